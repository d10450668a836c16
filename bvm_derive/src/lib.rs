//! Derive macros for the bvm crate.
//!
//! Provides:
//! - `#[derive(Error)]` - `Display` and `std::error::Error` from `#[error("...")]` messages
//! - `#[derive(Fault)]` - fault classification from `#[fault(Kind)]` attributes

mod error;
mod fault;

use proc_macro::TokenStream;

/// Automatically implements `Display` and `Error` traits for error types.
#[proc_macro_derive(Error, attributes(error))]
pub fn derive_error(input: TokenStream) -> TokenStream {
    error::derive_error(input)
}

/// Generates a `kind()` accessor mapping every variant to its `FaultKind`.
#[proc_macro_derive(Fault, attributes(fault))]
pub fn derive_fault(input: TokenStream) -> TokenStream {
    fault::derive_fault(input)
}
