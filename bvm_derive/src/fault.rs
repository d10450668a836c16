//! Derive macro classifying error variants into fault kinds.
//!
//! ```ignore
//! use bvm_derive::{Error, Fault};
//!
//! #[derive(Debug, Error, Fault)]
//! pub enum VMError {
//!     #[error("contract aborted")]
//!     #[fault(ExplicitAbort)]
//!     Aborted,
//! }
//! ```
//!
//! The generated `kind()` returns `FaultKind::<Kind>`; `FaultKind` must be in
//! scope where the derive is used.

use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, parse_macro_input};

pub fn derive_fault(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand_fault_derive(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_fault_derive(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let Data::Enum(data_enum) = &input.data else {
        return Err(syn::Error::new_spanned(
            input,
            "Fault derive only supports enums",
        ));
    };

    let arms = data_enum
        .variants
        .iter()
        .map(|variant| {
            let variant_name = &variant.ident;
            let kind = extract_fault_kind(variant)?;
            let pattern = match &variant.fields {
                Fields::Unit => quote!(Self::#variant_name),
                Fields::Unnamed(_) => quote!(Self::#variant_name(..)),
                Fields::Named(_) => quote!(Self::#variant_name { .. }),
            };
            Ok(quote! {
                #pattern => FaultKind::#kind,
            })
        })
        .collect::<syn::Result<Vec<_>>>()?;

    Ok(quote! {
        impl #impl_generics #name #ty_generics #where_clause {
            /// Returns the fault category this error belongs to.
            pub fn kind(&self) -> FaultKind {
                match self {
                    #(#arms)*
                }
            }
        }
    })
}

fn extract_fault_kind(variant: &syn::Variant) -> syn::Result<syn::Ident> {
    variant
        .attrs
        .iter()
        .find(|attr| attr.path().is_ident("fault"))
        .map(|attr| attr.parse_args::<syn::Ident>())
        .unwrap_or_else(|| {
            Err(syn::Error::new_spanned(
                &variant.ident,
                format!(
                    "missing #[fault(...)] attribute on variant `{}`",
                    variant.ident
                ),
            ))
        })
}
