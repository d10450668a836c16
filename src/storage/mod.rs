//! Storage backends for contract variables.
//!
//! - [`variable_mem`]: ordered in-memory store implementing [`State`](crate::virtual_machine::state::State)

pub mod variable_mem;
