//! Derive macro for error types.
//!
//! Generates `std::fmt::Display` and `std::error::Error` implementations.
//!
//! # Usage
//!
//! ```ignore
//! use bvm_derive::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum StackError {
//!     #[error("stack offset {0} out of range")]
//!     OutOfRange(usize),
//!
//!     #[error("frame of {size} bytes does not fit below {sp}")]
//!     Frame { size: usize, sp: usize },
//!
//!     #[error("empty stack")]
//!     Empty,
//! }
//! ```
//!
//! Fields that the message does not mention are matched with `..` and left
//! out of the `write!` call, so a variant may carry context that is only
//! meant for programmatic inspection.

use proc_macro::TokenStream;
use quote::{ToTokens, format_ident, quote};
use syn::{Data, DeriveInput, Fields, Lit, Meta, parse_macro_input};

/// Derives `Display` and `Error` for an enum or struct.
pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand_error_derive(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_error_derive(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let display_body = match &input.data {
        Data::Enum(data_enum) => {
            let arms = data_enum
                .variants
                .iter()
                .map(|variant| {
                    let variant_name = &variant.ident;
                    let message = extract_error_message(
                        &variant.attrs,
                        &variant.ident,
                        &format!("variant `{variant_name}`"),
                    )?;
                    Ok(display_arm(quote!(Self::#variant_name), &variant.fields, &message))
                })
                .collect::<syn::Result<Vec<_>>>()?;

            quote! {
                match self {
                    #(#arms)*
                }
            }
        }
        Data::Struct(data_struct) => {
            let message = extract_error_message(
                &input.attrs,
                &input.ident,
                &format!("type `{name}`"),
            )?;
            let arm = display_arm(quote!(Self), &data_struct.fields, &message);
            quote! {
                match self {
                    #arm
                }
            }
        }
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "Error derive does not support unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                #display_body
            }
        }

        impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {}
    })
}

/// Builds one `pattern => write!(..)` arm binding only the fields the message uses.
fn display_arm(
    path: proc_macro2::TokenStream,
    fields: &Fields,
    message: &str,
) -> proc_macro2::TokenStream {
    match fields {
        Fields::Unit => quote! {
            #path => write!(f, #message),
        },
        Fields::Named(named) => {
            let used: Vec<_> = named
                .named
                .iter()
                .filter_map(|field| field.ident.as_ref())
                .filter(|ident| mentions(message, &ident.to_string()))
                .collect();
            quote! {
                #path { #(#used,)* .. } => write!(f, #message, #(#used = #used),*),
            }
        }
        Fields::Unnamed(unnamed) => {
            let count = unnamed.unnamed.len();
            let format_str = convert_positional_to_named(message, count);
            let mut bindings = Vec::with_capacity(count);
            let mut used = Vec::new();
            for i in 0..count {
                if mentions(message, &i.to_string()) {
                    let ident = format_ident!("f{}", i);
                    bindings.push(ident.to_token_stream());
                    used.push(ident);
                } else {
                    bindings.push(quote!(_));
                }
            }
            quote! {
                #path(#(#bindings),*) => write!(f, #format_str, #(#used = #used),*),
            }
        }
    }
}

/// True when `message` interpolates `{name}` or `{name:...}`.
fn mentions(message: &str, name: &str) -> bool {
    message.contains(&format!("{{{name}}}")) || message.contains(&format!("{{{name}:"))
}

/// Extracts the message of an `#[error("...")]` attribute.
fn extract_error_message<T: ToTokens>(
    attrs: &[syn::Attribute],
    target: &T,
    target_desc: &str,
) -> syn::Result<String> {
    for attr in attrs {
        if !attr.path().is_ident("error") {
            continue;
        }

        let Meta::List(meta_list) = &attr.meta else {
            return Err(syn::Error::new_spanned(
                &attr.meta,
                "invalid #[error] attribute; use #[error(\"message\")] to describe the error",
            ));
        };

        let lit = syn::parse2::<Lit>(meta_list.tokens.clone()).map_err(|_| {
            syn::Error::new_spanned(
                &attr.meta,
                "failed to parse #[error] attribute; expected a string literal like #[error(\"stack overflow at {offset}\")]",
            )
        })?;

        return match lit {
            Lit::Str(lit_str) => Ok(lit_str.value()),
            _ => Err(syn::Error::new_spanned(
                &attr.meta,
                "invalid #[error] attribute: message must be a string literal",
            )),
        };
    }

    Err(syn::Error::new_spanned(
        target,
        format!(
            "missing #[error(\"...\")] attribute on {target_desc}; every error variant must declare a display message"
        ),
    ))
}

/// Converts positional format args `{0}`, `{1:x}` to named args `{f0}`, `{f1:x}`.
fn convert_positional_to_named(format_str: &str, field_count: usize) -> String {
    let mut result = format_str.to_string();
    for i in (0..field_count).rev() {
        result = result
            .replace(&format!("{{{i}}}"), &format!("{{f{i}}}"))
            .replace(&format!("{{{i}:"), &format!("{{f{i}:"));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mentions_plain_and_formatted() {
        assert!(mentions("offset {offset}", "offset"));
        assert!(mentions("opcode {opcode:#04x}", "opcode"));
        assert!(!mentions("offset {offsets}", "offset"));
        assert!(!mentions("no fields", "offset"));
    }

    #[test]
    fn positional_args_become_named() {
        assert_eq!(
            convert_positional_to_named("{0} then {1:x}", 2),
            "{f0} then {f1:x}"
        );
    }
}
