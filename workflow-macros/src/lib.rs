//! Procedural macros for the workflow system.

mod utils;

use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, parse_macro_input};
use utils::{compile_error, field_options, unwrap_option, value_type};

/// Derive `DataSchema` for a struct with named fields.
///
/// Each field becomes a schema entry named after the field. Field types map to
/// value types: integers to `Integer`, floats to `Float`, `bool`, `String`
/// (along with `DateTime` and `Uuid`), sequences to `Array`, `serde_json::Value`
/// to `Any`, and anything else to `Object`. `Option<T>` maps like `T` but accepts `null`.
///
/// Field attributes:
/// - `#[schema(nested)]` flattens the field type's own schema under the field name
/// - `#[schema(skip)]` leaves the field out
/// - `#[schema(rename = "name")]` uses a different name; mirror any `#[serde(rename)]`
#[proc_macro_derive(DataSchema, attributes(schema))]
pub fn derive_data_schema(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => return compile_error(name, "DataSchema requires a struct with named fields"),
        },
        _ => return compile_error(name, "DataSchema can only be derived for structs"),
    };

    let mut entries = Vec::new();
    for field in fields {
        let options = match field_options(field) {
            Ok(options) => options,
            Err(e) => return e.to_compile_error().into(),
        };
        if options.skip {
            continue;
        }
        let Some(ident) = &field.ident else {
            continue;
        };
        let key = options.rename.unwrap_or_else(|| ident.to_string());
        let (inner, nullable) = unwrap_option(&field.ty);

        if options.nested {
            entries.push(quote! {
                .nested(#key, #nullable, <#inner as ::workflow_core::data::DataSchema>::schema())
            });
        } else {
            let ty = value_type(inner);
            entries.push(quote! {
                .field(#key, #ty, #nullable)
            });
        }
    }

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    TokenStream::from(quote! {
        impl #impl_generics ::workflow_core::data::DataSchema for #name #ty_generics #where_clause {
            fn schema() -> ::workflow_core::data::Schema {
                ::workflow_core::data::Schema::new()
                    #(#entries)*
            }
        }
    })
}
