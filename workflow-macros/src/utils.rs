use proc_macro2::TokenStream;
use quote::quote;
use syn::{Attribute, Field, GenericArgument, LitStr, Type};

// Helper to create a compile error
pub(crate) fn compile_error<T: quote::ToTokens>(
    tokens: T,
    message: &str,
) -> proc_macro::TokenStream {
    syn::Error::new_spanned(tokens, message)
        .to_compile_error()
        .into()
}

/// Options read from `#[schema(...)]` on a field.
#[derive(Default)]
pub(crate) struct FieldOptions {
    pub skip: bool,
    pub nested: bool,
    pub rename: Option<String>,
}

pub(crate) fn field_options(field: &Field) -> syn::Result<FieldOptions> {
    let mut options = FieldOptions::default();
    for attr in field.attrs.iter().filter(|a| is_schema_attr(a)) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                options.skip = true;
                Ok(())
            } else if meta.path.is_ident("nested") {
                options.nested = true;
                Ok(())
            } else if meta.path.is_ident("rename") {
                let name: LitStr = meta.value()?.parse()?;
                if !is_identifier(&name.value()) {
                    return Err(syn::Error::new(
                        name.span(),
                        "schema names must be identifiers (letters, digits and `_`, not starting with a digit)",
                    ));
                }
                options.rename = Some(name.value());
                Ok(())
            } else {
                Err(meta.error("expected `skip`, `nested` or `rename = \"...\"`"))
            }
        })?;
    }
    Ok(options)
}

/// Whether `name` is usable as a single field path segment.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_schema_attr(attr: &Attribute) -> bool {
    attr.path().is_ident("schema")
}

// Extract T from Wrapper<T> when the last path segment is one of `names`
pub(crate) fn single_generic_arg<'a>(ty: &'a Type, names: &[&str]) -> Option<&'a Type> {
    let Type::Path(type_path) = ty else {
        return None;
    };
    let segment = type_path.path.segments.last()?;
    if !names.iter().any(|n| segment.ident == n) {
        return None;
    }
    match &segment.arguments {
        syn::PathArguments::AngleBracketed(args) => match args.args.first() {
            Some(GenericArgument::Type(inner)) if args.args.len() == 1 => Some(inner),
            _ => None,
        },
        _ => None,
    }
}

/// Strip `Option<_>`, returning the inner type and whether it was optional.
pub(crate) fn unwrap_option(ty: &Type) -> (&Type, bool) {
    match single_generic_arg(ty, &["Option"]) {
        Some(inner) => (inner, true),
        None => (ty, false),
    }
}

/// The `ValueType` variant for a field type.
pub(crate) fn value_type(ty: &Type) -> TokenStream {
    let variant = match ty {
        Type::Reference(r) => return value_type(&r.elem),
        Type::Paren(p) => return value_type(&p.elem),
        Type::Array(_) | Type::Slice(_) | Type::Tuple(_) => quote!(Array),
        Type::Path(type_path) => {
            if let Some(inner) = single_generic_arg(ty, &["Box", "Arc", "Rc"]) {
                return value_type(inner);
            }
            match type_path.path.segments.last().map(|s| s.ident.to_string()).as_deref() {
                Some(
                    "i8" | "i16" | "i32" | "i64" | "i128" | "isize" | "u8" | "u16" | "u32"
                    | "u64" | "u128" | "usize",
                ) => quote!(Integer),
                Some("f32" | "f64") => quote!(Float),
                Some("bool") => quote!(Bool),
                // Types serde writes as strings
                Some("String" | "str" | "char" | "DateTime" | "NaiveDateTime" | "Uuid" | "PathBuf") => {
                    quote!(String)
                }
                Some("Vec" | "VecDeque" | "HashSet" | "BTreeSet") => quote!(Array),
                Some("Value") => quote!(Any),
                _ => quote!(Object),
            }
        }
        _ => quote!(Object),
    };
    quote!(::workflow_core::data::ValueType::#variant)
}
