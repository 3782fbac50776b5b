use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Field, Fields, LitStr, parse_macro_input, spanned::Spanned};

/// How a field value is rendered.
enum ValueFmt {
    Display,
    Len,
    Path,
    /// Three decimals, for lengths and seconds.
    Fixed,
}

struct KvField {
    key: String,
    value: proc_macro2::TokenStream,
}

fn parse_field(field: &Field) -> syn::Result<Option<KvField>> {
    let Some(ident) = &field.ident else {
        return Ok(None);
    };
    let mut key = ident.to_string();
    let mut fmt = ValueFmt::Display;
    let mut skip = false;
    for attr in field.attrs.iter().filter(|a| a.path().is_ident("kv")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                skip = true;
                return Ok(());
            }
            let lit: LitStr = meta.value()?.parse()?;
            if meta.path.is_ident("name") {
                key = lit.value();
            } else if meta.path.is_ident("fmt") {
                fmt = match lit.value().as_str() {
                    "display" => ValueFmt::Display,
                    "len" => ValueFmt::Len,
                    "path" => ValueFmt::Path,
                    "fixed" => ValueFmt::Fixed,
                    other => {
                        return Err(syn::Error::new(
                            lit.span(),
                            format!("unsupported kv fmt mode: {other}"),
                        ));
                    }
                };
            } else {
                return Err(meta.error("unsupported kv attribute; expected name/fmt/skip"));
            }
            Ok(())
        })?;
    }
    if skip {
        return Ok(None);
    }
    let value = match fmt {
        ValueFmt::Display => quote! { &self.#ident },
        ValueFmt::Len => quote! { &self.#ident.len() },
        ValueFmt::Path => quote! { &self.#ident.display() },
        ValueFmt::Fixed => quote! { &format_args!("{:.3}", self.#ident) },
    };
    Ok(Some(KvField { key, value }))
}

/// `#[kv(inline)]` on the struct renders one `key=value` line.
fn is_inline(attrs: &[Attribute]) -> syn::Result<bool> {
    let mut inline = false;
    for attr in attrs.iter().filter(|a| a.path().is_ident("kv")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("inline") {
                inline = true;
                return Ok(());
            }
            Err(meta.error("unsupported kv container attribute; expected inline"))
        })?;
    }
    Ok(inline)
}

fn aligned_format(keys: &[String]) -> String {
    let longest = keys.iter().map(String::len).max().unwrap_or(0);
    let lines: Vec<String> = keys
        .iter()
        .map(|key| format!("\t{key:<longest$} = {{}}"))
        .collect();
    format!("\n{}", lines.join("\n"))
}

fn inline_format(keys: &[String]) -> String {
    keys.iter()
        .map(|key| format!("{key}={{}}"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn derive_kv_display_inner(item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let struct_ident = &input.ident;
    let Data::Struct(data_struct) = &input.data else {
        return Err(syn::Error::new(
            input.span(),
            "KvDisplay can only be derived for structs",
        ));
    };
    let Fields::Named(fields) = &data_struct.fields else {
        return Err(syn::Error::new(input.span(), "KvDisplay requires named fields"));
    };

    let mut keys = Vec::new();
    let mut values = Vec::new();
    for field in &fields.named {
        if let Some(kv) = parse_field(field)? {
            keys.push(kv.key);
            values.push(kv.value);
        }
    }
    let format = if is_inline(&input.attrs)? {
        inline_format(&keys)
    } else {
        aligned_format(&keys)
    };
    let format_lit = LitStr::new(&format, Span::call_site());

    Ok(quote! {
        impl std::fmt::Display for #struct_ident {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, #format_lit, #(#values),*)
            }
        }
    })
}
