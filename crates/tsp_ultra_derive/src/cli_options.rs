use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::{ToTokens, quote};
use syn::{Data, DeriveInput, Field, Fields, Ident, LitStr, Path, parse_macro_input, spanned::Spanned};

use crate::utils;

/// One `--long` option parsed from a `#[cli(...)]` field attribute.
struct CliField<'a> {
    ident: &'a Ident,
    field: &'a Field,
    long: String,
    parse_with: Option<Path>,
    value_name: Option<String>,
    flag: bool,
}

impl<'a> CliField<'a> {
    fn from_field(field: &'a Field) -> syn::Result<Option<Self>> {
        let Some(ident) = &field.ident else {
            return Ok(None);
        };
        let mut long = None;
        let mut parse_with = None;
        let mut value_name = None;
        let mut flag = false;
        for attr in field.attrs.iter().filter(|a| a.path().is_ident("cli")) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("flag") {
                    flag = true;
                    return Ok(());
                }
                let lit: LitStr = meta.value()?.parse()?;
                if meta.path.is_ident("long") {
                    long = Some(lit.value());
                } else if meta.path.is_ident("parse_with") {
                    parse_with = Some(syn::parse_str::<Path>(&lit.value())?);
                } else if meta.path.is_ident("value_name") {
                    value_name = Some(lit.value());
                } else {
                    return Err(meta.error(
                        "unsupported cli attribute; expected long/parse_with/value_name/flag",
                    ));
                }
                Ok(())
            })?;
        }
        let Some(long) = long else {
            return Ok(None);
        };
        if flag && parse_with.is_some() {
            return Err(syn::Error::new(
                field.span(),
                "a cli flag cannot also declare parse_with",
            ));
        }
        Ok(Some(Self {
            ident,
            field,
            long,
            parse_with,
            value_name,
            flag,
        }))
    }

    fn apply_arms(&self) -> proc_macro2::TokenStream {
        let ident = self.ident;
        let long = LitStr::new(&self.long, Span::call_site());
        if self.flag {
            let negated = LitStr::new(&format!("no-{}", self.long), Span::call_site());
            return quote! {
                #long => {
                    self.#ident = match value {
                        Some(raw) => Self::parse_cli_bool(name, &raw)?,
                        None => true,
                    };
                    Ok(true)
                }
                #negated => {
                    if value.is_some() {
                        return Err(crate::Error::invalid_input(format!(
                            "Flag --{name} does not take a value"
                        )));
                    }
                    self.#ident = false;
                    Ok(true)
                }
            };
        }
        let parse_expr = utils::build_cli_parse_expr(&self.field.ty, self.parse_with.as_ref());
        quote! {
            #long => {
                let raw = value.ok_or_else(|| {
                    crate::Error::invalid_input(format!("Missing value for --{name}"))
                })?;
                self.#ident = #parse_expr;
                Ok(true)
            }
        }
    }

    /// Help lines for this option, resolved at runtime so enum
    /// choices come from their `VARIANTS`.
    fn usage_lines(&self) -> proc_macro2::TokenStream {
        let long = &self.long;
        if self.flag {
            let lines = format!("  --{long}[=<bool>]\n  --no-{long}\n");
            return quote! { out.push_str(#lines); };
        }
        if let Some(name) = &self.value_name {
            let line = format!("  --{long} <{name}>\n");
            return quote! { out.push_str(#line); };
        }
        if self.parse_with.is_some() {
            let ty = &self.field.ty;
            let prefix = format!("  --{long} <");
            return quote! {
                out.push_str(#prefix);
                out.push_str(&<#ty>::VARIANTS.join("|"));
                out.push_str(">\n");
            };
        }
        let ty = self.field.ty.to_token_stream().to_string().replace(' ', "");
        let line = format!("  --{long} <{ty}>\n");
        quote! { out.push_str(#line); }
    }
}

pub fn derive_cli_options_inner(item: TokenStream) -> TokenStream {
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
            "CliOptions can only be derived for structs",
        ));
    };
    let Fields::Named(fields) = &data_struct.fields else {
        return Err(syn::Error::new(input.span(), "CliOptions requires named fields"));
    };

    let mut options = Vec::new();
    for field in &fields.named {
        if let Some(option) = CliField::from_field(field)? {
            options.push(option);
        }
    }
    let arms = options.iter().map(CliField::apply_arms);
    let usage = options.iter().map(CliField::usage_lines);

    Ok(quote! {
        impl #struct_ident {
            fn split_arg(
                raw_name: &str,
                args: &mut std::iter::Peekable<impl Iterator<Item = String>>,
            ) -> (String, Option<String>) {
                if let Some((k, v)) = raw_name.split_once('=') {
                    return (k.to_string(), Some(v.to_string()));
                }

                let value = match args.peek() {
                    Some(next) if !next.starts_with("--") => args.next(),
                    _ => None,
                };

                (raw_name.to_string(), value)
            }

            fn parse_cli_bool(name: &str, raw: &str) -> crate::Result<bool> {
                match raw.to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => Ok(true),
                    "0" | "false" | "no" | "off" => Ok(false),
                    _ => Err(crate::Error::invalid_input(format!(
                        "Invalid boolean for --{name}: {raw} (expected true/false)"
                    ))),
                }
            }

            fn apply_cli_option(
                &mut self,
                name: &str,
                value: Option<String>,
            ) -> crate::Result<bool> {
                match name {
                    #(#arms)*
                    _ => Ok(false),
                }
            }

            /// One line per option in declaration order.
            fn cli_option_usage() -> String {
                let mut out = String::new();
                #(#usage)*
                out
            }
        }
    })
}
