use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Fields, LitStr, Variant, parse_macro_input, spanned::Spanned};

use crate::utils;

/// Spellings accepted for one variant; the first is canonical.
struct VariantNames {
    canonical: String,
    aliases: Vec<String>,
}

fn option_name(ident: &syn::Ident, attrs: &[Attribute]) -> syn::Result<String> {
    let mut name = utils::to_kebab_case(&ident.to_string());
    for attr in attrs.iter().filter(|a| a.path().is_ident("cli_value")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("option") {
                let lit: LitStr = meta.value()?.parse()?;
                name = lit.value();
                return Ok(());
            }
            Err(meta.error("unsupported cli_value attribute; expected option = \"...\""))
        })?;
    }
    Ok(name)
}

fn variant_names(variant: &Variant) -> syn::Result<VariantNames> {
    if !matches!(variant.fields, Fields::Unit) {
        return Err(syn::Error::new(
            variant.span(),
            "CliValue only supports enums with unit variants",
        ));
    }
    let mut names = VariantNames {
        canonical: utils::to_kebab_case(&variant.ident.to_string()),
        aliases: Vec::new(),
    };
    for attr in variant.attrs.iter().filter(|a| a.path().is_ident("cli")) {
        attr.parse_nested_meta(|meta| {
            let lit: LitStr = meta.value()?.parse()?;
            if meta.path.is_ident("name") {
                names.canonical = lit.value();
            } else if meta.path.is_ident("alias") {
                names.aliases.push(lit.value());
            } else {
                return Err(meta.error("unsupported cli attribute; expected name/alias"));
            }
            Ok(())
        })?;
    }
    Ok(names)
}

pub fn derive_cli_value_inner(item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let enum_ident = &input.ident;
    let Data::Enum(data_enum) = &input.data else {
        return Err(syn::Error::new(
            input.span(),
            "CliValue can only be derived for enums",
        ));
    };
    let option_lit = LitStr::new(&option_name(enum_ident, &input.attrs)?, Span::call_site());

    let mut parse_arms = Vec::new();
    let mut display_arms = Vec::new();
    let mut canonical_lits = Vec::new();
    for variant in &data_enum.variants {
        let names = variant_names(variant)?;
        let ident = &variant.ident;
        let canonical = LitStr::new(&names.canonical, Span::call_site());
        let spellings = std::iter::once(&names.canonical)
            .chain(&names.aliases)
            .map(|s| LitStr::new(&s.to_ascii_lowercase(), Span::call_site()));
        parse_arms.push(quote! { #(#spellings)|* => Ok(Self::#ident), });
        display_arms.push(quote! { Self::#ident => #canonical, });
        canonical_lits.push(canonical);
    }

    Ok(quote! {
        impl #enum_ident {
            /// Canonical spellings in declaration order.
            pub const VARIANTS: &'static [&'static str] = &[#(#canonical_lits),*];

            pub fn parse(raw: &str) -> crate::Result<Self> {
                match raw.to_ascii_lowercase().as_str() {
                    #(#parse_arms)*
                    _ => Err(crate::Error::invalid_input(format!(
                        "Invalid value for --{}: {} (expected {})",
                        #option_lit,
                        raw,
                        Self::VARIANTS.join("|")
                    ))),
                }
            }

            pub const fn as_str(&self) -> &'static str {
                match self {
                    #(#display_arms)*
                }
            }
        }

        impl std::str::FromStr for #enum_ident {
            type Err = crate::Error;

            fn from_str(raw: &str) -> crate::Result<Self> {
                Self::parse(raw)
            }
        }

        impl std::fmt::Display for #enum_ident {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    })
}
