use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, parse_macro_input};

/// Positional `const fn new` over every named field, in declaration order.
pub fn derive_new_inner(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => &named.named,
            _ => {
                return syn::Error::new_spanned(name, "`New` requires named fields")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new_spanned(name, "`New` can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let params = fields.iter().filter_map(|f| {
        let ident = f.ident.as_ref()?;
        let ty = &f.ty;
        Some(quote! { #ident: #ty })
    });
    let inits = fields.iter().filter_map(|f| f.ident.as_ref());

    let expanded = quote! {
        impl #impl_generics #name #ty_generics #where_clause {
            #[allow(clippy::too_many_arguments)]
            pub const fn new(#(#params),*) -> Self {
                Self { #(#inits),* }
            }
        }
    };

    TokenStream::from(expanded)
}
