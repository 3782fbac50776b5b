use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{ItemFn, LitStr, parse::Parser, parse_macro_input, punctuated::Punctuated, token::Comma};

pub fn timer_inner(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match Punctuated::<LitStr, Comma>::parse_terminated.parse(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    if args.len() > 1 {
        return syn::Error::new(Span::call_site(), "timer accepts at most one label")
            .to_compile_error()
            .into();
    }

    let func = parse_macro_input!(item as ItemFn);
    let label = args
        .first()
        .map(LitStr::value)
        .unwrap_or_else(|| func.sig.ident.to_string());
    let label_lit = LitStr::new(&label, Span::call_site());

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = func;
    let stmts = &block.stmts;

    let expanded = quote! {
        #(#attrs)*
        #vis #sig {
            struct __TimerGuard(std::time::Instant);

            impl Drop for __TimerGuard {
                fn drop(&mut self) {
                    log::debug!(
                        "{}: elapsed_s={:.3}",
                        #label_lit,
                        self.0.elapsed().as_secs_f64()
                    );
                }
            }

            let __timer_guard = __TimerGuard(std::time::Instant::now());
            #(#stmts)*
        }
    };

    TokenStream::from(expanded)
}
