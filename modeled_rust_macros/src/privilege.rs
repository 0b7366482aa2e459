use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, LitStr};

pub fn derive_privilege(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let Data::Enum(data) = &input.data else {
        return syn::Error::new(name.span(), "Privilege derive only supports enums")
            .to_compile_error()
            .into();
    };

    if data.variants.is_empty() {
        return syn::Error::new(name.span(), "Privilege derive requires at least one variant")
            .to_compile_error()
            .into();
    }

    let mut variants = Vec::with_capacity(data.variants.len());
    let mut names = Vec::with_capacity(data.variants.len());
    for variant in &data.variants {
        if !matches!(variant.fields, Fields::Unit) {
            return syn::Error::new(
                variant.ident.span(),
                "Privilege variants cannot carry data",
            )
            .to_compile_error()
            .into();
        }

        let mut privilege_name = variant.ident.to_string();
        for attr in &variant.attrs {
            if !attr.path().is_ident("privilege") {
                continue;
            }
            let parsed = attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("name") {
                    let value: LitStr = meta.value()?.parse()?;
                    privilege_name = value.value();
                    Ok(())
                } else {
                    Err(meta.error("expected `name = \"...\"`"))
                }
            });
            if let Err(err) = parsed {
                return err.to_compile_error().into();
            }
        }

        if names.contains(&privilege_name) {
            return syn::Error::new(
                variant.ident.span(),
                format!("duplicate privilege name `{}`", privilege_name),
            )
            .to_compile_error()
            .into();
        }

        variants.push(&variant.ident);
        names.push(privilege_name);
    }

    let expanded = quote! {
        impl modeled_rust::Privilege for #name {
            const ALL: &'static [Self] = &[#(Self::#variants),*];

            fn name(&self) -> &'static str {
                match self {
                    #(Self::#variants => #names,)*
                }
            }
        }
    };

    TokenStream::from(expanded)
}
