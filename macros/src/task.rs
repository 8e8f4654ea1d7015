use syn::parse::{Parse, ParseStream};

use super::*;

syn::custom_keyword!(label);

/// Arguments to `#[task]`.
pub struct Args {
    label: Option<syn::LitStr>,
}

impl Parse for Args {
    fn parse(input: ParseStream) -> Result<Self> {
        let label = utils::parse_key_value::<label, syn::LitStr>(input)?;
        if !input.is_empty() {
            return Err(input.error("graphchain: expected `label = \"...\"`"));
        }
        Ok(Self { label })
    }
}

/// Inject the source fingerprint into a task impl block.
pub fn expand(args: Args, mut item: syn::ItemImpl) -> Result<TokenStream> {
    if item.trait_.is_none() {
        bail!(item.self_ty, "`task` can only be applied to `impl Task<V> for T` blocks");
    }

    for member in &item.items {
        let syn::ImplItem::Fn(method) = member else { continue };
        let name = &method.sig.ident;
        if name == "source" {
            bail!(name, "`source` is generated by `#[task]`");
        }
        if name == "label" && args.label.is_some() {
            bail!(name, "`label` is defined twice");
        }
    }

    // Fingerprint the block as written, before anything is injected. Doc
    // comments do not change what the task computes.
    let source = utils::strip_docs(quote! { #item }).to_string();
    item.items.push(parse_quote! {
        fn source(&self) -> &'static str {
            #source
        }
    });

    if let Some(label) = &args.label {
        item.items.push(parse_quote! {
            fn label(&self) -> ::std::borrow::Cow<'_, str> {
                ::std::borrow::Cow::Borrowed(#label)
            }
        });
    }

    Ok(quote! { #item })
}
