use syn::{
    parse::{Parse, ParseStream},
    token::Token,
};

use super::*;

/// Parse a metadata key-value pair, separated by `=`.
pub fn parse_key_value<K: Token + Default + Parse, V: Parse>(
    input: ParseStream,
) -> Result<Option<V>> {
    if !input.peek(|_| K::default()) {
        return Ok(None);
    }

    let _: K = input.parse()?;
    let _: syn::Token![=] = input.parse()?;
    let value: V = input.parse::<V>()?;
    eat_comma(input)?;
    Ok(Some(value))
}

/// Parse a comma if there is one.
pub fn eat_comma(input: ParseStream) -> Result<()> {
    if input.peek(syn::Token![,]) {
        let _: syn::Token![,] = input.parse()?;
    }
    Ok(())
}

/// Whether a field carries `#[identity(skip)]`.
pub fn is_skipped(attrs: &[syn::Attribute]) -> Result<bool> {
    let mut skip = false;
    for attr in attrs.iter().filter(|attr| attr.path().is_ident("identity")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                skip = true;
                Ok(())
            } else {
                Err(meta.error("graphchain: unknown identity attribute"))
            }
        })?;
    }
    Ok(skip)
}

/// Remove doc attributes, including those of doc comments, at any depth.
pub fn strip_docs(stream: TokenStream) -> TokenStream {
    use proc_macro2::{Delimiter, Group, TokenTree};

    let is_doc = |tree: Option<&TokenTree>| match tree {
        Some(TokenTree::Group(group)) if group.delimiter() == Delimiter::Bracket => matches!(
            group.stream().into_iter().next(),
            Some(TokenTree::Ident(ident)) if ident == "doc"
        ),
        _ => false,
    };

    let tokens = stream.into_iter().collect::<Vec<_>>();
    let mut out = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        if matches!(&tokens[i], TokenTree::Punct(punct) if punct.as_char() == '#') {
            // Inner attributes carry a `!` before the brackets.
            let bang = matches!(
                tokens.get(i + 1),
                Some(TokenTree::Punct(punct)) if punct.as_char() == '!'
            );
            let attr = i + 1 + usize::from(bang);
            if is_doc(tokens.get(attr)) {
                i = attr + 1;
                continue;
            }
        }

        match &tokens[i] {
            TokenTree::Group(group) => {
                let mut stripped = Group::new(group.delimiter(), strip_docs(group.stream()));
                stripped.set_span(group.span());
                out.push(TokenTree::Group(stripped));
            }
            tree => out.push(tree.clone()),
        }
        i += 1;
    }
    out.into_iter().collect()
}
