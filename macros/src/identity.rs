use super::*;

/// Derive `Identity` for a struct or enum.
pub fn expand(mut input: syn::DeriveInput) -> Result<TokenStream> {
    let name = &input.ident;
    let type_name = name.to_string();

    let body = match &input.data {
        syn::Data::Struct(data) => {
            let (pattern, writes) = destructure(&data.fields)?;
            quote! {
                let Self #pattern = self;
                #writes
            }
        }
        syn::Data::Enum(data) => {
            let mut arms = vec![];
            for variant in &data.variants {
                let ident = &variant.ident;
                let variant_name = ident.to_string();
                let (pattern, writes) = destructure(&variant.fields)?;
                arms.push(quote! {
                    Self::#ident #pattern => {
                        ::graphchain::IdentityHasher::write_str(__graphchain_state, #variant_name);
                        #writes
                    }
                });
            }
            quote! {
                match self {
                    #(#arms)*
                }
            }
        }
        syn::Data::Union(data) => {
            bail!(data.union_token, "unions do not have a deterministic identity")
        }
    };

    // Every type parameter must have an identity itself.
    let params = input
        .generics
        .type_params()
        .map(|param| param.ident.clone())
        .collect::<Vec<_>>();
    let clause = input.generics.make_where_clause();
    for param in params {
        clause
            .predicates
            .push(parse_quote! { #param: ::graphchain::Identity });
    }

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    Ok(quote! {
        impl #impl_generics ::graphchain::Identity for #name #ty_generics #where_clause {
            fn identify(
                &self,
                __graphchain_state: &mut ::graphchain::IdentityHasher,
            ) -> ::std::result::Result<(), ::graphchain::IdentityError> {
                ::graphchain::IdentityHasher::write_str(__graphchain_state, #type_name);
                #body
                ::std::result::Result::Ok(())
            }
        }
    })
}

/// Produce a pattern binding the fields and the statements hashing them.
///
/// Named fields are written with their names, sorted by name. Unnamed fields
/// are written in position order. Bindings are generated so that no field
/// can shadow the hasher.
fn destructure(fields: &syn::Fields) -> Result<(TokenStream, TokenStream)> {
    match fields {
        syn::Fields::Named(named) => {
            let mut kept = vec![];
            for field in &named.named {
                if utils::is_skipped(&field.attrs)? {
                    continue;
                }
                if let Some(ident) = &field.ident {
                    kept.push(ident.clone());
                }
            }
            kept.sort_by_key(|ident| ident.to_string());

            let names = kept.iter().map(|ident| ident.to_string());
            let bindings = kept
                .iter()
                .map(|ident| quote::format_ident!("__field_{}", ident))
                .collect::<Vec<_>>();
            let count = kept.len();
            let writes = quote! {
                ::graphchain::IdentityHasher::write_len(__graphchain_state, #count);
                #(
                    ::graphchain::IdentityHasher::write_str(__graphchain_state, #names);
                    ::graphchain::Identity::identify(#bindings, __graphchain_state)?;
                )*
            };
            Ok((quote! { { #(#kept: #bindings,)* .. } }, writes))
        }
        syn::Fields::Unnamed(unnamed) => {
            let mut pattern = vec![];
            let mut kept = vec![];
            for (i, field) in unnamed.unnamed.iter().enumerate() {
                if utils::is_skipped(&field.attrs)? {
                    pattern.push(quote! { _ });
                } else {
                    let binding = quote::format_ident!("__field{}", i);
                    pattern.push(quote! { #binding });
                    kept.push(binding);
                }
            }

            let count = kept.len();
            let writes = quote! {
                ::graphchain::IdentityHasher::write_len(__graphchain_state, #count);
                #(::graphchain::Identity::identify(#kept, __graphchain_state)?;)*
            };
            Ok((quote! { ( #(#pattern),* ) }, writes))
        }
        syn::Fields::Unit => Ok((quote! {}, quote! {})),
    }
}
