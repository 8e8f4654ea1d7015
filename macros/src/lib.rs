extern crate proc_macro;

macro_rules! bail {
    ($item:expr, $fmt:literal $($tts:tt)*) => {
        return Err(Error::new_spanned(
            &$item,
            format!(concat!("graphchain: ", $fmt) $($tts)*)
        ))
    }
}

mod identity;
mod task;
mod utils;

use proc_macro::TokenStream as BoundaryStream;
use proc_macro2::TokenStream;
use quote::quote;
use syn::{parse_quote, Error, Result};

/// Derive the declared identity of a type.
///
/// Named fields are hashed together with their names in sorted order, so
/// reordering the declaration keeps the identity. Tuple fields are hashed in
/// position order. Enums additionally hash the name of the variant.
///
/// Fields marked `#[identity(skip)]` do not contribute. They must not affect
/// what the value computes.
///
/// ```ignore
/// #[derive(Identity)]
/// struct Resize {
///     width: u32,
///     height: u32,
///     #[identity(skip)]
///     verbose: bool,
/// }
/// ```
#[proc_macro_derive(Identity, attributes(identity))]
pub fn derive_identity(stream: BoundaryStream) -> BoundaryStream {
    let input = syn::parse_macro_input!(stream as syn::DeriveInput);
    identity::expand(input)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

/// Fingerprint the code of a task.
///
/// Apply this to an `impl Task<V> for T` block. It generates the task's
/// `source` from the tokens of the whole block, so that any edit to the
/// block invalidates the task's cached results. Comments, including doc
/// comments, are not part of the fingerprint. An optional label names the
/// task in logs.
///
/// ```ignore
/// #[task(label = "scale")]
/// impl Task<i64> for Scale {
///     fn run(&self, inputs: &[&i64]) -> Result<i64, TaskError> {
///         Ok(*inputs[0] * self.factor)
///     }
/// }
/// ```
///
/// Code called from the block but defined elsewhere is not part of the
/// fingerprint.
#[proc_macro_attribute]
pub fn task(args: BoundaryStream, stream: BoundaryStream) -> BoundaryStream {
    let args = syn::parse_macro_input!(args as task::Args);
    let block = syn::parse_macro_input!(stream as syn::ItemImpl);
    task::expand(args, block)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}
