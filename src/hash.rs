use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

/// Key derivation contexts. Changing any of these invalidates every cache.
const IDENTITY_CONTEXT: &str = "graphchain 2024-01 node identity v1";
const CHAIN_CONTEXT: &str = "graphchain 2024-01 chain hash v1";

/// A 256-bit BLAKE3 digest identifying a node's full transitive computation.
///
/// # Correctness assumption
/// Two nodes with equal chain hashes are assumed to be interchangeable: a
/// result stored under a chain hash is returned for every node that hashes to
/// it. This relies on the collision resistance of BLAKE3 and on every task
/// declaring its identity faithfully through [`Identity`] and
/// [`Task::source`](crate::Task::source).
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainHash(pub [u8; 32]);

impl ChainHash {
    /// View the hash as bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Render the hash as lowercase hex.
    pub fn to_hex(&self) -> String {
        self.to_string()
    }

    /// Parse a hash from 64 lowercase hex digits.
    ///
    /// Only the exact output of [`to_hex`](Self::to_hex) is accepted, so a
    /// parsed hash always renders back to the same string.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hash = blake3::Hash::from_hex(hex).ok()?;
        (hash.to_hex().as_str() == hex).then(|| Self(*hash.as_bytes()))
    }
}

impl Display for ChainHash {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(blake3::Hash::from_bytes(self.0).to_hex().as_str())
    }
}

impl Debug for ChainHash {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        // The first eight bytes are plenty to tell hashes apart in logs.
        write!(f, "ChainHash(")?;
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "…)")
    }
}

/// Compose a node's identity with the chain hashes of its dependencies.
///
/// Dependencies are consumed in their declared positional order. The order
/// always matters, even for tasks that happen to be commutative.
pub fn chain_hash(identity: &ChainHash, deps: &[ChainHash]) -> ChainHash {
    let mut state = blake3::Hasher::new_derive_key(CHAIN_CONTEXT);
    state.update(identity.as_bytes());
    state.update(&(deps.len() as u64).to_le_bytes());
    for dep in deps {
        state.update(dep.as_bytes());
    }
    ChainHash(*state.finalize().as_bytes())
}

/// Produce the identity digest of a value.
pub fn identity<T: Identity + ?Sized>(value: &T) -> Result<ChainHash, IdentityError> {
    let mut state = IdentityHasher::new();
    value.identify(&mut state)?;
    Ok(state.finish())
}

/// Declares how a value contributes to a node's identity.
///
/// This is the explicit serialization contract that replaces hashing of
/// arbitrary in-memory objects. Implementations must write the same bytes for
/// equal values in every process on every platform: no addresses, no random
/// state, no iteration order of hash-based collections. Values that cannot
/// meet this must return an [`IdentityError`].
///
/// The trait can be derived with `#[derive(Identity)]`. Named fields are
/// written by name in sorted order, so reordering the fields of a struct does
/// not change its identity. Tuple fields are written positionally.
pub trait Identity {
    /// Feed this value into the hasher.
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError>;
}

/// Incrementally builds an identity digest.
///
/// Every write is self-delimiting (fixed width or length prefixed), so
/// distinct sequences of writes cannot produce the same byte stream.
#[derive(Clone)]
pub struct IdentityHasher {
    inner: blake3::Hasher,
}

impl IdentityHasher {
    /// Create a hasher in the identity domain.
    pub fn new() -> Self {
        Self { inner: blake3::Hasher::new_derive_key(IDENTITY_CONTEXT) }
    }

    /// Write a one-byte tag that distinguishes kinds of values.
    #[inline]
    pub fn write_tag(&mut self, tag: u8) {
        self.inner.update(&[tag]);
    }

    /// Write a length-prefixed byte string.
    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_len(bytes.len());
        self.inner.update(bytes);
    }

    /// Write a length-prefixed UTF-8 string.
    #[inline]
    pub fn write_str(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    /// Write a length or count.
    #[inline]
    pub fn write_len(&mut self, len: usize) {
        self.write_u64(len as u64);
    }

    /// Write an unsigned 64-bit integer.
    #[inline]
    pub fn write_u64(&mut self, v: u64) {
        self.inner.update(&v.to_le_bytes());
    }

    /// Write a signed 64-bit integer.
    #[inline]
    pub fn write_i64(&mut self, v: i64) {
        self.inner.update(&v.to_le_bytes());
    }

    /// Write an unsigned 128-bit integer.
    #[inline]
    pub fn write_u128(&mut self, v: u128) {
        self.inner.update(&v.to_le_bytes());
    }

    /// Write a signed 128-bit integer.
    #[inline]
    pub fn write_i128(&mut self, v: i128) {
        self.inner.update(&v.to_le_bytes());
    }

    /// Write a previously computed digest.
    #[inline]
    pub fn write_digest(&mut self, digest: &ChainHash) {
        self.inner.update(digest.as_bytes());
    }

    /// Finish the digest. The hasher can keep being written to.
    pub fn finish(&self) -> ChainHash {
        ChainHash(*self.inner.finalize().as_bytes())
    }
}

impl Default for IdentityHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// A value whose state cannot be serialized deterministically.
///
/// Wrapping handles, clocks or random generators in `Opaque` turns an
/// accidental dependency on them into a loud [`IdentityError`] instead of a
/// silently wrong cache hit.
#[derive(Debug, Clone, Default)]
pub struct Opaque<T>(pub T);

impl<T> Identity for Opaque<T> {
    fn identify(&self, _: &mut IdentityHasher) -> Result<(), IdentityError> {
        Err(IdentityError::new(format!(
            "value of type `{}` has no deterministic identity",
            std::any::type_name::<T>()
        )))
    }
}

// Tags keep values of different shapes apart.
const TAG_UNIT: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_UINT: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_CHAR: u8 = 5;
const TAG_STR: u8 = 6;
const TAG_SEQ: u8 = 7;
const TAG_NONE: u8 = 8;
const TAG_SOME: u8 = 9;
const TAG_OK: u8 = 10;
const TAG_ERR: u8 = 11;
const TAG_TUPLE: u8 = 12;
const TAG_SET: u8 = 13;
const TAG_MAP: u8 = 14;
const TAG_PATH: u8 = 15;

macro_rules! uint_identity {
    ($($ty:ty),*) => {$(
        impl Identity for $ty {
            #[inline]
            fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
                state.write_tag(TAG_UINT);
                state.write_u128(*self as u128);
                Ok(())
            }
        }
    )*};
}

macro_rules! int_identity {
    ($($ty:ty),*) => {$(
        impl Identity for $ty {
            #[inline]
            fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
                state.write_tag(TAG_INT);
                state.write_i128(*self as i128);
                Ok(())
            }
        }
    )*};
}

// All integers are widened so that `usize` hashes the same on 32- and 64-bit
// targets.
uint_identity!(u8, u16, u32, u64, u128, usize);
int_identity!(i8, i16, i32, i64, i128, isize);

impl Identity for () {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        state.write_tag(TAG_UNIT);
        Ok(())
    }
}

impl Identity for bool {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        state.write_tag(TAG_BOOL);
        state.write_tag(*self as u8);
        Ok(())
    }
}

impl Identity for f64 {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        // NaN payloads differ between platforms.
        let bits = if self.is_nan() { f64::NAN.to_bits() } else { self.to_bits() };
        state.write_tag(TAG_FLOAT);
        state.write_u64(bits);
        Ok(())
    }
}

impl Identity for f32 {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        f64::from(*self).identify(state)
    }
}

impl Identity for char {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        state.write_tag(TAG_CHAR);
        state.write_u64(u64::from(*self));
        Ok(())
    }
}

impl Identity for str {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        state.write_tag(TAG_STR);
        state.write_str(self);
        Ok(())
    }
}

impl Identity for String {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        self.as_str().identify(state)
    }
}

impl Identity for Path {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        let Some(s) = self.to_str() else {
            return Err(IdentityError::new(format!(
                "path {} is not valid UTF-8",
                self.display()
            )));
        };
        state.write_tag(TAG_PATH);
        state.write_str(s);
        Ok(())
    }
}

impl Identity for PathBuf {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        self.as_path().identify(state)
    }
}

impl Identity for ChainHash {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        state.write_digest(self);
        Ok(())
    }
}

impl<T: Identity> Identity for [T] {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        state.write_tag(TAG_SEQ);
        state.write_len(self.len());
        self.iter().try_for_each(|item| item.identify(state))
    }
}

impl<T: Identity, const N: usize> Identity for [T; N] {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        self.as_slice().identify(state)
    }
}

impl<T: Identity> Identity for Vec<T> {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        self.as_slice().identify(state)
    }
}

impl<T: Identity> Identity for Option<T> {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        match self {
            None => {
                state.write_tag(TAG_NONE);
                Ok(())
            }
            Some(value) => {
                state.write_tag(TAG_SOME);
                value.identify(state)
            }
        }
    }
}

impl<T: Identity, E: Identity> Identity for Result<T, E> {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        match self {
            Ok(value) => {
                state.write_tag(TAG_OK);
                value.identify(state)
            }
            Err(error) => {
                state.write_tag(TAG_ERR);
                error.identify(state)
            }
        }
    }
}

impl<T: Identity + ?Sized> Identity for &T {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        (**self).identify(state)
    }
}

impl<T: Identity + ?Sized> Identity for Box<T> {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        (**self).identify(state)
    }
}

impl<T: Identity + ?Sized> Identity for Arc<T> {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        (**self).identify(state)
    }
}

impl<T: Identity + ?Sized> Identity for Rc<T> {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        (**self).identify(state)
    }
}

impl<T: Identity> Identity for BTreeSet<T> {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        unordered_set(self.iter(), self.len(), state)
    }
}

impl<T: Identity, S> Identity for HashSet<T, S> {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        unordered_set(self.iter(), self.len(), state)
    }
}

impl<K: Identity, V: Identity> Identity for BTreeMap<K, V> {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        unordered_map(self.iter(), self.len(), state)
    }
}

impl<K: Identity, V: Identity, S> Identity for HashMap<K, V, S> {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        unordered_map(self.iter(), self.len(), state)
    }
}

/// Hash a set independent of its iteration order.
///
/// `BTreeSet` would already iterate deterministically, but sharing the
/// scheme with `HashSet` makes both produce the same identity.
fn unordered_set<'a, T: Identity + 'a>(
    items: impl Iterator<Item = &'a T>,
    len: usize,
    state: &mut IdentityHasher,
) -> Result<(), IdentityError> {
    let mut digests = items.map(identity).collect::<Result<Vec<_>, _>>()?;
    digests.sort_unstable();
    state.write_tag(TAG_SET);
    state.write_len(len);
    digests.iter().for_each(|digest| state.write_digest(digest));
    Ok(())
}

/// Hash a map independent of its iteration order.
fn unordered_map<'a, K: Identity + 'a, V: Identity + 'a>(
    entries: impl Iterator<Item = (&'a K, &'a V)>,
    len: usize,
    state: &mut IdentityHasher,
) -> Result<(), IdentityError> {
    let mut digests = entries
        .map(|(k, v)| Ok((identity(k)?, identity(v)?)))
        .collect::<Result<Vec<_>, IdentityError>>()?;
    digests.sort_unstable();
    state.write_tag(TAG_MAP);
    state.write_len(len);
    for (k, v) in &digests {
        state.write_digest(k);
        state.write_digest(v);
    }
    Ok(())
}

macro_rules! tuple_identity {
    ($($param:tt $idx:tt),*) => {
        impl<$($param: Identity),*> Identity for ($($param,)*) {
            fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
                state.write_tag(TAG_TUPLE);
                state.write_len([$(stringify!($param)),*].len());
                $(self.$idx.identify(state)?;)*
                Ok(())
            }
        }
    };
}

tuple_identity! { A 0 }
tuple_identity! { A 0, B 1 }
tuple_identity! { A 0, B 1, C 2 }
tuple_identity! { A 0, B 1, C 2, D 3 }
tuple_identity! { A 0, B 1, C 2, D 3, E 4 }
tuple_identity! { A 0, B 1, C 2, D 3, E 4, F 5 }
tuple_identity! { A 0, B 1, C 2, D 3, E 4, F 5, G 6 }
tuple_identity! { A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7 }
tuple_identity! { A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8 }
tuple_identity! { A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9 }
tuple_identity! { A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10 }
tuple_identity! { A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10, L 11 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_stable() {
        // Separate allocations must not matter.
        let a = identity(&(1u32, "x".to_string())).unwrap();
        let b = identity(&Box::new((1u32, String::from("x")))).unwrap();
        assert_eq!(a, b);
        assert_eq!(identity(&1u8).unwrap(), identity(&1u64).unwrap());
        assert_eq!(identity(&1usize).unwrap(), identity(&1u128).unwrap());
        assert_ne!(identity(&1u8).unwrap(), identity(&1i8).unwrap());
    }

    #[test]
    fn test_positional_order_matters() {
        assert_ne!(identity(&(1, 2)).unwrap(), identity(&(2, 1)).unwrap());
        assert_ne!(identity(&vec![1, 2]).unwrap(), identity(&vec![2, 1]).unwrap());
    }

    #[test]
    fn test_no_ambiguous_concatenation() {
        let ab_c = identity(&("ab".to_string(), "c".to_string())).unwrap();
        let a_bc = identity(&("a".to_string(), "bc".to_string())).unwrap();
        assert_ne!(ab_c, a_bc);
        assert_ne!(identity(&None::<u8>).unwrap(), identity(&Some(0u8)).unwrap());
    }

    #[test]
    fn test_maps_ignore_iteration_order() {
        let mut hashed = HashMap::new();
        let mut sorted = BTreeMap::new();
        for i in 0..64u32 {
            hashed.insert(i.to_string(), i);
        }
        for i in (0..64u32).rev() {
            sorted.insert(i.to_string(), i);
        }
        assert_eq!(identity(&hashed).unwrap(), identity(&sorted).unwrap());

        let set: HashSet<_> = [3, 1, 2].into_iter().collect();
        let tree: BTreeSet<_> = [1, 2, 3].into_iter().collect();
        assert_eq!(identity(&set).unwrap(), identity(&tree).unwrap());
    }

    #[test]
    fn test_floats() {
        assert_eq!(identity(&f64::NAN).unwrap(), identity(&-f64::NAN).unwrap());
        assert_ne!(identity(&0.0f64).unwrap(), identity(&-0.0f64).unwrap());
        assert_eq!(identity(&1.5f32).unwrap(), identity(&1.5f64).unwrap());
    }

    #[test]
    fn test_opaque_fails_loudly() {
        let err = identity(&(1, Opaque(std::time::Instant::now()))).unwrap_err();
        assert!(err.to_string().contains("Instant"));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_path_fails() {
        use std::os::unix::ffi::OsStrExt;
        let path = Path::new(std::ffi::OsStr::from_bytes(b"bad\xff"));
        assert!(identity(path).is_err());
        assert!(identity(Path::new("good")).is_ok());
    }

    #[test]
    fn test_chain_hash_order() {
        let id = identity("node").unwrap();
        let x = identity(&1).unwrap();
        let y = identity(&2).unwrap();
        assert_ne!(chain_hash(&id, &[x, y]), chain_hash(&id, &[y, x]));
        assert_ne!(chain_hash(&id, &[]), chain_hash(&id, &[x]));
        assert_eq!(chain_hash(&id, &[x, y]), chain_hash(&id, &[x, y]));
    }

    #[test]
    fn test_hex_round_trip() {
        let hash = identity("hex").unwrap();
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ChainHash::from_hex(&hex), Some(hash));
        assert_eq!(ChainHash::from_hex("zz"), None);
    }

    #[test]
    fn test_hex_rejects_non_canonical() {
        assert_eq!(ChainHash::from_hex(&"+f".repeat(32)), None);
        assert_eq!(ChainHash::from_hex(&"AB".repeat(32)), None);
        assert_eq!(ChainHash::from_hex(&"ab".repeat(33)), None);
        let hash = ChainHash::from_hex(&"ab".repeat(32)).unwrap();
        assert_eq!(hash.to_hex(), "ab".repeat(32));
    }
}
