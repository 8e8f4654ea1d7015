use std::fmt::{self, Debug, Formatter};
use std::ops::Deref;

use crate::error::IdentityError;
use crate::hash::{identity, ChainHash, Identity, IdentityHasher};

/// A wrapper type with a precomputed identity.
///
/// This is useful for large static parameters that are shared between many
/// tasks or many rebuilds of a graph: the value is walked once on
/// construction instead of once per node per rewrite.
///
/// # Equality
/// Two `Prehashed` values compare equal when their identities do. The
/// identity is a 256-bit digest, so the chance of two distinct values
/// comparing equal is negligible.
///
/// # Notice
/// For a value `v`, `identity(v)` is not equal to
/// `identity(Prehashed::new(v))`. Writing the precomputed digest produces
/// different bytes than writing the value's parts. Stick to one of the two
/// forms for a given parameter.
#[derive(Clone)]
pub struct Prehashed<T: ?Sized> {
    /// The precomputed identity.
    digest: ChainHash,
    /// The wrapped item.
    item: T,
}

impl<T: Identity> Prehashed<T> {
    /// Compute an item's identity and wrap it.
    pub fn new(item: T) -> Result<Self, IdentityError> {
        Ok(Self { digest: identity(&item)?, item })
    }

    /// Return the wrapped value.
    #[inline]
    pub fn into_inner(self) -> T {
        self.item
    }
}

impl<T: ?Sized> Prehashed<T> {
    /// The precomputed identity digest.
    #[inline]
    pub fn digest(&self) -> ChainHash {
        self.digest
    }
}

impl<T: ?Sized> Deref for Prehashed<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.item
    }
}

impl<T: ?Sized> Identity for Prehashed<T> {
    #[inline]
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        state.write_digest(&self.digest);
        Ok(())
    }
}

impl<T: Debug + ?Sized> Debug for Prehashed<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.item.fmt(f)
    }
}

impl<T: ?Sized> Eq for Prehashed<T> {}

impl<T: ?Sized> PartialEq for Prehashed<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Opaque;

    #[test]
    fn test_prehashed_equality() {
        let a = Prehashed::new(vec![1, 2, 3]).unwrap();
        let b = Prehashed::new(vec![1, 2, 3]).unwrap();
        let c = Prehashed::new(vec![3, 2, 1]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 3);
        assert_eq!(identity(&a).unwrap(), identity(&b).unwrap());
        assert_ne!(identity(&a).unwrap(), identity(&vec![1, 2, 3]).unwrap());
    }

    #[test]
    fn test_prehashed_rejects_opaque() {
        assert!(Prehashed::new(Opaque(0u8)).is_err());
    }
}
