//! Generation-protected references to slot-allocated records.

use derive_more::Display;

/// The index half of a [`UniqueId`].
pub type Index = u64;

/// The generation half of a [`UniqueId`].
pub type Generation = u32;

/// Sentinel value marking an invalid [`Index`].
pub const INVALID_INDEX: Index = Index::MAX;

/// Sentinel value marking an invalid [`Generation`].
pub const INVALID_GENERATION: Generation = Generation::MAX;

/// A reference to a slot-allocated record, safe across slot reuse.
///
/// Records in this framework live in pools that hand slots out and take them
/// back; a bare index would dangle as soon as its slot were reused.  A
/// `UniqueId` therefore pairs the index with the generation the slot had when
/// the id was taken, and every dereference checks both.  Holders of a stale
/// id observe "gone", never somebody else's record.
///
/// The invalid id is `(Index::MAX, Generation::MAX)`; it compares unequal to
/// every valid id.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[display("{index}:{generation}")]
pub struct UniqueId {
    /// Slot index within the owning pool.
    index: Index,
    /// Generation the slot had when this id was taken.
    generation: Generation,
}

/// Identifies an actor within a manager.
///
/// Actor ids have the same shape and staleness rules as any other
/// [`UniqueId`]; the alias only records intent at API boundaries.
pub type ActorId = UniqueId;

impl UniqueId {
    /// Return a new id for `index` at `generation`.
    pub const fn new(index: Index, generation: Generation) -> Self {
        UniqueId { index, generation }
    }

    /// Return the invalid id.
    pub const fn invalid() -> Self {
        UniqueId {
            index: INVALID_INDEX,
            generation: INVALID_GENERATION,
        }
    }

    /// Return this id's slot index.
    pub const fn index(&self) -> Index {
        self.index
    }

    /// Return this id's generation.
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Return true if this id can possibly name a record.
    pub const fn is_valid(&self) -> bool {
        self.index != INVALID_INDEX
    }

    /// Return true if this id names nothing.
    pub const fn is_invalid(&self) -> bool {
        !self.is_valid()
    }

    /// Reset this id to the invalid value.
    pub fn clear(&mut self) {
        *self = UniqueId::invalid();
    }
}

impl Default for UniqueId {
    fn default() -> Self {
        UniqueId::invalid()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn validity() {
        let invalid = UniqueId::invalid();
        assert!(invalid.is_invalid());
        assert!(!invalid.is_valid());
        assert_eq!(invalid, UniqueId::default());

        let id = UniqueId::new(3, 0);
        assert!(id.is_valid());
        assert_eq!(id.index(), 3);
        assert_eq!(id.generation(), 0);

        let mut id = id;
        id.clear();
        assert!(id.is_invalid());
    }

    #[test]
    fn equality_needs_both_fields() {
        let a = UniqueId::new(1, 1);
        assert_ne!(a, UniqueId::new(1, 2));
        assert_ne!(a, UniqueId::new(2, 1));
        assert_eq!(a, UniqueId::new(1, 1));
    }

    #[test]
    fn display() {
        assert_eq!(UniqueId::new(7, 2).to_string(), "7:2");
    }
}
