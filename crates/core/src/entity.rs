//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;

    /// Version of the last accepted mutation.
    ///
    /// Starts at 0 on creation and grows by exactly one per accepted mutation.
    fn version(&self) -> u64;
}
