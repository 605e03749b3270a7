//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
pub trait Entity {
    /// Strongly-typed entity identifier.
    ///
    /// Ordered so stores can return listings in a stable order.
    type Id: Clone
        + Eq
        + Ord
        + core::hash::Hash
        + core::fmt::Debug
        + core::fmt::Display
        + Send
        + Sync;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
