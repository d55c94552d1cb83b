//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Subsidies, usage transactions and audit entries are entities: they keep their
/// identity while their attributes (e.g. `total_amount_used`) change.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
