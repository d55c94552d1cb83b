//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**: two `Money`
/// amounts of 1500 cents are the same amount, whereas two subsidies with equal
/// balances are still different grants (see [`crate::Entity`]).
///
/// To "modify" a value object, produce a new one.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
