//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects carry no identity and are immutable: "changing" one means
/// building a new one. Constructors are the place to enforce their invariants,
/// e.g. a `Price` that can never be negative.
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Eq)]
/// struct Quantity(i32);
///
/// impl ValueObject for Quantity {}
///
/// assert_eq!(Quantity(5), Quantity(5));
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
