use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use isostock_core::{
    AggregateId, AggregateRoot, ConcurrencyStamp, DomainError, DomainResult, Entity, ValueObject,
};

/// Maximum product name length, in characters.
pub const MAX_NAME_LENGTH: usize = 128;

/// Digits allowed after the decimal point of a price.
pub const PRICE_SCALE: u32 = 2;

/// Prices must stay strictly below this amount (16 integer digits).
pub const PRICE_UPPER_BOUND: i64 = 10_000_000_000_000_000;

/// Product identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub AggregateId);

impl ProductId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl core::str::FromStr for ProductId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Non-negative unit price with at most [`PRICE_SCALE`] decimal places.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Price(Decimal);

impl Price {
    pub fn new(amount: Decimal) -> DomainResult<Self> {
        if amount < Decimal::ZERO {
            return Err(DomainError::validation(format!(
                "price cannot be negative (got {amount})"
            )));
        }
        if amount.normalize().scale() > PRICE_SCALE {
            return Err(DomainError::validation(format!(
                "price cannot have more than {PRICE_SCALE} decimal places (got {amount})"
            )));
        }
        if amount >= Decimal::from(PRICE_UPPER_BOUND) {
            return Err(DomainError::validation(format!(
                "price must be below {PRICE_UPPER_BOUND} (got {amount})"
            )));
        }
        Ok(Self(amount))
    }

    pub fn amount(&self) -> Decimal {
        self.0
    }
}

impl ValueObject for Price {}

impl TryFrom<Decimal> for Price {
    type Error = DomainError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Price> for Decimal {
    fn from(value: Price) -> Self {
        value.0
    }
}

impl core::fmt::Display for Price {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Partial field update applied atomically by [`Product::apply_fields`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductFieldsUpdate {
    pub price: Option<Decimal>,
    pub stock_quantity: Option<i32>,
}

impl ProductFieldsUpdate {
    pub fn price(price: Decimal) -> Self {
        Self {
            price: Some(price),
            stock_quantity: None,
        }
    }

    pub fn stock(quantity: i32) -> Self {
        Self {
            price: None,
            stock_quantity: Some(quantity),
        }
    }

    pub fn with_price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_stock(mut self, quantity: i32) -> Self {
        self.stock_quantity = Some(quantity);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.price.is_none() && self.stock_quantity.is_none()
    }
}

/// Aggregate root: Product.
///
/// Price and stock can only change through [`Product::update_stock`],
/// [`Product::update_price`] and [`Product::apply_fields`]; each accepted change
/// rotates the concurrency stamp, each rejected change leaves the product untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    id: ProductId,
    name: String,
    price: Price,
    stock_quantity: i32,
    concurrency_stamp: ConcurrencyStamp,
}

impl Product {
    /// Create a new product with a fresh concurrency stamp.
    pub fn create(
        id: ProductId,
        name: impl Into<String>,
        price: Decimal,
        stock_quantity: i32,
    ) -> DomainResult<Self> {
        Self::restore(id, name, price, stock_quantity, ConcurrencyStamp::new())
    }

    /// Rebuild a product from persisted state, keeping its stored stamp.
    pub fn restore(
        id: ProductId,
        name: impl Into<String>,
        price: Decimal,
        stock_quantity: i32,
        concurrency_stamp: ConcurrencyStamp,
    ) -> DomainResult<Self> {
        let name = name.into();
        validate_name(&name)?;
        let price = Price::new(price)?;
        validate_stock(stock_quantity)?;

        Ok(Self {
            id,
            name,
            price,
            stock_quantity,
            concurrency_stamp,
        })
    }

    pub fn id_typed(&self) -> ProductId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn price(&self) -> Price {
        self.price
    }

    pub fn stock_quantity(&self) -> i32 {
        self.stock_quantity
    }

    /// Set the stock level to `quantity`.
    pub fn update_stock(&mut self, quantity: i32) -> DomainResult<()> {
        validate_stock(quantity)?;
        self.stock_quantity = quantity;
        self.rotate_stamp();
        Ok(())
    }

    /// Set the unit price to `price`.
    pub fn update_price(&mut self, price: Decimal) -> DomainResult<()> {
        self.price = Price::new(price)?;
        self.rotate_stamp();
        Ok(())
    }

    /// Apply every field present in `update`, or none of them.
    pub fn apply_fields(&mut self, update: &ProductFieldsUpdate) -> DomainResult<()> {
        if update.is_empty() {
            return Err(DomainError::validation("update must set at least one field"));
        }

        let price = update.price.map(Price::new).transpose()?;
        if let Some(quantity) = update.stock_quantity {
            validate_stock(quantity)?;
        }

        if let Some(price) = price {
            self.price = price;
        }
        if let Some(quantity) = update.stock_quantity {
            self.stock_quantity = quantity;
        }
        self.rotate_stamp();
        Ok(())
    }

    fn rotate_stamp(&mut self) {
        self.concurrency_stamp = ConcurrencyStamp::new();
    }
}

impl Entity for Product {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl AggregateRoot for Product {
    fn concurrency_stamp(&self) -> &ConcurrencyStamp {
        &self.concurrency_stamp
    }
}

fn validate_name(name: &str) -> DomainResult<()> {
    if name.trim().is_empty() {
        return Err(DomainError::validation("name cannot be empty"));
    }
    let len = name.chars().count();
    if len > MAX_NAME_LENGTH {
        return Err(DomainError::validation(format!(
            "name cannot exceed {MAX_NAME_LENGTH} characters (got {len})"
        )));
    }
    Ok(())
}

fn validate_stock(quantity: i32) -> DomainResult<()> {
    if quantity < 0 {
        return Err(DomainError::validation(format!(
            "stock quantity cannot be negative (got {quantity})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_product_id() -> ProductId {
        ProductId::new(AggregateId::new())
    }

    fn widget() -> Product {
        Product::create(test_product_id(), "Widget", Decimal::new(100, 0), 50).unwrap()
    }

    #[test]
    fn create_product_sets_fields() {
        let id = test_product_id();
        let product = Product::create(id, "Widget", Decimal::new(1999, 2), 7).unwrap();

        assert_eq!(product.id_typed(), id);
        assert_eq!(product.name(), "Widget");
        assert_eq!(product.price().amount(), Decimal::new(1999, 2));
        assert_eq!(product.stock_quantity(), 7);
    }

    #[test]
    fn create_product_rejects_empty_name() {
        let err = Product::create(test_product_id(), "   ", Decimal::ONE, 1).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn create_product_rejects_long_name() {
        let name = "x".repeat(MAX_NAME_LENGTH + 1);
        let err = Product::create(test_product_id(), name, Decimal::ONE, 1).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn create_product_accepts_name_at_limit() {
        let name = "é".repeat(MAX_NAME_LENGTH);
        assert!(Product::create(test_product_id(), name, Decimal::ONE, 1).is_ok());
    }

    #[test]
    fn create_product_rejects_negative_price() {
        let err = Product::create(test_product_id(), "Widget", Decimal::new(-1, 2), 1).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn create_product_rejects_negative_stock() {
        let err = Product::create(test_product_id(), "Widget", Decimal::ONE, -1).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn zero_price_and_stock_are_valid() {
        let product = Product::create(test_product_id(), "Free sample", Decimal::ZERO, 0).unwrap();
        assert_eq!(product.price().amount(), Decimal::ZERO);
        assert_eq!(product.stock_quantity(), 0);
    }

    #[test]
    fn negative_zero_price_is_accepted() {
        let negative_zero = -Decimal::ZERO;
        assert!(Price::new(negative_zero).is_ok());
    }

    #[test]
    fn update_stock_rotates_stamp() {
        let mut product = widget();
        let before = product.concurrency_stamp().clone();

        product.update_stock(40).unwrap();

        assert_eq!(product.stock_quantity(), 40);
        assert_ne!(product.concurrency_stamp(), &before);
    }

    #[test]
    fn update_price_rotates_stamp() {
        let mut product = widget();
        let before = product.concurrency_stamp().clone();

        product.update_price(Decimal::new(12550, 2)).unwrap();

        assert_eq!(product.price().amount(), Decimal::new(12550, 2));
        assert_ne!(product.concurrency_stamp(), &before);
    }

    #[test]
    fn rejected_update_leaves_product_untouched() {
        let mut product = widget();
        let before = product.clone();

        assert!(product.update_stock(-5).is_err());
        assert!(product.update_price(Decimal::new(-1, 0)).is_err());

        assert_eq!(product, before);
    }

    #[test]
    fn apply_fields_is_all_or_nothing() {
        let mut product = widget();
        let before = product.clone();

        let update = ProductFieldsUpdate::price(Decimal::new(5, 0)).with_stock(-1);
        assert!(product.apply_fields(&update).is_err());
        assert_eq!(product, before);

        let update = ProductFieldsUpdate::price(Decimal::new(5, 0)).with_stock(3);
        product.apply_fields(&update).unwrap();
        assert_eq!(product.price().amount(), Decimal::new(5, 0));
        assert_eq!(product.stock_quantity(), 3);
        assert_ne!(product.concurrency_stamp(), before.concurrency_stamp());
    }

    #[test]
    fn apply_fields_rejects_empty_update() {
        let mut product = widget();
        let err = product.apply_fields(&ProductFieldsUpdate::default()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn restore_keeps_persisted_stamp() {
        let stamp = ConcurrencyStamp::from_persisted("0123456789abcdef0123456789abcdef");
        let product =
            Product::restore(test_product_id(), "Widget", Decimal::ONE, 1, stamp.clone()).unwrap();
        assert_eq!(product.concurrency_stamp(), &stamp);
    }

    #[test]
    fn price_deserialization_enforces_invariant() {
        let ok: Price = serde_json::from_str("\"12.50\"").unwrap();
        assert_eq!(ok.amount(), Decimal::new(1250, 2));

        let err = serde_json::from_str::<Price>("\"-3\"");
        assert!(err.is_err());
    }

    #[test]
    fn price_precision_and_magnitude_are_bounded() {
        assert!(Price::new(Decimal::new(1005, 3)).is_err());
        assert!(Price::new(Decimal::new(1500, 3)).is_ok());
        assert!(Price::new(Decimal::from(PRICE_UPPER_BOUND)).is_err());
        assert!(Price::new(Decimal::from(PRICE_UPPER_BOUND - 1)).is_ok());

        let mut product = widget();
        let before = product.clone();
        let err = product.update_price(Decimal::new(1005, 3)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(product, before);
    }

    #[test]
    fn product_id_parses_display_form() {
        let id = test_product_id();
        let parsed: ProductId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 500,
                ..ProptestConfig::default()
            })]

            /// Every accepted stock change lands exactly and rotates the stamp.
            #[test]
            fn valid_stock_updates_rotate_stamp(quantity in 0i32..=i32::MAX) {
                let mut product = widget();
                let before = product.concurrency_stamp().clone();

                product.update_stock(quantity).unwrap();

                prop_assert_eq!(product.stock_quantity(), quantity);
                prop_assert_ne!(product.concurrency_stamp(), &before);
            }

            /// Negative stock is always rejected without touching state.
            #[test]
            fn negative_stock_never_changes_state(quantity in i32::MIN..0i32) {
                let mut product = widget();
                let before = product.clone();

                prop_assert!(product.update_stock(quantity).is_err());
                prop_assert_eq!(product, before);
            }

            /// Prices keep their exact decimal value.
            #[test]
            fn valid_price_updates_are_exact(cents in 0i64..1_000_000_000i64) {
                let mut product = widget();
                let price = Decimal::new(cents, 2);

                product.update_price(price).unwrap();

                prop_assert_eq!(product.price().amount(), price);
            }

            /// Negative prices are always rejected without touching state.
            #[test]
            fn negative_price_never_changes_state(cents in -1_000_000_000i64..0i64) {
                let mut product = widget();
                let before = product.clone();

                prop_assert!(product.update_price(Decimal::new(cents, 2)).is_err());
                prop_assert_eq!(product, before);
            }

            /// Names within bounds are accepted as-is.
            #[test]
            fn bounded_names_are_accepted(name in "[A-Za-z][A-Za-z0-9 ]{0,127}") {
                let product =
                    Product::create(test_product_id(), name.clone(), Decimal::ONE, 0).unwrap();
                prop_assert_eq!(product.name(), name.as_str());
            }
        }
    }
}
