use std::collections::HashMap;

use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::{
    entities::{
        commerce::product_variant::{self, Entity as ProductVariant},
        product::{self, Entity as Product},
    },
    errors::ServiceError,
};

/// Largest quantity accepted on a single cart line.
pub const MAX_LINE_QUANTITY: i32 = 10_000;

/// `max(0, subtotal - discount + shipping_cost)`
pub fn compute_total(subtotal: Decimal, shipping_cost: Decimal, discount: Decimal) -> Decimal {
    (subtotal - discount + shipping_cost).max(Decimal::ZERO)
}

/// Converts a major-unit amount into the gateway's integer minor units.
pub fn to_minor_units(amount: Decimal, minor_exponent: u32) -> Result<i64, ServiceError> {
    let scale = Decimal::from(10_i64.pow(minor_exponent));
    (amount * scale)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| ServiceError::InvalidInput(format!("amount {} is out of range", amount)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceBreakdown {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub shipping_cost: Decimal,
    pub total: Decimal,
    /// `total` in the gateway's minor unit
    pub total_minor: i64,
}

/// Combines subtotal, shipping and discount and enforces the gateway's
/// minimum chargeable amount.
#[derive(Debug, Clone, Copy)]
pub struct PricingCalculator {
    min_amount_minor: i64,
    minor_exponent: u32,
}

impl PricingCalculator {
    pub fn new(min_amount_minor: i64, minor_exponent: u32) -> Self {
        Self {
            min_amount_minor,
            minor_exponent,
        }
    }

    pub fn minor_exponent(&self) -> u32 {
        self.minor_exponent
    }

    pub fn price(
        &self,
        subtotal: Decimal,
        shipping_cost: Decimal,
        discount: Decimal,
    ) -> Result<PriceBreakdown, ServiceError> {
        let total = compute_total(subtotal, shipping_cost, discount);
        let total_minor = to_minor_units(total, self.minor_exponent)?;

        if total_minor < self.min_amount_minor {
            return Err(ServiceError::BadRequest(format!(
                "order total {} is below the minimum chargeable amount",
                total
            )));
        }

        Ok(PriceBreakdown {
            subtotal,
            discount,
            shipping_cost,
            total,
            total_minor,
        })
    }
}

/// A cart line as submitted by the client
#[derive(Debug, Clone)]
pub struct LineRequest {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub quantity: i32,
    /// Price the cart displayed; recorded, never charged
    pub client_unit_price: Option<Decimal>,
}

/// A line priced from the live catalog
#[derive(Debug, Clone, PartialEq)]
pub struct PricedLine {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub client_unit_price: Option<Decimal>,
    pub line_total: Decimal,
}

pub fn subtotal_of(lines: &[PricedLine]) -> Decimal {
    lines.iter().map(|l| l.line_total).sum()
}

/// Prices every line from the catalog: the variant's price when a variant is
/// named, otherwise the product's.
pub async fn reprice_lines<C: ConnectionTrait>(
    conn: &C,
    lines: &[LineRequest],
) -> Result<Vec<PricedLine>, ServiceError> {
    if lines.is_empty() {
        return Err(ServiceError::ValidationError(
            "order must contain at least one item".to_string(),
        ));
    }

    if let Some(bad) = lines
        .iter()
        .find(|l| l.quantity <= 0 || l.quantity > MAX_LINE_QUANTITY)
    {
        return Err(ServiceError::ValidationError(format!(
            "quantity for product {} must be between 1 and {}",
            bad.product_id, MAX_LINE_QUANTITY
        )));
    }

    let product_ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();
    let products: HashMap<Uuid, product::Model> = Product::find()
        .filter(product::Column::Id.is_in(product_ids))
        .all(conn)
        .await?
        .into_iter()
        .map(|p| (p.id, p))
        .collect();

    let variant_ids: Vec<Uuid> = lines.iter().filter_map(|l| l.variant_id).collect();
    let variants: HashMap<Uuid, product_variant::Model> = if variant_ids.is_empty() {
        HashMap::new()
    } else {
        ProductVariant::find()
            .filter(product_variant::Column::Id.is_in(variant_ids))
            .all(conn)
            .await?
            .into_iter()
            .map(|v| (v.id, v))
            .collect()
    };

    lines
        .iter()
        .map(|line| {
            let product = products
                .get(&line.product_id)
                .filter(|p| p.is_active)
                .ok_or_else(|| {
                    ServiceError::ValidationError(format!(
                        "product {} is not available",
                        line.product_id
                    ))
                })?;

            let (name, unit_price) = match line.variant_id {
                Some(variant_id) => {
                    let variant = variants
                        .get(&variant_id)
                        .filter(|v| v.product_id == product.id)
                        .ok_or_else(|| {
                            ServiceError::ValidationError(format!(
                                "variant {} does not belong to product {}",
                                variant_id, product.id
                            ))
                        })?;
                    (format!("{} - {}", product.name, variant.name), variant.price)
                }
                None => (product.name.clone(), product.price),
            };

            if let Some(client_price) = line.client_unit_price {
                if client_price != unit_price {
                    debug!(
                        product_id = %line.product_id,
                        %client_price,
                        catalog_price = %unit_price,
                        "client price differs from catalog; charging catalog price"
                    );
                }
            }

            Ok(PricedLine {
                product_id: line.product_id,
                variant_id: line.variant_id,
                name,
                quantity: line.quantity,
                unit_price,
                client_unit_price: line.client_unit_price,
                line_total: unit_price * Decimal::from(line.quantity),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    #[test]
    fn total_is_clamped_at_zero() {
        assert_eq!(compute_total(dec!(100), dec!(0), dec!(250)), Decimal::ZERO);
        assert_eq!(compute_total(dec!(2000), dec!(0), dec!(200)), dec!(1800));
        assert_eq!(compute_total(dec!(500), dec!(100), dec!(50)), dec!(550));
    }

    #[test]
    fn minor_units_use_the_currency_exponent() {
        assert_eq!(to_minor_units(dec!(1800), 2).unwrap(), 180_000);
        assert_eq!(to_minor_units(dec!(0.50), 2).unwrap(), 50);
        assert_eq!(to_minor_units(dec!(12.345), 2).unwrap(), 1235);
        assert_eq!(to_minor_units(dec!(500), 0).unwrap(), 500);
    }

    #[test]
    fn calculator_rejects_totals_below_gateway_floor() {
        let calc = PricingCalculator::new(100, 2);

        assert_matches!(
            calc.price(dec!(0.50), dec!(0), dec!(0)),
            Err(ServiceError::BadRequest(_))
        );
        // Fully discounted carts cannot be charged either
        assert_matches!(
            calc.price(dec!(300), dec!(0), dec!(300)),
            Err(ServiceError::BadRequest(_))
        );

        let ok = calc.price(dec!(50), dec!(0), dec!(0)).unwrap();
        assert_eq!(ok.total, dec!(50));
        assert_eq!(ok.total_minor, 5_000);

        let floor = calc.price(dec!(1), dec!(0), dec!(0)).unwrap();
        assert_eq!(floor.total_minor, 100);
    }

    #[test]
    fn subtotal_sums_line_totals() {
        let line = |total: Decimal| PricedLine {
            product_id: Uuid::new_v4(),
            variant_id: None,
            name: "Tee".into(),
            quantity: 1,
            unit_price: total,
            client_unit_price: None,
            line_total: total,
        };
        assert_eq!(subtotal_of(&[line(dec!(1200)), line(dec!(800))]), dec!(2000));
    }
}
