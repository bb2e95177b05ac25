use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use serde::Serialize;
use tracing::{debug, instrument, warn};
use utoipa::ToSchema;

use crate::{
    entities::commerce::coupon::{self, normalize_code, DiscountType, Entity as Coupon},
    errors::ServiceError,
};

/// Why a coupon code was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CouponRejection {
    #[error("invalid code")]
    InvalidCode,
    #[error("code expired")]
    Expired,
    #[error("usage limit reached")]
    UsageLimitReached,
    #[error("minimum order amount not met")]
    MinimumNotMet,
}

/// A coupon accepted for a given subtotal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct AppliedCoupon {
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    /// Amount taken off the subtotal, never more than the subtotal
    pub discount_amount: Decimal,
}

/// Discount produced by a coupon descriptor for `subtotal`, rounded to the
/// currency's minor unit and capped at the subtotal.
pub fn discount_amount(
    discount_type: DiscountType,
    discount_value: Decimal,
    subtotal: Decimal,
    minor_exponent: u32,
) -> Decimal {
    if subtotal <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let raw = match discount_type {
        DiscountType::Percentage => {
            let pct = discount_value.clamp(Decimal::ZERO, Decimal::ONE_HUNDRED);
            (subtotal * pct / Decimal::ONE_HUNDRED)
                .round_dp_with_strategy(minor_exponent, RoundingStrategy::MidpointAwayFromZero)
        }
        DiscountType::Fixed => discount_value.max(Decimal::ZERO),
    };

    raw.min(subtotal)
}

/// Pure coupon check. `coupon` is the row looked up by normalized code, if any.
/// When `subtotal` is `None` only the code's own constraints are checked and
/// the discount amount is reported as zero.
pub fn evaluate_coupon(
    coupon: Option<&coupon::Model>,
    subtotal: Option<Decimal>,
    now: DateTime<Utc>,
    minor_exponent: u32,
) -> Result<AppliedCoupon, CouponRejection> {
    let coupon = match coupon {
        Some(c) if c.is_active => c,
        _ => return Err(CouponRejection::InvalidCode),
    };

    if matches!(coupon.expires_at, Some(expires_at) if expires_at < now) {
        return Err(CouponRejection::Expired);
    }

    if matches!(coupon.usage_limit, Some(limit) if coupon.usage_count >= limit) {
        return Err(CouponRejection::UsageLimitReached);
    }

    let discount = match subtotal {
        Some(subtotal) => {
            if matches!(coupon.min_order_amount, Some(min) if subtotal < min) {
                return Err(CouponRejection::MinimumNotMet);
            }
            discount_amount(
                coupon.discount_type,
                coupon.discount_value,
                subtotal,
                minor_exponent,
            )
        }
        None => Decimal::ZERO,
    };

    Ok(AppliedCoupon {
        code: coupon.code.clone(),
        discount_type: coupon.discount_type,
        discount_value: coupon.discount_value,
        discount_amount: discount,
    })
}

/// Coupon lookup and evaluation. Evaluation never touches `usage_count`;
/// redemption is recorded by payment reconciliation through
/// [`CouponService::record_redemption`].
#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
    minor_exponent: u32,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>, minor_exponent: u32) -> Self {
        Self { db, minor_exponent }
    }

    pub async fn find_by_code(&self, code: &str) -> Result<Option<coupon::Model>, ServiceError> {
        let normalized = normalize_code(code);
        if normalized.is_empty() {
            return Ok(None);
        }

        Ok(Coupon::find()
            .filter(coupon::Column::Code.eq(normalized))
            .one(&*self.db)
            .await?)
    }

    /// Evaluates `code` against `subtotal` at `now`. The outer error is an
    /// infrastructure failure; the inner one is a business rejection.
    #[instrument(skip(self))]
    pub async fn evaluate(
        &self,
        code: &str,
        subtotal: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<Result<AppliedCoupon, CouponRejection>, ServiceError> {
        let coupon = self.find_by_code(code).await?;
        let outcome = evaluate_coupon(coupon.as_ref(), subtotal, now, self.minor_exponent);

        if let Err(reason) = &outcome {
            debug!(code = %normalize_code(code), %reason, "coupon rejected");
        }

        Ok(outcome)
    }

    /// Atomically bumps `usage_count` by one. Runs on the caller's
    /// connection so it commits or rolls back with the reconciliation.
    pub async fn record_redemption<C: ConnectionTrait>(
        conn: &C,
        code: &str,
    ) -> Result<(), ServiceError> {
        let result = Coupon::update_many()
            .col_expr(
                coupon::Column::UsageCount,
                Expr::col(coupon::Column::UsageCount).add(1),
            )
            .col_expr(coupon::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(coupon::Column::Code.eq(normalize_code(code)))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            // Coupon row deleted after the order was priced; the order keeps its discount.
            warn!(code = %code, "coupon redeemed on a paid order no longer exists");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rstest::rstest;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn coupon(discount_type: DiscountType, value: Decimal) -> coupon::Model {
        let now = Utc::now();
        coupon::Model {
            id: Uuid::new_v4(),
            code: "SAVE10".into(),
            discount_type,
            discount_value: value,
            min_order_amount: None,
            usage_limit: None,
            usage_count: 0,
            expires_at: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[rstest]
    #[case(DiscountType::Percentage, dec!(10), dec!(2000), dec!(200))]
    #[case(DiscountType::Percentage, dec!(100), dec!(450), dec!(450))]
    #[case(DiscountType::Percentage, dec!(150), dec!(450), dec!(450))]
    #[case(DiscountType::Percentage, dec!(12.5), dec!(99.99), dec!(12.50))]
    #[case(DiscountType::Fixed, dec!(300), dec!(2000), dec!(300))]
    #[case(DiscountType::Fixed, dec!(300), dec!(120), dec!(120))]
    #[case(DiscountType::Fixed, dec!(300), dec!(0), dec!(0))]
    fn discount_amount_cases(
        #[case] kind: DiscountType,
        #[case] value: Decimal,
        #[case] subtotal: Decimal,
        #[case] expected: Decimal,
    ) {
        assert_eq!(discount_amount(kind, value, subtotal, 2), expected);
    }

    #[test]
    fn unknown_or_inactive_code_is_invalid() {
        let now = Utc::now();
        assert_eq!(
            evaluate_coupon(None, Some(dec!(100)), now, 2),
            Err(CouponRejection::InvalidCode)
        );

        let mut inactive = coupon(DiscountType::Fixed, dec!(10));
        inactive.is_active = false;
        assert_eq!(
            evaluate_coupon(Some(&inactive), Some(dec!(100)), now, 2),
            Err(CouponRejection::InvalidCode)
        );
    }

    #[test]
    fn expired_code_is_rejected() {
        let now = Utc::now();
        let mut c = coupon(DiscountType::Percentage, dec!(10));
        c.expires_at = Some(now - Duration::minutes(1));
        let err = evaluate_coupon(Some(&c), Some(dec!(100)), now, 2).unwrap_err();
        assert_eq!(err, CouponRejection::Expired);
        assert_eq!(err.to_string(), "code expired");

        c.expires_at = Some(now + Duration::days(1));
        assert!(evaluate_coupon(Some(&c), Some(dec!(100)), now, 2).is_ok());
    }

    #[test]
    fn exhausted_code_is_rejected() {
        let now = Utc::now();
        let mut c = coupon(DiscountType::Percentage, dec!(10));
        c.usage_limit = Some(5);
        c.usage_count = 5;
        let err = evaluate_coupon(Some(&c), Some(dec!(100)), now, 2).unwrap_err();
        assert_eq!(err.to_string(), "usage limit reached");

        c.usage_count = 4;
        assert!(evaluate_coupon(Some(&c), Some(dec!(100)), now, 2).is_ok());
    }

    #[test]
    fn minimum_order_amount_applies_only_with_subtotal() {
        let now = Utc::now();
        let mut c = coupon(DiscountType::Fixed, dec!(50));
        c.min_order_amount = Some(dec!(500));

        assert_eq!(
            evaluate_coupon(Some(&c), Some(dec!(499)), now, 2),
            Err(CouponRejection::MinimumNotMet)
        );

        let applied = evaluate_coupon(Some(&c), None, now, 2).unwrap();
        assert_eq!(applied.discount_amount, Decimal::ZERO);
        assert_eq!(applied.discount_value, dec!(50));
    }

    #[test]
    fn evaluation_reports_descriptor_and_amount() {
        let c = coupon(DiscountType::Percentage, dec!(10));
        let applied = evaluate_coupon(Some(&c), Some(dec!(2000)), Utc::now(), 2).unwrap();
        assert_eq!(
            applied,
            AppliedCoupon {
                code: "SAVE10".into(),
                discount_type: DiscountType::Percentage,
                discount_value: dec!(10),
                discount_amount: dec!(200),
            }
        );
    }
}
