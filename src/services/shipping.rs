use std::{collections::HashMap, str::FromStr, sync::Arc};

use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::Serialize;
use tracing::warn;
use utoipa::ToSchema;

use crate::{
    entities::{
        commerce::store_setting::{self, Entity as StoreSetting},
        order::ShippingMethod,
    },
    errors::ServiceError,
};

const STANDARD_PRICE: &str = "shipping_standard_price";
const STANDARD_LABEL: &str = "shipping_standard_label";
const STANDARD_ETA: &str = "shipping_standard_eta";
const EXPRESS_PRICE: &str = "shipping_express_price";
const EXPRESS_LABEL: &str = "shipping_express_label";
const EXPRESS_ETA: &str = "shipping_express_eta";

const SETTING_KEYS: [&str; 6] = [
    STANDARD_PRICE,
    STANDARD_LABEL,
    STANDARD_ETA,
    EXPRESS_PRICE,
    EXPRESS_LABEL,
    EXPRESS_ETA,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ShippingOption {
    pub method: ShippingMethod,
    pub price: Decimal,
    pub label: String,
    pub eta: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ShippingOptions {
    pub standard: ShippingOption,
    pub express: ShippingOption,
}

impl ShippingOptions {
    pub fn cost_for(&self, method: ShippingMethod) -> Decimal {
        match method {
            ShippingMethod::Standard => self.standard.price,
            ShippingMethod::Express => self.express.price,
        }
    }

    fn from_settings(settings: &HashMap<String, String>) -> Self {
        let text = |key: &str, default: &str| {
            settings
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
                .to_string()
        };

        Self {
            standard: ShippingOption {
                method: ShippingMethod::Standard,
                price: price_setting(settings, STANDARD_PRICE, Decimal::ZERO),
                label: text(STANDARD_LABEL, "Standard Delivery"),
                eta: text(STANDARD_ETA, "5-7 business days"),
            },
            express: ShippingOption {
                method: ShippingMethod::Express,
                price: price_setting(settings, EXPRESS_PRICE, Decimal::ONE_HUNDRED),
                label: text(EXPRESS_LABEL, "Express Delivery"),
                eta: text(EXPRESS_ETA, "1-2 business days"),
            },
        }
    }
}

impl Default for ShippingOptions {
    fn default() -> Self {
        Self::from_settings(&HashMap::new())
    }
}

fn price_setting(settings: &HashMap<String, String>, key: &str, default: Decimal) -> Decimal {
    match settings.get(key).map(|v| v.trim()) {
        None | Some("") => default,
        Some(raw) => match Decimal::from_str(raw) {
            Ok(price) if price >= Decimal::ZERO => price,
            _ => {
                warn!(key, value = raw, "ignoring malformed shipping price setting");
                default
            }
        },
    }
}

/// Read-only view of shipping prices kept in `store_settings`.
#[derive(Clone)]
pub struct ShippingSettingsService {
    db: Arc<DatabaseConnection>,
}

impl ShippingSettingsService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn options(&self) -> Result<ShippingOptions, ServiceError> {
        let settings: HashMap<String, String> = StoreSetting::find()
            .filter(store_setting::Column::Key.is_in(SETTING_KEYS))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|s| (s.key, s.value))
            .collect();

        Ok(ShippingOptions::from_settings(&settings))
    }

    pub async fn cost_for(&self, method: ShippingMethod) -> Result<Decimal, ServiceError> {
        Ok(self.options().await?.cost_for(method))
    }
}
