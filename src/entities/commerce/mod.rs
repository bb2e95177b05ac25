//! Storefront catalog and configuration tables.

pub mod coupon;
pub mod product_variant;
pub mod store_setting;

pub use super::product::{Entity as Product, Model as ProductModel};
pub use coupon::{DiscountType, Entity as Coupon, Model as CouponModel};
pub use product_variant::{Entity as ProductVariant, Model as ProductVariantModel};
pub use store_setting::{Entity as StoreSetting, Model as StoreSettingModel};
