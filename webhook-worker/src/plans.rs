//! Static mapping from billing product identifiers to plan tiers.

use std::collections::HashMap;

use tracing::warn;

use crate::model::Plan;
use crate::Config;

/// Lookup table from Stripe product id to internal [`Plan`].
///
/// An unknown product is not a lookup miss to paper over: the caller treats it
/// as a data-integrity failure.
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    products: HashMap<String, Plan>,
}

impl PlanCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a product id for a plan.
    pub fn with_product(mut self, product_id: impl Into<String>, plan: Plan) -> Self {
        self.products.insert(product_id.into(), plan);
        self
    }

    /// Build the catalog from the dedicated product variables plus
    /// `PLAN_PRODUCT_MAP`. Entries naming an unknown plan are skipped.
    pub fn from_config(config: &Config) -> Self {
        let mut catalog = PlanCatalog::new();

        if let Some(id) = &config.growth_plan_product_id {
            catalog = catalog.with_product(id.clone(), Plan::Growth);
        }
        if let Some(id) = &config.eagle_eye_plan_product_id {
            catalog = catalog.with_product(id.clone(), Plan::EagleEye);
        }

        for (product, plan) in &config.plan_product_map {
            match plan.parse::<Plan>() {
                Ok(plan) => catalog = catalog.with_product(product.clone(), plan),
                Err(e) => warn!(product = %product, error = %e, "plan_catalog_entry_skipped"),
            }
        }

        catalog
    }

    pub fn plan_for(&self, product_id: &str) -> Option<Plan> {
        self.products.get(product_id).copied()
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}
