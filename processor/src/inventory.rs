use std::collections::BTreeSet;

use data_model::{instance_family, PoolId, ProtectedInstance};

use crate::config::PoolCatalogConfig;

/// Read-only view over the configured pool catalog. Answers which pools a
/// replacement for an instance may be placed in and what they cost.
#[derive(Debug, Clone, Default)]
pub struct PoolCatalog {
    config: PoolCatalogConfig,
}

impl PoolCatalog {
    pub fn new(config: PoolCatalogConfig) -> Self {
        Self { config }
    }

    pub fn region_of_zone(&self, zone: &str) -> Option<&str> {
        self.config
            .regions
            .iter()
            .find(|(_, zones)| zones.iter().any(|z| z == zone))
            .map(|(region, _)| region.as_str())
    }

    pub fn zones(&self, region: &str) -> Vec<String> {
        self.config.regions.get(region).cloned().unwrap_or_default()
    }

    /// The family itself followed by the families configured as
    /// compatible with it.
    pub fn families_for(&self, family: &str) -> Vec<String> {
        let mut families = vec![family.to_string()];
        if let Some(entry) = self.config.families.get(family) {
            for compatible in &entry.compatible {
                if !families.contains(compatible) {
                    families.push(compatible.clone());
                }
            }
        }
        families
    }

    /// Sibling pools a replacement for `instance` could land in, including
    /// its own pool. Zones come from the instance's region, or from the
    /// region owning its zone when the region is not in the catalog.
    pub fn candidate_pools(&self, instance: &ProtectedInstance) -> Vec<PoolId> {
        let mut zones = self.zones(&instance.region);
        if zones.is_empty() {
            if let Some(region) = self.region_of_zone(&instance.pool.zone) {
                zones = self.zones(region);
            }
        }
        if !zones.contains(&instance.pool.zone) {
            zones.push(instance.pool.zone.clone());
        }

        let family = instance_family(&instance.instance_type);
        let mut seen = BTreeSet::new();
        let mut pools = Vec::new();
        for family in self.families_for(&family) {
            for zone in &zones {
                let pool = PoolId::new(&family, zone);
                if seen.insert(pool.to_string()) {
                    pools.push(pool);
                }
            }
        }
        pools
    }

    pub fn is_compatible(&self, family: &str, other: &str) -> bool {
        family == other ||
            self.config
                .families
                .get(family)
                .is_some_and(|f| f.compatible.iter().any(|c| c == other))
    }

    pub fn hourly_rate(&self, family: &str) -> Option<f64> {
        self.config
            .families
            .get(family)
            .and_then(|f| f.hourly_rate_usd)
    }
}
