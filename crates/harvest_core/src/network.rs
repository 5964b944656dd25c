use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type NetworkId = u64;

/// Property forcing a full harvest even when an incremental one was requested.
pub const FORCE_FULL_HARVESTING: &str = "FORCE_FULL_HARVESTING";
/// Property asking for an Identify call to learn the repository granularity.
pub const DISCOVER_CAPABILITIES: &str = "HARVEST_IDENTIFY_PARAMETERS";

/// Reference to a prevalidation rule-set; compiled by the validation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRef {
    pub id: u64,
    pub name: String,
}

/// A harvested repository as configured by the platform. Read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: NetworkId,
    pub name: String,
    pub origin_url: String,
    pub metadata_prefix: String,
    pub metadata_store_schema: String,
    #[serde(default)]
    pub sets: Vec<String>,
    #[serde(default)]
    pub prevalidator: Option<ValidatorRef>,
    #[serde(default)]
    pub properties: BTreeMap<String, bool>,
}

impl Network {
    pub fn new(
        id: NetworkId,
        name: impl Into<String>,
        origin_url: impl Into<String>,
        metadata_prefix: impl Into<String>,
    ) -> Self {
        let metadata_prefix = metadata_prefix.into();
        Self {
            id,
            name: name.into(),
            origin_url: origin_url.into(),
            metadata_store_schema: metadata_prefix.clone(),
            metadata_prefix,
            sets: Vec::new(),
            prevalidator: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_sets<I, S>(mut self, sets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sets = sets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_store_schema(mut self, schema: impl Into<String>) -> Self {
        self.metadata_store_schema = schema.into();
        self
    }

    pub fn with_prevalidator(mut self, validator: ValidatorRef) -> Self {
        self.prevalidator = Some(validator);
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: bool) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Unset properties read as `false`.
    pub fn bool_property(&self, name: &str) -> bool {
        self.properties.get(name).copied().unwrap_or(false)
    }

    pub fn force_full_harvesting(&self) -> bool {
        self.bool_property(FORCE_FULL_HARVESTING)
    }

    pub fn discover_capabilities(&self) -> bool {
        self.bool_property(DISCOVER_CAPABILITIES)
    }

    pub fn harvests_by_set(&self) -> bool {
        !self.sets.is_empty()
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.origin_url)
    }
}
