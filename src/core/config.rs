//! Catalog configuration.

use serde::{Deserialize, Serialize};

use crate::core::negotiation::APPLICATION_JSON;

/// Prefix of the environment variables read by [`CatalogConfig::from_env`].
pub const ENV_PREFIX: &str = "FUNCTION_CATALOG_";

/// Configuration for a [`FunctionCatalog`](crate::FunctionCatalog)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Definition used when a lookup receives an empty one
    pub definition: Option<String>,
    /// Content type assumed when a lookup names none (default: application/json)
    pub default_content_type: String,
    /// Re-registering a name replaces the old entry (default: true)
    pub allow_overwrite: bool,
    /// Unclassifiable callables register as opaque pass-throughs (default: false)
    pub allow_opaque: bool,
    /// Erased element types are treated as streams (default: true)
    pub unknown_as_stream: bool,
    /// Message header the routing function reads its definition from
    pub routing_header: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            definition: None,
            default_content_type: APPLICATION_JSON.to_string(),
            allow_overwrite: true,
            allow_opaque: false,
            unknown_as_stream: true,
            routing_header: "function.definition".to_string(),
        }
    }
}

impl CatalogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_definition(mut self, definition: impl Into<String>) -> Self {
        self.definition = Some(definition.into());
        self
    }

    pub fn with_default_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.default_content_type = content_type.into();
        self
    }

    pub fn with_allow_overwrite(mut self, allow: bool) -> Self {
        self.allow_overwrite = allow;
        self
    }

    pub fn with_allow_opaque(mut self, allow: bool) -> Self {
        self.allow_opaque = allow;
        self
    }

    pub fn with_unknown_as_stream(mut self, stream: bool) -> Self {
        self.unknown_as_stream = stream;
        self
    }

    pub fn with_routing_header(mut self, header: impl Into<String>) -> Self {
        self.routing_header = header.into();
        self
    }

    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Defaults overridden by `FUNCTION_CATALOG_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let flag = |name: &str, default: bool| match var(name) {
            None => default,
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    log::warn!("Ignoring {ENV_PREFIX}{name}={raw}: expected a boolean");
                    default
                }
            },
        };

        let defaults = Self::default();
        Self {
            definition: var("DEFINITION").filter(|d| !d.trim().is_empty()),
            default_content_type: var("DEFAULT_CONTENT_TYPE")
                .unwrap_or(defaults.default_content_type),
            allow_overwrite: flag("ALLOW_OVERWRITE", defaults.allow_overwrite),
            allow_opaque: flag("ALLOW_OPAQUE", defaults.allow_opaque),
            unknown_as_stream: flag("UNKNOWN_AS_STREAM", defaults.unknown_as_stream),
            routing_header: var("ROUTING_HEADER").unwrap_or(defaults.routing_header),
        }
    }
}
