//! Configuration for binding a set of plugin libraries.

use serde::{Deserialize, Serialize};

/// Declarative configuration for a [`MultiLoader`](crate::MultiLoader).
///
/// Typically deserialized from the host application's configuration file and
/// passed to [`MultiLoader::from_config`](crate::MultiLoader::from_config).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiLoaderConfig {
    /// Whether libraries are loaded lazily and closed when their last
    /// managed instance drops.
    #[serde(default)]
    pub on_demand: bool,

    /// Library paths to bind, in dispatch order.
    #[serde(default)]
    pub libraries: Vec<String>,
}

impl MultiLoaderConfig {
    /// Start an empty configuration.
    pub fn new(on_demand: bool) -> Self {
        Self {
            on_demand,
            libraries: Vec::new(),
        }
    }

    /// Add a library path.
    pub fn with_library(mut self, library_path: impl Into<String>) -> Self {
        self.libraries.push(library_path.into());
        self
    }
}
