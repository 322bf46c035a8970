//! Configuration loaders for different file formats.
//!
//! Every loader produces the same [`ConfigFile`]: an ordered list of named
//! groups with string settings. Supported formats:
//!
//! - INI (`.ini`, `.conf`), the native warden format
//! - TOML (`.toml`), where each top-level table is a group

pub mod ini;
pub mod toml;

use crate::config::ConfigFile;
use crate::error::{Error, Result};
use std::path::Path;

/// Trait for configuration loaders.
///
/// Implement this trait to add support for new configuration formats.
pub trait ConfigLoader: Send + Sync {
    /// Parse configuration text. `path` is only used for error reporting.
    fn parse(&self, content: &str, path: &Path) -> Result<ConfigFile>;

    /// Check if this loader supports the given file extension.
    fn supports_extension(&self, ext: &str) -> bool;

    /// Get a description of the loader for logging purposes.
    fn name(&self) -> &'static str;

    /// Load configuration from the given path.
    fn load(&self, path: &Path) -> Result<ConfigFile> {
        let content = std::fs::read_to_string(path)?;
        self.parse(&content, path)
    }
}

/// Registry of configuration loaders.
pub struct LoaderRegistry {
    loaders: Vec<Box<dyn ConfigLoader>>,
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LoaderRegistry {
    /// Create a new loader registry with default loaders.
    pub fn new() -> Self {
        let mut registry = Self {
            loaders: Vec::new(),
        };

        registry.register(Box::new(ini::IniLoader));
        registry.register(Box::new(toml::TomlLoader));

        registry
    }

    /// Register a new loader.
    pub fn register(&mut self, loader: Box<dyn ConfigLoader>) {
        self.loaders.push(loader);
    }

    /// Find a loader that supports the given file extension.
    pub fn find_loader(&self, ext: &str) -> Option<&dyn ConfigLoader> {
        self.loaders
            .iter()
            .find(|loader| loader.supports_extension(ext))
            .map(|b| b.as_ref())
    }

    /// Load configuration from the given path.
    ///
    /// The loader is picked by file extension; files without a known
    /// extension are read as INI.
    pub fn load(&self, path: &Path) -> Result<ConfigFile> {
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("ini");

        let loader = self
            .find_loader(ext)
            .ok_or_else(|| Error::ConfigError(format!("No loader found for extension: {}", ext)))?;

        tracing::debug!(path = %path.display(), loader = loader.name(), "Loading configuration");
        loader.load(path)
    }
}

pub use self::ini::IniLoader;
pub use self::toml::TomlLoader;
