//! TOML configuration loader.
//!
//! Each top-level table is one group. Scalar values are stringified and
//! arrays of scalars are joined with commas, so
//! `Socket = ["/run/a.sock", "/run/b.sock"]` reads the same as the INI
//! `Socket=/run/a.sock,/run/b.sock`.
//!
//! A value that cannot be stringified rejects only its group; top-level
//! keys outside any table are skipped with a warning. A TOML syntax error
//! fails the whole file, since no group boundaries can be trusted.

use super::ConfigLoader;
use crate::config::{ConfigFile, ConfigGroup};
use crate::error::{Error, Result};
use std::path::Path;
use toml::Value;
use tracing::warn;

/// Loader for TOML configuration files.
pub struct TomlLoader;

impl ConfigLoader for TomlLoader {
    fn parse(&self, content: &str, path: &Path) -> Result<ConfigFile> {
        let table: toml::Table = toml::from_str(content).map_err(|e| Error::InvalidConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut file = ConfigFile::new(path);
        for (name, value) in table {
            let Value::Table(settings) = value else {
                warn!(path = %path.display(), key = %name, "Ignoring top-level key outside of a table");
                continue;
            };

            let mut group = ConfigGroup::new(name.as_str());
            for (key, value) in settings {
                match stringify(&value) {
                    Some(value) => group.set(key, value),
                    None => {
                        warn!(path = %path.display(), group = %name, key = %key, "Unsupported value");
                        group.reject(format!("unsupported value for {}.{}", name, key));
                    }
                }
            }
            file.groups.push(group);
        }

        Ok(file)
    }

    fn supports_extension(&self, ext: &str) -> bool {
        ext == "toml"
    }

    fn name(&self) -> &'static str {
        "TOML"
    }
}

fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Array(_) | Value::Table(_) => None,
                other => stringify(other),
            })
            .collect::<Option<Vec<_>>>()
            .map(|items| items.join(",")),
        Value::Datetime(_) | Value::Table(_) => None,
    }
}
