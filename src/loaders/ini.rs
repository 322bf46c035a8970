//! INI configuration loader.
//!
//! ```ini
//! # comments start with '#' or ';'
//! [WindowServer]
//! Executable=/usr/bin/window-server
//! Socket=/run/window-server.sock
//! SystemModes=graphical
//! ```
//!
//! Malformed lines never fail the file. A broken line inside a section
//! marks that group as rejected, so only that service is skipped; a broken
//! section header opens a rejected group that swallows the settings under
//! it. Lines before the first section belong to no service and are skipped
//! with a warning. Repeated section headers produce separate groups so that
//! the definition loader can report them.

use super::ConfigLoader;
use crate::config::{ConfigFile, ConfigGroup};
use crate::error::Result;
use std::path::Path;
use tracing::warn;

/// Loader for INI configuration files.
pub struct IniLoader;

impl ConfigLoader for IniLoader {
    fn parse(&self, content: &str, path: &Path) -> Result<ConfigFile> {
        Ok(parse_groups(content, path))
    }

    fn supports_extension(&self, ext: &str) -> bool {
        matches!(ext, "ini" | "conf")
    }

    fn name(&self) -> &'static str {
        "INI"
    }
}

/// Parse INI content into groups.
fn parse_groups(content: &str, path: &Path) -> ConfigFile {
    let mut file = ConfigFile::new(path);

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        let lineno = index + 1;

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(header) = line.strip_prefix('[') {
            let (name, problem) = match header.strip_suffix(']').map(str::trim) {
                Some("") => (line, "empty section name"),
                Some(name) => (name, ""),
                None => (header.trim(), "malformed section header"),
            };

            let mut group = ConfigGroup::new(name);
            if !problem.is_empty() {
                warn!(path = %path.display(), line = lineno, group = %name, "{}", problem);
                group.reject(format!("line {}: {}", lineno, problem));
            }
            file.groups.push(group);
            continue;
        }

        let Some(group) = file.groups.last_mut() else {
            warn!(path = %path.display(), line = lineno, "Ignoring setting outside of a section");
            continue;
        };

        match line.split_once('=') {
            Some((key, value)) => group.set(key.trim(), value.trim()),
            None => {
                warn!(path = %path.display(), line = lineno, group = %group.name, "Expected key=value");
                group.reject(format!("line {}: expected key=value", lineno));
            }
        }
    }

    file
}
