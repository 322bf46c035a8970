//! Configuration model.
//!
//! A configuration source is an ordered list of named groups, each holding
//! string key/value settings. Loaders in [`crate::loaders`] produce a
//! [`ConfigFile`] from a file on disk; the service definition loader turns
//! each group into a [`crate::service::ServiceDefinition`].
//!
//! [`SupervisorConfig`] carries the supervisor's own settings: where the
//! configuration sources live, the mode probes and the restart guard.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default system-scope configuration source.
pub const DEFAULT_SYSTEM_CONFIG: &str = "/etc/buckos/warden.ini";

/// Default privileged user-services configuration source.
pub const DEFAULT_USER_CONFIG: &str = "/etc/buckos/warden-user.ini";

/// File name of the app-scope source under the user's config directory.
pub const APP_CONFIG_NAME: &str = "buckos/warden.ini";

/// Default path of the system mode probe.
pub const DEFAULT_SYSTEM_MODE_PATH: &str = "/sys/kernel/system_mode";

/// Default graphics device whose presence gates graphical mode.
pub const DEFAULT_GRAPHICS_DEVICE: &str = "/dev/dri/card0";

/// Default location of the status snapshot written on SIGUSR1.
pub const DEFAULT_STATUS_FILE: &str = "/run/buckos/warden.status.json";

/// A single named group of settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigGroup {
    /// Group name; becomes the service name
    pub name: String,
    /// Settings in file order
    pub entries: Vec<(String, String)>,
    /// Lines of this group the loader could not parse
    pub problems: Vec<String>,
}

impl ConfigGroup {
    /// Create an empty group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
            problems: Vec::new(),
        }
    }

    /// Builder-style setter, mostly useful in tests.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Append a setting.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Record a syntax problem. A group with problems never becomes a
    /// service.
    pub fn reject(&mut self, problem: impl Into<String>) {
        self.problems.push(problem.into());
    }

    /// Look up a setting. The last assignment of a key wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// An ordered sequence of groups read from one configuration source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    /// Where the groups came from
    pub source: PathBuf,
    /// Groups in declaration order
    pub groups: Vec<ConfigGroup>,
}

impl ConfigFile {
    /// Create an empty configuration for the given source.
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            groups: Vec::new(),
        }
    }

    /// Create a configuration from groups already in memory.
    pub fn from_groups(source: impl Into<PathBuf>, groups: Vec<ConfigGroup>) -> Self {
        Self {
            source: source.into(),
            groups,
        }
    }
}

/// How the supervisor was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Invocation {
    /// Booting the system services
    #[default]
    System,
    /// Booting the services of a user session
    User,
}

/// A configuration source and whether its absence is tolerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSource {
    /// Path of the source
    pub path: PathBuf,
    /// Whether a missing file is expected
    pub optional: bool,
}

impl ConfigSource {
    /// A source that must exist.
    pub fn required(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            optional: false,
        }
    }

    /// A source whose absence is not an error.
    pub fn optional(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            optional: true,
        }
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// System or user-session invocation
    pub invocation: Invocation,
    /// Configuration sources, processed back to back
    pub sources: Vec<ConfigSource>,
    /// System mode probe
    pub system_mode_path: PathBuf,
    /// Graphics device checked before committing to graphical mode
    pub graphics_device: PathBuf,
    /// Number of graphics device checks
    pub graphics_attempts: u32,
    /// Delay between graphics device checks
    pub graphics_interval: Duration,
    /// A run shorter than this counts as a rapid restart
    pub rapid_restart_window: Duration,
    /// Rapid restarts tolerated before a service is given up on
    pub max_rapid_restarts: u32,
    /// Where the SIGUSR1 status snapshot is written
    pub status_file: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::for_invocation(Invocation::System)
    }
}

impl SupervisorConfig {
    /// Default configuration for the given invocation, including its sources.
    pub fn for_invocation(invocation: Invocation) -> Self {
        Self {
            invocation,
            sources: default_sources(invocation),
            system_mode_path: PathBuf::from(DEFAULT_SYSTEM_MODE_PATH),
            graphics_device: PathBuf::from(DEFAULT_GRAPHICS_DEVICE),
            graphics_attempts: 10,
            graphics_interval: Duration::from_secs(1),
            rapid_restart_window: Duration::from_secs(1),
            max_rapid_restarts: 5,
            status_file: PathBuf::from(DEFAULT_STATUS_FILE),
        }
    }
}

/// Configuration sources used when none are given explicitly.
pub fn default_sources(invocation: Invocation) -> Vec<ConfigSource> {
    match invocation {
        Invocation::System => vec![ConfigSource::required(DEFAULT_SYSTEM_CONFIG)],
        Invocation::User => {
            let mut sources = vec![ConfigSource::required(DEFAULT_USER_CONFIG)];
            if let Some(dir) = user_config_dir() {
                sources.push(ConfigSource::optional(dir.join(APP_CONFIG_NAME)));
            }
            sources
        }
    }
}

/// `$XDG_CONFIG_HOME`, falling back to `$HOME/.config`.
fn user_config_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|d| !d.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(|home| Path::new(&home).join(".config"))
}
