//! System mode resolution.
//!
//! The boot mode is read once from a probe file. Graphical mode is only kept
//! if the graphics device shows up within a bounded number of checks, since
//! device nodes appear asynchronously during boot.

use crate::config::SupervisorConfig;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Boot-time operating posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SystemMode {
    /// Text console only
    Text,
    /// Graphical session
    #[default]
    Graphical,
    /// Automated self-test run
    SelfTest,
}

impl SystemMode {
    /// All modes, in the order they are usually listed.
    pub const ALL: [SystemMode; 3] = [SystemMode::Text, SystemMode::Graphical, SystemMode::SelfTest];

    /// Name as written in configuration and in the probe file.
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemMode::Text => "text",
            SystemMode::Graphical => "graphical",
            SystemMode::SelfTest => "self-test",
        }
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SystemMode {
    type Err = Error;

    /// Case-sensitive parse of a mode name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(SystemMode::Text),
            "graphical" => Ok(SystemMode::Graphical),
            "self-test" => Ok(SystemMode::SelfTest),
            other => Err(Error::ConfigError(format!("unknown system mode: {}", other))),
        }
    }
}

/// Determines the active [`SystemMode`].
#[derive(Debug, Clone)]
pub struct ModeResolver {
    probe_path: PathBuf,
    graphics_device: PathBuf,
    attempts: u32,
    interval: Duration,
}

impl ModeResolver {
    /// Create a resolver reading `probe_path` and gating graphical mode on
    /// `graphics_device`.
    pub fn new(
        probe_path: impl Into<PathBuf>,
        graphics_device: impl Into<PathBuf>,
        attempts: u32,
        interval: Duration,
    ) -> Self {
        Self {
            probe_path: probe_path.into(),
            graphics_device: graphics_device.into(),
            attempts,
            interval,
        }
    }

    /// Create a resolver from the supervisor configuration.
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(
            &config.system_mode_path,
            &config.graphics_device,
            config.graphics_attempts,
            config.graphics_interval,
        )
    }

    /// Probe the mode and, if graphical, wait for the graphics device.
    pub async fn resolve(&self, current: SystemMode) -> SystemMode {
        let mode = self.probe(current);
        self.await_graphics(mode).await
    }

    /// Read the probe file.
    ///
    /// Unrecognised content yields [`SystemMode::Text`]. A read failure also
    /// yields text mode, except that an already selected self-test mode is
    /// kept.
    pub fn probe(&self, current: SystemMode) -> SystemMode {
        let content = match std::fs::read_to_string(&self.probe_path) {
            Ok(content) => content,
            Err(e) => {
                let fallback = if current == SystemMode::SelfTest {
                    SystemMode::SelfTest
                } else {
                    SystemMode::Text
                };
                warn!(
                    path = %self.probe_path.display(),
                    error = %e,
                    mode = %fallback,
                    "Failed to read system mode"
                );
                return fallback;
            }
        };

        let value = content.strip_suffix('\n').unwrap_or(&content);
        let value = value.strip_suffix('\r').unwrap_or(value);
        let mode = value.parse().unwrap_or_else(|_| {
            debug!(value = %value, "Unrecognised system mode, using text");
            SystemMode::Text
        });

        info!(mode = %mode, "Read system mode");
        mode
    }

    /// Downgrade graphical mode to text if the graphics device never appears.
    pub async fn await_graphics(&self, mode: SystemMode) -> SystemMode {
        if mode != SystemMode::Graphical {
            return mode;
        }

        for attempt in 0..self.attempts {
            if std::fs::symlink_metadata(&self.graphics_device).is_ok() {
                debug!(device = %self.graphics_device.display(), attempt, "Graphics device present");
                return mode;
            }
            if attempt + 1 < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        warn!(
            device = %self.graphics_device.display(),
            attempts = self.attempts,
            "No graphics device, disabling graphical mode"
        );
        SystemMode::Text
    }
}
