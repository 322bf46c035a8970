//! Service definition types and states for the supervisor.

use crate::config::{ConfigFile, ConfigGroup};
use crate::error::{Error, Result};
use crate::mode::SystemMode;
use crate::socket::SocketAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Permissions given to Unix sockets when none are configured.
pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

/// Service restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart
    #[default]
    Never,
    /// Always restart
    Always,
    /// Restart on non-zero exit or death by signal
    OnFailure,
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "never" | "no" => Ok(RestartPolicy::Never),
            "always" => Ok(RestartPolicy::Always),
            "on-failure" => Ok(RestartPolicy::OnFailure),
            other => Err(format!("unknown restart policy: {}", other)),
        }
    }
}

/// Where a service's standard streams go.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StdioPolicy {
    /// stdin from /dev/null, stdout and stderr inherited from the supervisor
    #[default]
    Inherit,
    /// All three streams attached to this file (usually a terminal)
    File(PathBuf),
}

/// Service definition - describes how to run a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    /// Unique name of the service
    pub name: String,
    /// Program to execute
    pub executable: PathBuf,
    /// Program arguments
    pub arguments: Vec<String>,
    /// Boot modes this service is enabled for
    pub system_modes: HashSet<SystemMode>,
    /// Listening sockets created before the process starts
    pub sockets: Vec<SocketAddress>,
    /// Permissions for each Unix socket, parallel to `sockets`
    pub socket_permissions: Vec<u32>,
    /// User to run as
    pub user: Option<String>,
    /// Group to run as
    pub group: Option<String>,
    /// Restart policy
    pub restart: RestartPolicy,
    /// Declared lazy activation (socket first, process on first connection)
    pub lazy: bool,
    /// Standard stream handling
    pub stdio: StdioPolicy,
    /// Working directory
    pub working_directory: Option<PathBuf>,
    /// Extra environment variables
    pub environment: Vec<(String, String)>,
}

impl ServiceDefinition {
    /// Create a new service definition with minimal configuration.
    pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            arguments: Vec::new(),
            system_modes: SystemMode::ALL.into_iter().collect(),
            sockets: Vec::new(),
            socket_permissions: Vec::new(),
            user: None,
            group: None,
            restart: RestartPolicy::default(),
            lazy: false,
            stdio: StdioPolicy::default(),
            working_directory: None,
            environment: Vec::new(),
        }
    }

    /// Build a definition from a configuration group.
    ///
    /// Unknown keys are ignored. Any malformed value fails the whole group.
    pub fn from_group(group: &ConfigGroup) -> Result<Self> {
        let name = group.name.as_str();
        let invalid = |reason: String| Error::invalid_group(name, reason);

        if !group.problems.is_empty() {
            return Err(invalid(group.problems.join("; ")));
        }

        let executable = group
            .get("Executable")
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| invalid("missing Executable".to_string()))?;

        let mut def = ServiceDefinition::new(name, executable);

        if let Some(args) = group.get("Arguments") {
            def.arguments = args.split_whitespace().map(str::to_string).collect();
        }

        if let Some(modes) = group.get("SystemModes") {
            def.system_modes = split_list(modes)
                .map(|m| m.parse::<SystemMode>().map_err(|e| invalid(e.to_string())))
                .collect::<Result<_>>()?;
            if def.system_modes.is_empty() {
                return Err(invalid("SystemModes is empty".to_string()));
            }
        }

        if let Some(sockets) = group.get("Socket") {
            def.sockets = split_list(sockets)
                .map(|s| s.parse::<SocketAddress>().map_err(invalid))
                .collect::<Result<_>>()?;
        }

        def.socket_permissions = parse_permissions(group.get("SocketPermissions"), def.sockets.len())
            .map_err(invalid)?;

        def.user = group.get("User").map(str::to_string).filter(|u| !u.is_empty());
        def.group = group.get("Group").map(str::to_string).filter(|g| !g.is_empty());

        let keep_alive = parse_bool(group.get("KeepAlive"), "KeepAlive").map_err(invalid)?;
        def.restart = match group.get("Restart") {
            Some(policy) => policy.trim().parse().map_err(invalid)?,
            None if keep_alive => RestartPolicy::Always,
            None => RestartPolicy::Never,
        };

        def.lazy = parse_bool(group.get("Lazy"), "Lazy").map_err(invalid)?;

        if let Some(path) = group.get("StdIO").filter(|p| !p.is_empty()) {
            def.stdio = StdioPolicy::File(PathBuf::from(path));
        }

        def.working_directory = group
            .get("WorkingDirectory")
            .filter(|d| !d.is_empty())
            .map(PathBuf::from);

        if let Some(env) = group.get("Environment") {
            def.environment = env
                .split_whitespace()
                .map(|pair| match pair.split_once('=') {
                    Some((key, value)) if !key.is_empty() => {
                        Ok((key.to_string(), value.to_string()))
                    }
                    _ => Err(invalid(format!("malformed Environment entry: {}", pair))),
                })
                .collect::<Result<_>>()?;
        }

        Ok(def)
    }

    /// Whether this service runs in the given mode.
    pub fn is_enabled_for(&self, mode: SystemMode) -> bool {
        self.system_modes.contains(&mode)
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_bool(value: Option<&str>, key: &str) -> std::result::Result<bool, String> {
    match value.map(str::trim) {
        None => Ok(false),
        Some("true" | "yes" | "1") => Ok(true),
        Some("false" | "no" | "0" | "") => Ok(false),
        Some(other) => Err(format!("invalid boolean for {}: {}", key, other)),
    }
}

/// One mode per socket, or a single mode applied to all of them.
fn parse_permissions(value: Option<&str>, sockets: usize) -> std::result::Result<Vec<u32>, String> {
    let Some(value) = value else {
        return Ok(vec![DEFAULT_SOCKET_MODE; sockets]);
    };

    let modes = split_list(value)
        .map(|m| {
            u32::from_str_radix(m, 8)
                .ok()
                .filter(|mode| *mode <= 0o7777)
                .ok_or_else(|| format!("invalid SocketPermissions entry: {}", m))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    match modes.len() {
        0 => Ok(vec![DEFAULT_SOCKET_MODE; sockets]),
        1 => Ok(vec![modes[0]; sockets]),
        n if n == sockets => Ok(modes),
        n => Err(format!(
            "SocketPermissions has {} entries for {} sockets",
            n, sockets
        )),
    }
}

/// A configuration group that failed validation.
#[derive(Debug)]
pub struct GroupError {
    /// Name of the rejected group
    pub group: String,
    /// Why it was rejected
    pub error: Error,
}

/// Result of loading every group of a configuration source.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Valid definitions in declaration order
    pub definitions: Vec<ServiceDefinition>,
    /// Groups that were skipped
    pub errors: Vec<GroupError>,
}

/// Turn every group of a configuration source into a definition.
///
/// A malformed group is reported and skipped; it never stops the remaining
/// groups from loading. A group repeating the name of an earlier valid
/// group is rejected.
pub fn load_definitions(config: &ConfigFile) -> LoadReport {
    let mut report = LoadReport::default();
    let mut seen = HashSet::new();

    for group in &config.groups {
        if seen.contains(group.name.as_str()) {
            report.errors.push(GroupError {
                group: group.name.clone(),
                error: Error::DuplicateService(group.name.clone()),
            });
            continue;
        }

        match ServiceDefinition::from_group(group) {
            Ok(def) => {
                seen.insert(group.name.as_str());
                report.definitions.push(def);
            }
            Err(error) => report.errors.push(GroupError {
                group: group.name.clone(),
                error,
            }),
        }
    }

    report
}

/// Current state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    /// Registered but not started
    #[default]
    Inactive,
    /// Being spawned
    Activating,
    /// Process is running
    Running,
    /// Process exited with this code
    Exited(i32),
    /// Killed by a signal, or could not be started at all
    Failed {
        /// Terminating signal, absent for activation failures
        signal: Option<i32>,
    },
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Inactive => write!(f, "inactive"),
            ServiceState::Activating => write!(f, "activating"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Exited(code) => write!(f, "exited ({})", code),
            ServiceState::Failed { signal: Some(sig) } => write!(f, "failed (signal {})", sig),
            ServiceState::Failed { signal: None } => write!(f, "failed"),
        }
    }
}

/// Runtime information about an activated service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Internal instance id, bumped on every successful spawn
    pub generation: u64,
    /// Current process ID
    pub pid: Option<u32>,
    /// Current state
    pub state: ServiceState,
    /// Time the current or last process was started
    pub started_at: Option<DateTime<Utc>>,
    /// Time the last process stopped
    pub stopped_at: Option<DateTime<Utc>>,
    /// Exit code of the last process
    pub exit_code: Option<i32>,
    /// Terminating signal of the last process
    pub exit_signal: Option<i32>,
    /// Number of restarts attempted
    pub restart_count: u32,
    /// Consecutive restarts after very short runs
    pub rapid_restarts: u32,
    /// No further action will be taken for this service
    pub terminal: bool,
    /// Last failure reason
    pub failure_reason: Option<String>,
}

impl ServiceInstance {
    /// Create an inactive instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the service has a live process.
    pub fn is_active(&self) -> bool {
        matches!(self.state, ServiceState::Running | ServiceState::Activating)
    }

    /// Check if the service has failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.state, ServiceState::Failed { .. })
    }

    /// How long the current or last process ran.
    pub fn run_time(&self) -> Option<Duration> {
        let start = self.started_at?;
        let end = if self.is_active() {
            Utc::now()
        } else {
            self.stopped_at.unwrap_or_else(Utc::now)
        };
        Some(Duration::from_millis(
            end.signed_duration_since(start).num_milliseconds().max(0) as u64,
        ))
    }
}

/// Service status information for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Service name
    pub name: String,
    /// Current state
    pub state: ServiceState,
    /// Current process ID
    pub pid: Option<u32>,
    /// Bound socket addresses
    pub sockets: Vec<String>,
    /// Seconds the current or last process ran
    pub uptime_secs: Option<u64>,
    /// Number of restarts
    pub restart_count: u32,
    /// Whether the service is given up on
    pub terminal: bool,
    /// Last failure reason
    pub failure_reason: Option<String>,
}

impl ServiceStatus {
    /// Create status from definition and instance.
    pub fn from_service(def: &ServiceDefinition, instance: &ServiceInstance) -> Self {
        Self {
            name: def.name.clone(),
            state: instance.state,
            pid: instance.pid,
            sockets: def.sockets.iter().map(ToString::to_string).collect(),
            uptime_secs: instance.run_time().map(|d| d.as_secs()),
            restart_count: instance.restart_count,
            terminal: instance.terminal,
            failure_reason: instance.failure_reason.clone(),
        }
    }
}
