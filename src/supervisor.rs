//! Supervisor core - boot sequence, exit policy and the event loop.
//!
//! A [`Supervisor`] owns the [`Registry`] and is the only thing that mutates
//! it. Boot runs in three strictly ordered passes over every configured
//! source: load definitions, bind every socket, then launch every process.
//! Afterwards the event loop waits for signals and applies restart policy
//! to reaped children. Everything runs on one thread.

use crate::config::{ConfigFile, ConfigSource, Invocation, SupervisorConfig};
use crate::error::{Error, Result};
use crate::loaders::LoaderRegistry;
use crate::mode::{ModeResolver, SystemMode};
use crate::process::{ProcessLauncher, RunAs, Spawn};
use crate::reaper::{reap_children, ExitStatus};
use crate::registry::{Registry, ServiceEntry};
use crate::service::{
    load_definitions, GroupError, RestartPolicy, ServiceDefinition, ServiceState, DEFAULT_SOCKET_MODE,
};
use crate::signals::{Notification, Notifications};
use crate::socket::{bind_all, BoundSocket, SocketOptions};
use chrono::Utc;
use std::cell::OnceCell;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of one activation pass.
#[derive(Debug, Default)]
pub struct ActivationReport {
    /// Groups rejected by the definition loader
    pub group_errors: Vec<GroupError>,
    /// Services not enabled for the current mode
    pub skipped: Vec<String>,
    /// Services whose process was spawned
    pub started: Vec<String>,
    /// Services that could not be activated
    pub failed: Vec<String>,
}

/// What the supervisor did about a reaped child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// The pid does not belong to a live service
    Ignored,
    /// The service stays down
    Terminal,
    /// The service was respawned
    Restarted,
    /// A respawn was attempted and failed
    RestartFailed,
    /// The service kept dying right after start and was given up on
    GaveUp,
}

/// The service supervisor.
pub struct Supervisor<S: Spawn = ProcessLauncher> {
    config: SupervisorConfig,
    spawner: S,
    registry: Registry,
    mode: OnceCell<SystemMode>,
}

impl Supervisor<ProcessLauncher> {
    /// Create a supervisor that launches real processes.
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_spawner(config, ProcessLauncher::new())
    }
}

impl<S: Spawn> Supervisor<S> {
    /// Create a supervisor using a custom process spawner.
    pub fn with_spawner(config: SupervisorConfig, spawner: S) -> Self {
        Self {
            config,
            spawner,
            registry: Registry::new(),
            mode: OnceCell::new(),
        }
    }

    /// The service registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The process spawner.
    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    /// The process spawner, for mutation.
    pub fn spawner_mut(&mut self) -> &mut S {
        &mut self.spawner
    }

    /// The active system mode. Before resolution this is the default mode.
    pub fn mode(&self) -> SystemMode {
        self.mode.get().copied().unwrap_or_default()
    }

    /// Fix the system mode. Returns `false` if it was already set, in which
    /// case the earlier value stays.
    pub fn set_mode(&self, mode: SystemMode) -> bool {
        self.mode.set(mode).is_ok()
    }

    /// Determine the system mode once per run.
    ///
    /// User sessions skip the probes and keep the default mode.
    pub async fn resolve_mode(&self) -> SystemMode {
        if let Some(mode) = self.mode.get() {
            return *mode;
        }

        let mode = match self.config.invocation {
            Invocation::User => {
                debug!("User session, not probing system mode");
                SystemMode::default()
            }
            Invocation::System => {
                ModeResolver::from_config(&self.config)
                    .resolve(SystemMode::default())
                    .await
            }
        };

        self.set_mode(mode);
        info!(mode = %self.mode(), "System mode resolved");
        self.mode()
    }

    /// Read every configured source.
    ///
    /// A missing optional source is skipped quietly; any other failure is
    /// logged and that source contributes no services.
    pub fn load_sources(&self) -> Vec<ConfigFile> {
        let loaders = LoaderRegistry::new();
        let mut files = Vec::new();

        for ConfigSource { path, optional } in &self.config.sources {
            if *optional && !path.exists() {
                debug!(path = %path.display(), "Optional configuration source absent");
                continue;
            }

            match loaders.load(path) {
                Ok(file) => {
                    info!(path = %path.display(), groups = file.groups.len(), "Loaded configuration");
                    files.push(file);
                }
                Err(e) => error!(path = %path.display(), error = %e, "Failed to load configuration"),
            }
        }

        files
    }

    /// Activate the services of `sources`, which are processed back to back.
    ///
    /// Every socket of every enabled service is bound before the first
    /// process is spawned. Per-group and per-service failures are logged and
    /// isolated; this never fails as a whole.
    pub fn activate(&mut self, sources: &[ConfigFile]) -> ActivationReport {
        let mode = self.mode();
        let mut report = ActivationReport::default();
        let mut enabled: Vec<ServiceDefinition> = Vec::new();

        for source in sources {
            let loaded = load_definitions(source);

            for group_error in loaded.errors {
                error!(
                    source = %source.source.display(),
                    service = %group_error.group,
                    error = %group_error.error,
                    "Skipping service group"
                );
                report.group_errors.push(group_error);
            }

            for def in loaded.definitions {
                if self.registry.contains(&def.name) || enabled.iter().any(|d| d.name == def.name) {
                    let error = Error::DuplicateService(def.name.clone());
                    error!(source = %source.source.display(), service = %def.name, error = %error, "Skipping service group");
                    report.group_errors.push(GroupError {
                        group: def.name,
                        error,
                    });
                } else if def.is_enabled_for(mode) {
                    enabled.push(def);
                } else {
                    debug!(service = %def.name, mode = %mode, "Not enabled for this mode");
                    report.skipped.push(def.name);
                }
            }
        }

        // Sockets first, for everything.
        let mut to_launch = Vec::with_capacity(enabled.len());
        for def in enabled {
            let name = def.name.clone();
            match self.create_sockets(&def) {
                Ok(sockets) => {
                    if let Some(slot) = self.registry.insert(ServiceEntry::new(def, sockets)) {
                        to_launch.push(slot);
                    }
                }
                Err(e) => {
                    error!(service = %name, error = %e, "Socket activation failed");
                    let mut entry = ServiceEntry::new(def, Vec::new());
                    entry.instance.state = ServiceState::Failed { signal: None };
                    entry.instance.failure_reason = Some(e.to_string());
                    entry.instance.terminal = true;
                    self.registry.insert(entry);
                    report.failed.push(name);
                }
            }
        }

        info!(count = to_launch.len(), "Activating services");
        for slot in to_launch {
            let name = self.registry.entry(slot).name().to_string();
            match self.launch(slot) {
                Ok(_) => report.started.push(name),
                Err(_) => report.failed.push(name),
            }
        }

        report
    }

    fn create_sockets(&self, def: &ServiceDefinition) -> Result<Vec<BoundSocket>> {
        if def.sockets.is_empty() {
            return Ok(Vec::new());
        }

        let run_as = RunAs::resolve(def)?;
        let options = SocketOptions {
            permissions: def.socket_permissions.clone(),
            owner: run_as.uid,
            group: run_as.gid,
        };
        bind_all(&def.name, &def.sockets, &options)
    }

    /// Spawn the service at `slot` and record the outcome.
    fn launch(&mut self, slot: usize) -> Result<u32> {
        let entry = self.registry.entry_mut(slot);
        entry.instance.state = ServiceState::Activating;
        if entry.definition.lazy {
            info!(service = %entry.name(), "Lazy activation is not supported, starting now");
        }

        let entry = self.registry.entry(slot);
        let result = self.spawner.spawn(&entry.definition, &entry.sockets);

        match result {
            Ok(pid) => {
                self.registry.bind_pid(slot, pid);
                let instance = &mut self.registry.entry_mut(slot).instance;
                instance.state = ServiceState::Running;
                instance.started_at = Some(Utc::now());
                instance.stopped_at = None;
                instance.exit_code = None;
                instance.exit_signal = None;
                instance.failure_reason = None;
                Ok(pid)
            }
            Err(e) => {
                let entry = self.registry.entry_mut(slot);
                error!(service = %entry.name(), error = %e, "Failed to start service");
                entry.instance.state = ServiceState::Failed { signal: None };
                entry.instance.failure_reason = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Re-bind any retained socket clients can no longer reach, such as a
    /// Unix socket whose path the exiting service unlinked.
    fn ensure_sockets(&mut self, slot: usize) -> Result<()> {
        let entry = self.registry.entry(slot);
        let stale: Vec<usize> = entry
            .sockets
            .iter()
            .enumerate()
            .filter(|(_, socket)| !socket.is_reachable())
            .map(|(index, _)| index)
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        warn!(service = %entry.name(), stale = stale.len(), "Sockets unreachable, binding them again");
        let run_as = RunAs::resolve(&entry.definition)?;
        let mut fresh = Vec::with_capacity(stale.len());
        for index in stale {
            let mode = entry
                .definition
                .socket_permissions
                .get(index)
                .copied()
                .unwrap_or(DEFAULT_SOCKET_MODE);
            let socket = BoundSocket::bind(entry.sockets[index].address(), mode, run_as.uid, run_as.gid)?;
            fresh.push((index, socket));
        }

        let entry = self.registry.entry_mut(slot);
        for (index, socket) in fresh {
            entry.sockets[index] = socket;
        }
        Ok(())
    }

    /// Apply exit policy to a reaped child.
    pub fn handle_exit(&mut self, status: ExitStatus) -> ExitAction {
        let Some(slot) = self.registry.take_pid(status.pid) else {
            debug!(pid = status.pid, "Reaped process is not a supervised service");
            return ExitAction::Ignored;
        };

        let window = self.config.rapid_restart_window;
        let max_rapid = self.config.max_rapid_restarts;
        let entry = self.registry.entry_mut(slot);
        let policy = entry.definition.restart;
        let name = entry.definition.name.clone();
        let instance = &mut entry.instance;

        instance.stopped_at = Some(Utc::now());
        instance.exit_code = status.code;
        instance.exit_signal = status.signal;
        instance.state = match (status.code, status.signal) {
            (_, Some(signal)) => ServiceState::Failed {
                signal: Some(signal),
            },
            (Some(code), None) => ServiceState::Exited(code),
            (None, None) => ServiceState::Failed { signal: None },
        };

        info!(
            service = %name,
            pid = status.pid,
            code = ?status.code,
            signal = ?status.signal,
            "Service process exited"
        );

        let restart = match policy {
            RestartPolicy::Never => false,
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => !status.success(),
        };

        if !restart {
            instance.terminal = true;
            return ExitAction::Terminal;
        }

        let ran = instance.run_time().unwrap_or(Duration::ZERO);
        if ran < window {
            instance.rapid_restarts += 1;
        } else {
            instance.rapid_restarts = 0;
        }

        if instance.rapid_restarts > max_rapid {
            warn!(
                service = %name,
                restarts = instance.restart_count,
                "Service keeps exiting right after start, giving up"
            );
            instance.terminal = true;
            instance.failure_reason = Some("restarting too quickly".to_string());
            return ExitAction::GaveUp;
        }

        instance.restart_count += 1;
        info!(service = %name, restart_count = instance.restart_count, "Restarting service");

        if let Err(e) = self.ensure_sockets(slot) {
            error!(service = %name, error = %e, "Failed to restore sockets for restart");
            let instance = &mut self.registry.entry_mut(slot).instance;
            instance.state = ServiceState::Failed { signal: None };
            instance.failure_reason = Some(e.to_string());
            return ExitAction::RestartFailed;
        }

        match self.launch(slot) {
            Ok(_) => ExitAction::Restarted,
            Err(_) => ExitAction::RestartFailed,
        }
    }

    /// Drain exited children and apply exit policy to each.
    pub fn reap(&mut self) -> Vec<ExitAction> {
        reap_children()
            .into_iter()
            .map(|status| self.handle_exit(status))
            .collect()
    }

    /// Write a JSON snapshot of every service to the status file.
    pub fn dump_status(&self) -> Result<()> {
        let statuses = self.registry.statuses();
        for status in &statuses {
            info!(
                service = %status.name,
                state = %status.state,
                pid = ?status.pid,
                restarts = status.restart_count,
                "Service status"
            );
        }

        let path = &self.config.status_file;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&statuses)?)?;
        Ok(())
    }

    /// Boot the services and supervise them until asked to terminate.
    ///
    /// Signal handlers are installed before anything is launched. A
    /// termination request returns immediately; running services are not
    /// stopped.
    pub async fn run(mut self) -> Result<()> {
        let mut notifications = Notifications::new()?;

        self.resolve_mode().await;
        let sources = self.load_sources();
        let report = self.activate(&sources);
        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            invalid = report.group_errors.len(),
            "Boot complete"
        );

        loop {
            match notifications.next().await {
                Notification::Child => {
                    self.reap();
                }
                Notification::Terminate | Notification::Interrupt => {
                    info!("Termination requested, exiting");
                    return Ok(());
                }
                Notification::DumpStatus => {
                    if let Err(e) = self.dump_status() {
                        error!(error = %e, "Failed to write status snapshot");
                    }
                }
            }
        }
    }
}
