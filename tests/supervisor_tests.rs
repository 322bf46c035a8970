//! Tests for activation and exit handling in the supervisor

use assert_matches::assert_matches;
use buckos_warden::process::Spawn;
use buckos_warden::{
    BoundSocket, ConfigFile, ConfigGroup, ConfigSource, Error, ExitAction, ExitStatus, Invocation,
    Result, ServiceDefinition, ServiceState, SocketAddress, Supervisor, SupervisorConfig, SystemMode,
};
use nix::sys::signal::{raise, Signal};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::os::fd::RawFd;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// One call to the recording spawner.
#[derive(Debug, Clone)]
struct Launch {
    name: String,
    pid: Option<u32>,
    sockets: Vec<SocketAddress>,
    fds: Vec<RawFd>,
    watched_sockets_present: bool,
}

/// Spawner that records launches instead of creating processes.
#[derive(Debug, Default)]
struct RecordingSpawner {
    next_pid: u32,
    launches: Vec<Launch>,
    failing: HashSet<String>,
    watched: Vec<PathBuf>,
}

impl RecordingSpawner {
    fn names(&self) -> Vec<&str> {
        self.launches.iter().map(|l| l.name.as_str()).collect()
    }

    fn count(&self, name: &str) -> usize {
        self.launches.iter().filter(|l| l.name == name).count()
    }
}

impl Spawn for RecordingSpawner {
    fn spawn(&mut self, service: &ServiceDefinition, sockets: &[BoundSocket]) -> Result<u32> {
        let watched_sockets_present = self.watched.iter().all(|path| is_socket(path));
        let failing = self.failing.contains(&service.name);

        let pid = if failing {
            None
        } else {
            self.next_pid += 1;
            Some(1000 + self.next_pid)
        };

        self.launches.push(Launch {
            name: service.name.clone(),
            pid,
            sockets: sockets.iter().map(|s| s.address().clone()).collect(),
            fds: sockets.iter().map(BoundSocket::raw_fd).collect(),
            watched_sockets_present,
        });

        pid.ok_or_else(|| Error::ProcessSpawnFailed(format!("{}: refused", service.name)))
    }
}

fn is_socket(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}

fn test_config(dir: &TempDir) -> SupervisorConfig {
    SupervisorConfig {
        system_mode_path: dir.path().join("system_mode"),
        graphics_device: dir.path().join("card0"),
        graphics_interval: Duration::from_millis(1),
        status_file: dir.path().join("status.json"),
        sources: Vec::new(),
        ..SupervisorConfig::default()
    }
}

fn supervisor(dir: &TempDir, mode: SystemMode) -> Supervisor<RecordingSpawner> {
    let supervisor = Supervisor::with_spawner(test_config(dir), RecordingSpawner::default());
    assert!(supervisor.set_mode(mode));
    supervisor
}

fn source(groups: Vec<ConfigGroup>) -> ConfigFile {
    ConfigFile::from_groups("test.ini", groups)
}

fn service(name: &str) -> ConfigGroup {
    ConfigGroup::new(name).with("Executable", format!("/usr/bin/{}", name))
}

fn state(supervisor: &Supervisor<RecordingSpawner>, name: &str) -> ServiceState {
    supervisor.registry().get(name).unwrap().instance.state
}

fn pid(supervisor: &Supervisor<RecordingSpawner>, name: &str) -> u32 {
    supervisor.registry().get(name).unwrap().instance.pid.unwrap()
}

mod activation {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_echo_service_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("run/echo.sock");
        let mut supervisor = supervisor(&dir, SystemMode::Text);

        let report = supervisor.activate(&[source(vec![ConfigGroup::new("echo")
            .with("Executable", "/bin/echod")
            .with("Socket", socket_path.display().to_string())
            .with("SystemModes", "text,graphical")])]);

        assert_eq!(report.started, vec!["echo"]);
        assert!(is_socket(&socket_path));

        let launch = &supervisor.spawner().launches[0];
        assert_eq!(launch.sockets, vec![SocketAddress::Unix(socket_path.clone())]);

        assert_eq!(supervisor.registry().len(), 1);
        let entry = supervisor.registry().get("echo").unwrap();
        assert_eq!(entry.instance.state, ServiceState::Running);
        assert_eq!(entry.instance.pid, launch.pid);
        assert!(entry.instance.started_at.is_some());
    }

    #[test]
    fn test_malformed_group_does_not_block_valid_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = supervisor(&dir, SystemMode::Text);

        let report = supervisor.activate(&[source(vec![
            ConfigGroup::new("broken").with("Arguments", "--oops"),
            service("valid"),
        ])]);

        assert_eq!(report.group_errors.len(), 1);
        assert_eq!(report.group_errors[0].group, "broken");
        assert_eq!(report.started, vec!["valid"]);
        assert!(supervisor.registry().get("broken").is_none());
        assert_eq!(state(&supervisor, "valid"), ServiceState::Running);
    }

    #[test]
    fn test_declaration_order_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = supervisor(&dir, SystemMode::Text);

        supervisor.activate(&[source(vec![service("zeta"), service("alpha"), service("mid")])]);

        assert_eq!(supervisor.spawner().names(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_every_socket_bound_before_first_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = ["a", "b", "c"]
            .iter()
            .map(|n| dir.path().join(format!("{}.sock", n)))
            .collect();

        let mut supervisor = supervisor(&dir, SystemMode::Text);
        supervisor.spawner_mut().watched = paths.clone();

        let groups = ["a", "b", "c"]
            .iter()
            .zip(&paths)
            .map(|(name, path)| service(name).with("Socket", path.display().to_string()))
            .collect();
        supervisor.activate(&[source(groups)]);

        let launches = &supervisor.spawner().launches;
        assert_eq!(launches.len(), 3);
        assert!(launches.iter().all(|l| l.watched_sockets_present));
    }

    #[test]
    fn test_sockets_of_later_sources_bound_before_first_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let late_socket = dir.path().join("late.sock");

        let mut supervisor = supervisor(&dir, SystemMode::Text);
        supervisor.spawner_mut().watched = vec![late_socket.clone()];

        supervisor.activate(&[
            source(vec![service("early")]),
            source(vec![service("late").with("Socket", late_socket.display().to_string())]),
        ]);

        assert!(supervisor.spawner().launches.iter().all(|l| l.watched_sockets_present));
    }

    #[test]
    fn test_mode_gating() {
        let dir = tempfile::tempdir().unwrap();
        let gui_socket = dir.path().join("gui.sock");
        let mut supervisor = supervisor(&dir, SystemMode::Text);

        let report = supervisor.activate(&[source(vec![
            service("console").with("SystemModes", "text"),
            service("gui")
                .with("SystemModes", "graphical")
                .with("Socket", gui_socket.display().to_string()),
            service("everywhere"),
        ])]);

        assert_eq!(report.skipped, vec!["gui"]);
        assert_eq!(report.started, vec!["console", "everywhere"]);
        assert!(!gui_socket.exists());
        assert!(supervisor.registry().get("gui").is_none());
    }

    #[test]
    fn test_spawn_failure_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = supervisor(&dir, SystemMode::Text);
        supervisor.spawner_mut().failing.insert("b".to_string());

        let report = supervisor.activate(&[source(vec![service("a"), service("b"), service("c")])]);

        assert_eq!(report.started, vec!["a", "c"]);
        assert_eq!(report.failed, vec!["b"]);
        assert_eq!(state(&supervisor, "b"), ServiceState::Failed { signal: None });
        assert!(supervisor.registry().get("b").unwrap().instance.failure_reason.is_some());
        assert_eq!(state(&supervisor, "c"), ServiceState::Running);
    }

    #[test]
    fn test_socket_failure_excludes_service_from_launch() {
        let dir = tempfile::tempdir().unwrap();
        let occupied = dir.path().join("occupied.sock");
        std::fs::write(&occupied, "not a socket").unwrap();

        let mut supervisor = supervisor(&dir, SystemMode::Text);
        let report = supervisor.activate(&[source(vec![
            service("blocked").with("Socket", occupied.display().to_string()),
            service("fine"),
        ])]);

        assert_eq!(report.failed, vec!["blocked"]);
        assert_eq!(supervisor.spawner().names(), vec!["fine"]);

        let blocked = supervisor.registry().get("blocked").unwrap();
        assert_matches!(blocked.instance.state, ServiceState::Failed { signal: None });
        assert!(blocked.instance.terminal);
        assert!(blocked.instance.pid.is_none());
    }

    #[test]
    fn test_later_source_appends_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = supervisor(&dir, SystemMode::Graphical);

        let report = supervisor.activate(&[
            source(vec![service("session"), service("clock")]),
            source(vec![service("notes"), service("clock")]),
        ]);

        assert_eq!(report.started, vec!["session", "clock", "notes"]);
        assert_eq!(report.group_errors.len(), 1);
        assert_matches!(report.group_errors[0].error, Error::DuplicateService(ref name) if name == "clock");

        let names: Vec<_> = supervisor.registry().iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["session", "clock", "notes"]);
        assert_eq!(
            supervisor.registry().get("clock").unwrap().definition.executable,
            PathBuf::from("/usr/bin/clock")
        );
    }
}

mod exit_handling {
    use super::*;
    use pretty_assertions::assert_eq;

    fn single(restart: &str) -> (TempDir, Supervisor<RecordingSpawner>) {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = supervisor(&dir, SystemMode::Text);
        supervisor.activate(&[source(vec![service("svc").with("Restart", restart)])]);
        (dir, supervisor)
    }

    #[test]
    fn test_unknown_pid_is_ignored() {
        let (_dir, mut supervisor) = single("always");
        let before = supervisor.registry().get("svc").unwrap().instance.clone();

        assert_eq!(supervisor.handle_exit(ExitStatus::exited(4242, 1)), ExitAction::Ignored);

        let after = &supervisor.registry().get("svc").unwrap().instance;
        assert_eq!(after.state, before.state);
        assert_eq!(after.pid, before.pid);
        assert_eq!(after.generation, before.generation);
        assert_eq!(after.restart_count, 0);
        assert_eq!(supervisor.spawner().launches.len(), 1);
    }

    #[test]
    fn test_always_restarts_after_clean_exit() {
        let (_dir, mut supervisor) = single("always");
        let first = pid(&supervisor, "svc");

        assert_eq!(supervisor.handle_exit(ExitStatus::exited(first, 0)), ExitAction::Restarted);

        let instance = &supervisor.registry().get("svc").unwrap().instance;
        assert_eq!(instance.state, ServiceState::Running);
        assert_ne!(instance.pid, Some(first));
        assert_eq!(instance.restart_count, 1);
        assert_eq!(supervisor.spawner().count("svc"), 2);
    }

    #[test]
    fn test_never_stays_terminal() {
        let (_dir, mut supervisor) = single("never");
        let first = pid(&supervisor, "svc");

        assert_eq!(supervisor.handle_exit(ExitStatus::exited(first, 0)), ExitAction::Terminal);

        let instance = &supervisor.registry().get("svc").unwrap().instance;
        assert_eq!(instance.state, ServiceState::Exited(0));
        assert!(instance.terminal);
        assert!(instance.pid.is_none());
        assert_eq!(supervisor.spawner().count("svc"), 1);

        // A second report for the same pid changes nothing.
        assert_eq!(supervisor.handle_exit(ExitStatus::exited(first, 0)), ExitAction::Ignored);
        assert_eq!(supervisor.spawner().count("svc"), 1);
    }

    #[test]
    fn test_on_failure_restarts_once_after_error_exit() {
        let (_dir, mut supervisor) = single("on-failure");
        let first = pid(&supervisor, "svc");

        assert_eq!(supervisor.handle_exit(ExitStatus::exited(first, 3)), ExitAction::Restarted);
        assert_eq!(supervisor.spawner().count("svc"), 2);
        assert_eq!(supervisor.registry().get("svc").unwrap().instance.restart_count, 1);
    }

    #[test]
    fn test_on_failure_does_not_restart_after_clean_exit() {
        let (_dir, mut supervisor) = single("on-failure");
        let first = pid(&supervisor, "svc");

        assert_eq!(supervisor.handle_exit(ExitStatus::exited(first, 0)), ExitAction::Terminal);
        assert_eq!(supervisor.spawner().count("svc"), 1);
        assert_eq!(state(&supervisor, "svc"), ServiceState::Exited(0));
    }

    #[test]
    fn test_on_failure_restarts_after_signal() {
        let (_dir, mut supervisor) = single("on-failure");
        let first = pid(&supervisor, "svc");

        assert_eq!(
            supervisor.handle_exit(ExitStatus::signaled(first, Signal::SIGSEGV as i32)),
            ExitAction::Restarted
        );
        let instance = &supervisor.registry().get("svc").unwrap().instance;
        assert_eq!(instance.exit_signal, Some(Signal::SIGSEGV as i32));
        assert_eq!(instance.state, ServiceState::Running);
    }

    #[test]
    fn test_signal_death_without_restart_is_failed() {
        let (_dir, mut supervisor) = single("never");
        let first = pid(&supervisor, "svc");

        supervisor.handle_exit(ExitStatus::signaled(first, Signal::SIGKILL as i32));
        assert_eq!(
            state(&supervisor, "svc"),
            ServiceState::Failed {
                signal: Some(Signal::SIGKILL as i32)
            }
        );
    }

    #[test]
    fn test_crash_loop_is_given_up() {
        let (_dir, mut supervisor) = single("always");
        let limit = SupervisorConfig::default().max_rapid_restarts as usize;

        for _ in 0..limit {
            let current = pid(&supervisor, "svc");
            assert_eq!(supervisor.handle_exit(ExitStatus::exited(current, 1)), ExitAction::Restarted);
        }

        let current = pid(&supervisor, "svc");
        assert_eq!(supervisor.handle_exit(ExitStatus::exited(current, 1)), ExitAction::GaveUp);

        let instance = &supervisor.registry().get("svc").unwrap().instance;
        assert!(instance.terminal);
        assert_eq!(instance.state, ServiceState::Exited(1));
        assert_eq!(supervisor.spawner().count("svc"), limit + 1);
    }

    #[test]
    fn test_respawn_failure_is_recorded() {
        let (_dir, mut supervisor) = single("always");
        let first = pid(&supervisor, "svc");
        supervisor.spawner_mut().failing.insert("svc".to_string());

        assert_eq!(supervisor.handle_exit(ExitStatus::exited(first, 0)), ExitAction::RestartFailed);

        let instance = &supervisor.registry().get("svc").unwrap().instance;
        assert_eq!(instance.state, ServiceState::Failed { signal: None });
        assert!(instance.failure_reason.is_some());
    }

    #[test]
    fn test_restart_reuses_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("keep.sock");
        let mut supervisor = supervisor(&dir, SystemMode::Text);
        supervisor.activate(&[source(vec![service("svc")
            .with("Restart", "always")
            .with("Socket", socket_path.display().to_string())])]);

        let first = pid(&supervisor, "svc");
        supervisor.handle_exit(ExitStatus::exited(first, 0));

        let launches = &supervisor.spawner().launches;
        assert_eq!(launches.len(), 2);
        assert_eq!(launches[0].fds, launches[1].fds);
        assert!(is_socket(&socket_path));
    }

    #[test]
    fn test_restart_rebinds_unlinked_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("svc.sock");
        let mut supervisor = supervisor(&dir, SystemMode::Text);
        supervisor.activate(&[source(vec![service("svc")
            .with("Restart", "always")
            .with("Socket", socket_path.display().to_string())])]);

        // The service cleans up its socket file on the way out.
        std::fs::remove_file(&socket_path).unwrap();
        let first = pid(&supervisor, "svc");
        assert_eq!(supervisor.handle_exit(ExitStatus::exited(first, 0)), ExitAction::Restarted);

        assert!(is_socket(&socket_path));
        UnixStream::connect(&socket_path).unwrap();

        let launches = &supervisor.spawner().launches;
        assert_eq!(launches.len(), 2);
        assert_ne!(launches[0].fds, launches[1].fds);
        let retained: Vec<RawFd> = supervisor
            .registry()
            .get("svc")
            .unwrap()
            .sockets
            .iter()
            .map(BoundSocket::raw_fd)
            .collect();
        assert_eq!(retained, launches[1].fds);
    }

    #[test]
    fn test_reap_before_later_services_registered() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = supervisor(&dir, SystemMode::Text);

        supervisor.activate(&[source(vec![service("early").with("Restart", "never")])]);
        let early = pid(&supervisor, "early");
        assert_eq!(supervisor.handle_exit(ExitStatus::exited(early, 1)), ExitAction::Terminal);

        let report = supervisor.activate(&[source(vec![service("late")])]);
        assert_eq!(report.started, vec!["late"]);
        assert_eq!(state(&supervisor, "early"), ServiceState::Exited(1));
    }
}

mod boot {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_user_invocation_skips_mode_probe() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("system_mode"), "text\n").unwrap();

        let config = SupervisorConfig {
            invocation: Invocation::User,
            ..test_config(&dir)
        };
        let supervisor = Supervisor::with_spawner(config, RecordingSpawner::default());

        assert_eq!(supervisor.resolve_mode().await, SystemMode::Graphical);
    }

    #[tokio::test]
    async fn test_system_mode_resolved_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("system_mode"), "self-test\n").unwrap();

        let supervisor = Supervisor::with_spawner(test_config(&dir), RecordingSpawner::default());
        assert_eq!(supervisor.resolve_mode().await, SystemMode::SelfTest);

        // Later probe changes and failures have no effect.
        std::fs::remove_file(dir.path().join("system_mode")).unwrap();
        assert_eq!(supervisor.resolve_mode().await, SystemMode::SelfTest);
        assert!(!supervisor.set_mode(SystemMode::Text));
        assert_eq!(supervisor.mode(), SystemMode::SelfTest);
    }

    #[tokio::test]
    async fn test_graphical_without_device_boots_text() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("system_mode"), "graphical\n").unwrap();

        let supervisor = Supervisor::with_spawner(test_config(&dir), RecordingSpawner::default());
        assert_eq!(supervisor.resolve_mode().await, SystemMode::Text);
    }

    #[test]
    fn test_load_sources() {
        let dir = tempfile::tempdir().unwrap();
        let system = dir.path().join("system.ini");
        std::fs::write(&system, "[a]\nExecutable=/bin/a\n").unwrap();
        let app = dir.path().join("app.toml");
        std::fs::write(&app, "[b]\nExecutable = \"/bin/b\"\n").unwrap();

        let config = SupervisorConfig {
            sources: vec![
                ConfigSource::required(&system),
                ConfigSource::required(dir.path().join("missing.ini")),
                ConfigSource::optional(dir.path().join("also-missing.ini")),
                ConfigSource::optional(&app),
            ],
            ..test_config(&dir)
        };
        let supervisor = Supervisor::with_spawner(config, RecordingSpawner::default());

        let files = supervisor.load_sources();
        let sources: Vec<_> = files.iter().map(|f| f.source.clone()).collect();
        assert_eq!(sources, vec![system, app]);
    }

    #[test]
    fn test_typo_in_one_group_keeps_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.ini");
        std::fs::write(
            &path,
            "[good]\nExecutable=/bin/good\n\n[bad]\nExecutable=/bin/bad\nthis line is a typo\n\n[also_good]\nExecutable=/bin/also_good\n",
        )
        .unwrap();

        let config = SupervisorConfig {
            sources: vec![ConfigSource::required(&path)],
            ..test_config(&dir)
        };
        let mut supervisor = Supervisor::with_spawner(config, RecordingSpawner::default());
        assert!(supervisor.set_mode(SystemMode::Text));

        let files = supervisor.load_sources();
        assert_eq!(files.len(), 1);

        let report = supervisor.activate(&files);
        assert_eq!(report.started, vec!["good", "also_good"]);
        assert_eq!(report.group_errors.len(), 1);
        assert_eq!(report.group_errors[0].group, "bad");
        assert!(supervisor.registry().get("bad").is_none());
    }

    #[tokio::test]
    async fn test_event_loop_dumps_status_and_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let status_file = dir.path().join("status.json");
        let supervisor = Supervisor::with_spawner(test_config(&dir), RecordingSpawner::default());

        // Polling `run` first installs its handlers before any signal is raised.
        let (result, dumped) = tokio::join!(supervisor.run(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            raise(Signal::SIGUSR1).unwrap();

            let mut dumped = false;
            for _ in 0..200 {
                if status_file.exists() {
                    dumped = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            raise(Signal::SIGTERM).unwrap();
            dumped
        });

        result.unwrap();
        assert!(dumped);
        assert_eq!(std::fs::read_to_string(&status_file).unwrap().trim(), "[]");
    }

    #[test]
    fn test_dump_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = supervisor(&dir, SystemMode::Text);
        supervisor.activate(&[source(vec![service("a"), service("b")])]);

        supervisor.dump_status().unwrap();

        let content = std::fs::read_to_string(dir.path().join("status.json")).unwrap();
        let statuses: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(statuses.as_array().unwrap().len(), 2);
        assert_eq!(statuses[0]["name"], "a");
        assert_eq!(statuses[0]["state"], "running");
    }
}
