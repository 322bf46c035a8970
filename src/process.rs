//! Process launching.
//!
//! This module spawns service processes. Pre-bound sockets are inherited
//! under their existing descriptor numbers and advertised to the child in
//! the `SOCKET_TAKEOVER` environment variable as `address:fd` pairs.

use crate::error::{Error, Result};
use crate::service::{ServiceDefinition, StdioPolicy};
use crate::socket::BoundSocket;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::{Gid, Group, Uid, User};
use std::fs::OpenOptions;
use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Environment variable listing inherited sockets.
pub const SOCKET_TAKEOVER: &str = "SOCKET_TAKEOVER";

/// `PATH` given to every service.
const SERVICE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Something that can start a service process.
///
/// The supervisor only ever goes through this trait, so tests can observe
/// launches without creating processes.
pub trait Spawn {
    /// Start `service` with `sockets` inherited, returning the process id.
    fn spawn(&mut self, service: &ServiceDefinition, sockets: &[BoundSocket]) -> Result<u32>;
}

/// Resolved run-as identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunAs {
    /// User id to switch to
    pub uid: Option<Uid>,
    /// Group id to switch to
    pub gid: Option<Gid>,
}

impl RunAs {
    /// Resolve the `User` and `Group` of a definition.
    ///
    /// Names and numeric ids are both accepted. Without an explicit group,
    /// a named user's primary group is used.
    pub fn resolve(service: &ServiceDefinition) -> Result<Self> {
        let mut run_as = RunAs::default();

        if let Some(ref user) = service.user {
            match user.parse::<u32>() {
                Ok(uid) => run_as.uid = Some(Uid::from_raw(uid)),
                Err(_) => {
                    let entry = User::from_name(user)?.ok_or_else(|| Error::UnknownIdentity {
                        kind: "user",
                        name: user.clone(),
                    })?;
                    run_as.uid = Some(entry.uid);
                    run_as.gid = Some(entry.gid);
                }
            }
        }

        if let Some(ref group) = service.group {
            run_as.gid = Some(match group.parse::<u32>() {
                Ok(gid) => Gid::from_raw(gid),
                Err(_) => {
                    Group::from_name(group)?
                        .ok_or_else(|| Error::UnknownIdentity {
                            kind: "group",
                            name: group.clone(),
                        })?
                        .gid
                }
            });
        }

        Ok(run_as)
    }

    /// Supplementary group list to install before switching identity.
    ///
    /// `None` when the service keeps the supervisor's identity. Otherwise the
    /// list holds only the target group, so nothing inherited from the
    /// supervisor survives the switch.
    pub fn supplementary_groups(&self) -> Option<Vec<Gid>> {
        if self.uid.is_none() && self.gid.is_none() {
            return None;
        }
        Some(self.gid.into_iter().collect())
    }
}

/// Value of `SOCKET_TAKEOVER` for a set of sockets.
pub fn socket_takeover(sockets: &[BoundSocket]) -> String {
    sockets
        .iter()
        .map(|s| format!("{}:{}", s.address(), s.raw_fd()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Spawns services as child processes with fork and exec.
#[derive(Debug, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    /// Create a new launcher.
    pub fn new() -> Self {
        Self
    }

    fn command(&self, service: &ServiceDefinition, sockets: &[BoundSocket]) -> Result<Command> {
        let mut cmd = Command::new(&service.executable);
        cmd.args(&service.arguments);

        if let Some(ref dir) = service.working_directory {
            cmd.current_dir(dir);
        }

        cmd.env("PATH", SERVICE_PATH);
        cmd.envs(service.environment.iter().map(|(k, v)| (k, v)));
        if !sockets.is_empty() {
            cmd.env(SOCKET_TAKEOVER, socket_takeover(sockets));
        }

        match service.stdio {
            StdioPolicy::Inherit => {
                cmd.stdin(Stdio::null());
                cmd.stdout(Stdio::inherit());
                cmd.stderr(Stdio::inherit());
            }
            StdioPolicy::File(ref path) => {
                let file = OpenOptions::new().read(true).write(true).open(path)?;
                cmd.stdin(Stdio::from(file.try_clone()?));
                cmd.stdout(Stdio::from(file.try_clone()?));
                cmd.stderr(Stdio::from(file));
            }
        }

        let run_as = RunAs::resolve(service)?;
        let groups = run_as.supplementary_groups();
        let fds: Vec<RawFd> = sockets.iter().map(BoundSocket::raw_fd).collect();

        // Only async-signal-safe calls past this point: the closure runs
        // between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                nix::unistd::setsid().map_err(std::io::Error::from)?;

                for &fd in &fds {
                    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).map_err(std::io::Error::from)?;
                }

                if let Some(ref groups) = groups {
                    nix::unistd::setgroups(groups).map_err(std::io::Error::from)?;
                }
                if let Some(gid) = run_as.gid {
                    nix::unistd::setgid(gid).map_err(std::io::Error::from)?;
                }
                if let Some(uid) = run_as.uid {
                    nix::unistd::setuid(uid).map_err(std::io::Error::from)?;
                }
                Ok(())
            });
        }

        Ok(cmd)
    }
}

impl Spawn for ProcessLauncher {
    fn spawn(&mut self, service: &ServiceDefinition, sockets: &[BoundSocket]) -> Result<u32> {
        let mut cmd = self.command(service, sockets).map_err(|e| {
            Error::ProcessSpawnFailed(format!("{}: {}", service.executable.display(), e))
        })?;

        debug!(service = %service.name, executable = %service.executable.display(), "Spawning");

        let child = cmd.spawn().map_err(|e| {
            Error::ProcessSpawnFailed(format!("{}: {}", service.executable.display(), e))
        })?;

        // The child is reaped through waitpid, not through this handle.
        let pid = child.id();
        info!(service = %service.name, pid = pid, "Spawned process");
        Ok(pid)
    }
}
