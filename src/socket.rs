//! Socket activation.
//!
//! Listening sockets are created and bound before any service process is
//! launched, so a client connecting right after boot queues in the kernel's
//! backlog instead of racing the service's fork and exec.

use crate::error::{Error, Result};
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::stat::fstat;
use nix::unistd::{chown, Gid, Uid};
use std::fmt;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// Address of a listening socket declared by a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SocketAddress {
    /// Unix stream socket at a filesystem path
    Unix(PathBuf),
    /// TCP listener, kept as written until bind time
    Tcp(String),
}

impl FromStr for SocketAddress {
    type Err = String;

    /// `/absolute/path`, `tcp:HOST:PORT` or `IP:PORT`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.starts_with('/') {
            return Ok(SocketAddress::Unix(PathBuf::from(s)));
        }

        if let Some(addr) = s.strip_prefix("tcp:") {
            let valid_port = addr
                .rsplit_once(':')
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
            if !valid_port {
                return Err(format!("invalid TCP socket address: {}", s));
            }
            return Ok(SocketAddress::Tcp(addr.to_string()));
        }

        if s.parse::<SocketAddr>().is_ok() {
            return Ok(SocketAddress::Tcp(s.to_string()));
        }

        Err(format!("invalid socket address: {}", s))
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Unix(path) => write!(f, "{}", path.display()),
            SocketAddress::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

/// How sockets of one service are created.
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    /// Permissions for each Unix socket, parallel to the addresses
    pub permissions: Vec<u32>,
    /// Owner given to Unix sockets
    pub owner: Option<Uid>,
    /// Group given to Unix sockets
    pub group: Option<Gid>,
}

/// A bound, listening socket.
///
/// The supervisor keeps the descriptor so the socket survives service
/// restarts; children inherit the descriptor.
#[derive(Debug)]
pub struct BoundSocket {
    address: SocketAddress,
    fd: OwnedFd,
}

impl BoundSocket {
    /// Bind and listen on `address`.
    pub fn bind(address: &SocketAddress, mode: u32, owner: Option<Uid>, group: Option<Gid>) -> Result<Self> {
        let fd = match address {
            SocketAddress::Unix(path) => bind_unix(path, mode, owner, group)?,
            SocketAddress::Tcp(addr) => bind_tcp(addr)?,
        };

        debug!(address = %address, fd = fd.as_raw_fd(), "Bound socket");
        Ok(Self {
            address: address.clone(),
            fd,
        })
    }

    /// The address this socket listens on.
    pub fn address(&self) -> &SocketAddress {
        &self.address
    }

    /// Raw descriptor held by the supervisor.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Whether the descriptor is still valid.
    pub fn is_open(&self) -> bool {
        fcntl(self.fd.as_raw_fd(), FcntlArg::F_GETFD).is_ok()
    }

    /// Whether clients can still reach this socket through its address.
    ///
    /// A Unix socket whose path was unlinked or replaced, typically by a
    /// service cleaning up on exit, keeps listening on an orphaned inode.
    pub fn is_reachable(&self) -> bool {
        if !self.is_open() {
            return false;
        }

        match self.address {
            SocketAddress::Unix(ref path) => {
                let Ok(bound) = fstat(self.fd.as_raw_fd()) else {
                    return false;
                };
                match std::fs::symlink_metadata(path) {
                    Ok(meta) => {
                        meta.file_type().is_socket()
                            && meta.dev() == bound.st_dev as u64
                            && meta.ino() == bound.st_ino as u64
                    }
                    Err(_) => false,
                }
            }
            SocketAddress::Tcp(_) => true,
        }
    }
}

impl AsFd for BoundSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn bind_unix(path: &Path, mode: u32, owner: Option<Uid>, group: Option<Gid>) -> Result<OwnedFd> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // A socket file left behind by a previous boot would make bind fail.
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(path)?,
        Ok(_) => {
            return Err(Error::ConfigError(format!(
                "{} exists and is not a socket",
                path.display()
            )))
        }
        Err(_) => {}
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    if owner.is_some() || group.is_some() {
        chown(path, owner, group)?;
    }

    Ok(OwnedFd::from(listener))
}

fn bind_tcp(addr: &str) -> Result<OwnedFd> {
    let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    let listener = TcpListener::bind(&addrs[..])?;
    Ok(OwnedFd::from(listener))
}

/// Bind every socket of one service.
///
/// All or nothing: if one address fails, sockets already bound for this
/// service are dropped and the error names the service.
pub fn bind_all(service: &str, addresses: &[SocketAddress], options: &SocketOptions) -> Result<Vec<BoundSocket>> {
    let mut bound = Vec::with_capacity(addresses.len());

    for (index, address) in addresses.iter().enumerate() {
        let mode = options
            .permissions
            .get(index)
            .copied()
            .unwrap_or(crate::service::DEFAULT_SOCKET_MODE);

        let socket = BoundSocket::bind(address, mode, options.owner, options.group).map_err(|e| {
            Error::SocketActivationError {
                name: service.to_string(),
                reason: format!("{}: {}", address, e),
            }
        })?;
        bound.push(socket);
    }

    if !bound.is_empty() {
        info!(service = %service, count = bound.len(), "Sockets ready");
    }
    Ok(bound)
}
