//! Buckos service supervisor.
//!
//! `warden` boots the statically configured set of long-running services
//! for the system, or for a user session, and keeps them running:
//!
//! - Service definitions are read from configuration groups
//! - The boot mode (text, graphical, self-test) decides which services run
//! - Listening sockets are bound before any service process starts
//! - Services are spawned in declaration order with their sockets inherited
//! - Exited children are reaped and restarted according to their policy
//!
//! # Architecture
//!
//! - **loaders / config**: configuration files to ordered groups
//! - **service**: definitions, validation and runtime state
//! - **mode**: system mode probe and graphics gate
//! - **socket**: socket activation
//! - **process**: the process launcher
//! - **registry**: activated services by name and by pid
//! - **reaper**: draining exited children
//! - **supervisor**: ties it together on a single-threaded event loop
//!
//! # Example
//!
//! ```no_run
//! use buckos_warden::{Supervisor, SupervisorConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let supervisor = Supervisor::new(SupervisorConfig::default());
//!     supervisor.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod loaders;
pub mod mode;
pub mod process;
pub mod reaper;
pub mod registry;
pub mod service;
pub mod signals;
pub mod socket;
pub mod supervisor;

// Re-export main types
pub use config::{ConfigFile, ConfigGroup, ConfigSource, Invocation, SupervisorConfig};
pub use error::{Error, Result};
pub use mode::{ModeResolver, SystemMode};
pub use process::{ProcessLauncher, Spawn};
pub use reaper::ExitStatus;
pub use registry::{Registry, ServiceEntry};
pub use service::{
    load_definitions, RestartPolicy, ServiceDefinition, ServiceInstance, ServiceState, ServiceStatus,
};
pub use socket::{BoundSocket, SocketAddress};
pub use supervisor::{ActivationReport, ExitAction, Supervisor};
