//! Sessions: the registry of live shells and the shell collaborator.

pub mod registry;
pub mod shell;

pub use registry::{SessionInfo, SessionLimits, SessionRegistry};
pub use shell::{PtySpawner, ShellEvent, ShellHandle, ShellSpawner, ShellSpec};
