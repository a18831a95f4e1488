//! Application layer: port trait definitions and use-case orchestration.
//!
//! This module depends only on `crate::domain` and `xenpack_common`, never on
//! `crate::infra`, `crate::commands`, or `crate::output`.

pub mod ports;
pub mod runner;
pub mod services;
pub mod state;
pub mod steps;
pub mod tunnel;
pub mod wait;

pub use ports::{
    CommandRunner, Downloader, FileHasher, Hypervisor, LocalFs, MountManager, ProgressReporter,
    RemoteShell, ShellConnector, TunnelDialer,
};
pub use runner::{RunOutcome, Step, StepAction, StepRunner};
pub use state::{BuildContext, BuildServices, BuildState};
