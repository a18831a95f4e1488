//! Domain layer: pure types, validation and planning.
//!
//! This module has zero imports from `crate::infra`, `crate::commands`,
//! `crate::application`, `tokio`, `std::fs`, `std::process`, or `std::net`.
//! All functions are synchronous and take data in, returning data out.

pub mod config;
pub mod disk;
pub mod duration;
pub mod error;
pub mod handles;
pub mod network;
pub mod progress;
pub mod ssh;

pub use config::{
    BuildConfig, BuilderConfig, CommonConfig, DiskSpec, IsoConfig, KeepVm, Template, VmConfig,
};
pub use error::{
    ConfigError, ExportError, InstanceError, LookupError, StateError, TransportError, WaitError,
};
pub use handles::{NetworkRef, SrRef, VbdKind, VdiRef, Vif, VifRef, VmRef};
pub use ssh::{SshAuth, SshTarget};
