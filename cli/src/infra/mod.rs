//! Infrastructure layer: concrete implementations of application port traits.
//!
//! This module contains all I/O-performing code: the XenAPI client, the
//! OpenSSH transport, HTTP downloads, process execution, mounts and
//! filesystem access.
//!
//! Imports from `crate::domain` and `crate::application` are allowed.
//! Imports from `crate::commands` or `crate::output` are forbidden.

pub mod command_runner;
pub mod config;
pub mod download;
pub mod fs;
pub mod mount;
pub mod ssh;
pub mod xapi;
