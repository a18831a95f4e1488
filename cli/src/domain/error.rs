//! Typed domain error enums.
//!
//! This module has zero imports from `crate::infra`, `crate::commands`,
//! `crate::application`, `tokio`, `std::fs`, `std::process`, or `std::net`.
//! All error types implement `thiserror::Error` and convert to `anyhow::Error`
//! via the `?` operator.

use std::time::Duration;

use thiserror::Error;

// ── Config errors ─────────────────────────────────────────────────────────────

/// Problems found while validating a build template.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be specified")]
    Missing { field: &'static str },

    #[error("Failed to parse {field} '{value}': {reason}")]
    InvalidDuration {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid value for {field}: {value}\n\nValid values: {valid}")]
    InvalidValue {
        field: &'static str,
        value: String,
        valid: String,
    },

    #[error("{0}")]
    Invalid(String),

    #[error("{}", join_problems(.0))]
    Multiple(Vec<ConfigError>),
}

fn join_problems(problems: &[ConfigError]) -> String {
    let mut out = format!("template has {} problem(s):", problems.len());
    for p in problems {
        out.push_str("\n  * ");
        out.push_str(&p.to_string());
    }
    out
}

// ── Build state errors ────────────────────────────────────────────────────────

/// A step read a state key that no earlier step wrote.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("build state key '{key}' was not set by an earlier step")]
    Missing { key: &'static str },
}

// ── Wait errors ───────────────────────────────────────────────────────────────

/// Outcome of a bounded poll that did not succeed.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("wait was interrupted")]
    Cancelled,

    #[error(transparent)]
    Predicate(anyhow::Error),
}

// ── Transport errors ──────────────────────────────────────────────────────────

/// Failures of the remote shell transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot reach {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("remote command '{command}' failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        /// Output captured before the failure, including earlier commands of a batch.
        stdout: String,
        stderr: String,
    },

    #[error("failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },
}

// ── Lookup errors ─────────────────────────────────────────────────────────────

/// Name lookups that must resolve to exactly one object.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' is ambiguous: {count} matches")]
    Ambiguous {
        kind: &'static str,
        name: String,
        count: usize,
    },
}

impl LookupError {
    /// Pick the single element of `matches`, or describe why there is none.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for zero matches and `Ambiguous` for more than one.
    pub fn exactly_one<T>(kind: &'static str, name: &str, mut matches: Vec<T>) -> Result<T, Self> {
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(Self::NotFound {
                kind,
                name: name.to_string(),
            }),
            count => Err(Self::Ambiguous {
                kind,
                name: name.to_string(),
                count,
            }),
        }
    }
}

// ── Export errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExportError {
    #[error("unknown export format '{0}'")]
    UnknownFormat(String),
}

// ── Instance errors ───────────────────────────────────────────────────────────

/// The VM does not have the shape the build can work with.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstanceError {
    #[error("only VMs with one disk can be processed; this VM has {0}")]
    DiskCount(usize),
}
