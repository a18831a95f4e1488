//! Connection targets for the remote shell transport.

use std::fmt;
use std::path::PathBuf;

/// How to authenticate to an SSH server.
#[derive(Clone, PartialEq, Eq)]
pub enum SshAuth {
    Password(String),
    Key(PathBuf),
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::Key(path) => f.debug_tuple("Key").field(path).finish(),
        }
    }
}

/// A host reachable over SSH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,
}

impl SshTarget {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            auth,
        }
    }

    /// `user@host` destination argument.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Same credentials, different host and port.
    #[must_use]
    pub fn retarget(&self, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..self.clone()
        }
    }
}
