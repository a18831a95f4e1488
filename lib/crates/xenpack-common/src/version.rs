//! Hypervisor product versions (`6.2.0`, `7.1.2`, `8.2`).
//!
//! Comparison is numeric per component with missing trailing components
//! treated as zero, so `10.0` sorts after `6.5` and `6.5 == 6.5.0`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid product version '{0}'")]
pub struct VersionParseError(pub String);

#[derive(Debug, Clone)]
pub struct ProductVersion {
    components: Vec<u32>,
}

impl ProductVersion {
    #[must_use]
    pub fn new(components: &[u32]) -> Self {
        Self {
            components: components.to_vec(),
        }
    }

    #[must_use]
    pub fn components(&self) -> &[u32] {
        &self.components
    }

    fn component(&self, i: usize) -> u32 {
        self.components.get(i).copied().unwrap_or(0)
    }
}

impl FromStr for ProductVersion {
    type Err = VersionParseError;

    /// Accepts dotted numeric versions; a non-numeric suffix on the last
    /// component (`7.1.2-beta`) is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut components = Vec::new();
        for part in trimmed.split('.') {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            if digits.is_empty() {
                return Err(VersionParseError(s.to_string()));
            }
            let n = digits
                .parse::<u32>()
                .map_err(|_| VersionParseError(s.to_string()))?;
            components.push(n);
            if digits.len() != part.len() {
                break;
            }
        }
        if components.is_empty() {
            return Err(VersionParseError(s.to_string()));
        }
        Ok(Self { components })
    }
}

impl Ord for ProductVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for ProductVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ProductVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ProductVersion {}

impl fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.components.iter().map(u32::to_string).collect();
        f.write_str(&parts.join("."))
    }
}
