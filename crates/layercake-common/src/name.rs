//! Layer name validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{LayerError, LayerResult};

/// A validated layer name.
///
/// Layer names must:
/// - Be non-empty
/// - Contain only ASCII letters, digits, underscores and hyphens
/// - Not start with a hyphen
///
/// Names are case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LayerName(String);

impl LayerName {
    /// Create a new layer name, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::InvalidName`] if the name format is invalid.
    pub fn new(name: impl Into<String>) -> LayerResult<Self> {
        let name = name.into();
        if !Self::is_valid(&name) {
            return Err(LayerError::InvalidName { name });
        }
        Ok(Self(name))
    }

    /// Check a candidate name without constructing it.
    #[must_use]
    pub fn is_valid(name: &str) -> bool {
        let mut chars = name.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        if !(first.is_ascii_alphanumeric() || first == '_') {
            return false;
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }

    /// Get the layer name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for LayerName {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for LayerName {
    type Error = LayerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LayerName> for String {
    fn from(name: LayerName) -> Self {
        name.0
    }
}

impl AsRef<str> for LayerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
