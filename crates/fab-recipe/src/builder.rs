//! Builder classes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::RecipeError;

/// The worker environment a recipe builds in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Builder {
    /// The standard worker image with the package toolchain preinstalled.
    Default,
    /// Like default, but the worker also gets the host container socket.
    Docker,
    /// A bare base image; the build may not rely on any built package.
    Bootstrap,
}

impl Builder {
    /// Parse a builder name from a recipe.
    ///
    /// The empty string means default. The retired `alpine` and `panux`
    /// names, still present in old recipe trees, fold into default;
    /// anything else is an error.
    pub fn parse(name: &str) -> Result<Self, RecipeError> {
        match name {
            "" | "default" => Ok(Builder::Default),
            "docker" => Ok(Builder::Docker),
            "bootstrap" => Ok(Builder::Bootstrap),
            "alpine" | "panux" => Ok(Builder::Default),
            other => Err(RecipeError::UnknownBuilder {
                builder: other.to_string(),
            }),
        }
    }

    pub fn is_bootstrap(self) -> bool {
        self == Builder::Bootstrap
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Builder::Default => "default",
            Builder::Docker => "docker",
            Builder::Bootstrap => "bootstrap",
        }
    }
}

impl fmt::Display for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_aliases() {
        assert_eq!(Builder::parse("").unwrap(), Builder::Default);
        assert_eq!(Builder::parse("alpine").unwrap(), Builder::Default);
        assert_eq!(Builder::parse("panux").unwrap(), Builder::Default);
        assert_eq!(Builder::parse("bootstrap").unwrap(), Builder::Bootstrap);
        assert_eq!(Builder::parse("docker").unwrap(), Builder::Docker);
        assert!(Builder::parse("chroot").is_err());
    }
}
