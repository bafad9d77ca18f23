//! Canonical job names.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use fab_recipe::Arch;

#[derive(Debug, Error)]
#[error("malformed job name {0:?}")]
pub struct ParseJobNameError(pub String);

/// `<pkg>:<arch>`, with a `-bootstrap` suffix for bootstrap variants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobName {
    pub package: String,
    pub arch: Arch,
    pub bootstrap: bool,
}

impl JobName {
    pub fn new(package: impl Into<String>, arch: Arch, bootstrap: bool) -> Self {
        JobName {
            package: package.into(),
            arch,
            bootstrap,
        }
    }

    /// Parse a job name by reverse: strip the suffix, then split on the
    /// last colon.
    pub fn parse(s: &str) -> Result<Self, ParseJobNameError> {
        let (body, bootstrap) = match s.strip_suffix("-bootstrap") {
            Some(body) => (body, true),
            None => (s, false),
        };
        let (package, arch) = body
            .rsplit_once(':')
            .ok_or_else(|| ParseJobNameError(s.to_string()))?;
        if package.is_empty() || arch.is_empty() {
            return Err(ParseJobNameError(s.to_string()));
        }
        Ok(JobName {
            package: package.to_string(),
            arch: Arch::new_unchecked(arch),
            bootstrap,
        })
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.package, self.arch)?;
        if self.bootstrap {
            f.write_str("-bootstrap")?;
        }
        Ok(())
    }
}
