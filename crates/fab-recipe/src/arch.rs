//! Architecture names and sets.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::RecipeError;

/// A CPU architecture, by its package-repository name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Arch(String);

impl Arch {
    pub const X86_64: &'static str = "x86_64";
    pub const X86: &'static str = "x86";

    /// Parse an architecture name, rejecting unrecognized ones.
    pub fn parse(name: &str) -> Result<Self, RecipeError> {
        match name {
            Self::X86_64 | Self::X86 => Ok(Arch(name.to_string())),
            other => Err(RecipeError::UnknownArch {
                arch: other.to_string(),
            }),
        }
    }

    /// Construct without validation. Used when the name comes from a
    /// trusted source (a parsed job name, a cache record).
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Arch(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this arch is recognized and will be processed correctly.
    pub fn supported(&self) -> bool {
        matches!(self.0.as_str(), Self::X86_64 | Self::X86)
    }

    /// The name autotools uses for this arch.
    pub fn autotools(&self) -> &str {
        match self.0.as_str() {
            // autotools treats x86 as "i.86"
            Self::X86 => "i386",
            _ => &self.0,
        }
    }

    /// The name the container platform uses for node architectures.
    pub fn node_name(&self) -> &str {
        match self.0.as_str() {
            Self::X86 => "386",
            Self::X86_64 => "amd64",
            _ => &self.0,
        }
    }

    /// Architectures whose machine code this arch's output will run on.
    /// 32-bit x86 code also runs on x86_64 hosts.
    pub fn runs_on(&self) -> Vec<Arch> {
        match self.0.as_str() {
            Self::X86 => vec![
                Arch::new_unchecked(Self::X86),
                Arch::new_unchecked(Self::X86_64),
            ],
            _ => vec![self.clone()],
        }
    }

    /// The full set of architectures the build system knows about.
    pub fn all() -> ArchSet {
        ArchSet(vec![
            Arch::new_unchecked(Self::X86_64),
            Arch::new_unchecked(Self::X86),
        ])
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A set of supported architectures. An empty set means the recipe is
/// architecture-independent and builds everywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchSet(Vec<Arch>);

impl ArchSet {
    pub fn new(arches: Vec<Arch>) -> Self {
        ArchSet(arches)
    }

    pub fn is_universal(&self) -> bool {
        self.0.is_empty()
    }

    pub fn supports(&self, arch: &Arch) -> bool {
        self.0.is_empty() || self.0.contains(arch)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arch> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Arch> for ArchSet {
    fn from_iter<T: IntoIterator<Item = Arch>>(iter: T) -> Self {
        ArchSet(iter.into_iter().collect())
    }
}
