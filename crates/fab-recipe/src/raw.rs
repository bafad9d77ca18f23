//! Raw, file-backed recipe form.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;

use crate::arch::ArchSet;
use crate::error::RecipeError;

/// File name a recipe lives under inside its package directory.
pub const RECIPE_FILE_NAME: &str = "pkgen.yaml";

/// A recipe as it appears on disk, before preprocessing.
///
/// Field names follow the recipe format: single words, all lowercase.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub struct Recipe {
    /// Packages produced by this recipe, with their runtime dependencies.
    pub packages: BTreeMap<String, Package>,

    /// Supported architectures. Empty means universal.
    #[serde(default)]
    pub arch: ArchSet,

    /// Upstream version.
    pub version: String,

    /// Build number, appended to the version.
    #[serde(default)]
    pub build: u32,

    /// Source URL templates.
    #[serde(default)]
    pub sources: Vec<String>,

    /// Build script line templates.
    #[serde(default)]
    pub script: Vec<String>,

    /// Packages that must be installed in the worker before building.
    #[serde(default, rename = "builddependencies")]
    pub build_dependencies: Vec<String>,

    /// Builder class name. Empty means default.
    #[serde(default)]
    pub builder: String,

    /// Whether this recipe can be cross-compiled.
    #[serde(default)]
    pub cross: bool,

    /// Free-form recipe data.
    #[serde(default)]
    pub data: BTreeMap<String, serde_yaml::Value>,

    /// Dependencies for which the bootstrap variant must not be used,
    /// even in bootstrap builds. Format: `{python: true}`.
    #[serde(default, rename = "nobootstrap")]
    pub no_bootstrap: BTreeMap<String, bool>,
}

/// A package entry in a recipe.
#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
pub struct Package {
    /// Runtime dependencies of the produced package.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Recipe {
    /// Load a recipe from YAML.
    pub fn from_reader(r: impl Read) -> Result<Self, RecipeError> {
        let recipe: Recipe = serde_yaml::from_reader(r)?;
        Ok(recipe)
    }

    pub fn from_str(s: &str) -> Result<Self, RecipeError> {
        let recipe: Recipe = serde_yaml::from_str(s)?;
        Ok(recipe)
    }
}
