//! Error types for recipe loading and preprocessing.

use thiserror::Error;

/// Errors produced while loading or preprocessing a recipe.
#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("failed to parse recipe: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unknown architecture {arch:?}")]
    UnknownArch { arch: String },

    #[error("unknown builder {builder:?}")]
    UnknownBuilder { builder: String },

    #[error("invalid version {version:?}: {message}")]
    Version { version: String, message: String },

    #[error("template error in {field}: {message}")]
    Template { field: String, message: String },

    #[error("invalid source url {url:?}: {message}")]
    SourceUrl { url: String, message: String },
}
