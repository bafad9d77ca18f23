//! fab-recipe: recipe model and preprocessing
//!
//! A recipe describes how a set of packages is produced: sources, a build
//! script, build dependencies, supported architectures and the builder
//! class that runs it. Recipes are loaded from YAML, then lowered into a
//! concrete [`BuildSpec`] for a (host arch, build arch, bootstrap) triple.

mod arch;
mod builder;
mod error;
mod fileload;
mod httpload;
mod info;
mod loader;
mod raw;
mod spec;
mod srctar;
mod template;

pub use arch::{Arch, ArchSet};
pub use builder::Builder;
pub use error::RecipeError;
pub use fileload::{resolve_in_tree, FileLoader};
pub use httpload::HttpLoader;
pub use info::PkgInfo;
pub use loader::{BufferLoader, Loader, LoaderError, MultiLoader, Source};
pub use raw::{Package, Recipe, RECIPE_FILE_NAME};
pub use spec::BuildSpec;
pub use srctar::{write_source_tar, MakefileEmitter, SourceTarError};
