//! In-memory recipe index with dependency walking.

use camino::{Utf8Path, Utf8PathBuf};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use fab_recipe::{Recipe, RECIPE_FILE_NAME};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("package {0:?} not found")]
    PackageNotFound(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load {path}: {source}")]
    Recipe {
        path: Utf8PathBuf,
        #[source]
        source: fab_recipe::RecipeError,
    },
}

/// One recipe file and where it came from.
#[derive(Debug)]
pub struct RecipeEntry {
    /// Path of the recipe file.
    pub path: Utf8PathBuf,
    pub recipe: Recipe,
}

impl RecipeEntry {
    /// The recipe's directory, against which `file://` sources resolve.
    pub fn dir(&self) -> &Utf8Path {
        self.path.parent().unwrap_or_else(|| Utf8Path::new("."))
    }

    /// Base name of the recipe directory; this names the build jobs.
    pub fn dir_name(&self) -> &str {
        self.dir().file_name().unwrap_or("recipe")
    }
}

/// Maps every produced package name to the recipe that builds it.
///
/// Built once by scanning a recipe tree; immutable afterwards.
pub struct RecipeIndex {
    by_package: HashMap<String, Arc<RecipeEntry>>,
    entries: Vec<Arc<RecipeEntry>>,
}

impl RecipeIndex {
    /// Recursively scan `root` for recipe files.
    pub fn scan(root: &Utf8Path) -> Result<Self, IndexError> {
        let mut paths = Vec::new();
        find_recipes(root, &mut paths)?;
        paths.sort();

        let mut by_package = HashMap::new();
        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            let file = std::fs::File::open(&path).map_err(|e| IndexError::Io {
                path: path.clone(),
                source: e,
            })?;
            let recipe = Recipe::from_reader(file).map_err(|e| IndexError::Recipe {
                path: path.clone(),
                source: e,
            })?;
            let entry = Arc::new(RecipeEntry { path, recipe });
            for package in entry.recipe.packages.keys() {
                by_package.insert(package.clone(), entry.clone());
            }
            entries.push(entry);
        }

        debug!(
            recipes = entries.len(),
            packages = by_package.len(),
            "indexed recipe tree"
        );
        Ok(RecipeIndex {
            by_package,
            entries,
        })
    }

    pub fn get(&self, package: &str) -> Option<&Arc<RecipeEntry>> {
        self.by_package.get(package)
    }

    pub fn lookup(&self, package: &str) -> Result<&Arc<RecipeEntry>, IndexError> {
        self.by_package
            .get(package)
            .ok_or_else(|| IndexError::PackageNotFound(package.to_string()))
    }

    /// Every indexed recipe, in path order.
    pub fn entries(&self) -> &[Arc<RecipeEntry>] {
        &self.entries
    }

    /// Recipe directory base names, deduplicated and sorted.
    pub fn dirs(&self) -> Vec<String> {
        let mut dirs: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.dir_name().to_string())
            .collect();
        dirs.sort();
        dirs.dedup();
        dirs
    }

    /// The transitive dependency closure of `targets`, each package
    /// exactly once, dependencies before dependents.
    ///
    /// A visited set makes the walk terminate on cyclic inputs.
    pub fn walk(&self, targets: &[String]) -> Result<Vec<String>, IndexError> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for target in targets {
            self.walk_one(target, &mut seen, &mut out)?;
        }
        Ok(out)
    }

    fn walk_one(
        &self,
        package: &str,
        seen: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) -> Result<(), IndexError> {
        if !seen.insert(package.to_string()) {
            return Ok(());
        }
        let entry = self.lookup(package)?;
        let deps = entry
            .recipe
            .packages
            .get(package)
            .map(|p| p.dependencies.as_slice())
            .unwrap_or(&[]);
        for dep in deps {
            self.walk_one(dep, seen, out)?;
        }
        out.push(package.to_string());
        Ok(())
    }
}

fn find_recipes(dir: &Utf8Path, out: &mut Vec<Utf8PathBuf>) -> Result<(), IndexError> {
    let io_err = |source| IndexError::Io {
        path: dir.to_owned(),
        source,
    };
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = Utf8PathBuf::from_path_buf(entry.path()).map_err(|p| IndexError::Io {
            path: dir.to_owned(),
            source: std::io::Error::other(format!("non-UTF8 path {}", p.display())),
        })?;
        let kind = entry.file_type().map_err(io_err)?;
        if kind.is_dir() {
            find_recipes(&path, out)?;
        } else if path.file_name() == Some(RECIPE_FILE_NAME) {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_recipe(root: &Utf8Path, dir: &str, yaml: &str) {
        let dir = root.join(dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(RECIPE_FILE_NAME), yaml).unwrap();
    }

    fn tree() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    #[test]
    fn scan_indexes_by_package_name() {
        let (_guard, root) = tree();
        write_recipe(
            &root,
            "gcc",
            "packages:\n  gcc: {}\n  gcc-doc: {}\nversion: 9.1.0\nscript: [make]",
        );
        write_recipe(
            &root,
            "nested/musl",
            "packages:\n  musl: {}\nversion: 1.1.22\nscript: [make]",
        );

        let index = RecipeIndex::scan(&root).unwrap();
        assert!(index.get("gcc").is_some());
        assert!(index.get("gcc-doc").is_some());
        assert!(index.get("musl").is_some());
        assert_eq!(index.dirs(), vec!["gcc", "musl"]);
        // both packages resolve to the same entry
        assert_eq!(
            index.get("gcc").unwrap().dir_name(),
            index.get("gcc-doc").unwrap().dir_name()
        );
    }

    #[test]
    fn walk_is_post_order_and_deduplicated() {
        let (_guard, root) = tree();
        write_recipe(
            &root,
            "a",
            "packages:\n  a:\n    dependencies: [b, c]\nversion: 1.0.0\nscript: [make]",
        );
        write_recipe(
            &root,
            "b",
            "packages:\n  b:\n    dependencies: [c]\nversion: 1.0.0\nscript: [make]",
        );
        write_recipe(&root, "c", "packages:\n  c: {}\nversion: 1.0.0\nscript: [make]");

        let index = RecipeIndex::scan(&root).unwrap();
        assert_eq!(index.walk(&["a".to_string()]).unwrap(), vec!["c", "b", "a"]);
    }

    #[test]
    fn walk_missing_package_is_typed() {
        let (_guard, root) = tree();
        write_recipe(
            &root,
            "a",
            "packages:\n  a:\n    dependencies: [ghost]\nversion: 1.0.0\nscript: [make]",
        );
        let index = RecipeIndex::scan(&root).unwrap();
        assert!(matches!(
            index.walk(&["a".to_string()]),
            Err(IndexError::PackageNotFound(p)) if p == "ghost"
        ));
    }

    #[test]
    fn walk_terminates_on_cycles() {
        let (_guard, root) = tree();
        write_recipe(
            &root,
            "a",
            "packages:\n  a:\n    dependencies: [b]\nversion: 1.0.0\nscript: [make]",
        );
        write_recipe(
            &root,
            "b",
            "packages:\n  b:\n    dependencies: [a]\nversion: 1.0.0\nscript: [make]",
        );
        let index = RecipeIndex::scan(&root).unwrap();
        // the walker terminates; each package appears exactly once
        let order = index.walk(&["a".to_string()]).unwrap();
        assert_eq!(order, vec!["b", "a"]);
    }
}
