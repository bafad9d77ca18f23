//! Preprocessed build specifications.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

use crate::arch::{Arch, ArchSet};
use crate::builder::Builder;
use crate::error::RecipeError;
use crate::info::PkgInfo;
use crate::raw::{Package, Recipe};
use crate::template::TemplateCtx;

/// A recipe lowered for one concrete (host, build, bootstrap) triple.
///
/// All templated fields are expanded and all maps are ordered, so the JSON
/// encoding of a `BuildSpec` is deterministic. That encoding participates
/// in the build input digest; changing field order or names invalidates
/// every cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Produced packages and their runtime dependencies.
    pub packages: BTreeMap<String, Package>,

    /// Supported architectures from the recipe. Empty means universal.
    pub arch: ArchSet,

    /// Architecture the produced packages will run on.
    pub host_arch: Arch,

    /// Architecture the build itself runs on.
    pub build_arch: Arch,

    /// Rendered `<version>-<build>` string.
    pub version: String,

    /// Expanded, parsed source URLs.
    pub sources: Vec<Url>,

    /// Expanded build script lines.
    pub script: Vec<String>,

    /// Build dependencies, verbatim from the recipe.
    pub build_dependencies: Vec<String>,

    /// Normalised builder class.
    pub builder: Builder,

    /// Whether the recipe can be cross-compiled.
    pub cross: bool,

    /// Whether this spec was preprocessed for a bootstrap build.
    pub bootstrap: bool,

    /// Bootstrap-override map, carried verbatim from the recipe.
    pub no_bootstrap: BTreeMap<String, bool>,
}

impl Recipe {
    /// Lower this recipe into a [`BuildSpec`].
    ///
    /// A recipe whose builder is `bootstrap` is silently downgraded to the
    /// default builder when `bootstrap` is false; the bootstrap variant is
    /// a separate preprocessing call.
    pub fn preprocess(
        &self,
        host_arch: Arch,
        build_arch: Arch,
        bootstrap: bool,
    ) -> Result<BuildSpec, RecipeError> {
        if !host_arch.supported() {
            return Err(RecipeError::UnknownArch {
                arch: host_arch.to_string(),
            });
        }
        if !build_arch.supported() {
            return Err(RecipeError::UnknownArch {
                arch: build_arch.to_string(),
            });
        }

        let version = format!("{}-{}", normalize_version(&self.version)?, self.build);

        let ctx = TemplateCtx {
            version: &version,
            host: &host_arch,
            build: &build_arch,
        };

        let mut sources = Vec::with_capacity(self.sources.len());
        for (i, raw) in self.sources.iter().enumerate() {
            let expanded = ctx.expand(&format!("src-{i}"), raw)?;
            let url = Url::parse(&expanded).map_err(|e| RecipeError::SourceUrl {
                url: expanded.clone(),
                message: e.to_string(),
            })?;
            sources.push(url);
        }

        // The script expands as one unit so a helper may emit several lines.
        let script = ctx.expand("script", &self.script.join("\n"))?;
        let script: Vec<String> = script.lines().map(str::to_string).collect();

        let mut builder = Builder::parse(&self.builder)?;
        if !bootstrap && builder.is_bootstrap() {
            builder = Builder::Default;
        }

        Ok(BuildSpec {
            packages: self.packages.clone(),
            arch: self.arch.clone(),
            host_arch,
            build_arch,
            version,
            sources,
            script,
            build_dependencies: self.build_dependencies.clone(),
            builder,
            cross: self.cross,
            bootstrap,
            no_bootstrap: self.no_bootstrap.clone(),
        })
    }
}

impl BuildSpec {
    /// Produced package names, sorted.
    pub fn package_names(&self) -> Vec<String> {
        self.packages.keys().cloned().collect()
    }

    /// Package info records for every produced package.
    pub fn package_infos(&self) -> Vec<PkgInfo> {
        self.packages
            .iter()
            .map(|(name, pkg)| PkgInfo {
                name: name.clone(),
                version: self.version.clone(),
                dependencies: pkg.dependencies.clone(),
            })
            .collect()
    }
}

/// Normalize a recipe version to full semver form.
///
/// Recipes commonly write `2.10` for `2.10.0`; a leading `v` is tolerated.
fn normalize_version(raw: &str) -> Result<semver::Version, RecipeError> {
    let trimmed = raw.trim().trim_start_matches('v');
    let dots = trimmed.chars().filter(|&c| c == '.').count();
    let padded = match dots {
        0 => format!("{trimmed}.0.0"),
        1 => format!("{trimmed}.0"),
        _ => trimmed.to_string(),
    };
    semver::Version::parse(&padded).map_err(|e| RecipeError::Version {
        version: raw.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe(yaml: &str) -> Recipe {
        Recipe::from_str(yaml).unwrap()
    }

    fn x86_64() -> Arch {
        Arch::parse("x86_64").unwrap()
    }

    #[test]
    fn version_is_normalized_with_build_number() {
        let r = recipe("packages: {hello: {}}\nversion: '2.10'\nbuild: 4\nscript: [make]");
        let spec = r.preprocess(x86_64(), x86_64(), false).unwrap();
        assert_eq!(spec.version, "2.10.0-4");
    }

    #[test]
    fn sources_are_expanded_and_parsed() {
        let r = recipe(
            "packages: {hello: {}}\nversion: 1.0.0\nscript: [make]\nsources:\n  - https://example.org/hello-{{version}}.tar.gz",
        );
        let spec = r.preprocess(x86_64(), x86_64(), false).unwrap();
        assert_eq!(
            spec.sources[0].as_str(),
            "https://example.org/hello-1.0.0-0.tar.gz"
        );
    }

    #[test]
    fn bootstrap_builder_downgrades_for_regular_builds() {
        let r = recipe("packages: {gcc: {}}\nversion: 1.0.0\nscript: [make]\nbuilder: bootstrap");

        let plain = r.preprocess(x86_64(), x86_64(), false).unwrap();
        assert_eq!(plain.builder, Builder::Default);
        assert!(!plain.bootstrap);
        assert!(plain.no_bootstrap.is_empty());

        let boot = r.preprocess(x86_64(), x86_64(), true).unwrap();
        assert_eq!(boot.builder, Builder::Bootstrap);
        assert!(boot.bootstrap);
    }

    #[test]
    fn unknown_builder_fails() {
        let r = recipe("packages: {x: {}}\nversion: 1.0.0\nscript: [make]\nbuilder: chroot");
        assert!(matches!(
            r.preprocess(x86_64(), x86_64(), false),
            Err(RecipeError::UnknownBuilder { .. })
        ));
    }

    #[test]
    fn script_helper_may_emit_multiple_lines() {
        let r = recipe(
            "packages: {gcc: {}}\nversion: 1.0.0\nscript:\n  - '{{extract \"gcc\" \"gz\"}}'\n  - make",
        );
        let spec = r.preprocess(x86_64(), x86_64(), false).unwrap();
        assert_eq!(
            spec.script,
            vec![
                "tar -xf src/gcc-1.0.0-0.tar.gz",
                "mv gcc-1.0.0-0 gcc",
                "make"
            ]
        );
    }

    #[test]
    fn spec_json_is_stable() {
        let r = recipe(
            "packages:\n  b: {}\n  a: {}\nversion: 1.0.0\nscript: [make]\nbuilddependencies: [musl]",
        );
        let spec = r.preprocess(x86_64(), x86_64(), false).unwrap();
        let one = serde_json::to_vec(&spec).unwrap();
        let two =
            serde_json::to_vec(&serde_json::from_slice::<BuildSpec>(&one).unwrap()).unwrap();
        assert_eq!(one, two);
    }
}
