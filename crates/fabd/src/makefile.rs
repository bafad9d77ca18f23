//! The coordinator's Makefile emitter.
//!
//! The build core treats the Makefile as an opaque source-tar entry; this
//! is the concrete emitter it ships. The generated file runs the recipe
//! script from the build directory and packages each output root into
//! `tars/<pkg>.tar.gz`.

use std::fmt::Write;

use fab_recipe::{BuildSpec, MakefileEmitter};

pub struct ScriptMakefile;

impl MakefileEmitter for ScriptMakefile {
    fn render(&self, spec: &BuildSpec) -> std::io::Result<Vec<u8>> {
        let mut out = String::new();
        let packages = spec.package_names();

        let _ = writeln!(out, ".POSIX:");
        let _ = writeln!(out, "VERSION = {}", spec.version);
        let _ = writeln!(out);
        let _ = writeln!(out, "all: pkgs");
        let _ = writeln!(out);

        // output roots for the script to populate
        let _ = writeln!(out, "outdirs:");
        for package in &packages {
            let _ = writeln!(out, "\tmkdir -p out/{package}");
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "build: outdirs");
        for line in &spec.script {
            if line.trim().is_empty() {
                continue;
            }
            let _ = writeln!(out, "\t{line}");
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "pkgs: build");
        let _ = writeln!(out, "\tmkdir -p tars");
        for package in &packages {
            let _ = writeln!(
                out,
                "\ttar -czf tars/{package}.tar.gz -C out/{package} ."
            );
        }

        Ok(out.into_bytes())
    }
}
