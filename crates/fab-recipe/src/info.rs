//! Package info records shipped inside source tarballs.

use std::fmt::Write;

/// The data in a `<pkg>.pkginfo` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgInfo {
    pub name: String,
    pub version: String,
    pub dependencies: Vec<String>,
}

impl PkgInfo {
    /// Render in the `KEY="value"` format the worker tooling consumes.
    pub fn render(&self) -> String {
        let mut out = String::new();
        // write! to a String cannot fail
        let _ = write!(out, "NAME={:?}\nVERSION={:?}\n", self.name, self.version);
        if !self.dependencies.is_empty() {
            let _ = write!(out, "DEPENDENCIES={:?}\n", self.dependencies.join(" "));
        }
        out
    }

    /// File name for this record inside the source tar.
    pub fn file_name(&self) -> String {
        format!("{}.pkginfo", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_with_dependencies() {
        let info = PkgInfo {
            name: "hello".to_string(),
            version: "2.10.0-1".to_string(),
            dependencies: vec!["musl".to_string(), "libgcc".to_string()],
        };
        assert_eq!(
            info.render(),
            "NAME=\"hello\"\nVERSION=\"2.10.0-1\"\nDEPENDENCIES=\"musl libgcc\"\n"
        );
    }

    #[test]
    fn render_without_dependencies() {
        let info = PkgInfo {
            name: "hello".to_string(),
            version: "1.0.0-0".to_string(),
            dependencies: vec![],
        };
        assert_eq!(info.render(), "NAME=\"hello\"\nVERSION=\"1.0.0-0\"\n");
    }
}
