//! Script and source-URL template expansion.
//!
//! Recipes may use `{{helper arg ...}}` placeholders with a fixed helper
//! vocabulary. Expansion is a pure function of the recipe and the selected
//! architectures; no I/O happens here, so a recipe expands identically
//! every time it is preprocessed.

use crate::arch::Arch;
use crate::error::RecipeError;

pub(crate) struct TemplateCtx<'a> {
    /// Rendered `<version>-<build>` string.
    pub version: &'a str,
    pub host: &'a Arch,
    pub build: &'a Arch,
}

impl TemplateCtx<'_> {
    /// Expand every `{{...}}` placeholder in `input`.
    ///
    /// `field` names the recipe field being expanded and only appears in
    /// error messages.
    pub fn expand(&self, field: &str, input: &str) -> Result<String, RecipeError> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| RecipeError::Template {
                field: field.to_string(),
                message: "unterminated placeholder".to_string(),
            })?;
            let call = &after[..end];
            out.push_str(&self.eval(field, call)?);
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn eval(&self, field: &str, call: &str) -> Result<String, RecipeError> {
        let err = |message: String| RecipeError::Template {
            field: field.to_string(),
            message,
        };

        let words = tokenize(call).map_err(|m| err(m))?;
        let Some((helper, args)) = words.split_first() else {
            return Err(err("empty placeholder".to_string()));
        };

        let arity = |n: usize| -> Result<(), RecipeError> {
            if args.len() == n {
                Ok(())
            } else {
                Err(err(format!(
                    "{} takes {} argument(s), got {}",
                    helper,
                    n,
                    args.len()
                )))
            }
        };

        match helper.as_str() {
            // unpack an upstream tarball from src/ and normalize its name
            "extract" => {
                arity(2)?;
                let (name, ext) = (&args[0], &args[1]);
                Ok(format!(
                    "tar -xf src/{name}-{version}.tar.{ext}\nmv {name}-{version} {name}",
                    version = self.version,
                ))
            }
            // move a file from one output package root to another
            "pkmv" => {
                arity(3)?;
                let file = args[0].trim_end_matches('/');
                let (src, dest) = (&args[1], &args[2]);
                let dir = match file.rfind('/') {
                    Some(i) => &file[..i],
                    None => "",
                };
                let mv = format!("mv out/{src}/{file} out/{dest}/{dir}");
                if dir.is_empty() {
                    Ok(mv)
                } else {
                    Ok(format!("mkdir -p out/{dest}/{dir}\n{mv}"))
                }
            }
            // split man pages out of a package into <pkg>-man
            "mvman" => {
                arity(1)?;
                let pkg = &args[0];
                Ok(format!(
                    "mkdir -p out/{pkg}-man/usr/share\nmv out/{pkg}/usr/share/man out/{pkg}-man/usr/share/man"
                ))
            }
            // ./configure with the canonical flag set, in a subshell
            "configure" => {
                if args.is_empty() {
                    return Err(err("configure takes at least a directory".to_string()));
                }
                let dir = &args[0];
                let extra = args[1..].join(" ");
                let mut cmd = format!(
                    "(cd {dir} && ./configure {flags} --prefix=/usr --sysconfdir=/etc --mandir=/usr/share/man --localstatedir=/var",
                    flags = self.confflags(),
                );
                if !extra.is_empty() {
                    cmd.push(' ');
                    cmd.push_str(&extra);
                }
                cmd.push(')');
                Ok(cmd)
            }
            "confflags" => {
                arity(0)?;
                Ok(self.confflags())
            }
            "confarch" => {
                arity(0)?;
                Ok(self.build.autotools().to_string())
            }
            "hostarch" => {
                arity(0)?;
                Ok(self.host.to_string())
            }
            "buildarch" => {
                arity(0)?;
                Ok(self.build.to_string())
            }
            "version" => {
                arity(0)?;
                Ok(self.version.to_string())
            }
            other => Err(err(format!("unknown helper {other:?}"))),
        }
    }

    fn confflags(&self) -> String {
        format!(
            "--build {}-pc-linux-musl --host {}-pc-linux-musl",
            self.build.autotools(),
            self.host.autotools(),
        )
    }
}

/// Split a placeholder body into a helper name and arguments.
/// Arguments are bare words or double-quoted strings.
fn tokenize(call: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut chars = call.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '"' => {
                chars.next();
                let mut word = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(esc) => word.push(esc),
                            None => return Err("unterminated string".to_string()),
                        },
                        Some(other) => word.push(other),
                        None => return Err("unterminated string".to_string()),
                    }
                }
                words.push(word);
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ' ' || c == '\t' || c == '"' {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                words.push(word);
            }
        }
    }

    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(host: &'a Arch, build: &'a Arch) -> TemplateCtx<'a> {
        TemplateCtx {
            version: "1.2.3-4",
            host,
            build,
        }
    }

    #[test]
    fn extract_expands() {
        let host = Arch::parse("x86_64").unwrap();
        let build = Arch::parse("x86_64").unwrap();
        let out = ctx(&host, &build)
            .expand("script", r#"{{extract "gcc" "gz"}}"#)
            .unwrap();
        assert_eq!(out, "tar -xf src/gcc-1.2.3-4.tar.gz\nmv gcc-1.2.3-4 gcc");
    }

    #[test]
    fn configure_includes_canonical_flags() {
        let host = Arch::parse("x86").unwrap();
        let build = Arch::parse("x86_64").unwrap();
        let out = ctx(&host, &build)
            .expand("script", r#"{{configure "gcc" "--disable-nls"}}"#)
            .unwrap();
        assert!(out.starts_with("(cd gcc && ./configure --build x86_64-pc-linux-musl --host i386-pc-linux-musl"));
        assert!(out.contains("--prefix=/usr"));
        assert!(out.ends_with("--disable-nls)"));
    }

    #[test]
    fn pkmv_with_subdir_makes_target_dir() {
        let host = Arch::parse("x86_64").unwrap();
        let build = Arch::parse("x86_64").unwrap();
        let out = ctx(&host, &build)
            .expand("script", r#"{{pkmv "usr/lib/libfoo.so" "foo" "foo-dev"}}"#)
            .unwrap();
        assert_eq!(
            out,
            "mkdir -p out/foo-dev/usr/lib\nmv out/foo/usr/lib/libfoo.so out/foo-dev/usr/lib"
        );
    }

    #[test]
    fn arch_accessors() {
        let host = Arch::parse("x86").unwrap();
        let build = Arch::parse("x86_64").unwrap();
        let out = ctx(&host, &build)
            .expand("script", "{{hostarch}}/{{buildarch}}/{{confarch}}")
            .unwrap();
        assert_eq!(out, "x86/x86_64/x86_64");
    }

    #[test]
    fn unknown_helper_is_an_error() {
        let host = Arch::parse("x86_64").unwrap();
        let build = Arch::parse("x86_64").unwrap();
        let err = ctx(&host, &build)
            .expand("script", "{{frobnicate}}")
            .unwrap_err();
        assert!(matches!(err, RecipeError::Template { .. }));
    }

    #[test]
    fn text_without_placeholders_is_unchanged() {
        let host = Arch::parse("x86_64").unwrap();
        let build = Arch::parse("x86_64").unwrap();
        let out = ctx(&host, &build).expand("script", "make -j4").unwrap();
        assert_eq!(out, "make -j4");
    }
}
