//! `BuildCfg`: a named choice of build tools for a triplet.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::ConfigError;

static NON_NAME_CHAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[^0-9A-Za-z_-]").expect("static regex"));

fn default_name(triplet: &str, ccopts: &[String]) -> String {
    let mut raw = triplet.to_string();
    raw.push_str(&ccopts.concat());
    NON_NAME_CHAR.replace_all(&raw, "_").into_owned()
}

/// A `BuildCfg` represents a choice of tools for building code.
///
/// `BuildCfg` objects describe both hosts in a toolchain and target
/// multilibs. Different pieces of code built with different tools or
/// different GNU triplets use different `BuildCfg` objects, even when the
/// resulting code ends up packaged together; a `BuildCfg` says nothing about
/// where code ends up in a package (that is [`crate::PkgHost`] and the
/// multilib layout's job).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildCfg {
    /// The GNU triplet for this configuration.
    pub triplet: String,
    /// Unique name, used in naming build directories.
    pub name: String,
    tool_prefix: String,
    ccopts: Vec<String>,
    tool_opts: BTreeMap<String, Vec<String>>,
}

impl BuildCfg {
    /// Construct a `BuildCfg` with the default tool prefix and no options.
    #[must_use]
    pub fn new(triplet: impl Into<String>) -> Self {
        Self::with_options(triplet, None, None, Vec::new(), BTreeMap::new())
    }

    /// Construct a `BuildCfg` with full control over every optional field.
    ///
    /// `tool_prefix` of `None` defaults to `"<triplet>-"`; an explicit empty
    /// string means native (unprefixed) tools. `name` of `None` defaults to
    /// the triplet and `ccopts` concatenated, with non `[0-9A-Za-z_-]`
    /// characters mapped to `_`.
    #[must_use]
    pub fn with_options(
        triplet: impl Into<String>,
        name: Option<String>,
        tool_prefix: Option<String>,
        ccopts: Vec<String>,
        tool_opts: BTreeMap<String, Vec<String>>,
    ) -> Self {
        let triplet = triplet.into();
        let tool_prefix = tool_prefix.unwrap_or_else(|| format!("{triplet}-"));
        let name = name.unwrap_or_else(|| default_name(&triplet, &ccopts));
        Self {
            triplet,
            name,
            tool_prefix,
            ccopts,
            tool_opts,
        }
    }

    /// Whether this triplet targets Windows (MinGW).
    #[must_use]
    pub fn is_windows(&self) -> bool {
        self.triplet.contains("-mingw")
    }

    /// Whether code for this configuration should be linked against
    /// `libiconv` rather than relying on a libc-provided `iconv`.
    #[must_use]
    pub fn use_libiconv(&self) -> bool {
        self.is_windows()
    }

    /// Whether code for this configuration should use ncurses.
    #[must_use]
    pub fn use_ncurses(&self) -> bool {
        !self.is_windows()
    }

    /// Return the full name and arguments for the named tool.
    ///
    /// `"c-compiler"` and `"c++-compiler"` map to `gcc`/`g++`. The result is
    /// a fresh `Vec` the caller is free to extend with further arguments.
    #[must_use]
    pub fn tool(&self, name: &str) -> Vec<String> {
        let mapped = match name {
            "c-compiler" => "gcc",
            "c++-compiler" => "g++",
            other => other,
        };
        let mut tool_list = vec![format!("{}{}", self.tool_prefix, mapped)];
        if matches!(mapped, "c++" | "cpp" | "g++" | "gcc") {
            tool_list.extend(self.ccopts.iter().cloned());
        }
        if let Some(extra) = self.tool_opts.get(mapped) {
            tool_list.extend(extra.iter().cloned());
        }
        tool_list
    }

    /// Run a configured tool, optionally prefixing `PATH` and checking the
    /// exit status.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotShellSafe`] if `check` is set and the tool
    /// exits non-zero (surfaced via the generic `BadValue` variant, since
    /// the true failure is an execution error owned by the caller's
    /// `forge_core::Error`; this crate has no execution-error type).
    pub fn run_tool(
        &self,
        name: &str,
        args: &[String],
        path_prepend: Option<&str>,
        check: bool,
    ) -> std::io::Result<std::process::Output> {
        let argv = self.tool(name);
        let mut cmd = std::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.args(args);
        if let Some(prefix) = path_prepend {
            let existing = std::env::var("PATH").unwrap_or_default();
            cmd.env("PATH", format!("{prefix}:{existing}"));
        }
        let output = cmd.output()?;
        if check && !output.status.success() {
            return Err(std::io::Error::other(format!(
                "{} exited with {}",
                argv.join(" "),
                output.status
            )));
        }
        Ok(output)
    }

    /// Determine target endianness by preprocessing a small C snippet with
    /// this configuration's C compiler.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BadValue`] if the compiler cannot be run, or
    /// if the preprocessed output names neither little- nor big-endian (for
    /// example PDP-endian, or a missing `__BYTE_ORDER__` macro).
    pub fn get_endianness(&self, path_prepend: Option<&str>) -> Result<String, ConfigError> {
        const SNIPPET: &str = "\
#if __BYTE_ORDER__ == __ORDER_LITTLE_ENDIAN__\nlittle\n\
#elif __BYTE_ORDER__ == __ORDER_BIG_ENDIAN__\nbig\n\
#else\nunknown\n#endif\n";
        let mut argv = self.tool("gcc");
        argv.extend(["-E", "-P", "-"].map(str::to_string));
        let mut cmd = std::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        if let Some(prefix) = path_prepend {
            let existing = std::env::var("PATH").unwrap_or_default();
            cmd.env("PATH", format!("{prefix}:{existing}"));
        }
        let map_err = |e: std::io::Error| ConfigError::BadValue {
            name: format!("endianness probe: {e}"),
        };
        let mut child = cmd.spawn().map_err(map_err)?;
        {
            use std::io::Write;
            child
                .stdin
                .take()
                .expect("piped stdin")
                .write_all(SNIPPET.as_bytes())
                .map_err(map_err)?;
        }
        let output = child.wait_with_output().map_err(map_err)?;
        let text = String::from_utf8_lossy(&output.stdout);
        let trimmed: String = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        match trimmed.as_str() {
            "little" => Ok("little".to_string()),
            "big" => Ok("big".to_string()),
            _ => Err(ConfigError::BadValue {
                name: "endianness (PDP-endian or undetermined)".to_string(),
            }),
        }
    }

    /// Return the standard set of `configure`-time variable settings
    /// (`CC=...`, `CXX=...`, ...), sorted by variable name.
    ///
    /// On Windows targets, also includes `WINDRES` and the libtool alias
    /// `RC` (both pointing at `windres`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotShellSafe`] if any resulting argv word
    /// would be altered by shell quoting (i.e. is unsafe to place
    /// unquoted in a generated command line).
    pub fn configure_vars(&self, cflags_extra: Option<&[String]>) -> Result<Vec<String>, ConfigError> {
        let mut var_map: BTreeMap<&str, &str> = BTreeMap::from([
            ("AR", "ar"),
            ("AS", "as"),
            ("CC", "c-compiler"),
            ("CXX", "c++-compiler"),
            ("LD", "ld"),
            ("NM", "nm"),
            ("OBJCOPY", "objcopy"),
            ("OBJDUMP", "objdump"),
            ("RANLIB", "ranlib"),
            ("READELF", "readelf"),
            ("STRIP", "strip"),
        ]);
        if self.is_windows() {
            var_map.insert("WINDRES", "windres");
            var_map.insert("RC", "windres");
        }
        let mut var_list = Vec::with_capacity(var_map.len());
        for (var, tool_name) in var_map {
            let mut val = self.tool(tool_name);
            if let Some(extra) = cflags_extra {
                if matches!(var, "CC" | "CXX") {
                    val.extend(extra.iter().cloned());
                }
            }
            for word in &val {
                if !is_shell_safe(word) {
                    return Err(ConfigError::NotShellSafe {
                        var: var.to_string(),
                        value: word.clone(),
                    });
                }
            }
            var_list.push(format!("{var}={}", val.join(" ")));
        }
        Ok(var_list)
    }
}

/// Whether `word`, placed unquoted on a shell command line, would be parsed
/// back as exactly itself — the same check the original implementation
/// performs with `shlex.quote`.
fn is_shell_safe(word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    word.bytes().all(|b| {
        b.is_ascii_alphanumeric() || matches!(b, b'%' | b'+' | b'-' | b'.' | b'/' | b':' | b'=' | b'@' | b'_' | b',')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_name_sanitizes() {
        let cfg = BuildCfg::with_options(
            "x86_64-w64-mingw32",
            None,
            None,
            vec!["-m32".to_string()],
            BTreeMap::new(),
        );
        assert_eq!(cfg.name, "x86_64-w64-mingw32-m32");
    }

    #[test]
    fn tool_prefixes_compiler_drivers_only() {
        let cfg = BuildCfg::with_options(
            "aarch64-linux-gnu".to_string(),
            None,
            None,
            vec!["-g".to_string()],
            BTreeMap::new(),
        );
        assert_eq!(cfg.tool("gcc"), vec!["aarch64-linux-gnu-gcc", "-g"]);
        assert_eq!(cfg.tool("ar"), vec!["aarch64-linux-gnu-ar"]);
        assert_eq!(cfg.tool("c-compiler"), vec!["aarch64-linux-gnu-gcc", "-g"]);
    }

    #[test]
    fn configure_vars_sorted_and_mingw_alias() {
        let cfg = BuildCfg::new("x86_64-w64-mingw32");
        let vars = cfg.configure_vars(None).unwrap();
        let names: Vec<&str> = vars.iter().map(|v| v.split('=').next().unwrap()).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
        assert!(vars.iter().any(|v| v.starts_with("WINDRES=")));
        assert!(vars.iter().any(|v| v == &format!("RC=x86_64-w64-mingw32-windres")));
    }

    #[test]
    fn configure_vars_rejects_unsafe_word() {
        let mut tool_opts = BTreeMap::new();
        tool_opts.insert("ar".to_string(), vec!["$(evil)".to_string()]);
        let cfg = BuildCfg::with_options(
            "x86_64-linux-gnu".to_string(),
            None,
            None,
            Vec::new(),
            tool_opts,
        );
        assert!(cfg.configure_vars(None).is_err());
    }
}
