//! Generated-makefile object model and command quoting.

use std::collections::{BTreeMap, BTreeSet};

use forge_schema::GraphError;

use crate::tsort::tsort;

/// Shell-quote `word` the way a POSIX shell would require for it to round
/// trip unchanged, then double any `$` for use inside a makefile recipe
/// line (make otherwise treats `$` as its own variable-reference
/// sigil).
#[must_use]
pub fn shell_quote_for_make(word: &str) -> String {
    let needs_quote = word.is_empty()
        || !word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'%' | b'+' | b'-' | b'.' | b'/' | b':' | b'=' | b'@' | b'_'));
    let quoted = if needs_quote {
        format!("'{}'", word.replace('\'', r"'\''"))
    } else {
        word.to_string()
    };
    quoted.replace('$', "$$")
}

/// Convert a command and its arguments to the form used in a makefile
/// recipe line.
///
/// # Errors
///
/// Returns [`GraphError::InvalidEnvValue`] if any argument contains a
/// newline, which cannot be represented on a single recipe line.
pub fn command_to_make(command: &[String]) -> Result<String, GraphError> {
    let rendered = command
        .iter()
        .map(|s| shell_quote_for_make(s))
        .collect::<Vec<_>>()
        .join(" ");
    if rendered.contains('\n') {
        return Err(GraphError::InvalidEnvValue {
            key: format!("newline in command for makefile: {rendered}"),
        });
    }
    Ok(rendered)
}

/// A generated makefile: phony targets, their dependency edges, and the
/// recipe lines attached to each.
#[derive(Debug)]
pub struct Makefile {
    first_target: String,
    targets: BTreeSet<String>,
    deps: BTreeMap<String, BTreeSet<String>>,
    commands: BTreeMap<String, Vec<String>>,
}

impl Makefile {
    /// Create a new makefile whose first (default) target is `first_target`.
    #[must_use]
    pub fn new(first_target: impl Into<String>) -> Self {
        let first_target = first_target.into();
        let mut mf = Self {
            first_target: first_target.clone(),
            targets: BTreeSet::new(),
            deps: BTreeMap::new(),
            commands: BTreeMap::new(),
        };
        mf.add_target(&first_target)
            .expect("first target is new by construction");
        mf
    }

    /// Add a target. Each target must be added exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateTaskName`] if `target` was already
    /// added.
    pub fn add_target(&mut self, target: &str) -> Result<(), GraphError> {
        if !self.targets.insert(target.to_string()) {
            return Err(GraphError::DuplicateTaskName {
                name: target.to_string(),
            });
        }
        self.deps.insert(target.to_string(), BTreeSet::new());
        self.commands.insert(target.to_string(), Vec::new());
        Ok(())
    }

    /// Add dependency edges `target: deps...`. Duplicate dependencies are
    /// fine; both `target` and each of `deps` must already be known.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownDependency`] if `target` or any
    /// dependency has not been added via [`Makefile::add_target`].
    pub fn add_deps(&mut self, target: &str, deps: &[String]) -> Result<(), GraphError> {
        if !self.targets.contains(target) {
            return Err(GraphError::UnknownDependency {
                name: target.to_string(),
            });
        }
        for dep in deps {
            if !self.targets.contains(dep) {
                return Err(GraphError::UnknownDependency { name: dep.clone() });
            }
        }
        self.deps
            .get_mut(target)
            .expect("checked above")
            .extend(deps.iter().cloned());
        Ok(())
    }

    /// Append a recipe line (already shell/make-quoted) for `target`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownDependency`] if `target` is unknown, or
    /// [`GraphError::InvalidEnvValue`] if `command` contains a newline.
    pub fn add_command(&mut self, target: &str, command: impl Into<String>) -> Result<(), GraphError> {
        if !self.targets.contains(target) {
            return Err(GraphError::UnknownDependency {
                name: target.to_string(),
            });
        }
        let command = command.into();
        if command.contains('\n') {
            return Err(GraphError::InvalidEnvValue {
                key: format!("newline in command for makefile: {command}"),
            });
        }
        self.commands.get_mut(target).expect("checked above").push(command);
        Ok(())
    }

    /// Render the complete makefile text.
    ///
    /// Validates the dependency graph is acyclic first (a circular
    /// dependency is a fatal [`GraphError`], never silently emitted).
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CircularDependency`] if the dependency map
    /// contains a cycle.
    pub fn makefile_text(&self) -> Result<String, GraphError> {
        let deps_as_vecs: BTreeMap<String, Vec<String>> = self
            .deps
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
            .collect();
        tsort(&deps_as_vecs)?;

        let mut targets_sorted: Vec<&String> =
            self.targets.iter().filter(|t| **t != self.first_target).collect();
        targets_sorted.sort();
        let mut ordered = vec![&self.first_target];
        ordered.extend(targets_sorted);

        let mut chunks = Vec::with_capacity(ordered.len() + 1);
        for target in &ordered {
            let dep_text = self.deps[*target].iter().cloned().collect::<Vec<_>>().join(" ");
            let header = if dep_text.is_empty() {
                format!("{target}:")
            } else {
                format!("{target}: {dep_text}")
            };
            let mut lines = vec![header];
            lines.extend(self.commands[*target].iter().map(|c| format!("\t@{c}")));
            chunks.push(lines.join("\n") + "\n");
        }
        let phony_list = ordered.iter().map(|t| (*t).clone()).collect::<Vec<_>>().join(" ");
        chunks.push(format!(".PHONY: {phony_list}"));
        Ok(chunks.join("\n") + "\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_doubles_dollar_signs() {
        let cmd = vec!["echo".to_string(), "$HOME".to_string()];
        assert_eq!(command_to_make(&cmd).unwrap(), "echo '$$HOME'");
    }

    #[test]
    fn simple_word_unquoted() {
        let cmd = vec!["make".to_string(), "-j1".to_string(), "install".to_string()];
        assert_eq!(command_to_make(&cmd).unwrap(), "make -j1 install");
    }

    #[test]
    fn makefile_first_target_comes_first_and_is_phony() {
        let mut mf = Makefile::new("all");
        mf.add_target("end/x").unwrap();
        mf.add_deps("all", &["end/x".to_string()]).unwrap();
        mf.add_command("end/x", "true").unwrap();
        let text = mf.makefile_text().unwrap();
        let all_pos = text.find("all:").unwrap();
        let x_pos = text.find("end/x:").unwrap();
        assert!(all_pos < x_pos);
        assert!(text.contains(".PHONY: all end/x"));
    }

    #[test]
    fn detects_cycle_as_error() {
        let mut mf = Makefile::new("all");
        mf.add_target("a").unwrap();
        mf.add_target("b").unwrap();
        mf.add_deps("a", &["b".to_string()]).unwrap();
        mf.add_deps("b", &["a".to_string()]).unwrap();
        assert!(mf.makefile_text().is_err());
    }
}
