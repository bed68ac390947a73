//! The materialized tree layer: nodes backed by real paths on disk, plus
//! synthetic directories and symlinks built up from them.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use forge_schema::TreeError;
use glob::Pattern;

use super::invalid_path;

/// The byte/mode contents of a leaf node, used only to compare two leaves
/// when unioning with `allow_duplicate_files`.
#[derive(Debug, PartialEq, Eq)]
enum Contents {
    File { bytes: Vec<u8>, mode: u32 },
    Symlink(String),
}

/// A node in the materialized filesystem-tree algebra.
///
/// Three shapes: a [`Materialized::Copy`] of an existing path, a synthetic
/// [`Materialized::Map`] directory built from named children, or a
/// [`Materialized::Symlink`]. Map children are held behind `Rc` so that
/// `expand`'s shallow copy (mirrored from the original's dict-copy
/// semantics) is cheap rather than a deep clone.
#[derive(Debug, Clone)]
pub enum Materialized {
    /// A filesystem object copied verbatim from `path` at the time this
    /// node was constructed.
    Copy {
        /// Absolute path to copy from.
        path: PathBuf,
        /// Whether `path` was a directory (vs. regular file or symlink).
        is_dir: bool,
    },
    /// A synthetic directory: a name-to-node map.
    Map(BTreeMap<String, Rc<Materialized>>),
    /// A symbolic link with the given target string.
    Symlink(String),
}

impl Materialized {
    /// Construct a node by copying from a path on disk.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::Io`] if `path` cannot be stat'd, or a bespoke
    /// I/O error if `path` is neither a regular file, directory, nor
    /// symlink.
    pub fn copy(path: impl AsRef<Path>) -> Result<Self, TreeError> {
        let path = fs::canonicalize(path.as_ref()).or_else(|_| {
            std::env::current_dir().map(|cwd| cwd.join(path.as_ref()))
        })?;
        let meta = fs::symlink_metadata(&path)?;
        let file_type = meta.file_type();
        if !file_type.is_dir() && !file_type.is_file() && !file_type.is_symlink() {
            return Err(TreeError::Io(std::io::Error::other(format!(
                "bad file type for {}",
                path.display()
            ))));
        }
        Ok(Materialized::Copy {
            is_dir: file_type.is_dir(),
            path,
        })
    }

    /// Construct a synthetic directory node.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidPath`] if any key is empty, `.`, `..`,
    /// or contains `/`.
    pub fn map(entries: BTreeMap<String, Rc<Materialized>>) -> Result<Self, TreeError> {
        for key in entries.keys() {
            if key.is_empty() || key == "." || key == ".." || key.contains('/') {
                return Err(TreeError::InvalidPath { path: key.clone() });
            }
        }
        Ok(Materialized::Map(entries))
    }

    /// Construct a symlink node.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidPath`] if `target` is empty.
    pub fn symlink(target: impl Into<String>) -> Result<Self, TreeError> {
        let target = target.into();
        if target.is_empty() {
            return Err(TreeError::InvalidPath { path: target });
        }
        Ok(Materialized::Symlink(target))
    }

    /// Whether this node is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        match self {
            Materialized::Copy { is_dir, .. } => *is_dir,
            Materialized::Map(_) => true,
            Materialized::Symlink(_) => false,
        }
    }

    /// Write this tree to `path`, which must not already exist (its parent
    /// must).
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::Io`] if `path` already exists or the underlying
    /// filesystem operation fails.
    pub fn export(&self, path: impl AsRef<Path>) -> Result<(), TreeError> {
        let path = path.as_ref();
        if fs::symlink_metadata(path).is_ok() {
            return Err(TreeError::Io(std::io::Error::other(format!(
                "path {} already exists",
                path.display()
            ))));
        }
        self.export_impl(path)
    }

    fn export_impl(&self, path: &Path) -> Result<(), TreeError> {
        match self {
            Materialized::Copy { path: src, is_dir } => {
                if *is_dir {
                    copy_tree(src, path)?;
                } else {
                    copy_leaf(src, path)?;
                }
            }
            Materialized::Map(entries) => {
                fs::create_dir(path)?;
                for (name, child) in entries {
                    child.export_impl(&path.join(name))?;
                }
            }
            Materialized::Symlink(target) => {
                std::os::unix::fs::symlink(target, path)?;
            }
        }
        Ok(())
    }

    /// Return an expanded (one level deep) version of a directory node: a
    /// [`Materialized::Map`] whose entries are `Copy` nodes for a `Copy`
    /// directory, or a shallow clone of self for an existing `Map`.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::Io`] if listing a `Copy` directory fails. Never
    /// called on a non-directory by well-behaved callers in this module.
    fn expand(&self, copy: bool) -> Result<Materialized, TreeError> {
        match self {
            Materialized::Copy { path, is_dir: true } => {
                let mut entries = BTreeMap::new();
                for dirent in fs::read_dir(path)? {
                    let dirent = dirent?;
                    let name = dirent.file_name().to_string_lossy().into_owned();
                    entries.insert(name, Rc::new(Materialized::copy(dirent.path())?));
                }
                Ok(Materialized::Map(entries))
            }
            Materialized::Map(entries) => {
                if copy {
                    Ok(Materialized::Map(entries.clone()))
                } else {
                    Ok(self.clone())
                }
            }
            _ => unreachable!("expand called on a non-directory"),
        }
    }

    fn contents(&self) -> Result<Contents, TreeError> {
        match self {
            Materialized::Copy { path, is_dir: false } => {
                let meta = fs::symlink_metadata(path)?;
                if meta.file_type().is_symlink() {
                    let target = fs::read_link(path)?;
                    Ok(Contents::Symlink(target.to_string_lossy().into_owned()))
                } else {
                    let bytes = fs::read(path)?;
                    Ok(Contents::File {
                        bytes,
                        mode: meta.permissions().mode(),
                    })
                }
            }
            Materialized::Symlink(target) => Ok(Contents::Symlink(target.clone())),
            _ => unreachable!("contents called on a directory"),
        }
    }

    /// Union this tree with `other`. Both must be directories unless
    /// `allow_duplicate_files` permits an identical leaf-vs-leaf match;
    /// `path` names the current position, for diagnostics.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::NonDirectoryInUnion`] if a non-directory is
    /// unioned where a directory match is required, or
    /// [`TreeError::InconsistentUnion`] if two leaves permitted to
    /// coexist have different contents.
    pub fn union(
        &self,
        other: &Materialized,
        path: &str,
        allow_duplicate_files: bool,
    ) -> Result<Materialized, TreeError> {
        if !self.is_dir() || !other.is_dir() {
            if allow_duplicate_files && !self.is_dir() && !other.is_dir() {
                return if self.contents()? == other.contents()? {
                    Ok(self.clone())
                } else {
                    Err(TreeError::InconsistentUnion {
                        path: path.to_string(),
                    })
                };
            }
            return Err(TreeError::NonDirectoryInUnion {
                path: path.to_string(),
            });
        }
        let mut ret = match self.expand(true)? {
            Materialized::Map(m) => m,
            _ => unreachable!(),
        };
        let other_expanded = match other.expand(false)? {
            Materialized::Map(m) => m,
            _ => unreachable!(),
        };
        for (name, node) in other_expanded {
            match ret.remove(&name) {
                Some(existing) => {
                    let sub_name = if path.is_empty() {
                        name.clone()
                    } else {
                        format!("{path}/{name}")
                    };
                    let merged =
                        existing.union(&node, &sub_name, allow_duplicate_files)?;
                    ret.insert(name, Rc::new(merged));
                }
                None => {
                    ret.insert(name, node);
                }
            }
        }
        Ok(Materialized::Map(ret))
    }

    /// Return a tree like this one with the given paths removed.
    ///
    /// A component of exactly `**` expands to both "zero levels" and "one
    /// level and re-expand `**`", matching the spec's documented (if
    /// surprising) behavior.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidPath`] if any path is malformed.
    pub fn remove(&self, paths: &[String]) -> Result<Materialized, TreeError> {
        for path in paths {
            if invalid_path(path) {
                return Err(TreeError::InvalidPath { path: path.clone() });
            }
        }
        if !self.is_dir() {
            return Ok(self.clone());
        }
        let mut ret = match self.expand(true)? {
            Materialized::Map(m) => m,
            _ => unreachable!(),
        };
        let paths_exp = expand_double_star(paths);
        let mut sub_paths: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for path in &paths_exp {
            if let Some((p_dir, p_rest)) = path.split_once('/') {
                let pattern = Pattern::new(p_dir)
                    .map_err(|_| TreeError::InvalidPath { path: path.clone() })?;
                for name in ret.keys().filter(|n| pattern.matches(n)).cloned().collect::<Vec<_>>() {
                    sub_paths.entry(name).or_default().push(p_rest.to_string());
                }
            } else {
                let pattern = Pattern::new(path)
                    .map_err(|_| TreeError::InvalidPath { path: path.clone() })?;
                let matched: Vec<String> =
                    ret.keys().filter(|n| pattern.matches(n)).cloned().collect();
                for name in matched {
                    ret.remove(&name);
                }
            }
        }
        for (subdir, rest_paths) in sub_paths {
            let Some(node) = ret.get(&subdir) else { continue };
            if !node.is_dir() {
                continue;
            }
            let expanded = match node.expand(false)? {
                Materialized::Map(m) => m,
                _ => unreachable!(),
            };
            if expanded.is_empty() {
                continue;
            }
            let mut sorted_paths = rest_paths;
            sorted_paths.sort();
            let removed = Materialized::Map(expanded).remove(&sorted_paths)?;
            match &removed {
                Materialized::Map(m) if m.is_empty() => {
                    ret.remove(&subdir);
                }
                _ => {
                    ret.insert(subdir, Rc::new(removed));
                }
            }
        }
        Ok(Materialized::Map(ret))
    }

    /// Return a tree like this one keeping only the given paths.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::ExtractFromNonDirectory`] if called on a
    /// non-directory, or [`TreeError::InvalidPath`] if any path is
    /// malformed.
    pub fn extract(&self, paths: &[String]) -> Result<Materialized, TreeError> {
        if !self.is_dir() {
            return Err(TreeError::ExtractFromNonDirectory {
                path: String::new(),
            });
        }
        for path in paths {
            if invalid_path(path) {
                return Err(TreeError::InvalidPath { path: path.clone() });
            }
        }
        let ret = match self.expand(true)? {
            Materialized::Map(m) => m,
            _ => unreachable!(),
        };
        let mut keep_sub: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        let mut sub_paths: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for path in paths {
            if let Some((p_dir, p_rest)) = path.split_once('/') {
                let pattern = Pattern::new(p_dir)
                    .map_err(|_| TreeError::InvalidPath { path: path.clone() })?;
                for name in ret.keys().filter(|n| pattern.matches(n)).cloned().collect::<Vec<_>>() {
                    sub_paths.entry(name).or_default().push(p_rest.to_string());
                }
            } else {
                let pattern = Pattern::new(path)
                    .map_err(|_| TreeError::InvalidPath { path: path.clone() })?;
                keep_sub.extend(ret.keys().filter(|n| pattern.matches(n)).cloned());
            }
        }
        let mut out = BTreeMap::new();
        for (name, node) in ret {
            if keep_sub.contains(&name) {
                out.insert(name, node);
            } else if let Some(rest_paths) = sub_paths.get(&name) {
                if node.is_dir() {
                    let mut sorted_paths = rest_paths.clone();
                    sorted_paths.sort();
                    let extracted = node.extract(&sorted_paths)?;
                    if let Materialized::Map(m) = &extracted {
                        if !m.is_empty() {
                            out.insert(name, Rc::new(extracted));
                        }
                    }
                }
            }
        }
        Ok(Materialized::Map(out))
    }

    /// Return the node found by following `path` literally (no globs),
    /// moved to top level.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::ExtractFromNonDirectory`] or
    /// [`TreeError::InvalidPath`].
    pub fn extract_one(&self, path: &str) -> Result<Materialized, TreeError> {
        if !self.is_dir() {
            return Err(TreeError::ExtractFromNonDirectory {
                path: path.to_string(),
            });
        }
        if invalid_path(path) {
            return Err(TreeError::InvalidPath {
                path: path.to_string(),
            });
        }
        let expanded = match self.expand(false)? {
            Materialized::Map(m) => m,
            _ => unreachable!(),
        };
        if let Some((p_dir, p_rest)) = path.split_once('/') {
            let node = expanded
                .get(p_dir)
                .ok_or_else(|| TreeError::InvalidPath {
                    path: path.to_string(),
                })?;
            node.extract_one(p_rest)
        } else {
            expanded
                .get(path)
                .map(|rc| (**rc).clone())
                .ok_or_else(|| TreeError::InvalidPath {
                    path: path.to_string(),
                })
        }
    }
}

/// Expand `**`-led path components: a leading `**/x` is equivalent to
/// trying both `x` (zero levels consumed) and `*/**/x` (recurse one level
/// and re-expand `**` again), matching the original's documented behavior.
fn expand_double_star(paths: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        if let Some(stripped) = path.strip_prefix("**/") {
            let mut rest = stripped;
            while let Some(s) = rest.strip_prefix("**/") {
                rest = s;
            }
            out.push(rest.to_string());
            out.push(format!("*/**/{rest}"));
        } else {
            out.push(path.clone());
        }
    }
    out
}

fn copy_leaf(src: &Path, dst: &Path) -> Result<(), TreeError> {
    let meta = fs::symlink_metadata(src)?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(src)?;
        std::os::unix::fs::symlink(target, dst)?;
    } else {
        fs::copy(src, dst)?;
        fs::set_permissions(dst, meta.permissions())?;
    }
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), TreeError> {
    let meta = fs::symlink_metadata(src)?;
    fs::create_dir(dst)?;
    fs::set_permissions(dst, meta.permissions())?;
    for dirent in fs::read_dir(src)? {
        let dirent = dirent?;
        let child_src = dirent.path();
        let child_dst = dst.join(dirent.file_name());
        let child_meta = fs::symlink_metadata(&child_src)?;
        if child_meta.file_type().is_dir() {
            copy_tree(&child_src, &child_dst)?;
        } else {
            copy_leaf(&child_src, &child_dst)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;

    fn write_file(path: &Path, contents: &str) {
        let mut f = File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn copy_file_export_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        write_file(&src, "hello\n");
        let node = Materialized::copy(&src).unwrap();
        assert!(!node.is_dir());
        let dst = dir.path().join("out.txt");
        node.export(&dst).unwrap();
        assert_eq!(fs::read_to_string(&dst).unwrap(), "hello\n");
    }

    #[test]
    fn union_merges_disjoint_directories() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::create_dir(&a).unwrap();
        fs::create_dir(&b).unwrap();
        write_file(&a.join("x"), "x\n");
        write_file(&b.join("y"), "y\n");
        let ta = Materialized::copy(&a).unwrap();
        let tb = Materialized::copy(&b).unwrap();
        let merged = ta.union(&tb, "", false).unwrap();
        let out = dir.path().join("merged");
        merged.export(&out).unwrap();
        assert_eq!(fs::read_to_string(out.join("x")).unwrap(), "x\n");
        assert_eq!(fs::read_to_string(out.join("y")).unwrap(), "y\n");
    }

    #[test]
    fn union_rejects_conflicting_files_without_allow_dup() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::create_dir(&a).unwrap();
        fs::create_dir(&b).unwrap();
        write_file(&a.join("x"), "one\n");
        write_file(&b.join("x"), "two\n");
        let ta = Materialized::copy(&a).unwrap();
        let tb = Materialized::copy(&b).unwrap();
        assert!(ta.union(&tb, "", false).is_err());
    }

    #[test]
    fn union_allow_dup_requires_identical_contents() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::create_dir(&a).unwrap();
        fs::create_dir(&b).unwrap();
        write_file(&a.join("x"), "same\n");
        write_file(&b.join("x"), "same\n");
        let ta = Materialized::copy(&a).unwrap();
        let tb = Materialized::copy(&b).unwrap();
        let merged = ta.union(&tb, "", true).unwrap();
        let out = dir.path().join("merged");
        merged.export(&out).unwrap();
        assert_eq!(fs::read_to_string(out.join("x")).unwrap(), "same\n");
    }

    #[test]
    fn remove_deletes_matching_and_prunes_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(root.join("sub")).unwrap();
        write_file(&root.join("sub/bar"), "x\n");
        write_file(&root.join("keep"), "x\n");
        let tree = Materialized::copy(&root).unwrap();
        let removed = tree.remove(&["**/bar".to_string()]).unwrap();
        let out = dir.path().join("out");
        removed.export(&out).unwrap();
        assert!(!out.join("sub").exists());
        assert!(out.join("keep").exists());
    }

    #[test]
    fn extract_keeps_only_matching_paths() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(&root).unwrap();
        write_file(&root.join("a"), "1\n");
        write_file(&root.join("b"), "2\n");
        let tree = Materialized::copy(&root).unwrap();
        let extracted = tree.extract(&["a".to_string()]).unwrap();
        let out = dir.path().join("out");
        extracted.export(&out).unwrap();
        assert!(out.join("a").exists());
        assert!(!out.join("b").exists());
    }

    #[test]
    fn extract_one_moves_node_to_top_level() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(root.join("sub")).unwrap();
        write_file(&root.join("sub/inner"), "1\n");
        let tree = Materialized::copy(&root).unwrap();
        let extracted = tree.extract_one("sub/inner").unwrap();
        assert!(!extracted.is_dir());
        let out = dir.path().join("out");
        extracted.export(&out).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), "1\n");
    }

    #[test]
    fn remove_rejects_invalid_path() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Materialized::map(BTreeMap::new()).unwrap();
        let _ = dir;
        assert!(tree.remove(&["..".to_string()]).is_err());
    }
}
