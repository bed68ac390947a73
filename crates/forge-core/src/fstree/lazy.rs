//! The lazy tree layer: recipes that describe how to build a tree without
//! requiring the install trees they reference to exist yet.
//!
//! A [`Lazy`] recipe is resolved against a lookup of already-materialized
//! install trees (keyed by `(host, name)`) to produce a [`Materialized`]
//! tree. Recipes are plain data; nothing here touches the filesystem until
//! `export` is called on the result.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::rc::Rc;

use forge_schema::{InstallKey, TreeError};

use super::Materialized;

/// A deferred recipe for building a tree, possibly depending on install
/// trees that have not been built yet.
///
/// Each variant tracks (via [`Lazy::install_trees`]) the set of
/// `(host, name)` install trees it ultimately reads from, so a
/// [`crate::buildtask::BuildTask`] can declare the right dependency edges
/// before the recipe is ever resolved.
#[derive(Debug, Clone)]
pub enum Lazy {
    /// Copy a path from disk, exactly like [`Materialized::Copy`].
    Copy { path: PathBuf },
    /// An empty directory.
    Empty,
    /// A symbolic link.
    Symlink { target: String },
    /// Place another recipe's entire result at `dest` (ground truth:
    /// `FSTreeMove(other, subdir)` in `original_source/sourcery/fstree.py`).
    Move { inner: Rc<Lazy>, dest: String },
    /// Remove the given paths from another recipe's result.
    Remove { inner: Rc<Lazy>, paths: Vec<String> },
    /// Keep only the given paths from another recipe's result.
    Extract { inner: Rc<Lazy>, paths: Vec<String> },
    /// Extract a single literal path from another recipe's result.
    ExtractOne { inner: Rc<Lazy>, path: String },
    /// Union two recipes.
    Union {
        first: Rc<Lazy>,
        second: Rc<Lazy>,
        allow_duplicate_files: bool,
    },
    /// Reference to an install tree that must be resolved by the caller.
    InstallTree { key: InstallKey },
}

impl Lazy {
    /// Build a [`Lazy::Copy`] recipe.
    #[must_use]
    pub fn copy(path: impl Into<PathBuf>) -> Self {
        Lazy::Copy { path: path.into() }
    }

    /// Build an empty-directory recipe.
    #[must_use]
    pub fn empty() -> Self {
        Lazy::Empty
    }

    /// Build a symlink recipe.
    #[must_use]
    pub fn symlink(target: impl Into<String>) -> Self {
        Lazy::Symlink {
            target: target.into(),
        }
    }

    /// Reference an install tree by key; resolved lazily when `export` is
    /// called.
    #[must_use]
    pub fn install_tree(key: InstallKey) -> Self {
        Lazy::InstallTree { key }
    }

    /// Move `src` within this recipe to `dest` in the result: a composite of
    /// extracting `src` and then placing it whole at `dest`, built from the
    /// real primitives rather than its own recipe case.
    #[must_use]
    pub fn move_to(self: Rc<Self>, src: impl Into<String>, dest: impl Into<String>) -> Self {
        let extracted = Rc::new(Lazy::ExtractOne {
            inner: self,
            path: src.into(),
        });
        Lazy::Move {
            inner: extracted,
            dest: dest.into(),
        }
    }

    /// Place this recipe's entire result at `dest`, with no extraction.
    #[must_use]
    pub fn wrap(self: Rc<Self>, dest: impl Into<String>) -> Self {
        Lazy::Move {
            inner: self,
            dest: dest.into(),
        }
    }

    /// Remove the given paths.
    #[must_use]
    pub fn remove(self: Rc<Self>, paths: Vec<String>) -> Self {
        Lazy::Remove { inner: self, paths }
    }

    /// Keep only the given paths.
    #[must_use]
    pub fn extract(self: Rc<Self>, paths: Vec<String>) -> Self {
        Lazy::Extract { inner: self, paths }
    }

    /// Extract a single literal path, moved to top level.
    #[must_use]
    pub fn extract_one(self: Rc<Self>, path: impl Into<String>) -> Self {
        Lazy::ExtractOne {
            inner: self,
            path: path.into(),
        }
    }

    /// Union this recipe with `other`.
    #[must_use]
    pub fn union(self: Rc<Self>, other: Rc<Lazy>, allow_duplicate_files: bool) -> Self {
        Lazy::Union {
            first: self,
            second: other,
            allow_duplicate_files,
        }
    }

    /// The set of install trees this recipe (transitively) depends on.
    #[must_use]
    pub fn install_trees(&self) -> BTreeSet<InstallKey> {
        match self {
            Lazy::Copy { .. } | Lazy::Empty | Lazy::Symlink { .. } => BTreeSet::new(),
            Lazy::Move { inner, .. }
            | Lazy::Remove { inner, .. }
            | Lazy::Extract { inner, .. }
            | Lazy::ExtractOne { inner, .. } => inner.install_trees(),
            Lazy::Union { first, second, .. } => {
                let mut trees = first.install_trees();
                trees.extend(second.install_trees());
                trees
            }
            Lazy::InstallTree { key } => BTreeSet::from([key.clone()]),
        }
    }

    /// Resolve this recipe into a materialized tree, looking up any
    /// referenced install trees via `lookup`.
    ///
    /// # Errors
    ///
    /// Propagates whatever [`TreeError`] the underlying materialized
    /// operation raises, and fails with
    /// [`TreeError::InvalidPath`] if `lookup` cannot find a referenced
    /// install tree (callers are expected to have resolved every key
    /// returned by [`Lazy::install_trees`] beforehand).
    pub fn resolve(
        &self,
        lookup: &dyn Fn(&InstallKey) -> Option<Materialized>,
    ) -> Result<Materialized, TreeError> {
        match self {
            Lazy::Copy { path } => Materialized::copy(path),
            Lazy::Empty => Materialized::map(std::collections::BTreeMap::new()),
            Lazy::Symlink { target } => Materialized::symlink(target.clone()),
            Lazy::InstallTree { key } => lookup(key).ok_or_else(|| TreeError::InvalidPath {
                path: format!("{}/{}", key.0.name(), key.1),
            }),
            Lazy::Move { inner, dest } => {
                let resolved = inner.resolve(lookup)?;
                let empty = Materialized::map(std::collections::BTreeMap::new())?;
                place_at(&empty, dest, resolved)
            }
            Lazy::Remove { inner, paths } => inner.resolve(lookup)?.remove(paths),
            Lazy::Extract { inner, paths } => inner.resolve(lookup)?.extract(paths),
            Lazy::ExtractOne { inner, path } => inner.resolve(lookup)?.extract_one(path),
            Lazy::Union {
                first,
                second,
                allow_duplicate_files,
            } => {
                let a = first.resolve(lookup)?;
                let b = second.resolve(lookup)?;
                a.union(&b, "", *allow_duplicate_files)
            }
        }
    }
}

/// Place `node` at dotted-path `dest` within an otherwise-empty tree, by
/// building a chain of synthetic directories down to it.
fn place_at(base: &Materialized, dest: &str, node: Materialized) -> Result<Materialized, TreeError> {
    let mut components: Vec<&str> = dest.split('/').collect();
    let leaf = components.pop().expect("split always yields at least one element");
    let mut built = node;
    for component in components.into_iter().rev() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(component.to_string(), Rc::new(built));
        built = Materialized::map(map)?;
    }
    let mut map = std::collections::BTreeMap::new();
    map.insert(leaf.to_string(), Rc::new(built));
    let wrapped = Materialized::map(map)?;
    base.union(&wrapped, "", false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn copy_recipe_resolves_with_no_install_tree_deps() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"x").unwrap();
        let recipe = Lazy::copy(dir.path().join("f"));
        assert!(recipe.install_trees().is_empty());
        let resolved = recipe.resolve(&|_| None).unwrap();
        assert!(!resolved.is_dir());
    }

    #[test]
    fn install_tree_recipe_tracks_its_key() {
        let key: InstallKey = (
            forge_schema::InstallHost::Pkg(forge_schema::PkgHost::new("host")),
            "foo".to_string(),
        );
        let recipe = Lazy::install_tree(key.clone());
        let trees = recipe.install_trees();
        assert_eq!(trees.len(), 1);
        assert!(trees.contains(&key));
    }

    #[test]
    fn union_collects_install_trees_from_both_sides() {
        let key_a: InstallKey = (
            forge_schema::InstallHost::Pkg(forge_schema::PkgHost::new("a")),
            "x".to_string(),
        );
        let key_b: InstallKey = (
            forge_schema::InstallHost::Pkg(forge_schema::PkgHost::new("b")),
            "y".to_string(),
        );
        let recipe = Rc::new(Lazy::install_tree(key_a.clone()))
            .union(Rc::new(Lazy::install_tree(key_b.clone())), false);
        let trees = recipe.install_trees();
        assert_eq!(trees.len(), 2);
        assert!(trees.contains(&key_a));
        assert!(trees.contains(&key_b));
    }

    #[test]
    fn resolve_fails_when_install_tree_unresolved() {
        let key: InstallKey = (
            forge_schema::InstallHost::Pkg(forge_schema::PkgHost::new("host")),
            "foo".to_string(),
        );
        let recipe = Lazy::install_tree(key);
        assert!(recipe.resolve(&|_| None).is_err());
    }

    #[test]
    fn move_places_extracted_node_at_new_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/inner"), b"1").unwrap();
        let recipe = Rc::new(Lazy::copy(dir.path())).move_to("sub/inner", "new/place");
        let resolved = recipe.resolve(&|_| None).unwrap();
        let out = dir.path().parent().unwrap().join("moved-out");
        let _ = fs::remove_dir_all(&out);
        resolved.export(&out).unwrap();
        assert!(out.join("new/place").exists());
    }
}
