//! Topological sort over a dependency map.
//!
//! Spec.md calls this "assumed available", but nothing upstream of this
//! crate provides it, so it is implemented here: both [`crate::buildtask`]'s
//! dependency-DAG lowering and [`crate::package::replace_symlinks`]'s
//! bottom-up symlink ordering rely on it.

use std::collections::{BTreeMap, BTreeSet};

use forge_schema::GraphError;

fn tsort_rec(
    deps: &BTreeMap<String, Vec<String>>,
    cur_list: &[String],
    deps_list: &mut Vec<String>,
    seen: &mut BTreeSet<String>,
    tseen: &mut BTreeSet<String>,
) -> Result<(), GraphError> {
    for name in cur_list {
        if seen.contains(name) {
            continue;
        }
        if tseen.contains(name) {
            return Err(GraphError::CircularDependency { name: name.clone() });
        }
        tseen.insert(name.clone());
        let mut sub = deps.get(name).cloned().unwrap_or_default();
        sub.sort();
        tsort_rec(deps, &sub, deps_list, seen, tseen)?;
        deps_list.push(name.clone());
        seen.insert(name.clone());
        tseen.remove(name);
    }
    Ok(())
}

/// Topologically sort `deps`, a mapping from each entity to the entities it
/// depends on. The result lists every key of `deps`, each entity appearing
/// after all of its dependencies.
///
/// # Errors
///
/// Returns [`GraphError::CircularDependency`] naming the first node found on
/// a cycle.
pub fn tsort(deps: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>, GraphError> {
    let mut deps_list = Vec::with_capacity(deps.len());
    let mut seen = BTreeSet::new();
    let mut tseen = BTreeSet::new();
    let cur_list: Vec<String> = deps.keys().cloned().collect();
    tsort_rec(deps, &cur_list, &mut deps_list, &mut seen, &mut tseen)?;
    Ok(deps_list)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.iter().map(|s| (*s).to_string()).collect()))
            .collect()
    }

    #[test]
    fn linear_chain() {
        let deps = map(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]);
        let order = tsort(&deps).unwrap();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn detects_cycle() {
        let deps = map(&[("a", &["b"]), ("b", &["a"])]);
        assert!(tsort(&deps).is_err());
    }

    #[test]
    fn dep_not_itself_a_key_still_appears_before_dependent() {
        let deps = map(&[("a", &["b"])]);
        let order = tsort(&deps).unwrap();
        assert_eq!(order, vec!["b", "a"]);
    }
}
