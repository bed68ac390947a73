//! Packaging pipeline: canonicalizing permissions, deduplicating identical
//! files via hard links, eliminating symbolic links for hosts that cannot
//! carry them, and building the final tar invocation.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use forge_schema::TreeError;
use sha2::{Digest, Sha256};

use crate::tsort::tsort;

const NOEX_PERM: u32 = 0o644;
const EX_PERM: u32 = 0o755;

/// Change permissions under `path` to a canonical form for packaging.
///
/// Directories become mode `0o755`. Files become `0o755` or `0o644`
/// according to whether they were already user-executable. Symbolic link
/// permissions are left untouched.
///
/// # Errors
///
/// Returns [`TreeError::Io`] if a directory listing or `chmod` fails.
pub fn fix_perms(path: &Path) -> Result<(), TreeError> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(EX_PERM))?;
    for dirent in fs::read_dir(path)? {
        let dirent = dirent?;
        let file_type = dirent.file_type()?;
        if file_type.is_dir() {
            fix_perms(&dirent.path())?;
        } else if file_type.is_file() {
            let mode = dirent.metadata()?.permissions().mode();
            let new_mode = if mode & 0o100 != 0 { EX_PERM } else { NOEX_PERM };
            fs::set_permissions(dirent.path(), std::fs::Permissions::from_mode(new_mode))?;
        }
    }
    Ok(())
}

/// Convert files with identical contents and permissions under `path` into
/// hard links of each other, to save space in the final package.
///
/// It is expected, but not required, that permissions have previously been
/// canonicalized by [`fix_perms`]. Directories containing files to be
/// linked must be writable.
///
/// # Errors
///
/// Returns [`TreeError::HashCollision`] if two files with the same hash and
/// mode have different contents (a SHA-256 collision, or more likely a
/// packaging bug), or [`TreeError::Io`] if reading/linking fails.
pub fn hard_link_files(path: &Path) -> Result<(), TreeError> {
    let mut file_hashes: BTreeMap<([u8; 32], u32), Vec<PathBuf>> = BTreeMap::new();
    for entry in walkdir::WalkDir::new(path) {
        let entry = entry.map_err(|e| TreeError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let full = entry.path();
        let meta = fs::symlink_metadata(full)?;
        if !meta.file_type().is_file() {
            continue;
        }
        let mode = meta.permissions().mode();
        let contents = fs::read(full)?;
        let digest: [u8; 32] = Sha256::digest(&contents).into();
        file_hashes
            .entry((digest, mode))
            .or_default()
            .push(full.to_path_buf());
    }
    let mut groups: Vec<Vec<PathBuf>> = file_hashes.into_values().collect();
    groups.sort();
    for mut files in groups.drain(..) {
        if files.len() <= 1 {
            continue;
        }
        files.sort();
        let first = files[0].clone();
        let first_contents = fs::read(&first)?;
        for name in &files[1..] {
            let contents = fs::read(name)?;
            if contents != first_contents {
                return Err(TreeError::HashCollision {
                    first: first.display().to_string(),
                    second: name.display().to_string(),
                });
            }
            fs::remove_file(name)?;
            fs::hard_link(&first, name)?;
        }
    }
    Ok(())
}

/// Resolve a symbolic link at `top_path/sub_path/link_name` into the
/// relative path (as path components under `top_path`) it ultimately
/// points to, following any chain of symlinks encountered along the way.
///
/// `require_dir` demands the final destination be a directory; dangling,
/// absolute, or cyclic symlinks are rejected, as is any resolution that
/// would leave `top_path`.
///
/// # Errors
///
/// Returns [`TreeError::SymlinkCycle`], [`TreeError::AbsoluteSymlink`],
/// [`TreeError::SymlinkOutsideRoot`], [`TreeError::NotADirectory`], or
/// [`TreeError::Io`].
#[allow(clippy::too_many_lines)]
pub fn resolve_symlinks(
    top_path: &Path,
    sub_path: &[String],
    link_name: &str,
    mut require_dir: bool,
    being_resolved: &mut BTreeSet<Vec<String>>,
) -> Result<Vec<String>, TreeError> {
    let mut new_path: Vec<String> = sub_path.to_vec();
    new_path.push(link_name.to_string());
    let new_path_full = top_path.join(new_path.join("/"));
    if being_resolved.contains(&new_path) {
        return Err(TreeError::SymlinkCycle {
            path: new_path_full.display().to_string(),
        });
    }
    being_resolved.insert(new_path.clone());

    let link_contents = fs::read_link(&new_path_full)?
        .to_string_lossy()
        .into_owned();
    if link_contents.starts_with('/') {
        return Err(TreeError::AbsoluteSymlink {
            path: new_path_full.display().to_string(),
        });
    }
    if link_contents.ends_with('/') {
        require_dir = true;
    }
    let link_elements: Vec<&str> = link_contents.split('/').filter(|d| !d.is_empty()).collect();

    let mut cur_sub_path = sub_path.to_vec();
    let num_elements = link_elements.len();
    for (pos, elt) in link_elements.iter().enumerate() {
        let this_require_dir = require_dir || pos < num_elements - 1;
        if *elt == "." {
            continue;
        }
        if *elt == ".." {
            if cur_sub_path.is_empty() {
                return Err(TreeError::SymlinkOutsideRoot {
                    root: top_path.display().to_string(),
                    path: new_path_full.display().to_string(),
                });
            }
            cur_sub_path.pop();
            continue;
        }
        let mut elt_path = cur_sub_path.clone();
        elt_path.push((*elt).to_string());
        let elt_path_full = top_path.join(elt_path.join("/"));
        let mode = fs::symlink_metadata(&elt_path_full)?;
        if mode.file_type().is_symlink() {
            cur_sub_path = resolve_symlinks(
                top_path,
                &cur_sub_path,
                elt,
                this_require_dir,
                being_resolved,
            )?;
        } else {
            if this_require_dir && !mode.file_type().is_dir() {
                return Err(TreeError::NotADirectory {
                    path: elt_path_full.display().to_string(),
                });
            }
            cur_sub_path = elt_path;
        }
    }
    being_resolved.remove(&new_path);
    Ok(cur_sub_path)
}

/// Replace every symlink under `top_path` with a copy of what it points
/// to, in an order safe against a symlink pointing into a subtree that
/// itself still contains unresolved symlinks.
///
/// # Errors
///
/// Returns [`TreeError::SymlinkCycle`] if a symlink (directly or
/// indirectly, after following other symlinks) points to a directory
/// containing itself, or any error [`resolve_symlinks`] can raise.
pub fn replace_symlinks(top_path: &Path) -> Result<(), TreeError> {
    let mut symlinks: BTreeMap<Vec<String>, Vec<String>> = BTreeMap::new();
    for entry in walkdir::WalkDir::new(top_path).min_depth(1) {
        let entry = entry.map_err(|e| TreeError::Io(e.into()))?;
        let meta = fs::symlink_metadata(entry.path())?;
        if !meta.file_type().is_symlink() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(top_path)
            .expect("walkdir entries are under top_path");
        let mut sub_path_tuple: Vec<String> = rel
            .to_string_lossy()
            .split('/')
            .map(str::to_string)
            .collect();
        let name = sub_path_tuple.pop().expect("non-empty relative path");
        let target = resolve_symlinks(top_path, &sub_path_tuple, &name, false, &mut BTreeSet::new())?;
        let mut link_tuple = sub_path_tuple;
        link_tuple.push(name);
        symlinks.insert(link_tuple, target);
    }

    let mut symlinks_under: BTreeMap<Vec<String>, BTreeSet<Vec<String>>> = BTreeMap::new();
    for symlink in symlinks.keys() {
        for sublen in 0..=symlink.len() {
            symlinks_under
                .entry(symlink[..sublen].to_vec())
                .or_default()
                .insert(symlink.clone());
        }
    }
    let mut deps: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (symlink, target) in &symlinks {
        let symlink_str = symlink.join("/");
        let mut dep_list = Vec::new();
        if let Some(under) = symlinks_under.get(target) {
            dep_list.extend(under.iter().map(|t| t.join("/")));
        }
        deps.insert(symlink_str, dep_list);
    }

    let sorted = tsort(&deps).map_err(|_| TreeError::SymlinkCycle {
        path: top_path.display().to_string(),
    })?;
    for symlink in sorted {
        let Some(target) = symlinks.get(&symlink.split('/').map(str::to_string).collect::<Vec<_>>()) else {
            continue;
        };
        let target_str = target.join("/");
        let symlink_full = top_path.join(&symlink);
        let target_full = top_path.join(&target_str);
        fs::remove_file(&symlink_full)?;
        let mode = fs::symlink_metadata(&target_full)?;
        if mode.file_type().is_dir() {
            copy_dir_recursive(&target_full, &symlink_full)?;
        } else {
            fs::copy(&target_full, &symlink_full)?;
            fs::set_permissions(&symlink_full, mode.permissions())?;
        }
    }
    Ok(())
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), TreeError> {
    let meta = fs::symlink_metadata(src)?;
    fs::create_dir(dst)?;
    fs::set_permissions(dst, meta.permissions())?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let child_src = entry.path();
        let child_dst = dst.join(entry.file_name());
        let child_meta = fs::symlink_metadata(&child_src)?;
        if child_meta.file_type().is_symlink() {
            let target = fs::read_link(&child_src)?;
            std::os::unix::fs::symlink(target, &child_dst)?;
        } else if child_meta.file_type().is_dir() {
            copy_dir_recursive(&child_src, &child_dst)?;
        } else {
            fs::copy(&child_src, &child_dst)?;
            fs::set_permissions(&child_dst, child_meta.permissions())?;
        }
    }
    Ok(())
}

/// Build the `tar` command line to create a package tarball from the
/// current directory, named `output_name`, with `top_dir_name` as the
/// top-level directory in the archive and `source_date_epoch` used for
/// all timestamps (for reproducibility).
#[must_use]
pub fn tar_command(output_name: &str, top_dir_name: &str, source_date_epoch: i64) -> Vec<String> {
    vec![
        "tar".to_string(),
        "-c".to_string(),
        "-J".to_string(),
        "-f".to_string(),
        output_name.to_string(),
        "--sort=name".to_string(),
        format!("--mtime=@{source_date_epoch}"),
        "--owner=0".to_string(),
        "--group=0".to_string(),
        "--numeric-owner".to_string(),
        format!(r"--transform=s|^\.|{top_dir_name}|rSh"),
        ".".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;

    #[test]
    fn fix_perms_sets_canonical_modes() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        let exec = sub.join("exec");
        File::create(&exec).unwrap().write_all(b"x").unwrap();
        fs::set_permissions(&exec, fs::Permissions::from_mode(0o700)).unwrap();
        let plain = sub.join("plain");
        File::create(&plain).unwrap().write_all(b"x").unwrap();
        fs::set_permissions(&plain, fs::Permissions::from_mode(0o600)).unwrap();

        fix_perms(dir.path()).unwrap();

        assert_eq!(fs::metadata(&exec).unwrap().permissions().mode() & 0o777, EX_PERM);
        assert_eq!(fs::metadata(&plain).unwrap().permissions().mode() & 0o777, NOEX_PERM);
        assert_eq!(fs::metadata(&sub).unwrap().permissions().mode() & 0o777, EX_PERM);
    }

    #[test]
    fn hard_link_files_merges_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        File::create(&a).unwrap().write_all(b"same\n").unwrap();
        File::create(&b).unwrap().write_all(b"same\n").unwrap();
        fs::set_permissions(&a, fs::Permissions::from_mode(0o644)).unwrap();
        fs::set_permissions(&b, fs::Permissions::from_mode(0o644)).unwrap();

        hard_link_files(dir.path()).unwrap();

        let meta_a = fs::metadata(&a).unwrap();
        let meta_b = fs::metadata(&b).unwrap();
        assert_eq!(meta_a.ino(), meta_b.ino());
    }

    #[test]
    fn hard_link_files_leaves_distinct_content_alone() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        File::create(&a).unwrap().write_all(b"one\n").unwrap();
        File::create(&b).unwrap().write_all(b"two\n").unwrap();

        hard_link_files(dir.path()).unwrap();

        let meta_a = fs::metadata(&a).unwrap();
        let meta_b = fs::metadata(&b).unwrap();
        assert_ne!(meta_a.ino(), meta_b.ino());
    }

    #[test]
    fn replace_symlinks_copies_target_and_removes_link() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("real")).unwrap().write_all(b"hi\n").unwrap();
        std::os::unix::fs::symlink("real", dir.path().join("link")).unwrap();

        replace_symlinks(dir.path()).unwrap();

        let link_meta = fs::symlink_metadata(dir.path().join("link")).unwrap();
        assert!(!link_meta.file_type().is_symlink());
        assert_eq!(fs::read_to_string(dir.path().join("link")).unwrap(), "hi\n");
    }

    #[test]
    fn replace_symlinks_rejects_absolute_target() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/etc/passwd", dir.path().join("link")).unwrap();
        assert!(replace_symlinks(dir.path()).is_err());
    }

    #[test]
    fn tar_command_has_expected_shape() {
        let cmd = tar_command("out.tar.xz", "pkg-1.0", 1_700_000_000);
        assert_eq!(cmd[0], "tar");
        assert!(cmd.contains(&"--mtime=@1700000000".to_string()));
        assert!(cmd.iter().any(|a| a.contains("pkg-1.0")));
    }
}
