use std::path::{Component, Path, PathBuf};

/// Resolves a name announced by the peer inside `root`.
///
/// Returns `None` when the name is empty, absolute, or climbs out of `root`
/// through `..`. Such names must never be written; the receiver discards the data.
pub fn resolve_in_sandbox(root: &Path, name: &str) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (depth > 0).then_some(resolved)
}

/// Last path component of an entry, ignoring a trailing slash.
pub(crate) fn base_name(entry: &str) -> &str {
    let trimmed = entry.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

pub(crate) fn join_relative(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::{base_name, resolve_in_sandbox};
    use std::path::Path;

    #[test]
    fn test_resolve_plain_names() {
        let root = Path::new("/sandbox");
        assert_eq!(
            resolve_in_sandbox(root, "out/result.txt").unwrap(),
            Path::new("/sandbox/out/result.txt")
        );
        assert_eq!(
            resolve_in_sandbox(root, "./a").unwrap(),
            Path::new("/sandbox/a")
        );
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let root = Path::new("/sandbox");
        assert!(resolve_in_sandbox(root, "../etc/passwd").is_none());
        assert!(resolve_in_sandbox(root, "a/../../b").is_none());
        assert!(resolve_in_sandbox(root, "/etc/passwd").is_none());
        assert!(resolve_in_sandbox(root, "").is_none());
        assert!(resolve_in_sandbox(root, ".").is_none());
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("dir/sub/"), "sub");
        assert_eq!(base_name("file"), "file");
        assert_eq!(base_name("/abs/file.txt"), "file.txt");
    }
}
