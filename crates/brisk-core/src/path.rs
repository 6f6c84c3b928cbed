use std::path::{Component, Path};

/// Normalize a relative path to use `/` separators and drop empty / `.` segments.
///
/// The result is stable across platforms, which makes it suitable as a fingerprint key.
pub fn normalize_rel_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for segment in path.split(['/', '\\']) {
        if segment.is_empty() || segment == "." {
            continue;
        }
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(segment);
    }
    out
}

/// Returns `path` relative to `root` as a normalized `/`-separated string.
///
/// Returns `None` when `path` is not located under `root`. The root itself maps to `""`.
pub fn relative_path_string(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => {
                if !out.is_empty() {
                    out.push('/');
                }
                out.push_str(&segment.to_string_lossy());
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

/// The final path segment as an owned string (`""` for roots such as `/`).
pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn normalize_rel_path_collapses_separators() {
        assert_eq!(normalize_rel_path("src\\main//./A.java"), "src/main/A.java");
        assert_eq!(normalize_rel_path(""), "");
    }

    #[test]
    fn relative_path_string_handles_root_and_children() {
        let root = PathBuf::from("/work/project");
        assert_eq!(relative_path_string(&root, &root).as_deref(), Some(""));
        assert_eq!(
            relative_path_string(&root, &root.join("a").join("b.txt")).as_deref(),
            Some("a/b.txt")
        );
        assert_eq!(relative_path_string(&root, Path::new("/elsewhere")), None);
    }
}
