//! Remote path normalization
//!
//! Cache keys and hierarchy invalidation operate on canonical remote paths:
//! always rooted, `/`-separated, no empty, `.` or `..` segments, and no
//! trailing separator except for the root itself.

/// Path separator for remote paths
pub const SEPARATOR: char = '/';

/// The root path
pub const ROOT: &str = "/";

/// Normalize a remote path for consistent lookup
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return ROOT.to_string();
    }

    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in segments {
        normalized.push(SEPARATOR);
        normalized.push_str(segment);
    }
    normalized
}

/// Whether `path` equals `ancestor` or lies below it
///
/// Both arguments must already be normalized. `/a/bc` is not below `/a/b`.
pub fn is_same_or_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT {
        return true;
    }
    match path.strip_prefix(ancestor) {
        Some("") => true,
        Some(rest) => rest.starts_with(SEPARATOR),
        None => false,
    }
}

/// Parent directory of a normalized path, `None` for the root
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind(SEPARATOR) {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}
