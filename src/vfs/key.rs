//! Path <-> object key mapping.
//!
//! User-facing paths are POSIX-like (`/a/b/c`, `.` is the root). The
//! canonical key form is the cleaned path with the leading slash stripped,
//! the empty string for the root, and a trailing slash appended iff the
//! entity is a directory. Pure string manipulation, no I/O.

/// Lexically clean a path: collapse repeated separators, resolve `.` and
/// `..` segments. An empty or fully-collapsed relative path becomes `.`.
pub fn clean(path: &str) -> String {
    let rooted = path.starts_with('/');

    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Translate a user path into an object key.
pub fn to_key(path: &str, is_dir: bool) -> String {
    let mut key = clean(path);

    // The dot prefix doesn't make sense in a bucket.
    if key == "." {
        key.clear();
    }

    // Remove the leading slash.
    if let Some(stripped) = key.strip_prefix('/') {
        key = stripped.to_string();
    }

    // Add a trailing slash if it's a directory (and not the root directory).
    if is_dir && !key.is_empty() && !key.ends_with('/') {
        key.push('/');
    }

    key
}

/// The directory key of the entity addressed by `key`.
pub fn parent_key(key: &str) -> String {
    to_key(&dirname(key.trim_end_matches('/')), true)
}

/// All but the last path element, `.` if there is none.
pub fn dirname(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => clean(&path[..idx]),
        None => ".".to_string(),
    }
}

/// The last path element, ignoring trailing slashes. The empty path maps to
/// `.`, an all-slash path to `/`.
pub fn base(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return if path.is_empty() { "." } else { "/" };
    }
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Join a prefix and a path, cleaning the result.
pub fn join(prefix: &str, path: &str) -> String {
    clean(&format!("{prefix}/{path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean() {
        assert_eq!(clean(""), ".");
        assert_eq!(clean("."), ".");
        assert_eq!(clean("/"), "/");
        assert_eq!(clean("a//b"), "a/b");
        assert_eq!(clean("a/./b"), "a/b");
        assert_eq!(clean("a/../b"), "b");
        assert_eq!(clean("../a"), "../a");
        assert_eq!(clean("/../a"), "/a");
        assert_eq!(clean("a/b/"), "a/b");
    }

    #[test]
    fn test_to_key() {
        assert_eq!(to_key(".", false), "");
        assert_eq!(to_key(".", true), "");
        assert_eq!(to_key("/", true), "");
        assert_eq!(to_key("/a/b", false), "a/b");
        assert_eq!(to_key("a/b", true), "a/b/");
        assert_eq!(to_key("a//b/", true), "a/b/");
    }

    #[test]
    fn test_parent_key() {
        assert_eq!(parent_key("a/b"), "a/");
        assert_eq!(parent_key("a/b/"), "a/");
        assert_eq!(parent_key("a"), "");
        assert_eq!(parent_key("a/b/c"), "a/b/");
    }

    #[test]
    fn test_base() {
        assert_eq!(base(""), ".");
        assert_eq!(base("/"), "/");
        assert_eq!(base("a/b"), "b");
        assert_eq!(base("a/b/"), "b");
        assert_eq!(base("a"), "a");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("sub", "a.txt"), "sub/a.txt");
        assert_eq!(join("sub", "./a.txt"), "sub/a.txt");
        assert_eq!(join("sub/nested", "../a.txt"), "sub/a.txt");
    }
}
