//! Canonical store paths.
//!
//! A canonical path always begins with `/`, has no trailing slash and no `.`
//! or `..` segments. The root is `/`. Every store keys its entries by
//! canonical path, so anything coming from a caller goes through
//! [`canonicalize`] first.

use crate::error::{ErrorKind, Result};

/// The root folder.
pub const ROOT: &str = "/";

/// Normalize a path into its canonical form.
///
/// Empty segments and `.` are dropped, `..` removes the previous segment.
/// A `..` that would climb above the root is rejected rather than clamped,
/// as are null bytes.
///
/// # Examples
///
/// ```
/// use songbook_storage::path::canonicalize;
/// assert_eq!(canonicalize("Songs//./a.chopro/").unwrap(), "/Songs/a.chopro");
/// assert_eq!(canonicalize("/Songs/../Setlists").unwrap(), "/Setlists");
/// assert_eq!(canonicalize("").unwrap(), "/");
/// assert!(canonicalize("/../etc/passwd").is_err());
/// ```
pub fn canonicalize(path: &str) -> Result<String> {
    if path.contains('\0') {
        exn::bail!(ErrorKind::InvalidPath(path.replace('\0', "\\0")));
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {},
            ".." => {
                if segments.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.to_string()));
                }
            },
            segment => segments.push(segment),
        }
    }
    Ok(format!("/{}", segments.join("/")))
}

pub fn is_root(path: &str) -> bool {
    path == ROOT
}

/// Last segment of a canonical path. Empty for the root.
pub fn basename(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

/// Parent of a canonical path. The root is its own parent.
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => ROOT,
        Some(idx) => &path[..idx],
    }
}

/// Join a canonical folder path and a single child name.
pub fn join(parent: &str, name: &str) -> String {
    if is_root(parent) { format!("/{name}") } else { format!("{parent}/{name}") }
}

/// Returns `true` if `path` is `ancestor` or lies underneath it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if is_root(ancestor) {
        return true;
    }
    path == ancestor || path.strip_prefix(ancestor).is_some_and(|rest| rest.starts_with('/'))
}

/// Path of `path` relative to `ancestor`, without a leading slash.
///
/// `None` if `path` does not lie strictly underneath `ancestor`.
pub fn relative_to<'a>(path: &'a str, ancestor: &str) -> Option<&'a str> {
    if is_root(ancestor) {
        return path.strip_prefix('/').filter(|rest| !rest.is_empty());
    }
    path.strip_prefix(ancestor)?.strip_prefix('/').filter(|rest| !rest.is_empty())
}

/// Swap the `from` prefix of `path` for `to`.
///
/// Used when a folder moves: every descendant keeps its position relative to
/// the moved folder. Returns `None` for paths outside `from`.
pub fn rebase(path: &str, from: &str, to: &str) -> Option<String> {
    if path == from {
        return Some(to.to_string());
    }
    relative_to(path, from).map(|rest| join(to, rest))
}

/// The `n`th autorename candidate for a path: `/a/b.txt` becomes
/// `/a/b (n).txt`. Dotfiles and extensionless names get the suffix at the end.
pub fn autorename(path: &str, n: usize) -> String {
    let parent = dirname(path);
    let name = basename(path);
    let renamed = match name.rfind('.') {
        Some(idx) if idx > 0 => format!("{} ({n}){}", &name[..idx], &name[idx..]),
        _ => format!("{name} ({n})"),
    };
    join(parent, &renamed)
}
