use annostore::{AccessKey, KeyTarget, StoreError, StoreResult};
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};

pub(crate) const FILE_EXTENSION: &str = "cas";

/// Encodes a key component as a single path segment.
///
/// ASCII alphanumerics, `-` and `_` are kept; every other byte becomes `%XX`. The mapping is
/// injective, so two distinct components never share a segment, and the result can never be
/// `.`, `..` or contain a separator.
pub(crate) fn sanitize_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    if out.is_empty() {
        out.push('%');
    }
    out
}

/// File name of the container stored for `key`, without directories.
pub(crate) fn file_name(key: &AccessKey) -> String {
    let target = match key.target() {
        KeyTarget::Document(id) => format!("doc-{id}"),
        KeyTarget::SpecialPurpose(tag) => format!("tag-{}", sanitize_segment(tag)),
    };
    format!("{target}@{}.{FILE_EXTENSION}", sanitize_segment(key.user()))
}

/// Relative location `<project>/<shard>/<shard>/<file>` of the container stored for `key`.
///
/// Shards come from the Fx hash of the file name so that documents with consecutive ids
/// spread across directories. The hasher is unseeded, so the layout is stable across runs.
pub(crate) fn layout(key: &AccessKey) -> PathBuf {
    let name = file_name(key);
    let hash = fxhash::hash32(name.as_str()).to_be_bytes();

    let mut path = PathBuf::from(key.project().to_string());
    path.push(format!("{:02x}", hash[0]));
    path.push(format!("{:02x}", hash[1]));
    path.push(name);
    path
}

/// Resolves the physical path for `key` inside the sandbox root.
pub(crate) fn resolve_key(root: &Path, key: &AccessKey) -> StoreResult<PathBuf> {
    resolve_path(root, layout(key))
}

/// Safely joins a path to the root and ensures it doesn't escape the sandbox.
pub(crate) fn resolve_path(root: &Path, path: impl AsRef<Path>) -> StoreResult<PathBuf> {
    let path = path.as_ref();

    if path.is_absolute() {
        return Err(traversal(path, "Absolute paths are not allowed in sandbox"));
    }

    let safe_rel = normalize_relative(path)?;
    let joined = root.join(safe_rel);

    match joined.canonicalize() {
        Ok(canonical) if canonical.starts_with(root) => Ok(canonical),
        Ok(canonical) => Err(traversal(&canonical, "Path resolves outside the sandbox")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => validate_ancestors(root, &joined),
        Err(e) => Err(e.into()),
    }
}

/// Collapses `.` and `..` lexically, refusing anything that climbs above the root.
fn normalize_relative(path: &Path) -> StoreResult<PathBuf> {
    let mut out = PathBuf::new();

    for c in path.components() {
        match c {
            Component::CurDir => {},
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => {
                if !out.pop() {
                    return Err(traversal(path, "Path attempted to escape sandbox via '..'"));
                }
            },
            Component::RootDir | Component::Prefix(_) => {
                return Err(traversal(path, "Absolute paths are not allowed in sandbox"));
            },
        }
    }

    Ok(out)
}

/// Validates a path that doesn't exist yet through its first existing ancestor.
///
/// The ancestor is canonicalized, so a shard directory replaced by a symlink pointing out of
/// the sandbox is detected before anything is written through it.
fn validate_ancestors(root: &Path, joined: &Path) -> StoreResult<PathBuf> {
    if !joined.starts_with(root) {
        return Err(traversal(joined, "Path is outside sandbox boundaries"));
    }

    let mut current = Some(joined);
    while let Some(path) = current {
        if path == root {
            return Ok(joined.to_path_buf());
        }
        if path.exists() {
            let canonical = path.canonicalize()?;
            return if canonical.starts_with(root) {
                Ok(joined.to_path_buf())
            } else {
                Err(traversal(&canonical, "Existing parent directory is a symlink outside sandbox"))
            };
        }
        current = path.parent();
    }

    Err(traversal(joined, "No valid parent directory found within sandbox"))
}

fn traversal(path: &Path, context: &'static str) -> StoreError {
    StoreError::InvalidArgument {
        message: format!("Path traversal attempt: {}", path.display()).into(),
        context: Some(context.into()),
    }
}
