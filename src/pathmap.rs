use crate::error::{DashError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Component, Path, PathBuf};

/// Public mount point under which graph images are served
pub const IMAGE_PREFIX: &str = "/my_images/";

lazy_static! {
    // ASCII-only case folding so offsets line up with the input string.
    static ref GRAPHS_MARKER: Regex = Regex::new(r"(?i-u)graphs\\").unwrap();
}

/// Rewrite a stored graph path into the public URL it is served under
///
/// Stored paths come in mixed forms: relative fragments with either
/// separator (`data/graphs\data_0\graph.png`) or full local paths
/// (`C:\Users\...\data\graphs\data_0\graph.png`). Everything after the
/// first `graphs\` segment (matched case-insensitively, after turning every
/// `/` into `\`) is kept and re-joined with forward slashes under
/// [`IMAGE_PREFIX`].
///
/// Paths with no `graphs` segment fall back to their last component only.
/// Any subdirectories are lost in that case; the stored data gives no
/// better rule, so the fallback is left lossy on purpose.
///
/// # Examples
/// ```
/// use dashboard::pathmap::convert_graph_path;
///
/// assert_eq!(
///     convert_graph_path(r"data\GRAPHS\data_0\graph.png"),
///     "/my_images/data_0/graph.png"
/// );
/// assert_eq!(convert_graph_path(r"C:\tmp\chart.png"), "/my_images/chart.png");
/// ```
pub fn convert_graph_path(stored: &str) -> String {
    let unified = stored.replace('/', "\\");

    let remainder = match GRAPHS_MARKER.find(&unified) {
        Some(marker) => &unified[marker.end()..],
        None => last_component(&unified),
    };

    format!("{}{}", IMAGE_PREFIX, remainder.replace('\\', "/"))
}

/// Reduce a stored archive path to the file name used in download links
///
/// Either separator is accepted, so Windows paths stored in the result
/// tables resolve the same way on every host.
pub fn archive_basename(stored: &str) -> String {
    last_component(&stored.replace('/', "\\")).to_string()
}

// Everything after the final backslash
fn last_component(unified: &str) -> &str {
    match unified.rfind('\\') {
        Some(idx) => &unified[idx + 1..],
        None => unified,
    }
}

/// Map a file name taken from a request URL onto `base`
///
/// Only plain relative names are accepted: absolute paths, `..` and
/// drive prefixes are refused before touching the filesystem, and the
/// canonical result must still live under the canonical `base` so that a
/// symlink cannot point the request elsewhere.
///
/// # Errors
/// * `DashError::Forbidden` if the name escapes `base`
/// * `DashError::NotFound` if the file (or `base` itself) does not exist
pub fn resolve_within(base: &Path, requested: &str) -> Result<PathBuf> {
    let relative = Path::new(requested);

    if requested.is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(DashError::Forbidden(requested.to_string()));
    }

    let base = base
        .canonicalize()
        .map_err(|_| DashError::NotFound(base.display().to_string()))?;

    let full = base
        .join(relative)
        .canonicalize()
        .map_err(|_| DashError::NotFound(requested.to_string()))?;

    if !full.starts_with(&base) {
        return Err(DashError::Forbidden(requested.to_string()));
    }

    if !full.is_file() {
        return Err(DashError::NotFound(requested.to_string()));
    }

    Ok(full)
}
