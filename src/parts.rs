use std::path::Path;

use tracing::warn;

use crate::{errors::ChatError, models::Part};

/// Builds the request parts for one turn: the text first (when non-empty),
/// then one image part per path in the order given.
///
/// Every image is read before anything is returned, so a single unreadable
/// file fails the whole call. Both inputs empty yields an empty list; the
/// backend decides whether that is an acceptable turn.
pub async fn build_parts<P>(text: &str, images: &[P]) -> Result<Vec<Part>, ChatError>
where
    P: AsRef<Path>,
{
    let mut parts = Vec::with_capacity(images.len() + 1);
    if !text.is_empty() {
        parts.push(Part::Text(text.to_owned()));
    }

    for path in images {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await.map_err(|source| ChatError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let format = image_format(path);
        if format.is_empty() {
            warn!(path = %path.display(), "image has no extension, sending empty format");
        }
        parts.push(Part::Image { format, data });
    }

    Ok(parts)
}

/// Lowercased extension of `path` without a leading dot; empty when the path
/// has no extension.
pub fn image_format(path: &Path) -> String {
    path.extension()
        .map(|extension| extension.to_string_lossy().to_lowercase())
        .map(|extension| extension.trim_start_matches('.').to_owned())
        .unwrap_or_default()
}
