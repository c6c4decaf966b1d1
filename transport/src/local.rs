//! Local filesystem destination.

use common::engine::{self, CopyContext};
use common::errors::CopyError;

/// Stream `source` into a local file: parent directories are created, the
/// destination is opened in create/truncate mode and preallocated when the
/// size is known, then the copy engine does the rest.
pub async fn copy_stream_to_path<R>(
    source: R,
    size: Option<u64>,
    path: &std::path::Path,
    ctx: &CopyContext<'_>,
) -> Result<u64, CopyError>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(CopyError::Io)?;
        }
    }
    let mut sink = engine::create_preallocated(path, size.unwrap_or(0)).await?;
    engine::copy_stream(source, &mut sink, size, ctx).await
}
