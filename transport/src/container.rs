//! Docker container destination.
//!
//! The source is framed as a single-file USTAR archive and handed to the
//! engine's archive-extract operation (`docker cp - <id>:<dir>`), which
//! unpacks it at the destination's parent directory.

use common::engine::CopyContext;
use common::errors::CopyError;

use crate::exec;

pub async fn copy_stream_to_container<R>(
    source: R,
    size: u64,
    uri: &str,
    container_id: &str,
    path: &str,
    ctx: &CopyContext<'_>,
) -> Result<u64, CopyError>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let (parent, file_name) = exec::split_destination(uri, path)?;
    let mut command = tokio::process::Command::new("docker");
    command.args(["cp", "-", &format!("{container_id}:{parent}")]);
    tracing::debug!(
        "extracting {} ({} bytes) into container {} at {}",
        file_name,
        size,
        container_id,
        parent
    );
    exec::pipe_archive_into(command, source, &file_name, size, false, ctx).await
}
