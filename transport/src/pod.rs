//! Kubernetes pod destination.
//!
//! The framed archive is piped into `tar -xf -` executed inside the pod.
//! Stderr is drained to completion and any output at all is raised as a
//! failure, because `kubectl exec` can exit zero after a partial extract.

use common::engine::CopyContext;
use common::errors::CopyError;

use crate::exec;

pub async fn copy_stream_to_pod<R>(
    source: R,
    size: u64,
    uri: &str,
    namespace: &str,
    pod: &str,
    path: &str,
    ctx: &CopyContext<'_>,
) -> Result<u64, CopyError>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let (parent, file_name) = exec::split_destination(uri, path)?;
    let mut command = tokio::process::Command::new("kubectl");
    command.args([
        "exec", "-i", "-n", namespace, pod, "--", "tar", "-xf", "-", "-C", &parent,
    ]);
    tracing::debug!(
        "extracting {} ({} bytes) into pod {}/{} at {}",
        file_name,
        size,
        namespace,
        pod,
        parent
    );
    exec::pipe_archive_into(command, source, &file_name, size, true, ctx).await
}
