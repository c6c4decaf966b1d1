//! Shared subprocess plumbing for the container and pod transports.
//!
//! Both wrap the source in the USTAR framer and pipe the archive into an
//! external extract command: stdin is fed by the copy engine, shut down for
//! EOF, stderr is drained to completion, and the exit status decides the
//! outcome.

use common::engine::{self, CopyContext};
use common::errors::CopyError;
use tokio::io::AsyncWriteExt;

use crate::tar::{framed_len, TarStream};

/// Split a destination file path into `(parent_dir, file_name)` for an
/// extract-into-directory operation.
pub(crate) fn split_destination(uri: &str, path: &str) -> Result<(String, String), CopyError> {
    let path = std::path::Path::new(path);
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| CopyError::BadUri {
            uri: uri.to_string(),
            reason: "destination has no file name".to_string(),
        })?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            parent.to_string_lossy().into_owned()
        }
        _ => "/".to_string(),
    };
    Ok((parent, name.to_string()))
}

/// Frame `source` as `file_name`/`size` and pipe the archive into `command`.
///
/// Returns the content bytes delivered. `fail_on_stderr` raises any stderr
/// output as a failure even when the command exits zero (pod semantics).
pub(crate) async fn pipe_archive_into<R>(
    mut command: tokio::process::Command,
    source: R,
    file_name: &str,
    size: u64,
    fail_on_stderr: bool,
    ctx: &CopyContext<'_>,
) -> Result<u64, CopyError>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let program = format!("{:?}", command.as_std().get_program());
    let mut child = command
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|error| {
            CopyError::RemoteExec(format!("failed to launch {program}: {error}"))
        })?;
    let mut stdin = child
        .stdin
        .take()
        .expect("stdin was configured as piped");

    let framed = TarStream::new(source, file_name, size);
    let streamed = engine::copy_stream(framed, &mut stdin, Some(framed_len(size)), ctx).await;
    // close stdin so the extractor sees EOF before we wait on it
    let shutdown = stdin.shutdown().await;
    drop(stdin);

    let output = child
        .wait_with_output()
        .await
        .map_err(|error| CopyError::RemoteExec(format!("failed waiting for {program}: {error}")))?;
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    match streamed {
        Err(CopyError::Io(error)) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(CopyError::SourceTruncated(error.to_string()));
        }
        Err(CopyError::Io(error)) if error.kind() == std::io::ErrorKind::BrokenPipe => {
            // the extractor died; its stderr is the real story
            return Err(CopyError::RemoteExec(if stderr.is_empty() {
                format!("{program} closed its input early")
            } else {
                stderr
            }));
        }
        Err(error) => return Err(error),
        Ok(_) => {}
    }
    shutdown.map_err(CopyError::Io)?;
    if !output.status.success() {
        return Err(CopyError::RemoteExec(if stderr.is_empty() {
            format!("{program} exited with {}", output.status)
        } else {
            stderr
        }));
    }
    if fail_on_stderr && !stderr.is_empty() {
        return Err(CopyError::RemoteExec(stderr));
    }
    Ok(size)
}
