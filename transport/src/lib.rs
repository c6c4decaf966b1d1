//! Destination transports: local filesystem, SFTP over SSH, Docker
//! containers, and Kubernetes pods, all consuming the same byte-stream
//! contract. [`Transports`] maps a destination URI to its variant and owns
//! the state that outlives single jobs (the SFTP session pool).

pub mod container;
mod exec;
pub mod local;
pub mod pod;
pub mod sftp;
pub mod tar;
pub mod uri;

pub use sftp::SftpOptions;
pub use uri::{parse_destination, Destination};

use common::engine::CopyContext;
use common::errors::CopyError;
use common::job::CopyJob;

/// One transport set per run, shared by all workers.
pub struct Transports {
    sftp_pool: sftp::SftpPool,
}

impl Transports {
    pub fn new(sftp_options: SftpOptions) -> Self {
        Self {
            sftp_pool: sftp::SftpPool::new(sftp_options),
        }
    }

    /// Stream `source` to wherever `destination_uri` points.
    ///
    /// `size` must be the exact source size for container and pod
    /// destinations (the archive header states it up-front).
    pub async fn copy_stream_to<R>(
        &self,
        source: R,
        size: Option<u64>,
        destination_uri: &str,
        ctx: &CopyContext<'_>,
    ) -> Result<u64, CopyError>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        match parse_destination(destination_uri)? {
            Destination::Local { path } => {
                local::copy_stream_to_path(source, size, &path, ctx).await
            }
            Destination::Sftp {
                user,
                password,
                host,
                port,
                path,
            } => {
                let spec = sftp::SftpSpec {
                    user,
                    password,
                    host,
                    port,
                    path,
                };
                self.sftp_pool.copy_stream_to(source, size, spec, ctx).await
            }
            Destination::Container { id, path } => {
                let size = require_size(size, destination_uri)?;
                container::copy_stream_to_container(
                    source,
                    size,
                    destination_uri,
                    &id,
                    &path,
                    ctx,
                )
                .await
            }
            Destination::Pod {
                namespace,
                pod,
                path,
            } => {
                let size = require_size(size, destination_uri)?;
                pod::copy_stream_to_pod(
                    source,
                    size,
                    destination_uri,
                    &namespace,
                    &pod,
                    &path,
                    ctx,
                )
                .await
            }
        }
    }

    /// Execute one job: open the local source and stream it to the job's
    /// destination.
    pub async fn copy_job(&self, job: &CopyJob, ctx: &CopyContext<'_>) -> Result<u64, CopyError> {
        let source_path = std::path::Path::new(&job.source);
        let source = tokio::fs::File::open(source_path).await.map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                CopyError::SourceNotFound(job.source.clone())
            } else {
                CopyError::Io(error)
            }
        })?;
        let size = source.metadata().await.map_err(CopyError::Io)?.len();
        self.copy_stream_to(source, Some(size), &job.destination, ctx)
            .await
    }
}

fn require_size(size: Option<u64>, uri: &str) -> Result<u64, CopyError> {
    size.ok_or_else(|| {
        CopyError::BadArgument(format!(
            "destination {uri:?} requires a known source size"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test(tokio::test)]
    async fn job_to_local_destination_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.bin");
        let payload = common::testutils::deterministic_payload(64 * 1024 + 17);
        tokio::fs::write(&source, &payload).await.unwrap();
        let destination = dir.path().join("out").join("copy.bin");
        let job = CopyJob::new(
            source.display().to_string(),
            destination.display().to_string(),
            Some(payload.len() as u64),
        );
        let transports = Transports::new(SftpOptions::default());
        let cancel = tokio_util::sync::CancellationToken::new();
        let copied = transports
            .copy_job(&job, &CopyContext::unthrottled(cancel))
            .await
            .unwrap();
        assert_eq!(copied, payload.len() as u64);
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), payload);
    }

    #[test(tokio::test)]
    async fn missing_source_is_not_found() {
        let transports = Transports::new(SftpOptions::default());
        let cancel = tokio_util::sync::CancellationToken::new();
        let job = CopyJob::new("/definitely/not/here.bin", "/tmp/out.bin", None);
        let result = transports
            .copy_job(&job, &CopyContext::unthrottled(cancel))
            .await;
        assert!(matches!(result, Err(CopyError::SourceNotFound(_))));
    }

    #[test(tokio::test)]
    async fn unknown_scheme_is_rejected_before_any_io() {
        let transports = Transports::new(SftpOptions::default());
        let cancel = tokio_util::sync::CancellationToken::new();
        let result = transports
            .copy_stream_to(
                std::io::Cursor::new(vec![1u8]),
                Some(1),
                "gopher://host/file",
                &CopyContext::unthrottled(cancel),
            )
            .await;
        assert!(matches!(result, Err(CopyError::BadUri { .. })));
    }
}
