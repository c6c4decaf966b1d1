//! Job enumeration: turn a source specification into a stream of jobs.
//!
//! Three modes: a single file, a recursive directory walk, or an external
//! job list (`source|destination` per line). Jobs are pushed into a bounded
//! channel, so enumeration is as lazy as the workers are slow.

use anyhow::{Context, Result};
use async_recursion::async_recursion;

use crate::errors::CopyError;
use crate::job::CopyJob;

/// What to enumerate for this run.
#[derive(Debug, Clone)]
pub enum SourceSpec {
    /// One regular file copied to the destination URI.
    File(std::path::PathBuf),
    /// Every regular file under the root, copied to destination-root/relative.
    Directory(std::path::PathBuf),
    /// An external list of `source|destination` pairs.
    JobList(std::path::PathBuf),
    /// A failed-job stream from a previous run.
    RetryList(std::path::PathBuf),
}

impl SourceSpec {
    /// Classify a local path argument: file or directory.
    pub async fn for_path(path: &std::path::Path) -> Result<Self, CopyError> {
        let metadata = tokio::fs::metadata(path).await.map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                CopyError::SourceNotFound(path.display().to_string())
            } else {
                CopyError::Io(error)
            }
        })?;
        if metadata.is_dir() {
            Ok(SourceSpec::Directory(path.to_path_buf()))
        } else {
            Ok(SourceSpec::File(path.to_path_buf()))
        }
    }
}

/// Enumerate `spec` into `tx`. Returns the number of jobs produced.
///
/// `destination` is the destination root URI; ignored for list modes, which
/// carry their own destinations.
pub async fn produce(
    spec: &SourceSpec,
    destination: &str,
    tx: &tokio::sync::mpsc::Sender<CopyJob>,
) -> Result<u64> {
    match spec {
        SourceSpec::File(path) => {
            let size = tokio::fs::metadata(path)
                .await
                .with_context(|| format!("cannot stat {:?}", path))?
                .len();
            send(
                tx,
                CopyJob::new(path.display().to_string(), destination, Some(size)),
            )
            .await?;
            Ok(1)
        }
        SourceSpec::Directory(root) => walk(root, root, destination, tx).await,
        SourceSpec::JobList(path) => produce_job_list(path, tx).await,
        SourceSpec::RetryList(path) => produce_retry_list(path, tx).await,
    }
}

#[async_recursion]
async fn walk(
    root: &std::path::Path,
    dir: &std::path::Path,
    destination_root: &str,
    tx: &tokio::sync::mpsc::Sender<CopyJob>,
) -> Result<u64> {
    let mut produced = 0;
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", dir))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", dir))?
    {
        let path = entry.path();
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("failed reading type of {:?}", path))?;
        if file_type.is_dir() {
            produced += walk(root, &path, destination_root, tx).await?;
        } else if file_type.is_file() {
            let size = entry
                .metadata()
                .await
                .with_context(|| format!("failed reading metadata from {:?}", path))?
                .len();
            let relative = path
                .strip_prefix(root)
                .expect("walked path is always under the root");
            let destination = join_destination(destination_root, relative);
            send(
                tx,
                CopyJob::new(path.display().to_string(), destination, Some(size)),
            )
            .await?;
            produced += 1;
        } else {
            tracing::debug!("skipping non-regular file {:?}", path);
        }
    }
    Ok(produced)
}

async fn produce_job_list(
    path: &std::path::Path,
    tx: &tokio::sync::mpsc::Sender<CopyJob>,
) -> Result<u64> {
    use tokio::io::AsyncBufReadExt;

    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open job list {:?}", path))?;
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut produced = 0;
    let mut line_number = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        match parse_job_line(&line) {
            Ok(Some(job)) => {
                send(tx, job).await?;
                produced += 1;
            }
            Ok(None) => {}
            Err(error) => {
                return Err(error).with_context(|| {
                    format!("invalid job list entry at {:?}:{}", path, line_number)
                })
            }
        }
    }
    Ok(produced)
}

async fn produce_retry_list(
    path: &std::path::Path,
    tx: &tokio::sync::mpsc::Sender<CopyJob>,
) -> Result<u64> {
    let jobs = crate::recovery::RecoveryStore::read(path)
        .with_context(|| format!("cannot open failed-job stream {:?}", path))?;
    let mut produced = 0;
    for job in jobs {
        send(tx, job?).await?;
        produced += 1;
    }
    Ok(produced)
}

async fn send(tx: &tokio::sync::mpsc::Sender<CopyJob>, job: CopyJob) -> Result<()> {
    tx.send(job)
        .await
        .map_err(|_| anyhow::anyhow!("job queue closed before enumeration finished"))
}

/// Parse one job-list line. `Ok(None)` for comments and blank lines.
pub fn parse_job_line(line: &str) -> Result<Option<CopyJob>, CopyError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let (source, destination) = trimmed.split_once('|').ok_or_else(|| {
        CopyError::BadArgument(format!("job list line missing '|' separator: {line:?}"))
    })?;
    let source = source.trim();
    let destination = destination.trim();
    if source.is_empty() || destination.is_empty() {
        return Err(CopyError::BadArgument(format!(
            "job list line has an empty side: {line:?}"
        )));
    }
    Ok(Some(CopyJob::new(source, destination, None)))
}

/// Format a pair back into the job-list line grammar.
pub fn format_job_line(source: &str, destination: &str) -> String {
    format!("{source}|{destination}")
}

/// Join a destination root URI with a source-relative path.
pub fn join_destination(root: &str, relative: &std::path::Path) -> String {
    let relative = relative.to_string_lossy();
    if root.ends_with('/') {
        format!("{root}{relative}")
    } else {
        format!("{root}/{relative}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    async fn collect(
        spec: SourceSpec,
        destination: &str,
    ) -> (u64, Vec<CopyJob>) {
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let produced = produce(&spec, destination, &tx).await.unwrap();
        drop(tx);
        let mut jobs = Vec::new();
        while let Some(job) = rx.recv().await {
            jobs.push(job);
        }
        (produced, jobs)
    }

    #[test(tokio::test)]
    async fn single_file_produces_one_job() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.bin");
        tokio::fs::write(&src, b"payload").await.unwrap();
        let (produced, jobs) =
            collect(SourceSpec::File(src.clone()), "ssh://host/dst/a.bin").await;
        assert_eq!(produced, 1);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].source, src.display().to_string());
        assert_eq!(jobs[0].destination, "ssh://host/dst/a.bin");
        assert_eq!(jobs[0].size, Some(7));
    }

    #[test(tokio::test)]
    async fn directory_walk_mirrors_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        tokio::fs::create_dir_all(root.join("sub/deeper")).await.unwrap();
        tokio::fs::write(root.join("top.txt"), b"1").await.unwrap();
        tokio::fs::write(root.join("sub/mid.txt"), b"22").await.unwrap();
        tokio::fs::write(root.join("sub/deeper/leaf.txt"), b"333")
            .await
            .unwrap();
        let (produced, mut jobs) = collect(SourceSpec::Directory(root.clone()), "/dst").await;
        assert_eq!(produced, 3);
        jobs.sort_by(|a, b| a.source.cmp(&b.source));
        let destinations: Vec<&str> = jobs.iter().map(|j| j.destination.as_str()).collect();
        assert!(destinations.contains(&"/dst/top.txt"));
        assert!(destinations.contains(&"/dst/sub/mid.txt"));
        assert!(destinations.contains(&"/dst/sub/deeper/leaf.txt"));
    }

    #[test(tokio::test)]
    async fn job_list_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("jobs.txt");
        tokio::fs::write(
            &list,
            "# a comment\n\n  /src/a | /dst/a  \n/src/b|docker://box/data/b\n   \n",
        )
        .await
        .unwrap();
        let (produced, jobs) = collect(SourceSpec::JobList(list), "ignored").await;
        assert_eq!(produced, 2);
        assert_eq!(jobs[0], CopyJob::new("/src/a", "/dst/a", None));
        assert_eq!(jobs[1], CopyJob::new("/src/b", "docker://box/data/b", None));
    }

    #[test(tokio::test)]
    async fn malformed_job_line_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("jobs.txt");
        tokio::fs::write(&list, "no separator here\n").await.unwrap();
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let result = produce(&SourceSpec::JobList(list), "x", &tx).await;
        assert!(result.is_err());
    }

    #[test]
    fn job_line_round_trip() {
        for (source, destination) in [
            ("/a/b", "/c/d"),
            ("/with space", "ssh://user@host:2222/path"),
            ("rel/path", "k8s://ns/pod/tmp/x"),
        ] {
            let line = format_job_line(source, destination);
            let job = parse_job_line(&line).unwrap().unwrap();
            assert_eq!(job.source, source);
            assert_eq!(job.destination, destination);
        }
    }

    #[test]
    fn destination_join_handles_trailing_slash() {
        let rel = std::path::Path::new("sub/file.bin");
        assert_eq!(join_destination("/dst", rel), "/dst/sub/file.bin");
        assert_eq!(join_destination("/dst/", rel), "/dst/sub/file.bin");
        assert_eq!(
            join_destination("ssh://h/base", rel),
            "ssh://h/base/sub/file.bin"
        );
    }
}
