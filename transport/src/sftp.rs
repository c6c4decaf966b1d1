//! SFTP destination over ssh2.
//!
//! Sessions are pooled per `user@host:port` (capacity 10) and re-leased
//! across jobs; a session that errors is dropped instead of returned, so the
//! next job reconnects. The ssh2 API is blocking: the upload side runs in a
//! `spawn_blocking` task fed through a bounded channel, while the async side
//! runs the copy engine (gate, limiter, progress) into that channel.

use std::collections::HashMap;
use std::io::Write;
use std::pin::Pin;
use std::task::{Context, Poll};

use common::engine::{self, CopyContext};
use common::errors::CopyError;
use futures_sink::Sink;

const POOL_CAPACITY: usize = 10;
/// Segments in flight between the async engine and the blocking writer.
const BRIDGE_DEPTH: usize = 4;

/// Adapts a sink's error into `std::io::Error` so it satisfies the
/// `AsyncWrite` bound `tokio_util::io::SinkWriter` requires.
struct IoErrSink<S>(S);

impl<S, T> Sink<T> for IoErrSink<S>
where
    S: Sink<T> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    type Error = std::io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.get_mut().0)
            .poll_ready(cx)
            .map_err(std::io::Error::other)
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        Pin::new(&mut self.get_mut().0)
            .start_send(item)
            .map_err(std::io::Error::other)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.get_mut().0)
            .poll_flush(cx)
            .map_err(std::io::Error::other)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.get_mut().0)
            .poll_close(cx)
            .map_err(std::io::Error::other)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpSpec {
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl SftpSpec {
    fn pool_key(&self) -> String {
        format!(
            "{}@{}:{}",
            self.user.as_deref().unwrap_or_default(),
            self.host,
            self.port
        )
    }

    fn effective_user(&self) -> String {
        self.user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string())
    }
}

/// Connection and authentication knobs.
#[derive(Debug, Clone)]
pub struct SftpOptions {
    /// Validate the server host key against `~/.ssh/known_hosts`. Off means
    /// any host key is trusted (test mode).
    pub verify_host_keys: bool,
    /// Explicit private key tried before any discovered key.
    pub identity_file: Option<std::path::PathBuf>,
    /// Per-operation timeout applied to the whole session.
    pub operation_timeout: std::time::Duration,
}

impl Default for SftpOptions {
    fn default() -> Self {
        Self {
            verify_host_keys: false,
            identity_file: None,
            operation_timeout: std::time::Duration::from_secs(30),
        }
    }
}

/// Per-host session pool; owned by the transport set for the run.
pub struct SftpPool {
    options: SftpOptions,
    sessions: std::sync::Mutex<HashMap<String, Vec<ssh2::Session>>>,
}

impl SftpPool {
    pub fn new(options: SftpOptions) -> Self {
        Self {
            options,
            sessions: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn lease(&self, key: &str) -> Option<ssh2::Session> {
        self.sessions.lock().unwrap().get_mut(key)?.pop()
    }

    fn give_back(&self, key: &str, session: ssh2::Session) {
        let mut sessions = self.sessions.lock().unwrap();
        let pooled = sessions.entry(key.to_string()).or_default();
        if pooled.len() < POOL_CAPACITY {
            pooled.push(session);
        }
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self, key: &str) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Upload `source` to the remote path in `spec`.
    pub async fn copy_stream_to<R>(
        &self,
        source: R,
        size: Option<u64>,
        spec: SftpSpec,
        ctx: &CopyContext<'_>,
    ) -> Result<u64, CopyError>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let key = spec.pool_key();
        let leased = self.lease(&key);
        let options = self.options.clone();
        let connect_spec = spec.clone();
        let session = tokio::task::spawn_blocking(move || match leased {
            Some(session) => Ok(session),
            None => connect(&connect_spec, &options),
        })
        .await
        .map_err(|error| CopyError::Io(std::io::Error::other(error)))??;

        let (tx, rx) = tokio::sync::mpsc::channel::<bytes::Bytes>(BRIDGE_DEPTH);
        let remote_path = spec.path.clone();
        let upload = tokio::task::spawn_blocking(move || {
            let written = blocking_upload(&session, &remote_path, rx)?;
            Ok::<_, CopyError>((written, session))
        });

        let mut sink = tokio_util::io::SinkWriter::new(tokio_util::io::CopyToBytes::new(
            IoErrSink(tokio_util::sync::PollSender::new(tx)),
        ));
        let streamed = engine::copy_stream(source, &mut sink, size, ctx).await;
        drop(sink);

        let uploaded = upload
            .await
            .map_err(|error| CopyError::Io(std::io::Error::other(error)))?;
        match uploaded {
            Ok((written, session)) => match streamed {
                Ok(_) => {
                    self.give_back(&key, session);
                    Ok(written)
                }
                // the writer side finished but the engine failed: the
                // session is still healthy, keep it
                Err(error) => {
                    self.give_back(&key, session);
                    Err(error)
                }
            },
            Err(upload_error) => match streamed {
                // cancellation wins; the dropped session reconnects later
                Err(CopyError::Cancelled) => Err(CopyError::Cancelled),
                _ => Err(upload_error),
            },
        }
    }
}

/// Establish and authenticate a new session.
fn connect(spec: &SftpSpec, options: &SftpOptions) -> Result<ssh2::Session, CopyError> {
    use std::net::ToSocketAddrs;

    let authority = format!("{}:{}", spec.host, spec.port);
    let address = authority
        .to_socket_addrs()
        .map_err(|error| CopyError::Connection(format!("cannot resolve {authority}: {error}")))?
        .next()
        .ok_or_else(|| CopyError::Connection(format!("no address for {authority}")))?;
    let tcp = std::net::TcpStream::connect_timeout(&address, options.operation_timeout)
        .map_err(|error| CopyError::Connection(format!("cannot connect to {authority}: {error}")))?;
    let mut session = ssh2::Session::new()
        .map_err(|error| CopyError::Connection(format!("cannot create session: {error}")))?;
    session.set_timeout(options.operation_timeout.as_millis() as u32);
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|error| CopyError::Connection(format!("handshake with {authority} failed: {error}")))?;
    if options.verify_host_keys {
        verify_host_key(&session, &spec.host)?;
    }
    authenticate(&session, spec, options)?;
    tracing::debug!("sftp session established to {}", authority);
    Ok(session)
}

/// Try authentication methods in priority order: explicit key, discovered
/// keys (modern algorithms first), password, keyboard-interactive, agent,
/// empty password.
fn authenticate(
    session: &ssh2::Session,
    spec: &SftpSpec,
    options: &SftpOptions,
) -> Result<(), CopyError> {
    let user = spec.effective_user();
    let mut attempts: Vec<String> = Vec::new();

    if let Some(identity) = &options.identity_file {
        match session.userauth_pubkey_file(&user, None, identity, None) {
            Ok(()) => return Ok(()),
            Err(error) => attempts.push(format!("key {}: {}", identity.display(), error)),
        }
    }
    if let Some(home) = std::env::var_os("HOME") {
        for name in ["id_ed25519", "id_ecdsa", "id_rsa"] {
            let key = std::path::Path::new(&home).join(".ssh").join(name);
            if !key.exists() {
                continue;
            }
            match session.userauth_pubkey_file(&user, None, &key, None) {
                Ok(()) => return Ok(()),
                Err(error) => attempts.push(format!("key {}: {}", key.display(), error)),
            }
        }
    }
    if let Some(password) = &spec.password {
        match session.userauth_password(&user, password) {
            Ok(()) => return Ok(()),
            Err(error) => attempts.push(format!("password: {error}")),
        }
        let mut prompter = Prompter {
            password: password.clone(),
        };
        match session.userauth_keyboard_interactive(&user, &mut prompter) {
            Ok(()) => return Ok(()),
            Err(error) => attempts.push(format!("keyboard-interactive: {error}")),
        }
    }
    match session.userauth_agent(&user) {
        Ok(()) => return Ok(()),
        Err(error) => attempts.push(format!("agent: {error}")),
    }
    match session.userauth_password(&user, "") {
        Ok(()) => return Ok(()),
        Err(error) => attempts.push(format!("empty password: {error}")),
    }
    Err(CopyError::Auth(format!(
        "all authentication methods failed for {}@{}: {}",
        user,
        spec.host,
        attempts.join("; ")
    )))
}

struct Prompter {
    password: String,
}

impl ssh2::KeyboardInteractivePrompt for Prompter {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.password.clone()).collect()
    }
}

fn verify_host_key(session: &ssh2::Session, host: &str) -> Result<(), CopyError> {
    let mut known_hosts = session
        .known_hosts()
        .map_err(|error| CopyError::Connection(format!("known-hosts init failed: {error}")))?;
    if let Some(home) = std::env::var_os("HOME") {
        let path = std::path::Path::new(&home).join(".ssh").join("known_hosts");
        let _ = known_hosts.read_file(&path, ssh2::KnownHostFileKind::OpenSSH);
    }
    let (key, _key_type) = session
        .host_key()
        .ok_or_else(|| CopyError::Auth(format!("{host} presented no host key")))?;
    match known_hosts.check(host, key) {
        ssh2::CheckResult::Match => Ok(()),
        ssh2::CheckResult::Mismatch => Err(CopyError::Auth(format!(
            "host key mismatch for {host}; refusing to continue"
        ))),
        ssh2::CheckResult::NotFound | ssh2::CheckResult::Failure => Err(CopyError::Auth(
            format!("host key for {host} is not in known_hosts"),
        )),
    }
}

/// The blocking half: create remote parents, open the remote file, drain the
/// bridge channel into it.
fn blocking_upload(
    session: &ssh2::Session,
    remote_path: &str,
    mut rx: tokio::sync::mpsc::Receiver<bytes::Bytes>,
) -> Result<u64, CopyError> {
    let sftp = session
        .sftp()
        .map_err(|error| CopyError::Connection(format!("sftp subsystem failed: {error}")))?;
    ensure_remote_parents(&sftp, remote_path);
    let mut remote = sftp
        .create(std::path::Path::new(remote_path))
        .map_err(|error| {
            CopyError::RemoteExec(format!("cannot create remote file {remote_path}: {error}"))
        })?;
    let mut written: u64 = 0;
    while let Some(chunk) = rx.blocking_recv() {
        remote.write_all(&chunk).map_err(|error| {
            CopyError::RemoteExec(format!("write to {remote_path} failed: {error}"))
        })?;
        written += chunk.len() as u64;
    }
    remote.flush().map_err(|error| {
        CopyError::RemoteExec(format!("flush of {remote_path} failed: {error}"))
    })?;
    Ok(written)
}

/// Create every missing component of the remote parent directory. Races with
/// other workers are benign: a failed mkdir of an existing directory is
/// indistinguishable from success at the following stat.
fn ensure_remote_parents(sftp: &ssh2::Sftp, remote_path: &str) {
    let parent = match std::path::Path::new(remote_path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return,
    };
    let mut accumulated = String::new();
    for component in parent.to_string_lossy().split('/') {
        if component.is_empty() {
            if accumulated.is_empty() {
                accumulated.push('/');
            }
            continue;
        }
        if !accumulated.ends_with('/') {
            accumulated.push('/');
        }
        accumulated.push_str(component);
        let path = std::path::Path::new(&accumulated);
        if sftp.stat(path).is_err() {
            let _ = sftp.mkdir(path, 0o755);
        }
    }
}
