//! SSH remote shell
//!
//! Sessions are opened with the system `ssh` client through `openssh`. The
//! private key is written to a temporary file that lives as long as the
//! connector and is removed on drop.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use openssh::{Child, ChildStdout, KnownHosts, Session, SessionBuilder, Stdio};
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::workers::{ChunkStream, RemoteShell, ShellConnector, WorkerError};

/// Default SSH connection timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read size for streamed command output
const READ_CHUNK: usize = 256 * 1024;

/// Private key written to an owner-only temporary file
pub struct SshKeyFile {
    file: NamedTempFile,
}

impl SshKeyFile {
    /// Write the key to a new file in the system temp directory
    pub fn new(private_key: &str) -> Result<Self> {
        Self::new_in(private_key, &std::env::temp_dir())
    }

    /// Write the key to a new file inside `dir`
    pub fn new_in(private_key: &str, dir: &Path) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("redis-backup-ssh-")
            .tempfile_in(dir)?;

        file.write_all(private_key.as_bytes())?;
        // ssh rejects keys without a trailing newline
        if !private_key.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.flush()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Opens SSH sessions with a fixed user and key
pub struct SshConnector {
    user: String,
    port: u16,
    key: SshKeyFile,
}

impl SshConnector {
    pub fn new(user: impl Into<String>, port: u16, private_key: &str) -> Result<Self> {
        let user = user.into();
        if user.is_empty() {
            return Err(Error::config("ssh user must not be empty"));
        }
        Ok(Self {
            user,
            port,
            key: SshKeyFile::new(private_key)?,
        })
    }
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn connect(&self, host: &str) -> std::result::Result<Box<dyn RemoteShell>, WorkerError> {
        let mut builder = SessionBuilder::default();
        builder
            .user(self.user.clone())
            .port(self.port)
            .keyfile(self.key.path())
            .known_hosts_check(KnownHosts::Accept)
            .connect_timeout(CONNECT_TIMEOUT);

        let session = builder
            .connect(host)
            .await
            .map_err(|e| WorkerError::Connect(format!("{}@{}:{}: {}", self.user, host, self.port, e)))?;

        debug!(host = %host, user = %self.user, "SSH session opened");
        Ok(Box::new(SshShell { session }))
    }
}

struct SshShell {
    session: Session,
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, command: &str) -> std::result::Result<Vec<u8>, WorkerError> {
        let output = self
            .session
            .raw_command(command)
            .output()
            .await
            .map_err(|e| WorkerError::Command(format!("'{}': {}", command, e)))?;

        if !output.status.success() {
            return Err(WorkerError::Command(format!(
                "'{}' exited with {}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(output.stdout)
    }

    async fn exec_stream<'a>(&'a self, command: &'a str) -> std::result::Result<ChunkStream<'a>, WorkerError> {
        let mut remote = self.session.raw_command(command);
        remote
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = remote
            .spawn()
            .await
            .map_err(|e| WorkerError::Command(format!("'{}': {}", command, e)))?;
        let stdout = child
            .stdout()
            .take()
            .ok_or_else(|| WorkerError::Command(format!("'{}': stdout not captured", command)))?;

        let output = PipedOutput {
            command,
            child: Some(child),
            stdout,
        };
        Ok(stream::try_unfold(output, PipedOutput::next_chunk).boxed())
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.session.close().await {
            debug!(error = %e, "Failed to close SSH session");
        }
    }
}

/// Stdout of a running remote command
struct PipedOutput<'a> {
    command: &'a str,
    child: Option<Child<&'a Session>>,
    stdout: ChildStdout,
}

impl<'a> PipedOutput<'a> {
    /// Next chunk of stdout; at EOF the exit status decides between end and error
    async fn next_chunk(mut self) -> std::result::Result<Option<(Vec<u8>, Self)>, WorkerError> {
        let mut buf = vec![0u8; READ_CHUNK];
        let n = self
            .stdout
            .read(&mut buf)
            .await
            .map_err(|e| WorkerError::Command(format!("'{}': {}", self.command, e)))?;
        if n > 0 {
            buf.truncate(n);
            return Ok(Some((buf, self)));
        }

        if let Some(child) = self.child.take() {
            let status = child
                .wait()
                .await
                .map_err(|e| WorkerError::Command(format!("'{}': {}", self.command, e)))?;
            if !status.success() {
                return Err(WorkerError::Command(format!(
                    "'{}' exited with {}",
                    self.command, status
                )));
            }
        }
        Ok(None)
    }
}
