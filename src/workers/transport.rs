//! Transport seams used by backup workers
//!
//! Workers talk to Redis servers through a remote shell and to object
//! storage through a streaming upload. Production implementations live in
//! [`crate::adapters`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use super::WorkerError;

/// Output of a remote command, delivered in chunks
///
/// The stream ends with an error instead of `None` when the command exits
/// with a non-zero status.
pub type ChunkStream<'a> = BoxStream<'a, Result<Vec<u8>, WorkerError>>;

/// An open remote shell session on a Redis server
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run a shell command and return its stdout
    ///
    /// A non-zero exit status is an error.
    async fn exec(&self, command: &str) -> Result<Vec<u8>, WorkerError>;

    /// Run a shell command and stream its stdout
    async fn exec_stream<'a>(&'a self, command: &'a str) -> Result<ChunkStream<'a>, WorkerError> {
        let output = self.exec(command).await?;
        Ok(stream::once(async move { Ok(output) }).boxed())
    }

    /// Close the session
    async fn close(self: Box<Self>);
}

/// Opens remote shell sessions
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn connect(&self, host: &str) -> Result<Box<dyn RemoteShell>, WorkerError>;
}

/// Object storage destination
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store the whole of `body` under `key`, replacing any previous object
    ///
    /// The key only becomes visible once `body` ended without error.
    /// Returns the number of bytes stored.
    async fn upload(&self, key: &str, body: ChunkStream<'_>) -> Result<u64, WorkerError>;
}

/// Everything a worker needs to reach the outside world
#[derive(Clone)]
pub struct Transport {
    pub shell: Arc<dyn ShellConnector>,
    pub store: Arc<dyn ObjectStore>,
}

impl Transport {
    pub fn new(shell: Arc<dyn ShellConnector>, store: Arc<dyn ObjectStore>) -> Self {
        Self { shell, store }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}
