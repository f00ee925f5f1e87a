//! S3 object store
//!
//! Dumps that fit in one part go out as a single `PutObject`. Larger dumps
//! are streamed as a multipart upload that is only completed once the whole
//! body has been read, so a key is either absent or complete. Failed or
//! dropped uploads are aborted.

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::crd::S3Options;
use crate::workers::{ChunkStream, ObjectStore, WorkerError};

use super::secrets::S3Credentials;

/// Size of one multipart part (S3 requires at least 5 MiB but the last)
pub const PART_SIZE: usize = 8 * 1024 * 1024;

fn transfer_error<E: std::error::Error>(e: E) -> WorkerError {
    WorkerError::Transfer(DisplayErrorContext(&e).to_string())
}

/// S3 bucket with resolved credentials
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub fn new(options: &S3Options, credentials: S3Credentials) -> Self {
        let credentials = Credentials::new(
            credentials.access_key_id,
            credentials.secret_access_key,
            None,
            None,
            "redis-backup-operator",
        );

        let mut config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(options.region.clone()))
            .credentials_provider(credentials);

        if let Some(endpoint) = &options.service_endpoint {
            config = config.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(config.build()),
            bucket: options.bucket.clone(),
        }
    }

    async fn put_single(&self, key: &str, body: Vec<u8>) -> Result<(), WorkerError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(transfer_error)?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        key: &str,
        first: Vec<u8>,
        body: &mut ChunkStream<'_>,
    ) -> Result<u64, WorkerError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(transfer_error)?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| WorkerError::Transfer("multipart upload has no ID".to_string()))?;

        let mut upload = MultipartUpload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            parts: Vec::new(),
            finished: false,
        };

        match upload.send_parts(first, body).await {
            Ok(bytes) => {
                upload.complete().await?;
                Ok(bytes)
            }
            Err(e) => {
                upload.abort().await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn upload(&self, key: &str, mut body: ChunkStream<'_>) -> Result<u64, WorkerError> {
        let (first, exhausted) = next_part(&mut body, PART_SIZE).await?;

        let size = if exhausted {
            let size = first.len() as u64;
            self.put_single(key, first).await?;
            size
        } else {
            self.put_multipart(key, first, &mut body).await?
        };

        debug!(bucket = %self.bucket, key = %key, size, "Uploaded object");
        Ok(size)
    }
}

/// Pull chunks until `part_size` bytes are buffered or the stream ends
///
/// Returns the buffered part and whether the stream is exhausted.
pub async fn next_part<S>(body: &mut S, part_size: usize) -> Result<(Vec<u8>, bool), WorkerError>
where
    S: Stream<Item = Result<Vec<u8>, WorkerError>> + Unpin,
{
    let mut part = Vec::new();
    while part.len() < part_size {
        match body.next().await {
            Some(chunk) => part.extend_from_slice(&chunk?),
            None => return Ok((part, true)),
        }
    }
    Ok((part, false))
}

/// An open multipart upload, aborted on drop unless completed
struct MultipartUpload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
    finished: bool,
}

impl MultipartUpload {
    async fn send_parts(&mut self, first: Vec<u8>, body: &mut ChunkStream<'_>) -> Result<u64, WorkerError> {
        let mut total = first.len() as u64;
        self.send_part(first).await?;

        loop {
            let (part, exhausted) = next_part(body, PART_SIZE).await?;
            total += part.len() as u64;
            if !part.is_empty() {
                self.send_part(part).await?;
            }
            if exhausted {
                return Ok(total);
            }
        }
    }

    async fn send_part(&mut self, data: Vec<u8>) -> Result<(), WorkerError> {
        let part_number = self.parts.len() as i32 + 1;
        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(transfer_error)?;

        self.parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .set_e_tag(response.e_tag().map(str::to_string))
                .build(),
        );
        Ok(())
    }

    async fn complete(&mut self) -> Result<(), WorkerError> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();

        let result = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await;

        match result {
            Ok(_) => {
                self.finished = true;
                Ok(())
            }
            Err(e) => {
                self.abort().await;
                Err(transfer_error(e))
            }
        }
    }

    async fn abort(&mut self) {
        self.finished = true;
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await;
        if let Err(e) = result {
            warn!(key = %self.key, error = %DisplayErrorContext(&e), "Failed to abort multipart upload");
        }
    }
}

impl Drop for MultipartUpload {
    // Canceled or timed out while streaming
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let request = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id);
        let key = self.key.clone();
        runtime.spawn(async move {
            if let Err(e) = request.send().await {
                warn!(key = %key, error = %DisplayErrorContext(&e), "Failed to abort multipart upload");
            }
        });
    }
}
