//! Transport configuration adapter
//!
//! Builds the worker transport of a ShardedRedisBackup from its spec and
//! the credentials referenced by it.

use std::sync::Arc;

use kube::Client;

use crate::crd::ShardedRedisBackupSpec;
use crate::error::Result;
use crate::workers::Transport;

use super::s3::S3Store;
use super::secrets::{get_s3_credentials, get_ssh_private_key};
use super::ssh::SshConnector;

/// Fetch credentials and build the SSH + S3 transport
pub async fn build_transport(
    spec: &ShardedRedisBackupSpec,
    client: &Client,
    namespace: &str,
) -> Result<Transport> {
    let private_key = get_ssh_private_key(
        client,
        namespace,
        &spec.ssh_options.private_key_secret_ref.name,
    )
    .await?;

    let credentials = get_s3_credentials(
        client,
        namespace,
        &spec.s3_options.credentials_secret_ref.name,
    )
    .await?;

    let shell = SshConnector::new(
        spec.ssh_options.user.clone(),
        spec.ssh_options.port,
        &private_key,
    )?;
    let store = S3Store::new(&spec.s3_options, credentials);

    Ok(Transport::new(Arc::new(shell), Arc::new(store)))
}
