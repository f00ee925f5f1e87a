//! Secret fetching utilities for Kubernetes secrets

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

use crate::error::{Error, Result};

/// Secret type required for SSH private keys
pub const SSH_AUTH_SECRET_TYPE: &str = "kubernetes.io/ssh-auth";

/// Key holding the private key in an ssh-auth secret
pub const SSH_PRIVATE_KEY: &str = "ssh-privatekey";

/// Key holding the AWS access key ID
pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";

/// Key holding the AWS secret access key
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";

/// Fetch a secret from Kubernetes
pub async fn get_secret(client: &Client, name: &str, namespace: &str) -> Result<Secret> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    secrets
        .get(name)
        .await
        .map_err(|e| match e {
            kube::Error::Api(api_err) if api_err.code == 404 => {
                Error::SecretNotFound(format!("{}/{}", namespace, name))
            }
            other => Error::Kube(other),
        })
}

/// Get a string value from a secret
pub fn get_secret_string(secret: &Secret, key: &str) -> Result<String> {
    let data = secret
        .data
        .as_ref()
        .ok_or_else(|| Error::SecretKeyNotFound {
            secret: secret.metadata.name.clone().unwrap_or_default(),
            key: key.to_string(),
        })?;

    let bytes = data.get(key).ok_or_else(|| Error::SecretKeyNotFound {
        secret: secret.metadata.name.clone().unwrap_or_default(),
        key: key.to_string(),
    })?;

    String::from_utf8(bytes.0.clone()).map_err(|e| {
        Error::Config(format!(
            "Invalid UTF-8 in secret key '{}': {}",
            key, e
        ))
    })
}

/// Extract the private key of an ssh-auth secret
pub fn ssh_private_key(secret: &Secret) -> Result<String> {
    if secret.type_.as_deref() != Some(SSH_AUTH_SECRET_TYPE) {
        return Err(Error::config(format!(
            "secret {} must be of '{}' type",
            secret.metadata.name.clone().unwrap_or_default(),
            SSH_AUTH_SECRET_TYPE
        )));
    }
    get_secret_string(secret, SSH_PRIVATE_KEY)
}

/// Fetch the SSH private key from a Kubernetes secret
pub async fn get_ssh_private_key(client: &Client, namespace: &str, secret_name: &str) -> Result<String> {
    let secret = get_secret(client, secret_name, namespace).await?;
    ssh_private_key(&secret)
}

/// S3 access credentials
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Fetch S3 credentials from a Kubernetes secret
pub async fn get_s3_credentials(client: &Client, namespace: &str, secret_name: &str) -> Result<S3Credentials> {
    let secret = get_secret(client, secret_name, namespace).await?;
    let access_key_id = get_secret_string(&secret, AWS_ACCESS_KEY_ID)?;
    let secret_access_key = get_secret_string(&secret, AWS_SECRET_ACCESS_KEY)?;
    Ok(S3Credentials {
        access_key_id,
        secret_access_key,
    })
}
