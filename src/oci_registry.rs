use crate::dockerconfig::RegistryAuth;
use crate::image_reference::ImageReference;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

static MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";
static DEFAULT_MANIFEST_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned status {status}")]
    Status { url: String, status: StatusCode },
    #[error("malformed manifest at {url}: {source}")]
    Manifest {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("upload session for {repository} returned no usable location header")]
    MissingUploadLocation { repository: String },
    #[error("nested image index {digest} is not supported")]
    NestedIndex { digest: String },
}

/// The two registry operations the reconciliation core depends on. Both sides
/// of a copy authenticate independently.
#[async_trait]
pub trait BackupRegistry: Send + Sync {
    async fn reference_exists(
        &self,
        reference: &ImageReference,
        auth: Option<&RegistryAuth>,
    ) -> Result<bool, TransportError>;

    async fn copy_image(
        &self,
        source: &ImageReference,
        destination: &ImageReference,
        source_auth: Option<&RegistryAuth>,
        destination_auth: Option<&RegistryAuth>,
    ) -> Result<(), TransportError>;
}

/// [`BackupRegistry`] implementation against the OCI distribution API.
pub struct RegistryClient {
    http: Client,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

fn manifest_url(reference: &ImageReference, selector: &str) -> String {
    format!(
        "https://{}/v2/{}/manifests/{}",
        reference.registry, reference.repository, selector
    )
}

fn blob_url(reference: &ImageReference, digest: &str) -> String {
    format!(
        "https://{}/v2/{}/blobs/{}",
        reference.registry, reference.repository, digest
    )
}

fn with_auth(builder: RequestBuilder, auth: Option<&RegistryAuth>) -> RequestBuilder {
    match auth {
        Some(auth) => builder.basic_auth(&auth.username, Some(auth.password.expose_secret())),
        None => builder,
    }
}

impl RegistryClient {
    pub fn new() -> anyhow::Result<Self> {
        info!("Initializing OCI registry HTTP client");
        // System certificates are loaded automatically with rustls-tls-native-roots
        let http = Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http })
    }

    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        selector: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<(Vec<u8>, String), TransportError> {
        let url = manifest_url(reference, selector);
        debug!("Fetching manifest from {}", url);
        let response = with_auth(self.http.get(&url), auth)
            .header(ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(|e| TransportError::Request {
                url: url.clone(),
                source: e,
            })?;
        if !response.status().is_success() {
            return Err(TransportError::Status {
                url,
                status: response.status(),
            });
        }
        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(DEFAULT_MANIFEST_TYPE)
            .to_owned();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Request { url, source: e })?;
        Ok((body.to_vec(), media_type))
    }

    async fn put_manifest(
        &self,
        destination: &ImageReference,
        selector: &str,
        media_type: &str,
        body: Vec<u8>,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), TransportError> {
        let url = manifest_url(destination, selector);
        debug!("Pushing manifest to {}", url);
        let response = with_auth(self.http.put(&url), auth)
            .header(CONTENT_TYPE, media_type)
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::Request {
                url: url.clone(),
                source: e,
            })?;
        if !response.status().is_success() {
            return Err(TransportError::Status {
                url,
                status: response.status(),
            });
        }
        Ok(())
    }

    /// Copies a single blob unless the destination already holds it. Blob
    /// pushes are content-addressed, so re-uploads are overwrite-safe.
    async fn ensure_blob(
        &self,
        source: &ImageReference,
        destination: &ImageReference,
        digest: &str,
        source_auth: Option<&RegistryAuth>,
        destination_auth: Option<&RegistryAuth>,
    ) -> Result<(), TransportError> {
        let check_url = blob_url(destination, digest);
        let response = with_auth(self.http.head(&check_url), destination_auth)
            .send()
            .await
            .map_err(|e| TransportError::Request {
                url: check_url.clone(),
                source: e,
            })?;
        match response.status() {
            status if status.is_success() => return Ok(()),
            StatusCode::NOT_FOUND => {}
            status => {
                return Err(TransportError::Status {
                    url: check_url,
                    status,
                })
            }
        }

        let source_url = blob_url(source, digest);
        debug!("Copying blob {} to {}", source_url, destination.repository);
        let response = with_auth(self.http.get(&source_url), source_auth)
            .send()
            .await
            .map_err(|e| TransportError::Request {
                url: source_url.clone(),
                source: e,
            })?;
        if !response.status().is_success() {
            return Err(TransportError::Status {
                url: source_url,
                status: response.status(),
            });
        }
        let data = response
            .bytes()
            .await
            .map_err(|e| TransportError::Request {
                url: source_url.clone(),
                source: e,
            })?;

        let upload_url = format!(
            "https://{}/v2/{}/blobs/uploads/",
            destination.registry, destination.repository
        );
        let response = with_auth(self.http.post(&upload_url), destination_auth)
            .send()
            .await
            .map_err(|e| TransportError::Request {
                url: upload_url.clone(),
                source: e,
            })?;
        if !response.status().is_success() {
            return Err(TransportError::Status {
                url: upload_url,
                status: response.status(),
            });
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| TransportError::MissingUploadLocation {
                repository: destination.repository.clone(),
            })?;
        // The location may be relative to the destination registry
        let location = if location.starts_with("http") {
            location.to_string()
        } else {
            format!("https://{}{}", destination.registry, location)
        };
        let commit_url = if location.contains('?') {
            format!("{}&digest={}", location, digest)
        } else {
            format!("{}?digest={}", location, digest)
        };

        let response = with_auth(self.http.put(&commit_url), destination_auth)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| TransportError::Request {
                url: commit_url.clone(),
                source: e,
            })?;
        if !response.status().is_success() {
            return Err(TransportError::Status {
                url: commit_url,
                status: response.status(),
            });
        }
        Ok(())
    }

    async fn copy_manifest_blobs(
        &self,
        source: &ImageReference,
        destination: &ImageReference,
        manifest: &Manifest,
        source_auth: Option<&RegistryAuth>,
        destination_auth: Option<&RegistryAuth>,
    ) -> Result<(), TransportError> {
        for descriptor in manifest.config.iter().chain(manifest.layers.iter()) {
            self.ensure_blob(
                source,
                destination,
                &descriptor.digest,
                source_auth,
                destination_auth,
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BackupRegistry for RegistryClient {
    async fn reference_exists(
        &self,
        reference: &ImageReference,
        auth: Option<&RegistryAuth>,
    ) -> Result<bool, TransportError> {
        let url = manifest_url(reference, reference.identifier_str());
        let response = with_auth(self.http.head(&url), auth)
            .header(ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(|e| TransportError::Request {
                url: url.clone(),
                source: e,
            })?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(TransportError::Status { url, status }),
        }
    }

    async fn copy_image(
        &self,
        source: &ImageReference,
        destination: &ImageReference,
        source_auth: Option<&RegistryAuth>,
        destination_auth: Option<&RegistryAuth>,
    ) -> Result<(), TransportError> {
        let (body, media_type) = self
            .fetch_manifest(source, source.identifier_str(), source_auth)
            .await?;
        let url = manifest_url(source, source.identifier_str());
        let manifest: Manifest =
            serde_json::from_slice(&body).map_err(|e| TransportError::Manifest {
                url: url.clone(),
                source: e,
            })?;

        if manifest.manifests.is_empty() {
            self.copy_manifest_blobs(source, destination, &manifest, source_auth, destination_auth)
                .await?;
        } else {
            // A multi-platform index: copy every referenced manifest first, so
            // the index never points at content the destination does not hold
            for child in &manifest.manifests {
                let (child_body, child_media_type) = self
                    .fetch_manifest(source, &child.digest, source_auth)
                    .await?;
                let child_url = manifest_url(source, &child.digest);
                let child_manifest: Manifest = serde_json::from_slice(&child_body)
                    .map_err(|e| TransportError::Manifest {
                        url: child_url,
                        source: e,
                    })?;
                if !child_manifest.manifests.is_empty() {
                    return Err(TransportError::NestedIndex {
                        digest: child.digest.clone(),
                    });
                }
                self.copy_manifest_blobs(
                    source,
                    destination,
                    &child_manifest,
                    source_auth,
                    destination_auth,
                )
                .await?;
                self.put_manifest(
                    destination,
                    &child.digest,
                    &child_media_type,
                    child_body,
                    destination_auth,
                )
                .await?;
            }
        }

        self.put_manifest(
            destination,
            destination.identifier_str(),
            &media_type,
            body,
            destination_auth,
        )
        .await?;
        info!(
            "Copied image {}/{} to {}/{}",
            source.registry, source.repository, destination.registry, destination.repository
        );
        Ok(())
    }
}
