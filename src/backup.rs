use crate::dockerconfig::{DockerConfig, RegistryAuth};
use crate::error::Error;
use crate::image_reference::{Identifier, ImageReference};
use crate::oci_registry::BackupRegistry;
use std::sync::Arc;
use tracing::{debug, info};

/// Maps a source reference onto its identity under the backup registry root.
///
/// The repository path is flattened into a single segment by replacing every
/// `/` with `_`, and a path already under the root is left alone, so the
/// mapping is idempotent. Pure string work, no network.
pub fn backup_reference(root: &str, source: &ImageReference) -> String {
    let root = format!("{}/", root.trim_end_matches('/'));
    let repository = source
        .repository
        .strip_prefix(root.as_str())
        .unwrap_or(&source.repository);
    let flattened = repository.replace('/', "_");
    match &source.identifier {
        Identifier::Tag(tag) => format!("{}{}:{}", root, flattened, tag),
        Identifier::Digest(digest) => format!("{}{}@{}", root, flattened, digest),
    }
}

/// Guarantees a backup copy of an image exists and answers with the reference
/// workloads should use from now on. Copies only when the backup registry does
/// not already hold the reference, so repeat calls cost a single existence
/// check. Holds no mutable state; safe to share across reconciles.
pub struct BackupEnsurer {
    registry: Arc<dyn BackupRegistry>,
    backup_root: String,
    docker_config: DockerConfig,
    backup_auth: Option<RegistryAuth>,
}

impl BackupEnsurer {
    pub fn new(
        registry: Arc<dyn BackupRegistry>,
        backup_root: String,
        docker_config: DockerConfig,
        backup_auth_key: &str,
    ) -> Self {
        let backup_auth = docker_config.auth_for(backup_auth_key).cloned();
        Self {
            registry,
            backup_root,
            docker_config,
            backup_auth,
        }
    }

    pub async fn ensure_backup(&self, image: &str) -> Result<String, Error> {
        let source = ImageReference::parse(image).map_err(|e| Error::ReferenceParse {
            image: image.to_string(),
            source: e,
        })?;
        let backup = backup_reference(&self.backup_root, &source);
        // Rewriting a valid reference yields a valid reference; this parse
        // only exists to hand the structured form to the registry client
        let backup_ref = ImageReference::parse(&backup).map_err(|e| Error::ReferenceParse {
            image: backup.clone(),
            source: e,
        })?;

        let exists = self
            .registry
            .reference_exists(&backup_ref, self.backup_auth.as_ref())
            .await
            .map_err(|e| Error::RegistryTransport {
                reference: backup.clone(),
                source: e,
            })?;

        if exists {
            debug!("Image {} already present in backup registry", backup);
        } else {
            info!("Creating backup {} for image {}", backup, image);
            let source_auth = self.docker_config.auth_for_host(&source.registry);
            self.registry
                .copy_image(&source, &backup_ref, source_auth, self.backup_auth.as_ref())
                .await
                .map_err(|e| Error::RegistryTransport {
                    reference: backup.clone(),
                    source: e,
                })?;
            info!("Finished backup for image {}", image);
        }

        Ok(backup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci_registry::TransportError;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeRegistry {
        exists: bool,
        fail_exists: bool,
        exists_calls: AtomicUsize,
        copy_calls: AtomicUsize,
    }

    #[async_trait]
    impl BackupRegistry for FakeRegistry {
        async fn reference_exists(
            &self,
            _reference: &ImageReference,
            _auth: Option<&RegistryAuth>,
        ) -> Result<bool, TransportError> {
            self.exists_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_exists {
                return Err(TransportError::Status {
                    url: "https://example.invalid".to_string(),
                    status: StatusCode::UNAUTHORIZED,
                });
            }
            Ok(self.exists)
        }

        async fn copy_image(
            &self,
            _source: &ImageReference,
            _destination: &ImageReference,
            _source_auth: Option<&RegistryAuth>,
            _destination_auth: Option<&RegistryAuth>,
        ) -> Result<(), TransportError> {
            self.copy_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ensurer(registry: Arc<FakeRegistry>) -> BackupEnsurer {
        BackupEnsurer::new(
            registry,
            "imageclonebackupregistry/".to_string(),
            DockerConfig::default(),
            "dockerhub",
        )
    }

    fn rewrite(root: &str, image: &str) -> String {
        backup_reference(root, &ImageReference::parse(image).unwrap())
    }

    #[test]
    fn test_backup_reference_short_image() {
        assert_eq!(
            rewrite("imageclonebackupregistry/", "nginx:latest"),
            "imageclonebackupregistry/library_nginx:latest"
        );
    }

    #[test]
    fn test_backup_reference_nested_image() {
        assert_eq!(
            rewrite("imageclonebackupregistry/", "simontheleg/debug-pod:latest"),
            "imageclonebackupregistry/simontheleg_debug-pod:latest"
        );
    }

    #[test]
    fn test_backup_reference_foreign_registry() {
        assert_eq!(
            rewrite(
                "imageclonebackupregistry/",
                "quay.io/prometheus/node-exporter:v1.2.2"
            ),
            "imageclonebackupregistry/prometheus_node-exporter:v1.2.2"
        );
    }

    #[test]
    fn test_backup_reference_already_backed_up() {
        assert_eq!(
            rewrite(
                "imageclonebackupregistry/",
                "imageclonebackupregistry/simontheleg_debug-pod:latest"
            ),
            "imageclonebackupregistry/simontheleg_debug-pod:latest"
        );
    }

    #[test]
    fn test_backup_reference_root_without_separator() {
        assert_eq!(
            rewrite("imageclonebackupregistry", "nginx:latest"),
            rewrite("imageclonebackupregistry/", "nginx:latest")
        );
    }

    #[test]
    fn test_backup_reference_is_idempotent() {
        let root = "imageclonebackupregistry/";
        for image in [
            "nginx:latest",
            "simontheleg/debug-pod:latest",
            "quay.io/prometheus/node-exporter:v1.2.2",
        ] {
            let once = rewrite(root, image);
            assert_eq!(rewrite(root, &once), once);
        }
    }

    #[test]
    fn test_backup_reference_keeps_digest_separator() {
        assert_eq!(
            rewrite("imageclonebackupregistry/", "foo/bar@sha256:0123abcd"),
            "imageclonebackupregistry/foo_bar@sha256:0123abcd"
        );
    }

    #[tokio::test]
    async fn test_ensure_backup_skips_copy_when_present() {
        let registry = Arc::new(FakeRegistry {
            exists: true,
            ..Default::default()
        });
        let ensurer = ensurer(registry.clone());

        let reference = ensurer
            .ensure_backup("simontheleg/debug-pod:latest")
            .await
            .unwrap();

        assert_eq!(
            reference,
            "imageclonebackupregistry/simontheleg_debug-pod:latest"
        );
        assert_eq!(registry.exists_calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.copy_calls.load(Ordering::SeqCst), 0);

        // A repeat call performs exactly one more existence check, nothing else
        ensurer
            .ensure_backup("simontheleg/debug-pod:latest")
            .await
            .unwrap();
        assert_eq!(registry.exists_calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.copy_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ensure_backup_copies_when_absent() {
        let registry = Arc::new(FakeRegistry::default());
        let ensurer = ensurer(registry.clone());

        let reference = ensurer.ensure_backup("nginx:latest").await.unwrap();

        assert_eq!(reference, "imageclonebackupregistry/library_nginx:latest");
        assert_eq!(registry.exists_calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.copy_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_backup_propagates_transport_error() {
        let registry = Arc::new(FakeRegistry {
            fail_exists: true,
            ..Default::default()
        });
        let ensurer = ensurer(registry.clone());

        let error = ensurer.ensure_backup("nginx:latest").await.unwrap_err();
        assert!(matches!(error, Error::RegistryTransport { .. }));
        assert_eq!(registry.copy_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ensure_backup_rejects_malformed_reference() {
        let registry = Arc::new(FakeRegistry::default());
        let ensurer = ensurer(registry.clone());

        let error = ensurer.ensure_backup("not a reference").await.unwrap_err();
        assert!(matches!(error, Error::ReferenceParse { .. }));
        assert_eq!(registry.exists_calls.load(Ordering::SeqCst), 0);
    }
}
