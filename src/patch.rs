use crate::backup::BackupEnsurer;
use crate::error::Error;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use tracing::debug;

/// Outcome of running the patch engine over a pod template. `template` is an
/// independent copy of the input; the caller can compare it against the
/// original without the two sharing storage.
#[derive(Debug)]
pub struct TemplatePatch {
    pub changed: bool,
    pub template: PodTemplateSpec,
}

/// Walks init containers, then containers, in their original order and swaps
/// every image reference for its backup counterpart. The first ensurer error
/// aborts the walk; the half-built copy is dropped, never returned.
pub async fn patch_template(
    ensurer: &BackupEnsurer,
    template: &PodTemplateSpec,
) -> Result<TemplatePatch, Error> {
    let mut patched = template.clone();
    let mut changed = false;

    if let Some(spec) = patched.spec.as_mut() {
        let init_containers = spec.init_containers.iter_mut().flatten();
        let containers = spec.containers.iter_mut();
        for container in init_containers.chain(containers) {
            let Some(image) = container.image.clone() else {
                continue;
            };
            let backup = ensurer.ensure_backup(&image).await?;
            if backup != image {
                debug!(
                    "Rewriting container {} image {} to {}",
                    container.name, image, backup
                );
                changed = true;
                container.image = Some(backup);
            }
        }
    }

    Ok(TemplatePatch { changed, template: patched })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dockerconfig::{DockerConfig, RegistryAuth};
    use crate::image_reference::ImageReference;
    use crate::oci_registry::{BackupRegistry, TransportError};
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Registry double where every backup reference already exists; `fail_after`
    /// makes the nth existence check blow up.
    #[derive(Default)]
    struct FakeRegistry {
        fail_after: Option<usize>,
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
            let call = self.exists_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_after.is_some_and(|n| call >= n) {
                return Err(TransportError::Status {
                    url: "https://example.invalid".to_string(),
                    status: StatusCode::BAD_GATEWAY,
                });
            }
            Ok(true)
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

    fn template_from_images(images: &[&str], init_images: &[&str]) -> PodTemplateSpec {
        let container = |image: &&str| Container {
            image: Some(image.to_string()),
            ..Default::default()
        };
        PodTemplateSpec {
            spec: Some(PodSpec {
                containers: images.iter().map(container).collect(),
                init_containers: Some(init_images.iter().map(container).collect()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn images_of(template: &PodTemplateSpec) -> (Vec<String>, Vec<String>) {
        let spec = template.spec.as_ref().unwrap();
        let images = spec
            .containers
            .iter()
            .map(|c| c.image.clone().unwrap())
            .collect();
        let init_images = spec
            .init_containers
            .iter()
            .flatten()
            .map(|c| c.image.clone().unwrap())
            .collect();
        (images, init_images)
    }

    #[tokio::test]
    async fn test_image_to_patch_no_init_containers() {
        let registry = Arc::new(FakeRegistry::default());
        let template = template_from_images(&["simontheleg/debug-pod:latest"], &[]);

        let patch = patch_template(&ensurer(registry), &template).await.unwrap();

        assert!(patch.changed);
        let (images, init_images) = images_of(&patch.template);
        assert_eq!(
            images,
            vec!["imageclonebackupregistry/simontheleg_debug-pod:latest"]
        );
        assert!(init_images.is_empty());
    }

    #[tokio::test]
    async fn test_nothing_to_patch() {
        let registry = Arc::new(FakeRegistry::default());
        let template = template_from_images(
            &["imageclonebackupregistry/simontheleg_debug-pod:latest"],
            &["imageclonebackupregistry/istio_proxy-init:1.0.2"],
        );

        let patch = patch_template(&ensurer(registry.clone()), &template)
            .await
            .unwrap();

        assert!(!patch.changed);
        assert_eq!(patch.template, template);
        // Still one existence check per image, never a copy
        assert_eq!(registry.exists_calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.copy_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mix_of_containers_and_init_containers() {
        let registry = Arc::new(FakeRegistry::default());
        let template = template_from_images(
            &[
                "simontheleg/debug-pod:latest",
                "imageclonebackupregistry/library_nginx:latest",
            ],
            &[
                "imageclonebackupregistry/istio_proxy-init:1.0.2",
                "quay.io/prometheus/node-exporter:v1.2.2",
            ],
        );

        let patch = patch_template(&ensurer(registry), &template).await.unwrap();

        assert!(patch.changed);
        let (images, init_images) = images_of(&patch.template);
        assert_eq!(
            images,
            vec![
                "imageclonebackupregistry/simontheleg_debug-pod:latest",
                "imageclonebackupregistry/library_nginx:latest",
            ]
        );
        assert_eq!(
            init_images,
            vec![
                "imageclonebackupregistry/istio_proxy-init:1.0.2",
                "imageclonebackupregistry/prometheus_node-exporter:v1.2.2",
            ]
        );
    }

    #[tokio::test]
    async fn test_input_template_is_never_mutated() {
        let registry = Arc::new(FakeRegistry::default());
        let template = template_from_images(&["nginx:latest"], &["busybox:1.36"]);
        let snapshot = template.clone();

        let patch = patch_template(&ensurer(registry), &template).await.unwrap();

        assert!(patch.changed);
        assert_eq!(template, snapshot);
        assert_ne!(patch.template, template);
    }

    #[tokio::test]
    async fn test_first_error_stops_the_walk() {
        let registry = Arc::new(FakeRegistry {
            fail_after: Some(1),
            ..Default::default()
        });
        let template = template_from_images(
            &["nginx:latest", "busybox:1.36", "redis:7"],
            &[],
        );

        let error = patch_template(&ensurer(registry.clone()), &template)
            .await
            .unwrap_err();

        assert!(matches!(error, Error::RegistryTransport { .. }));
        // The second check failed, so the third image was never attempted
        assert_eq!(registry.exists_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_containers_without_image_are_skipped() {
        let registry = Arc::new(FakeRegistry::default());
        let template = PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container::default()],
                ..Default::default()
            }),
            ..Default::default()
        };

        let patch = patch_template(&ensurer(registry.clone()), &template)
            .await
            .unwrap();

        assert!(!patch.changed);
        assert_eq!(registry.exists_calls.load(Ordering::SeqCst), 0);
    }
}
