use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Any workload kind that embeds a pod template can be backed up. Adapters
/// only expose the template; all reconciliation logic is shared.
pub trait BackupWorkload
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    fn kind_name() -> &'static str {
        std::any::type_name::<Self>().split("::").last().unwrap()
    }

    fn pod_template(&self) -> Option<&PodTemplateSpec>;
    fn set_pod_template(&mut self, template: PodTemplateSpec);
}

impl BackupWorkload for Deployment {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }

    fn set_pod_template(&mut self, template: PodTemplateSpec) {
        if let Some(spec) = self.spec.as_mut() {
            spec.template = template;
        }
    }
}

impl BackupWorkload for DaemonSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }

    fn set_pod_template(&mut self, template: PodTemplateSpec) {
        if let Some(spec) = self.spec.as_mut() {
            spec.template = template;
        }
    }
}

impl BackupWorkload for StatefulSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }

    fn set_pod_template(&mut self, template: PodTemplateSpec) {
        if let Some(spec) = self.spec.as_mut() {
            spec.template = template;
        }
    }
}
