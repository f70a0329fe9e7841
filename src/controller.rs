use crate::backup::BackupEnsurer;
use crate::error::Error;
use crate::event_filter::{EventFilter, EventKind};
use crate::patch::patch_template;
use crate::workload::BackupWorkload;
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::PostParams;
use kube::runtime::controller::{Action, Controller};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const REQUEUE_AFTER: Duration = Duration::from_secs(30);

/// Read-only collaborators shared by all workload controllers.
pub struct Context {
    pub client: Client,
    pub ensurer: BackupEnsurer,
    pub filter: EventFilter,
}

pub async fn create_client() -> anyhow::Result<Client> {
    let client = Client::try_default().await?;
    let version = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server version {}.{} (default namespace {})",
        version.major,
        version.minor,
        client.default_namespace()
    );
    Ok(client)
}

/// Get/update seam over the cluster state store, so the reconcile logic is a
/// function of the current object and its injected collaborators.
#[async_trait]
pub trait WorkloadStore<K>: Send + Sync {
    /// Fetches the current object, `None` when it no longer exists.
    async fn get(&self, name: &str) -> Result<Option<K>, kube::Error>;

    /// Full-object update.
    async fn update(&self, name: &str, object: &K) -> Result<(), kube::Error>;
}

struct ApiStore<K> {
    api: Api<K>,
}

#[async_trait]
impl<K: BackupWorkload> WorkloadStore<K> for ApiStore<K> {
    async fn get(&self, name: &str) -> Result<Option<K>, kube::Error> {
        self.api.get_opt(name).await
    }

    async fn update(&self, name: &str, object: &K) -> Result<(), kube::Error> {
        self.api
            .replace(name, &PostParams::default(), object)
            .await
            .map(|_| ())
    }
}

/// One reconcile pass: fetch, patch, write back only when something changed.
/// Re-running against converged state performs no writes, so the external
/// delivery layer can redeliver freely.
pub async fn reconcile_workload<K: BackupWorkload>(
    store: &dyn WorkloadStore<K>,
    ensurer: &BackupEnsurer,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    let kind = K::kind_name();
    let key = format!("{}/{}", namespace, name);

    let current = store.get(name).await.map_err(|e| Error::ObjectFetch {
        kind: kind.to_string(),
        key: key.clone(),
        source: e,
    })?;
    let Some(mut object) = current else {
        // Already deleted, nothing left to mirror
        debug!("{} {} is gone, skipping", kind, key);
        return Ok(());
    };

    let Some(template) = object.pod_template() else {
        debug!("{} {} carries no pod template", kind, key);
        return Ok(());
    };

    let patch = patch_template(ensurer, template).await?;
    if patch.changed {
        info!("Patch required for {} {}", kind, key);
        object.set_pod_template(patch.template);
        store
            .update(name, &object)
            .await
            .map_err(|e| Error::ObjectUpdate {
                kind: kind.to_string(),
                key,
                source: e,
            })?;
    } else {
        info!("No patch required for {} {}", kind, key);
    }
    Ok(())
}

/// Entry point invoked by the kube runtime. The runtime collapses create,
/// update, and generic notifications into a single delivery; deletions only
/// surface as a failed fetch inside [`reconcile_workload`].
pub async fn reconcile<K: BackupWorkload>(
    object: Arc<K>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = object.name_any();
    let namespace = object.namespace().unwrap_or_default();

    if !ctx.filter.admits(EventKind::Update, &namespace) {
        debug!(
            "Skipping {} {}/{} in ignored namespace",
            K::kind_name(),
            namespace,
            name
        );
        return Ok(Action::await_change());
    }

    let store: ApiStore<K> = ApiStore {
        api: Api::namespaced(ctx.client.clone(), &namespace),
    };
    reconcile_workload(&store, &ctx.ensurer, &namespace, &name).await?;
    Ok(Action::await_change())
}

pub fn error_policy<K: BackupWorkload>(object: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        "Reconcile of {} {} failed: {}",
        K::kind_name(),
        object.name_any(),
        error
    );
    match error {
        // The same malformed string cannot parse on a retry; the next change
        // to the object retriggers on its own
        Error::ReferenceParse { .. } => Action::await_change(),
        _ => Action::requeue(REQUEUE_AFTER),
    }
}

/// Runs the controller for one workload kind until shutdown.
pub async fn run_controller<K: BackupWorkload>(ctx: Arc<Context>) {
    let api: Api<K> = Api::all(ctx.client.clone());
    let watch_config = ctx.filter.watch_config();
    info!("Starting {} controller", K::kind_name());
    Controller::new(api, watch_config)
        .shutdown_on_signal()
        .run(reconcile::<K>, error_policy::<K>, ctx)
        .for_each(|result| async {
            match result {
                Ok((object, _)) => debug!("Reconciled {}", object.name),
                Err(error) => warn!("Reconciliation error: {:?}", error),
            }
        })
        .await;
    info!("{} controller shut down", K::kind_name());
}
