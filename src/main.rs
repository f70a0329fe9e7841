use crate::backup::BackupEnsurer;
use crate::controller::Context;
use crate::event_filter::EventFilter;
use crate::oci_registry::{BackupRegistry, RegistryClient};
use anyhow::Context as _;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod backup;
mod config;
mod controller;
mod dockerconfig;
mod error;
mod event_filter;
mod image_reference;
mod oci_registry;
mod patch;
mod webserver;
mod workload;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting kube-image-backup {}", env!("CARGO_PKG_VERSION"));

    let config_path = env::var("CONFIG_FILE")
        .unwrap_or_else(|_| "/etc/kube-image-backup/config.yaml".to_string());
    let config = config::load_config(&config_path)?;

    let docker_config = dockerconfig::load(&config.docker_config.path)?;
    let registry: Arc<dyn BackupRegistry> = Arc::new(RegistryClient::new()?);
    let ensurer = BackupEnsurer::new(
        registry,
        config.backup.registry.clone(),
        docker_config,
        &config.docker_config.key,
    );
    let filter = EventFilter::new(config.ignore_namespaces.clone());

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let ready = Arc::new(AtomicBool::new(false));
    let client = controller::create_client().await?;
    ready.store(true, Ordering::Relaxed);

    let ctx = Arc::new(Context {
        client,
        ensurer,
        filter,
    });

    let app = webserver::create_app(webserver::AppState {
        ready: ready.clone(),
    });
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = async {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await
    };

    let (_, _, _, served) = tokio::join!(
        controller::run_controller::<Deployment>(ctx.clone()),
        controller::run_controller::<DaemonSet>(ctx.clone()),
        controller::run_controller::<StatefulSet>(ctx.clone()),
        server,
    );
    served.context("Webserver terminated abnormally")?;

    Ok(())
}
