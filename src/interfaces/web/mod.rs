pub(crate) mod auth;
mod handlers;
mod router;


use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Result;
use tracing::info;

use crate::config::AppConfig;
use crate::core::credentials::CredentialLifecycle;
use crate::core::interact::InteractionEngine;
use crate::core::publish::PublishPipeline;
use crate::core::scheduler::PostScheduler;
use crate::core::store::ConnectionStore;

/// Everything a handler can reach. Cheap to clone; all heavy state is
/// behind `Arc`s.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<AppConfig>,
    pub store: Arc<ConnectionStore>,
    pub lifecycle: CredentialLifecycle,
    pub pipeline: Arc<PublishPipeline>,
    pub scheduler: PostScheduler,
    pub interact: Arc<InteractionEngine>,
    pub scheduler_running: Arc<AtomicBool>,
}

pub async fn serve(state: AppState) -> Result<()> {
    let addr = state.cfg.bind.clone();
    let app = router::build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
