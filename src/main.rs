mod config;
mod core;
mod interfaces;
mod logging;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Result, anyhow};
use tokio::sync::Mutex;
use tokio_cron_scheduler::JobScheduler;

use crate::config::AppConfig;
use crate::core::credentials::CredentialLifecycle;
use crate::core::graph::{GraphClient, PlatformClient};
use crate::core::interact::InteractionEngine;
use crate::core::interact::compose::{
    CannedComposer, ChatCompletionComposer, DraftComposer, NoFanMemory,
};
use crate::core::media::{MediaMirror, SignedUploadMirror};
use crate::core::notify::Notifier;
use crate::core::publish::{FallbackCredential, PublishPipeline};
use crate::core::scheduler::PostScheduler;
use crate::core::store::{ConnectionStore, Db};
use crate::interfaces::web::{AppState, serve};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cfg = Arc::new(AppConfig::from_env());

    let db = Db::open(cfg.data_dir.join("prism.db"))?;
    let store = Arc::new(ConnectionStore::open(db.clone()).await?);
    store.seed_from_config(&cfg).await;

    let client: Arc<dyn PlatformClient> = Arc::new(GraphClient::new(&cfg)?);
    let mirror: Option<Arc<dyn MediaMirror>> = SignedUploadMirror::from_config(&cfg)?
        .map(|m| Arc::new(m) as Arc<dyn MediaMirror>);
    let notifier = Arc::new(Notifier::from_config(&cfg));

    let sched = Arc::new(Mutex::new(
        JobScheduler::new().await.map_err(|e| anyhow!("{e}"))?,
    ));

    let pipeline = Arc::new(PublishPipeline::new(
        client.clone(),
        store.clone(),
        mirror,
        FallbackCredential::from_config(&cfg),
    ));

    let scheduler = PostScheduler::new(db.clone(), sched.clone(), pipeline.clone());
    scheduler.recover().await?;

    let lifecycle = CredentialLifecycle::new(
        cfg.clone(),
        client.clone(),
        store.clone(),
        notifier,
        sched.clone(),
    );
    lifecycle.register_stored_renewals().await;

    let composer: Arc<dyn DraftComposer> = match ChatCompletionComposer::from_config(&cfg) {
        Some(c) => Arc::new(c),
        None => Arc::new(CannedComposer),
    };
    let interact = Arc::new(InteractionEngine::new(
        db,
        store.clone(),
        client,
        composer,
        Arc::new(NoFanMemory),
        cfg.default_persona.clone(),
    ));

    sched
        .lock()
        .await
        .start()
        .await
        .map_err(|e| anyhow!("{e}"))?;
    let scheduler_running = Arc::new(AtomicBool::new(true));

    serve(AppState {
        cfg,
        store,
        lifecycle,
        pipeline,
        scheduler,
        interact,
        scheduler_running,
    })
    .await
}
