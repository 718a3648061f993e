//! swarmgate daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{error, info};
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod admin;
mod alerts;
mod config;
mod notify;
mod orchestrator;
mod reconcile;
mod state;
mod supervisor;
mod sync;
mod tunnel;
mod types;

use alerts::AlertPipeline;
use config::Config;
use notify::{Notifier, PushoverNotifier};
use orchestrator::{DockerOrchestrator, Orchestrator};
use reconcile::RemovalReconciler;
use state::{HostnameRegistry, IngressCache, PendingRemovals, RecentEvents};
use supervisor::StreamSupervisor;
use sync::SyncEngine;
use tunnel::{CloudflareEdge, TunnelEdge};
use types::EventFilter;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cfg = Config::load()?;

    let docker = DockerOrchestrator::connect()?;
    // Fail fast at startup on an unreachable daemon.
    docker.ping().await?;
    let orchestrator: Arc<dyn Orchestrator> = Arc::new(docker);

    let edge: Arc<dyn TunnelEdge> = Arc::new(CloudflareEdge::new(
        &cfg.api_key,
        &cfg.api_email,
        cfg.account_id.clone(),
        cfg.tunnel_id.clone(),
    )?);
    let notifier: Arc<dyn Notifier> = Arc::new(PushoverNotifier::new(
        cfg.pushover_api_key.clone(),
        cfg.pushover_recipient.clone(),
    ));

    let cache = Arc::new(IngressCache::new());
    let registry = Arc::new(HostnameRegistry::default());
    let pending = Arc::new(PendingRemovals::default());
    let recent = Arc::new(RecentEvents::default());

    let sync_engine = Arc::new(SyncEngine::new(
        orchestrator.clone(),
        edge.clone(),
        cache.clone(),
        registry.clone(),
        pending.clone(),
    ));
    let reconciler = Arc::new(RemovalReconciler::new(
        orchestrator.clone(),
        edge.clone(),
        cache.clone(),
        registry.clone(),
        pending.clone(),
        cfg.removal_delay(),
        cfg.delete_dns_on_removal,
    ));
    let alert_pipeline = Arc::new(AlertPipeline::new(notifier, recent));

    let cancel = CancellationToken::new();
    let supervisor = Arc::new(StreamSupervisor::new(orchestrator.clone()));

    let mut tasks = Vec::new();
    {
        let supervisor = supervisor.clone();
        let handler = sync_engine.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            supervisor
                .run("service sync stream", EventFilter::service_changes(), handler, cancel)
                .await;
        }));
    }
    {
        let supervisor = supervisor.clone();
        let handler = reconciler.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            supervisor
                .run(
                    "service removal stream",
                    EventFilter::service_removals(),
                    handler,
                    cancel,
                )
                .await;
        }));
    }
    {
        let supervisor = supervisor.clone();
        let handler = alert_pipeline.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            supervisor
                .run(
                    "container event stream",
                    EventFilter::container_anomalies(),
                    handler,
                    cancel,
                )
                .await;
        }));
    }
    {
        let reconciler = reconciler.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move { reconciler.run(cancel).await }));
    }
    {
        let alert_pipeline = alert_pipeline.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(
            async move { alert_pipeline.run_sweeper(cancel).await },
        ));
    }

    let router = admin::router(orchestrator.clone(), cfg.auth_token.clone());
    let mut admin_task = tokio::spawn(admin::serve(router, cfg.http_port, cancel.clone()));

    info!("swarmgate started");

    let shutdown_err = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received shutdown signal, draining");
            None
        }
        result = &mut admin_task => {
            Some(match result {
                Ok(Ok(())) => anyhow::anyhow!("admin listener exited unexpectedly"),
                Ok(Err(e)) => e,
                Err(e) => anyhow::anyhow!("admin task panicked: {e}"),
            })
        }
    };

    cancel.cancel();

    // Engine tasks stop on signal receipt; the listener drains in-flight
    // requests. Nothing persistent needs flushing. The admin handle has
    // already yielded on the fatal-listener path and must not be polled
    // again.
    let await_admin = shutdown_err.is_none();
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
        if await_admin {
            let _ = admin_task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
        error!("shutdown deadline exceeded, exiting anyway");
    }

    match shutdown_err {
        Some(err) => Err(err),
        None => {
            info!("shutdown complete");
            Ok(())
        }
    }
}
