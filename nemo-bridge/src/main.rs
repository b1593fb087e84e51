/**
 * NEMO BRIDGE - entry point
 *
 * Wires config, tool mappings, the two broker connections and the worker
 * tasks together, then waits for ctrl-c. SIGHUP reloads the tool mappings.
 *
 * Shutdown runs in two phases: workers first (the heartbeat announces
 * offline on its way out), then the broker links disconnect cleanly.
 */

use anyhow::{Context, Result};
use nemo_bridge::aggregator::Aggregator;
use nemo_bridge::connection::{mqtt_options, Backoff, Connection};
use nemo_bridge::heartbeat::{last_will, HealthTracker, Heartbeat};
use nemo_bridge::ingest::{apply_mapping, IngestListener};
use nemo_bridge::normalize::Normalizer;
use nemo_bridge::publisher::{ChangeFeed, DisplayPublisher};
use nemo_bridge::{BridgeConfig, MappingSource, StatusStore, ToolMappingTable, Topics};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // optional .env
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nemo_bridge=info")))
        .init();

    info!("NEMO bridge starting");

    let config = BridgeConfig::load().context("invalid bridge configuration")?;
    let topics = Topics::from_config(&config.topics);

    let source = MappingSource::from_config(&config.mapping);
    let mapping = Arc::new(
        ToolMappingTable::load(source)
            .await
            .context("failed to load tool mappings")?,
    );

    let store = Arc::new(StatusStore::new());
    let display_feed = Arc::new(ChangeFeed::with_capacity(config.queue_capacity));
    let aggregate = Arc::new(Notify::new());

    // broker links
    let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_capacity);
    let ingest_conn = Connection::new(
        "ingest",
        mqtt_options(&config.ingest, None),
        topics.ingest_subscriptions(),
        Backoff::from_config(&config.reconnect),
        config.timeouts.connect(),
    )
    .with_inbound(inbound_tx);
    let display_conn = Connection::new(
        "display",
        mqtt_options(&config.display, Some(last_will(&topics))),
        Vec::new(),
        Backoff::from_config(&config.reconnect),
        config.timeouts.connect(),
    );
    let display_client = display_conn.client();
    let ingest_health = ingest_conn.health();
    let display_health = display_conn.health();

    let (stop_links_tx, stop_links_rx) = watch::channel(false);
    let (stop_workers_tx, stop_workers_rx) = watch::channel(false);

    let links: Vec<JoinHandle<()>> = vec![
        tokio::spawn(ingest_conn.run(stop_links_rx.clone())),
        tokio::spawn(display_conn.run(stop_links_rx)),
    ];

    // workers
    let listener = IngestListener::new(
        topics.clone(),
        mapping.clone(),
        store.clone(),
        Normalizer::new(config.display_format.utc_offset()),
        display_feed.clone(),
        aggregate.clone(),
    );
    let publisher = DisplayPublisher::new(
        display_client.clone(),
        store.clone(),
        display_feed.clone(),
        topics.clone(),
        config.display_format.max_name_length,
        config.timeouts.publish(),
    );
    let aggregator = Aggregator::new(
        display_client.clone(),
        store.clone(),
        &topics,
        Duration::from_secs(config.aggregate_interval_secs),
        config.timeouts.publish(),
        aggregate,
    );
    let heartbeat = Heartbeat::new(
        display_client,
        HealthTracker::new(store.clone(), mapping.clone(), ingest_health, display_health.clone()),
        &topics,
        Duration::from_secs(config.heartbeat_interval_secs),
        config.timeouts.publish(),
    );

    // the listener ends when the ingest link drops its sender
    let listener_task = tokio::spawn(listener.run(inbound_rx));
    let workers: Vec<JoinHandle<()>> = vec![
        tokio::spawn(publisher.run(display_health.subscribe(), stop_workers_rx.clone())),
        tokio::spawn(aggregator.run(stop_workers_rx.clone())),
        tokio::spawn(heartbeat.run(stop_workers_rx)),
    ];

    wait_for_shutdown(mapping, store, display_feed).await;
    info!("shutdown requested");

    stop_workers_tx.send_replace(true);
    join_all("workers", workers).await;
    stop_links_tx.send_replace(true);
    join_all("links", links).await;
    join_all("ingest", vec![listener_task]).await;

    info!("NEMO bridge stopped");
    Ok(())
}

async fn join_all(group: &str, handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(group, error = %e, "task panicked"),
            Err(_) => warn!(group, "task did not stop in time"),
        }
    }
}

/// Returns on ctrl-c. SIGHUP reloads the mapping table in place and moves
/// renamed tools to their new display topics.
#[cfg(unix)]
async fn wait_for_shutdown(mapping: Arc<ToolMappingTable>, store: Arc<StatusStore>, display_feed: Arc<ChangeFeed>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "SIGHUP handler unavailable, mapping reload disabled");
            None
        }
    };
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!(error = %e, "ctrl-c handler failed");
                }
                return;
            }
            Some(()) = async { match hangup.as_mut() { Some(h) => h.recv().await, None => std::future::pending().await } } => {
                match mapping.reload().await {
                    Ok(_) => {
                        let moved = apply_mapping(&store, &mapping, &display_feed);
                        info!(moved, "stored tools re-identified");
                    }
                    Err(e) => error!(error = %e, "mapping reload failed, keeping previous table"),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_mapping: Arc<ToolMappingTable>, _store: Arc<StatusStore>, _display_feed: Arc<ChangeFeed>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "ctrl-c handler failed");
    }
}
