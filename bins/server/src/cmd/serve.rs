use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use codec_gob::GobCodec;
use codec_msgpack::MsgpackCodec;
use relay::{StoreConnector, relay_queue, spawn_broker_listener};
use relay_api::{EnvelopeCodec, NetworkBroker, RelayError, StoreClient};
use storage_memory::MemoryStore;
use storage_mhist::MhistStore;
use transport_udp::{UdpBroker, UdpBrokerConfig};

use crate::config::{CodecKind, Effective};
use crate::error::ServerError;

const MEMORY_STORE: &str = "memory://";

/// Запас сверх shutdown_grace: задачи сами дренируют broadcast'ы за grace.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

type TaskOutcome = (&'static str, Result<(), ServerError>);

fn build_codec(kind: CodecKind, max_datagram: usize) -> Arc<dyn EnvelopeCodec> {
    match kind {
        CodecKind::Gob => Arc::new(GobCodec::new(max_datagram)),
        CodecKind::Msgpack => Arc::new(MsgpackCodec::new(max_datagram)),
    }
}

async fn connect_store(address: &str) -> Result<Box<dyn StoreClient>, RelayError> {
    if address == MEMORY_STORE {
        tracing::warn!("using in-process memory store, nothing is persisted");
        return Ok(Box::new(MemoryStore::new()));
    }
    Ok(Box::new(MhistStore::connect(address).await?))
}

pub async fn run(eff: &Effective) -> Result<(), ServerError> {
    tracing::info!(
        broadcast_ip = %eff.broadcast_ip,
        port = eff.port,
        store = %eff.store_address,
        filter = %eff.filter,
        codec = ?eff.codec,
        "mesh-relay starting"
    );

    let token = CancellationToken::new();

    // --- Network broker ---
    let codec = build_codec(eff.codec, eff.max_datagram);
    let broker_cfg = UdpBrokerConfig {
        broadcast_ip: eff.broadcast_ip.clone(),
        broadcast_port: eff.port,
        listen_host: eff.listen_host.clone(),
        listen_port: eff.port,
        max_datagram: eff.max_datagram,
    };
    let broker: Arc<dyn NetworkBroker> = Arc::new(UdpBroker::bind(&broker_cfg, codec).await?);

    // --- Store connector ---
    let store = connect_store(&eff.store_address).await?;
    let mut connector = StoreConnector::connect(&*store, &eff.filter, broker.clone(), eff.relay.dispatch).await?;

    // --- Tasks ---
    let (queue_tx, queue_rx) = relay_queue(eff.relay.queue_capacity);
    let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();

    let listener = spawn_broker_listener(broker.clone(), queue_tx, token.clone());
    tasks.spawn(async move {
        let res = match listener.await {
            Ok(res) => res.map_err(ServerError::from),
            Err(e) => Err(ServerError::Task {
                name: "broker listener",
                detail: e.to_string(),
            }),
        };
        ("broker listener", res)
    });

    let relay_token = token.clone();
    tasks.spawn(async move {
        let res = connector.run(queue_rx, relay_token).await;
        ("store connector", res.map_err(ServerError::from))
    });

    tracing::info!(queue_capacity = eff.relay.queue_capacity, "relay ready");

    // --- Ctrl+C или первая фатальная ошибка ---
    let outcome = tokio::select! {
        sig = tokio::signal::ctrl_c() => {
            sig?;
            tracing::info!("shutting down...");
            Ok(())
        }
        Some(done) = tasks.join_next() => settle(done),
    };

    token.cancel();

    let grace = eff.relay.dispatch.shutdown_grace + SHUTDOWN_SLACK;
    let drained = tokio::time::timeout(grace, async {
        while let Some(done) = tasks.join_next().await {
            if let Err(e) = settle(done) {
                tracing::error!(error = %e, "task failed during shutdown");
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(remaining = tasks.len(), "shutdown grace elapsed, aborting tasks");
        tasks.shutdown().await;
    }

    drop(broker);
    drop(store);
    tracing::info!("shutdown complete");
    outcome
}

fn settle(done: Result<TaskOutcome, tokio::task::JoinError>) -> Result<(), ServerError> {
    match done {
        Ok((name, Ok(()))) => {
            tracing::warn!(task = name, "task stopped");
            Ok(())
        }
        Ok((name, Err(e))) => {
            tracing::error!(task = name, error = %e, "task failed");
            Err(e)
        }
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(ServerError::Task {
            name: "relay",
            detail: e.to_string(),
        }),
    }
}
