use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use relay_api::{
    Envelope, ErrorKind, Filter, MeasurementSubscription, MeasurementWriter, NetworkBroker,
    Policy, RelayError, StoreClient,
};

use crate::config::DispatchConfig;
use crate::dispatch::BroadcastDispatcher;

// ═══════════════════════════════════════════════════════════════
//  ConnectorState
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Connecting,
    Connected,
    /// Терминальное: поток подписки сломан или фатальная ошибка broadcast.
    Failed,
}

impl std::fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectorState::Connecting => "connecting",
            ConnectorState::Connected => "connected",
            ConnectorState::Failed => "failed",
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  StoreConnector
// ═══════════════════════════════════════════════════════════════

/// Связка store ↔ mesh-сеть.
///
/// `listen`: подписка store → broadcast (конкурентно, без ожидания).
/// `update`: очередь из сети → write stream store (строго по порядку).
/// Обе половины работают на непересекающихся полях и могут
/// выполняться одновременно через [`StoreConnector::run`].
pub struct StoreConnector {
    subscription: Box<dyn MeasurementSubscription>,
    writer: Box<dyn MeasurementWriter>,
    dispatcher: BroadcastDispatcher,
    shutdown_grace: std::time::Duration,
    state: watch::Sender<ConnectorState>,
}

impl StoreConnector {
    /// Подписаться на `filter` и открыть write stream.
    /// Любая ошибка: `Connection`; ничего не удерживается.
    pub async fn connect(
        client: &dyn StoreClient,
        filter: &Filter,
        broker: Arc<dyn NetworkBroker>,
        dispatch: DispatchConfig,
    ) -> Result<Self, RelayError> {
        let state = watch::Sender::new(ConnectorState::Connecting);

        let subscription = client.subscribe(filter).await.map_err(as_connection)?;
        let writer = client.open_write_stream().await.map_err(as_connection)?;

        state.send_replace(ConnectorState::Connected);
        tracing::info!(filter = %filter, broker = broker.name(), "store connector connected");

        Ok(Self {
            subscription,
            writer,
            dispatcher: BroadcastDispatcher::new(broker, dispatch),
            shutdown_grace: dispatch.shutdown_grace,
            state,
        })
    }

    pub fn state(&self) -> ConnectorState {
        *self.state.borrow()
    }

    pub async fn listen(&mut self, token: CancellationToken) -> Result<(), RelayError> {
        listen_loop(
            &mut *self.subscription,
            &mut self.dispatcher,
            self.shutdown_grace,
            &self.state,
            token,
        )
        .await
    }

    pub async fn update(&mut self, queue: mpsc::Receiver<Envelope>, token: CancellationToken) -> Result<(), RelayError> {
        update_loop(&mut *self.writer, queue, token).await
    }

    /// `listen` и `update` одновременно. Первая фатальная ошибка
    /// останавливает обе половины и возвращается.
    pub async fn run(&mut self, queue: mpsc::Receiver<Envelope>, token: CancellationToken) -> Result<(), RelayError> {
        let Self {
            subscription,
            writer,
            dispatcher,
            shutdown_grace,
            state,
        } = self;

        let listen = listen_loop(&mut **subscription, dispatcher, *shutdown_grace, state, token.clone());
        let update = update_loop(&mut **writer, queue, token);
        tokio::try_join!(listen, update).map(|_| ())
    }
}

fn as_connection(e: RelayError) -> RelayError {
    match e.kind() {
        ErrorKind::Connection => e,
        _ => RelayError::connection("store", e),
    }
}

// ═══════════════════════════════════════════════════════════════
//  Loops
// ═══════════════════════════════════════════════════════════════

async fn listen_loop(
    subscription: &mut dyn MeasurementSubscription,
    dispatcher: &mut BroadcastDispatcher,
    grace: std::time::Duration,
    state: &watch::Sender<ConnectorState>,
    token: CancellationToken,
) -> Result<(), RelayError> {
    tracing::info!("store listener started");

    let failure = loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break None,
            Some(done) = dispatcher.next_completion(), if dispatcher.in_flight() > 0 => {
                if let Err(e) = done {
                    break Some(e);
                }
            }
            received = subscription.recv() => {
                let record = match received {
                    Ok(Some(record)) => record,
                    Ok(None) => break Some(RelayError::StreamReceive("store closed the subscription".into())),
                    Err(e) => break Some(e),
                };
                let envelope = Envelope::from_record(record);
                tracing::debug!(
                    channel = %envelope.channel,
                    timestamp = envelope.timestamp,
                    bytes = envelope.measurement.len(),
                    "store record received"
                );
                if let Err(e) = dispatcher.dispatch(envelope).await {
                    break Some(e);
                }
            }
        }
    };

    match failure {
        None => {
            dispatcher.drain(grace).await;
            tracing::info!("store listener stopped");
            Ok(())
        }
        Some(e) => {
            state.send_replace(ConnectorState::Failed);
            tracing::error!(kind = %e.kind(), error = %e, "store listener failed");
            dispatcher.abort().await;
            Err(e)
        }
    }
}

async fn update_loop(
    writer: &mut dyn MeasurementWriter,
    mut queue: mpsc::Receiver<Envelope>,
    token: CancellationToken,
) -> Result<(), RelayError> {
    tracing::info!("store writer started");

    loop {
        let envelope = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = queue.recv() => match next {
                Some(envelope) => envelope,
                None => {
                    tracing::info!("relay queue closed");
                    break;
                }
            },
        };

        let channel = envelope.channel.clone();
        let timestamp = envelope.timestamp;
        match writer.send(envelope.into_record()).await {
            Ok(()) => tracing::debug!(%channel, timestamp, "written to store"),
            Err(e) => match e.policy() {
                Policy::Skip => {
                    tracing::warn!(%channel, timestamp, kind = %e.kind(), error = %e, "store write dropped")
                }
                Policy::Fatal => {
                    tracing::error!(%channel, kind = %e.kind(), error = %e, "store writer failed");
                    return Err(e);
                }
            },
        }
    }

    tracing::info!("store writer stopped");
    Ok(())
}
