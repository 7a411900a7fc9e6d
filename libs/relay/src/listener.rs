use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use relay_api::{Envelope, NetworkBroker, RelayError};

/// Запустить приём из сети в отдельной задаче: broker кладёт
/// декодированные Envelope'ы в очередь relay до отмены `token`.
pub fn spawn_broker_listener(
    broker: Arc<dyn NetworkBroker>,
    queue: mpsc::Sender<Envelope>,
    token: CancellationToken,
) -> JoinHandle<Result<(), RelayError>> {
    tokio::spawn(async move {
        tracing::info!(broker = broker.name(), "broker listener started");
        let result = broker.listen(queue, token).await;
        match &result {
            Ok(()) => tracing::info!(broker = broker.name(), "broker listener stopped"),
            Err(e) => tracing::error!(broker = broker.name(), kind = %e.kind(), error = %e, "broker listener failed"),
        }
        result
    })
}
