pub mod config;
mod connector;
mod dispatch;
mod listener;

use tokio::sync::mpsc;

use relay_api::Envelope;

pub use config::{DispatchConfig, RelayConfig};
pub use connector::{ConnectorState, StoreConnector};
pub use dispatch::BroadcastDispatcher;
pub use listener::spawn_broker_listener;

/// Очередь mesh → store: ограниченная, при заполнении блокирует приём.
pub fn relay_queue(capacity: usize) -> (mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>) {
    mpsc::channel(capacity)
}
