pub mod error;
pub mod types;

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use error::{ErrorKind, Policy, RelayError};
pub use types::{Envelope, Filter, MAX_DATAGRAM_SIZE, Measurement, StoreRecord};

pub type RelayFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RelayError>> + Send + 'a>>;

// ════════════════════════════════════════════════════════════════
//  Codec
// ════════════════════════════════════════════════════════════════

/// Codec: wire-формат Envelope, Envelope ↔ bytes одной датаграммы.
///
/// Реализации: gob (совместим с Go-пирами), msgpack.
pub trait EnvelopeCodec: Send + Sync {
    /// Короткое имя для логов и конфига ("gob", "msgpack").
    fn name(&self) -> &'static str;

    /// Сериализовать. `OversizedPayload` если результат не влезает
    /// в датаграмму, `Serialization` если значение не кодируется.
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, RelayError>;

    /// Десериализовать одну датаграмму. `Decode` на битых данных,
    /// никогда не возвращает частично заполненный Envelope.
    fn decode(&self, data: &[u8]) -> Result<Envelope, RelayError>;
}

// ════════════════════════════════════════════════════════════════
//  Network broker
// ════════════════════════════════════════════════════════════════

/// Broker: транспорт в mesh-сеть и обратно.
///
/// UDP broadcast: один из вариантов; другие транспорты реализуют
/// тот же контракт.
pub trait NetworkBroker: Send + Sync {
    fn name(&self) -> &str;

    /// Отправить Envelope всем пирам.
    fn broadcast(&self, envelope: Envelope) -> RelayFuture<'_, ()>;

    /// Принимать Envelope'ы от пиров и класть в `queue`, пока не
    /// отменён `token` или не закрыт получатель очереди.
    fn listen(&self, queue: mpsc::Sender<Envelope>, token: CancellationToken) -> RelayFuture<'_, ()>;
}

// ════════════════════════════════════════════════════════════════
//  Store
// ════════════════════════════════════════════════════════════════

/// Подписка на store: server-streaming поток записей.
pub trait MeasurementSubscription: Send {
    /// Следующая запись. `Ok(None)`: store закрыл поток.
    fn recv(&mut self) -> RelayFuture<'_, Option<StoreRecord>>;
}

/// Client-streaming поток записи в store.
pub trait MeasurementWriter: Send {
    fn send(&mut self, record: StoreRecord) -> RelayFuture<'_, ()>;
}

/// Клиент store: две операции, которые нужны relay.
pub trait StoreClient: Send + Sync {
    fn subscribe(&self, filter: &Filter) -> RelayFuture<'_, Box<dyn MeasurementSubscription>>;

    fn open_write_stream(&self) -> RelayFuture<'_, Box<dyn MeasurementWriter>>;
}
