use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Notify, RwLock, mpsc};

use relay_api::{
    Filter, MeasurementSubscription, MeasurementWriter, RelayError, RelayFuture, StoreClient,
    StoreRecord,
};

fn default_buffer() -> usize {
    4096
}

// ═══════════════════════════════════════════════════════════════
//  Subscriber
// ═══════════════════════════════════════════════════════════════

struct Subscriber {
    filter: Filter,
    tx: mpsc::Sender<Result<StoreRecord, RelayError>>,
}

pub struct MemorySubscription {
    rx: mpsc::Receiver<Result<StoreRecord, RelayError>>,
}

impl MeasurementSubscription for MemorySubscription {
    fn recv(&mut self) -> RelayFuture<'_, Option<StoreRecord>> {
        Box::pin(async move { self.rx.recv().await.transpose() })
    }
}

pub struct MemoryWriter {
    store: MemoryStore,
}

impl MeasurementWriter for MemoryWriter {
    fn send(&mut self, record: StoreRecord) -> RelayFuture<'_, ()> {
        Box::pin(async move {
            if self.store.inner.take_injected_failure() {
                return Err(RelayError::StreamSend(format!(
                    "injected failure writing '{}'",
                    record.name
                )));
            }
            self.store.store(record).await;
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryStore
// ═══════════════════════════════════════════════════════════════

#[derive(Default)]
struct Inner {
    records: RwLock<Vec<StoreRecord>>,
    subscribers: RwLock<Vec<Subscriber>>,
    written: Notify,
    failing_writes: AtomicUsize,
    refuse_connections: AtomicBool,
}

impl Inner {
    fn take_injected_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-process store: каждая сохранённая запись уходит всем подписчикам,
/// чей filter совпадает с именем канала: как у настоящего store.
///
/// Используется для standalone-запуска (`memory://`) и в тестах.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Сохранить запись и разослать подписчикам (back-pressure).
    pub async fn store(&self, record: StoreRecord) {
        self.inner.records.write().await.push(record.clone());
        self.inner.written.notify_waiters();

        let mut subs = self.inner.subscribers.write().await;
        subs.retain(|s| !s.tx.is_closed());
        for sub in subs.iter().filter(|s| s.filter.matches(&record.name)) {
            if sub.tx.send(Ok(record.clone())).await.is_err() {
                tracing::debug!(channel = %record.name, "subscriber gone during send");
            }
        }
    }

    /// Все сохранённые записи в порядке поступления.
    pub async fn records(&self) -> Vec<StoreRecord> {
        self.inner.records.read().await.clone()
    }

    /// Дождаться, пока в store будет хотя бы `n` записей.
    pub async fn wait_for_records(&self, n: usize) -> Vec<StoreRecord> {
        loop {
            let notified = self.inner.written.notified();
            {
                let records = self.inner.records.read().await;
                if records.len() >= n {
                    return records.clone();
                }
            }
            notified.await;
        }
    }

    /// Следующие `n` записей через write stream завершатся ошибкой.
    pub fn fail_next_writes(&self, n: usize) {
        self.inner.failing_writes.store(n, Ordering::SeqCst);
    }

    /// subscribe / open_write_stream начнут возвращать Connection.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Оборвать все подписки ошибкой (поток сломан).
    pub async fn break_subscriptions(&self, reason: &str) {
        let mut subs = self.inner.subscribers.write().await;
        for sub in subs.drain(..) {
            let _ = sub.tx.send(Err(RelayError::StreamReceive(reason.to_string()))).await;
        }
    }

    /// Закрыть все подписки (store завершил поток).
    pub async fn close_subscriptions(&self) {
        self.inner.subscribers.write().await.clear();
    }

    fn check_connect(&self) -> Result<(), RelayError> {
        if self.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(RelayError::connection("memory://", "connection refused"));
        }
        Ok(())
    }
}

impl StoreClient for MemoryStore {
    fn subscribe(&self, filter: &Filter) -> RelayFuture<'_, Box<dyn MeasurementSubscription>> {
        let filter = filter.clone();
        Box::pin(async move {
            self.check_connect()?;
            let (tx, rx) = mpsc::channel(default_buffer());
            self.inner.subscribers.write().await.push(Subscriber { filter, tx });
            Ok(Box::new(MemorySubscription { rx }) as Box<dyn MeasurementSubscription>)
        })
    }

    fn open_write_stream(&self) -> RelayFuture<'_, Box<dyn MeasurementWriter>> {
        Box::pin(async move {
            self.check_connect()?;
            Ok(Box::new(MemoryWriter { store: self.clone() }) as Box<dyn MeasurementWriter>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscription_only_sees_matching_channels() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(&Filter::parse("a").unwrap()).await.unwrap();

        store.store(StoreRecord::raw("b", 1, vec![1])).await;
        store.store(StoreRecord::raw("a", 2, vec![2])).await;

        let rec = sub.recv().await.unwrap().unwrap();
        assert_eq!(rec, StoreRecord::raw("a", 2, vec![2]));
        assert_eq!(store.records().await.len(), 2);
    }

    #[tokio::test]
    async fn injected_write_failure_hits_exactly_n_writes() {
        let store = MemoryStore::new();
        let mut w = store.open_write_stream().await.unwrap();
        store.fail_next_writes(1);

        assert!(matches!(
            w.send(StoreRecord::raw("a", 1, vec![1])).await,
            Err(RelayError::StreamSend(_))
        ));
        w.send(StoreRecord::raw("a", 2, vec![2])).await.unwrap();

        let records = store.wait_for_records(1).await;
        assert_eq!(records, vec![StoreRecord::raw("a", 2, vec![2])]);
    }

    #[tokio::test]
    async fn closed_and_broken_subscriptions() {
        let store = MemoryStore::new();
        let filter = Filter::parse("a").unwrap();

        let mut closed = store.subscribe(&filter).await.unwrap();
        store.close_subscriptions().await;
        assert_eq!(closed.recv().await.unwrap(), None);

        let mut broken = store.subscribe(&filter).await.unwrap();
        store.break_subscriptions("reset by peer").await;
        assert!(matches!(broken.recv().await, Err(RelayError::StreamReceive(_))));
    }

    #[tokio::test]
    async fn refused_connection() {
        let store = MemoryStore::new();
        store.refuse_connections(true);
        assert!(matches!(
            store.subscribe(&Filter::parse("a").unwrap()).await,
            Err(RelayError::Connection { .. })
        ));
        assert!(store.open_write_stream().await.is_err());
    }
}
