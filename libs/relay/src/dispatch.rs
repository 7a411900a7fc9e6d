use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};

use relay_api::{Envelope, NetworkBroker, Policy, RelayError};

use crate::config::DispatchConfig;

type Completion = Result<Result<(), RelayError>, JoinError>;

// ═══════════════════════════════════════════════════════════════
//  BroadcastDispatcher
// ═══════════════════════════════════════════════════════════════

/// Fan-out broadcast'ов: каждый Envelope: отдельная задача в JoinSet,
/// не больше `max_in_flight` одновременно, каждая со своим дедлайном.
///
/// Порядок завершения задач не определён.
pub struct BroadcastDispatcher {
    broker: Arc<dyn NetworkBroker>,
    tasks: JoinSet<Result<(), RelayError>>,
    config: DispatchConfig,
}

impl BroadcastDispatcher {
    pub fn new(broker: Arc<dyn NetworkBroker>, config: DispatchConfig) -> Self {
        Self {
            broker,
            tasks: JoinSet::new(),
            config,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Запустить broadcast и вернуться, не дожидаясь его завершения.
    /// Ждёт только если уже `max_in_flight` задач в полёте.
    /// `Err`: фатальное завершение одной из предыдущих задач.
    pub async fn dispatch(&mut self, envelope: Envelope) -> Result<(), RelayError> {
        while let Some(done) = self.tasks.try_join_next() {
            settle(done)?;
        }
        while self.tasks.len() >= self.config.max_in_flight {
            tracing::debug!(in_flight = self.tasks.len(), "broadcast fan-out saturated");
            match self.tasks.join_next().await {
                Some(done) => settle(done)?,
                None => break,
            }
        }

        let broker = self.broker.clone();
        let timeout = self.config.broadcast_timeout;
        self.tasks.spawn(async move {
            match tokio::time::timeout(timeout, broker.broadcast(envelope)).await {
                Ok(res) => res,
                Err(_) => Err(RelayError::Timeout(timeout)),
            }
        });
        Ok(())
    }

    /// Следующее завершение. `None`: в полёте ничего нет.
    pub async fn next_completion(&mut self) -> Option<Result<(), RelayError>> {
        self.tasks.join_next().await.map(settle)
    }

    /// Дождаться in-flight задач не дольше `grace`, остальные прервать.
    pub async fn drain(&mut self, grace: Duration) {
        if self.tasks.is_empty() {
            return;
        }
        tracing::info!(in_flight = self.tasks.len(), "draining broadcasts");

        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(grace, async {
            while let Some(done) = tasks.join_next().await {
                if let Err(e) = settle(done) {
                    tracing::error!(error = %e, "broadcast failed during drain");
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(aborted = self.tasks.len(), "broadcast drain timed out");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }

    /// Прервать всё без ожидания.
    pub async fn abort(&mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }
}

/// Классификация завершения по таблице policy.
fn settle(done: Completion) -> Result<(), RelayError> {
    match done {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => match e.policy() {
            Policy::Skip => {
                tracing::warn!(kind = %e.kind(), error = %e, "broadcast dropped");
                Ok(())
            }
            Policy::Fatal => Err(e),
        },
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => {
            tracing::error!(error = %e, "broadcast task panicked");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use relay_api::RelayFuture;

    use super::*;

    /// Broker, отвечающий заранее заданной ошибкой или зависающий.
    struct ScriptedBroker {
        error: Mutex<Option<RelayError>>,
        hang: bool,
        started: AtomicUsize,
    }

    impl ScriptedBroker {
        fn new(error: Option<RelayError>, hang: bool) -> Arc<Self> {
            Arc::new(Self {
                error: Mutex::new(error),
                hang,
                started: AtomicUsize::new(0),
            })
        }
    }

    impl NetworkBroker for ScriptedBroker {
        fn name(&self) -> &str {
            "scripted"
        }

        fn broadcast(&self, _envelope: Envelope) -> RelayFuture<'_, ()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if self.hang {
                    std::future::pending::<()>().await;
                }
                let scripted = self.error.lock().unwrap().take();
                match scripted {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            })
        }

        fn listen(&self, _queue: mpsc::Sender<Envelope>, token: CancellationToken) -> RelayFuture<'_, ()> {
            Box::pin(async move {
                token.cancelled().await;
                Ok(())
            })
        }
    }

    fn config(max_in_flight: usize) -> DispatchConfig {
        DispatchConfig {
            max_in_flight,
            broadcast_timeout: Duration::from_millis(50),
            shutdown_grace: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn skip_errors_are_absorbed() {
        let broker = ScriptedBroker::new(Some(RelayError::network("10.0.0.255:4020", "unreachable")), false);
        let mut d = BroadcastDispatcher::new(broker, config(4));
        d.dispatch(Envelope::new("a", vec![1], 1)).await.unwrap();
        assert_eq!(d.next_completion().await, Some(Ok(())));
        assert_eq!(d.next_completion().await, None);
    }

    #[tokio::test]
    async fn serialization_failure_is_fatal() {
        let broker = ScriptedBroker::new(Some(RelayError::Serialization("bad".into())), false);
        let mut d = BroadcastDispatcher::new(broker, config(4));
        d.dispatch(Envelope::new("a", vec![1], 1)).await.unwrap();
        assert!(matches!(d.next_completion().await, Some(Err(RelayError::Serialization(_)))));
    }

    #[tokio::test]
    async fn hung_broadcast_times_out_and_is_skipped() {
        let broker = ScriptedBroker::new(None, true);
        let mut d = BroadcastDispatcher::new(broker, config(4));
        d.dispatch(Envelope::new("a", vec![1], 1)).await.unwrap();
        assert_eq!(d.next_completion().await, Some(Ok(())));
    }

    #[tokio::test]
    async fn saturation_waits_for_a_slot() {
        let broker = ScriptedBroker::new(None, true);
        let mut d = BroadcastDispatcher::new(broker.clone(), config(2));
        for i in 0..3 {
            d.dispatch(Envelope::new("a", vec![i], i as i64)).await.unwrap();
        }
        // третий стартовал только после таймаута одного из первых двух
        assert!(d.in_flight() <= 2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(broker.started.load(Ordering::SeqCst), 3);
        d.abort().await;
        assert_eq!(d.in_flight(), 0);
    }

    #[tokio::test]
    async fn drain_aborts_after_grace() {
        let broker = ScriptedBroker::new(None, true);
        let mut d = BroadcastDispatcher::new(
            broker,
            DispatchConfig {
                max_in_flight: 4,
                broadcast_timeout: Duration::from_secs(60),
                shutdown_grace: Duration::from_millis(20),
            },
        );
        d.dispatch(Envelope::new("a", vec![1], 1)).await.unwrap();
        d.drain(Duration::from_millis(20)).await;
        assert_eq!(d.in_flight(), 0);
    }
}
