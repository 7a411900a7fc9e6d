use std::time::Duration;

use relay_api::RelayError;

/// Ограничения fan-out broadcast'ов из подписки store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Максимум одновременно выполняющихся broadcast'ов.
    pub max_in_flight: usize,
    /// Дедлайн одного broadcast'а.
    pub broadcast_timeout: Duration,
    /// Сколько ждать in-flight broadcast'ы при остановке.
    pub shutdown_grace: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 256,
            broadcast_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Ёмкость очереди mesh → store.
    pub queue_capacity: usize,
    pub dispatch: DispatchConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.queue_capacity == 0 {
            return Err(RelayError::Config("queue_capacity must be positive".into()));
        }
        if self.dispatch.max_in_flight == 0 {
            return Err(RelayError::Config("max_in_flight must be positive".into()));
        }
        if self.dispatch.broadcast_timeout.is_zero() {
            return Err(RelayError::Config("broadcast_timeout must be positive".into()));
        }
        Ok(())
    }
}
