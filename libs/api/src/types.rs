use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

// ════════════════════════════════════════════════════════════════
//  Envelope
// ════════════════════════════════════════════════════════════════

/// Максимальный размер датаграммы по умолчанию (байт).
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Одно измерение в пути между store и mesh-сетью.
///
/// Создаётся ровно в одной точке входа (декодированная датаграмма
/// или запись из подписки store) и потребляется ровно в одной точке
/// выхода (запись в store или датаграмма). После создания не меняется.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    /// Имя канала измерений (e.g., "position_updates").
    pub channel: String,
    /// Сырые байты измерения.
    #[serde(with = "serde_bytes")]
    pub measurement: Vec<u8>,
    /// Timestamp измерения (epoch-based, как его отдаёт store).
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(channel: impl Into<String>, measurement: impl Into<Vec<u8>>, timestamp: i64) -> Self {
        Self {
            channel: channel.into(),
            measurement: measurement.into(),
            timestamp,
        }
    }

    /// Store record → Envelope. Не-raw измерения передаются
    /// в текстовом виде: у датаграммы один формат payload.
    pub fn from_record(record: StoreRecord) -> Self {
        let (timestamp, measurement) = match record.measurement {
            Measurement::Raw { ts, value } => (ts, value),
            Measurement::Categorical { ts, value } => (ts, value.into_bytes()),
            Measurement::Numerical { ts, value } => (ts, value.to_string().into_bytes()),
        };
        Self {
            channel: record.name,
            measurement,
            timestamp,
        }
    }

    /// Envelope → store write request. Всегда Raw.
    pub fn into_record(self) -> StoreRecord {
        StoreRecord {
            name: self.channel,
            measurement: Measurement::Raw {
                ts: self.timestamp,
                value: self.measurement,
            },
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  Store record model
// ════════════════════════════════════════════════════════════════

/// Измерение в store: один из трёх вариантов union'а.
#[derive(Clone, Debug, PartialEq)]
pub enum Measurement {
    Numerical { ts: i64, value: f64 },
    Categorical { ts: i64, value: String },
    Raw { ts: i64, value: Vec<u8> },
}

impl Measurement {
    pub fn ts(&self) -> i64 {
        match self {
            Measurement::Numerical { ts, .. }
            | Measurement::Categorical { ts, .. }
            | Measurement::Raw { ts, .. } => *ts,
        }
    }
}

/// Запись в store: имя канала + измерение.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreRecord {
    pub name: String,
    pub measurement: Measurement,
}

impl StoreRecord {
    pub fn raw(name: impl Into<String>, ts: i64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            measurement: Measurement::Raw { ts, value: value.into() },
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  Filter
// ════════════════════════════════════════════════════════════════

/// Неизменяемое множество каналов, на которые подписан connector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    names: BTreeSet<String>,
}

impl Filter {
    pub fn new<I, S>(names: I) -> Result<Self, RelayError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: BTreeSet<String> = names
            .into_iter()
            .map(|n| n.as_ref().trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() {
            return Err(RelayError::Config("channel filter is empty".into()));
        }
        Ok(Self { names })
    }

    /// Разобрать comma-separated список (`"map_updates,position_updates"`).
    pub fn parse(list: &str) -> Result<Self, RelayError> {
        Self::new(list.split(','))
    }

    pub fn matches(&self, channel: &str) -> bool {
        self.names.contains(channel)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.names().collect();
        f.write_str(&names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_trims_and_dedups() {
        let f = Filter::parse(" map_updates, position_updates,,map_updates ").unwrap();
        assert_eq!(f.len(), 2);
        assert!(f.matches("map_updates"));
        assert!(f.matches("position_updates"));
        assert!(!f.matches("other"));
        assert_eq!(f.to_string(), "map_updates,position_updates");
    }

    #[test]
    fn empty_filter_is_config_error() {
        let err = Filter::parse(" , ").unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn raw_record_converts_both_ways() {
        let rec = StoreRecord::raw("a", 100, vec![1, 2, 3]);
        let env = Envelope::from_record(rec.clone());
        assert_eq!(env, Envelope::new("a", vec![1, 2, 3], 100));
        assert_eq!(env.into_record(), rec);
    }

    #[test]
    fn non_raw_measurements_become_text() {
        let num = StoreRecord {
            name: "temp".into(),
            measurement: Measurement::Numerical { ts: 7, value: 21.5 },
        };
        assert_eq!(Envelope::from_record(num), Envelope::new("temp", b"21.5".to_vec(), 7));

        let cat = StoreRecord {
            name: "mode".into(),
            measurement: Measurement::Categorical { ts: 8, value: "idle".into() },
        };
        let env = Envelope::from_record(cat);
        assert_eq!(env.measurement, b"idle");
        assert_eq!(env.timestamp, 8);
    }
}
