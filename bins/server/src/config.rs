use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::Deserialize;

use relay::{DispatchConfig, RelayConfig};
use relay_api::{Filter, MAX_DATAGRAM_SIZE};

use crate::error::ServerError;

const DEFAULT_STORE_ADDRESS: &str = "localhost:6666";
const DEFAULT_CHANNEL_FILTER: &str = "map_updates,position_updates";
const DEFAULT_PORT: u16 = 4020;
const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";

/// Wire-формат датаграмм.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Совместим с Go-пирами (encoding/gob).
    #[default]
    Gob,
    Msgpack,
}

// ═══════════════════════════════════════════════════════════════
//  Config file (TOML)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub broadcast_ip: Option<String>,
    pub store_address: Option<String>,
    pub channel_filter: Option<String>,
    pub port: Option<u16>,
    pub listen_host: Option<String>,
    pub codec: Option<CodecKind>,
    pub queue_capacity: Option<usize>,
    pub max_in_flight: Option<usize>,
    pub broadcast_timeout_ms: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
    pub max_datagram: Option<usize>,
}

pub fn load_config(path: &str) -> Result<Config, ServerError> {
    let content = std::fs::read_to_string(path).map_err(|e| ServerError::Config {
        context: "read",
        detail: format!("'{path}': {e}"),
    })?;
    toml::from_str(&content).map_err(|e| ServerError::Config {
        context: "parse",
        detail: format!("'{path}': {e}"),
    })
}

// ═══════════════════════════════════════════════════════════════
//  CLI args
// ═══════════════════════════════════════════════════════════════

#[derive(Args, Clone, Debug, Default)]
pub struct ServeArgs {
    /// Путь к TOML конфиг файлу (отсутствующий файл = значения по умолчанию)
    #[arg(long, default_value = "mesh-relay.toml", env = "RELAY_CONFIG")]
    pub config: String,

    /// Broadcast адрес mesh-сети (обязателен)
    #[arg(long, env = "RELAY_BROADCAST_IP")]
    pub broadcast_ip: Option<String>,

    /// Адрес store (host:port или URI; `memory://` = встроенный store)
    #[arg(long, env = "RELAY_STORE_ADDRESS")]
    pub store_address: Option<String>,

    /// Каналы через запятую
    #[arg(long, env = "RELAY_CHANNEL_FILTER")]
    pub channel_filter: Option<String>,

    /// UDP порт mesh-сети (приём и broadcast)
    #[arg(long, env = "RELAY_PORT")]
    pub port: Option<u16>,

    /// Локальный адрес приёма датаграмм
    #[arg(long, env = "RELAY_LISTEN_HOST")]
    pub listen_host: Option<String>,

    /// Wire-формат датаграмм
    #[arg(long, value_enum, env = "RELAY_CODEC")]
    pub codec: Option<CodecKind>,
}

// ═══════════════════════════════════════════════════════════════
//  Effective: merged config
// ═══════════════════════════════════════════════════════════════

/// Итоговая конфигурация после мержа: config.toml < env/CLI
#[derive(Debug)]
pub struct Effective {
    pub broadcast_ip: String,
    pub store_address: String,
    pub filter: Filter,
    pub port: u16,
    pub listen_host: String,
    pub codec: CodecKind,
    pub max_datagram: usize,
    pub relay: RelayConfig,
}

impl Effective {
    pub fn new(args: &ServeArgs) -> Result<Self, ServerError> {
        let cfg = if std::path::Path::new(&args.config).exists() {
            load_config(&args.config)?
        } else {
            Config::default()
        };
        Self::merge(args, cfg)
    }

    pub fn merge(args: &ServeArgs, cfg: Config) -> Result<Self, ServerError> {
        let broadcast_ip = args
            .broadcast_ip
            .clone()
            .or(cfg.broadcast_ip)
            .filter(|ip| !ip.trim().is_empty())
            .ok_or_else(|| ServerError::Config {
                context: "broadcast_ip",
                detail: "required (--broadcast-ip or RELAY_BROADCAST_IP)".into(),
            })?;

        let filter_list = args
            .channel_filter
            .clone()
            .or(cfg.channel_filter)
            .unwrap_or_else(|| DEFAULT_CHANNEL_FILTER.into());
        let filter = Filter::parse(&filter_list)?;

        let defaults = RelayConfig::default();
        let relay = RelayConfig {
            queue_capacity: cfg.queue_capacity.unwrap_or(defaults.queue_capacity),
            dispatch: DispatchConfig {
                max_in_flight: cfg.max_in_flight.unwrap_or(defaults.dispatch.max_in_flight),
                broadcast_timeout: cfg
                    .broadcast_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.dispatch.broadcast_timeout),
                shutdown_grace: cfg
                    .shutdown_grace_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.dispatch.shutdown_grace),
            },
        };
        relay.validate()?;

        let max_datagram = cfg.max_datagram.unwrap_or(MAX_DATAGRAM_SIZE);
        if max_datagram == 0 || max_datagram > 65_507 {
            return Err(ServerError::Config {
                context: "max_datagram",
                detail: format!("{max_datagram} is outside 1..=65507"),
            });
        }

        Ok(Self {
            broadcast_ip,
            store_address: args
                .store_address
                .clone()
                .or(cfg.store_address)
                .unwrap_or_else(|| DEFAULT_STORE_ADDRESS.into()),
            filter,
            port: args.port.or(cfg.port).unwrap_or(DEFAULT_PORT),
            listen_host: args
                .listen_host
                .clone()
                .or(cfg.listen_host)
                .unwrap_or_else(|| DEFAULT_LISTEN_HOST.into()),
            codec: args.codec.or(cfg.codec).unwrap_or_default(),
            max_datagram,
            relay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(broadcast_ip: Option<&str>) -> ServeArgs {
        ServeArgs {
            config: "mesh-relay.toml".into(),
            broadcast_ip: broadcast_ip.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_mesh_deployment() {
        let eff = Effective::merge(&args(Some("10.0.0.255")), Config::default()).unwrap();
        assert_eq!(eff.store_address, "localhost:6666");
        assert_eq!(eff.port, 4020);
        assert_eq!(eff.listen_host, "0.0.0.0");
        assert_eq!(eff.codec, CodecKind::Gob);
        assert_eq!(eff.max_datagram, 1024);
        assert_eq!(eff.filter, Filter::parse("position_updates,map_updates").unwrap());
        assert_eq!(eff.relay, RelayConfig::default());
    }

    #[test]
    fn missing_broadcast_ip_is_config_error() {
        let err = Effective::merge(&args(None), Config::default()).unwrap_err();
        assert!(matches!(err, ServerError::Config { context: "broadcast_ip", .. }));

        let err = Effective::merge(&args(Some("  ")), Config::default()).unwrap_err();
        assert!(matches!(err, ServerError::Config { .. }));
    }

    #[test]
    fn cli_overrides_file() {
        let cfg: Config = toml::from_str(
            r#"
            broadcast_ip = "192.168.1.255"
            port = 5000
            channel_filter = "a,b"
            codec = "msgpack"
            max_in_flight = 8
            broadcast_timeout_ms = 500
            "#,
        )
        .unwrap();
        let mut a = args(Some("10.0.0.255"));
        a.port = Some(6000);

        let eff = Effective::merge(&a, cfg).unwrap();
        assert_eq!(eff.broadcast_ip, "10.0.0.255");
        assert_eq!(eff.port, 6000);
        assert_eq!(eff.codec, CodecKind::Msgpack);
        assert_eq!(eff.filter, Filter::parse("a,b").unwrap());
        assert_eq!(eff.relay.dispatch.max_in_flight, 8);
        assert_eq!(eff.relay.dispatch.broadcast_timeout, Duration::from_millis(500));
    }

    #[test]
    fn empty_filter_is_rejected() {
        let mut a = args(Some("10.0.0.255"));
        a.channel_filter = Some(" , ".into());
        let err = Effective::merge(&a, Config::default()).unwrap_err();
        assert!(matches!(err, ServerError::Relay(relay_api::RelayError::Config(_))));
    }

    #[test]
    fn invalid_tuning_is_rejected() {
        let cfg = Config {
            queue_capacity: Some(0),
            ..Default::default()
        };
        assert!(Effective::merge(&args(Some("10.0.0.255")), cfg).is_err());

        let cfg = Config {
            max_datagram: Some(70_000),
            ..Default::default()
        };
        assert!(Effective::merge(&args(Some("10.0.0.255")), cfg).is_err());
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        assert!(toml::from_str::<Config>("brodcast_ip = \"x\"").is_err());
    }

    #[test]
    fn missing_file_means_defaults() {
        let mut a = args(Some("10.0.0.255"));
        a.config = "/nonexistent/mesh-relay.toml".into();
        assert_eq!(Effective::new(&a).unwrap().port, 4020);
    }
}
