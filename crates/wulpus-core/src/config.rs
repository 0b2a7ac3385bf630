use serde::Deserialize;
use std::env;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use crate::logging::{LogConfig, LogFormat, LogLevel};
use wulpus_proto::CONFIG_BLOCK_LEN;

pub const DEFAULT_PORT: u16 = 2121;
pub const DEFAULT_SERVICE_NAME: &str = "wulpus";

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub listen: Option<String>,
    pub port: Option<u16>,
    pub service_name: Option<String>,
    pub max_payload: Option<usize>,
    pub handshake_timeout_ms: Option<u64>,
    pub spi_lock_timeout_ms: Option<u64>,
    pub send_lock_timeout_ms: Option<u64>,
    pub event_queue_depth: Option<usize>,
    pub log: Option<LogSection>,
    pub sim: Option<SimSection>,
    pub client: Option<ClientSection>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSection {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SimSection {
    pub sample_interval_ms: Option<u64>,
    pub ack_delay_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSection {
    pub addr: Option<String>,
}

/// Resolved bridge parameters with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    pub listen: SocketAddrV4,
    pub service_name: String,
    /// Capacity of the command payload buffer.
    pub max_payload: usize,
    pub handshake_timeout: Duration,
    pub spi_lock_timeout: Duration,
    pub send_lock_timeout: Duration,
    pub event_queue_depth: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            listen: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            max_payload: CONFIG_BLOCK_LEN,
            handshake_timeout: Duration::from_millis(1000),
            spi_lock_timeout: Duration::from_millis(1000),
            send_lock_timeout: Duration::from_millis(1000),
            event_queue_depth: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimSettings {
    pub sample_interval: Duration,
    pub ack_delay: Duration,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(100),
            ack_delay: Duration::from_millis(5),
        }
    }
}

fn non_zero_ms(name: &str, value: Option<u64>) -> Result<(), String> {
    match value {
        Some(0) => Err(format!("{} must be non-zero", name)),
        _ => Ok(()),
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(listen) = &self.listen {
            listen
                .trim()
                .parse::<Ipv4Addr>()
                .map_err(|e| format!("invalid listen address {}: {}", listen, e))?;
        }
        if let Some(port) = self.port {
            if port == 0 {
                return Err("port must be non-zero".to_string());
            }
        }
        if let Some(name) = &self.service_name {
            if name.trim().is_empty() {
                return Err("service_name must not be empty".to_string());
            }
        }
        if let Some(max) = self.max_payload {
            if max == 0 || max > CONFIG_BLOCK_LEN {
                return Err(format!(
                    "max_payload must be between 1 and {}",
                    CONFIG_BLOCK_LEN
                ));
            }
        }
        non_zero_ms("handshake_timeout_ms", self.handshake_timeout_ms)?;
        non_zero_ms("spi_lock_timeout_ms", self.spi_lock_timeout_ms)?;
        non_zero_ms("send_lock_timeout_ms", self.send_lock_timeout_ms)?;
        if self.event_queue_depth == Some(0) {
            return Err("event_queue_depth must be non-zero".to_string());
        }
        if let Some(sim) = &self.sim {
            non_zero_ms("sim.sample_interval_ms", sim.sample_interval_ms)?;
        }
        if let Some(addr) = self.client.as_ref().and_then(|c| c.addr.as_ref()) {
            addr.parse::<SocketAddr>()
                .map_err(|e| format!("invalid client addr {}: {}", addr, e))?;
        }
        Ok(())
    }

    /// Applies defaults. Call after [`Config::validate`].
    pub fn settings(&self) -> BridgeSettings {
        let defaults = BridgeSettings::default();
        let ip = self
            .listen
            .as_deref()
            .and_then(|s| s.trim().parse::<Ipv4Addr>().ok())
            .unwrap_or(*defaults.listen.ip());
        let ms = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };
        BridgeSettings {
            listen: SocketAddrV4::new(ip, self.port.unwrap_or(DEFAULT_PORT)),
            service_name: self
                .service_name
                .clone()
                .unwrap_or(defaults.service_name),
            max_payload: self.max_payload.unwrap_or(defaults.max_payload),
            handshake_timeout: ms(self.handshake_timeout_ms, defaults.handshake_timeout),
            spi_lock_timeout: ms(self.spi_lock_timeout_ms, defaults.spi_lock_timeout),
            send_lock_timeout: ms(self.send_lock_timeout_ms, defaults.send_lock_timeout),
            event_queue_depth: self.event_queue_depth.unwrap_or(defaults.event_queue_depth),
        }
    }

    pub fn sim_settings(&self) -> SimSettings {
        let defaults = SimSettings::default();
        let sim = self.sim.clone().unwrap_or_default();
        SimSettings {
            sample_interval: sim
                .sample_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.sample_interval),
            ack_delay: sim
                .ack_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.ack_delay),
        }
    }

    pub fn log_config(&self) -> LogConfig {
        let section = self.log.clone().unwrap_or_default();
        LogConfig {
            level: section.level.unwrap_or_default(),
            format: section.format.unwrap_or_default(),
            ..LogConfig::default()
        }
    }

    pub fn client_addr(&self) -> String {
        self.client
            .as_ref()
            .and_then(|c| c.addr.clone())
            .unwrap_or_else(|| format!("127.0.0.1:{}", self.port.unwrap_or(DEFAULT_PORT)))
    }
}

pub fn default_config_path() -> PathBuf {
    if let Some(home) = env::var_os("HOME") {
        PathBuf::from(home)
            .join(".config")
            .join("wulpus")
            .join("config.toml")
    } else {
        PathBuf::from(".config/wulpus/config.toml")
    }
}

pub fn config_path() -> PathBuf {
    env::var("WULPUS_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_config_path())
}

pub fn load_config() -> Result<(Config, PathBuf), String> {
    let path = config_path();
    let data = fs::read_to_string(&path)
        .map_err(|e| format!("failed to read config {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&data).map_err(|e| format!("failed to parse TOML: {}", e))?;
    Ok((cfg, path))
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_config_or_default() -> Result<(Config, PathBuf), String> {
    let path = config_path();
    if !path.exists() {
        return Ok((Config::default(), path));
    }
    load_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_path(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        env::temp_dir().join(format!("wulpus-{prefix}-{nanos}.toml"))
    }

    #[test]
    fn validate_rejects_zero_port() {
        let cfg = Config {
            port: Some(0),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_oversized_payload_buffer() {
        let cfg = Config {
            max_payload: Some(CONFIG_BLOCK_LEN + 1),
            ..Config::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("max_payload"));
    }

    #[test]
    fn validate_rejects_bad_listen_address() {
        let cfg = Config {
            listen: Some("not-an-ip".to_string()),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn settings_apply_defaults() {
        let settings = Config::default().settings();
        assert_eq!(settings, BridgeSettings::default());
        assert_eq!(settings.listen.port(), 2121);
        assert_eq!(settings.max_payload, CONFIG_BLOCK_LEN);
    }

    #[test]
    fn load_config_reads_toml() {
        let _guard = crate::test_support::ENV_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let path = unique_temp_path("config-load");
        let data = "port = 3131\nhandshake_timeout_ms = 250\n\n[log]\nlevel = \"debug\"\nformat = \"json\"\n\n[sim]\nsample_interval_ms = 20\n";
        fs::write(&path, data).expect("write config");

        let prev = env::var("WULPUS_CONFIG").ok();
        env::set_var("WULPUS_CONFIG", &path);

        let (cfg, loaded_path) = load_config().expect("load config");
        assert_eq!(loaded_path, path);
        cfg.validate().expect("valid");
        let settings = cfg.settings();
        assert_eq!(settings.listen.port(), 3131);
        assert_eq!(settings.handshake_timeout, Duration::from_millis(250));
        assert_eq!(cfg.log_config().level, LogLevel::Debug);
        assert_eq!(cfg.log_config().format, LogFormat::Json);
        assert_eq!(cfg.sim_settings().sample_interval, Duration::from_millis(20));
        assert_eq!(cfg.client_addr(), "127.0.0.1:3131");

        if let Some(value) = prev {
            env::set_var("WULPUS_CONFIG", value);
        } else {
            env::remove_var("WULPUS_CONFIG");
        }
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let _guard = crate::test_support::ENV_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let path = unique_temp_path("config-missing");
        let prev = env::var("WULPUS_CONFIG").ok();
        env::set_var("WULPUS_CONFIG", &path);

        let (cfg, loaded_path) = load_config_or_default().expect("defaults");
        assert_eq!(loaded_path, path);
        assert_eq!(cfg, Config::default());

        if let Some(value) = prev {
            env::set_var("WULPUS_CONFIG", value);
        } else {
            env::remove_var("WULPUS_CONFIG");
        }
    }
}
