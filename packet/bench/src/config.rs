//! Configuration for the packet pool load driver.

use packet_buffer::{BufferConfig, FRAGMENT_HEADER_LEN, parse_size};
use serde::Deserialize;
use std::time::Duration;

/// Top-level configuration.
#[derive(Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Pool the workers build and fragment packets in.
    #[serde(default)]
    pub pool: BufferConfig,
    /// Pool fragments are received into. Defaults to a copy of `pool`.
    #[serde(default)]
    pub rx: Option<BufferConfig>,
    pub workload: WorkloadConfig,
}

/// General run settings.
#[derive(Deserialize)]
pub struct GeneralConfig {
    /// How long to run the measurement phase.
    #[serde(deserialize_with = "deserialize_duration")]
    pub duration: Duration,
    /// How long to warm up before recording metrics.
    #[serde(deserialize_with = "deserialize_duration")]
    pub warmup: Duration,
    /// Number of worker threads.
    pub threads: usize,
}

/// Logging configuration.
#[derive(Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "LoggingConfig::default_timestamps")]
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: LogFormat::default(),
            timestamps: Self::default_timestamps(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_timestamps() -> bool {
        true
    }
}

/// Log output format.
#[derive(Deserialize, Clone, Copy, Default, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Workload configuration.
#[derive(Deserialize)]
pub struct WorkloadConfig {
    /// Link MTU used for fragmentation.
    pub mtu: usize,
    /// Deliver fragments to the reassembler in random order.
    #[serde(default)]
    pub shuffle: bool,
    /// Serialize each fragment into a link frame and parse it back, instead
    /// of copying it between pools.
    #[serde(default)]
    pub link_frames: bool,
    pub payload: PayloadConfig,
}

/// Payload length range, chosen uniformly per datagram.
#[derive(Deserialize)]
pub struct PayloadConfig {
    #[serde(deserialize_with = "deserialize_size")]
    pub min: usize,
    #[serde(deserialize_with = "deserialize_size")]
    pub max: usize,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Config = toml::from_str(contents)?;

        if config.general.threads == 0 {
            return Err("threads must be at least 1".into());
        }
        if config.workload.mtu == 0 {
            return Err("mtu must be at least 1".into());
        }
        if config.workload.payload.min > config.workload.payload.max {
            return Err(format!(
                "payload min ({}) exceeds max ({})",
                config.workload.payload.min, config.workload.payload.max
            )
            .into());
        }
        let layout = config.pool.validate()?;
        config.rx_pool().validate()?;
        if config.workload.link_frames && layout.header_reserve < FRAGMENT_HEADER_LEN {
            return Err(format!(
                "link_frames needs a pool header_reserve of at least {FRAGMENT_HEADER_LEN} bytes, got {}",
                layout.header_reserve
            )
            .into());
        }

        Ok(config)
    }

    /// Receive pool configuration, falling back to the transmit pool's.
    pub fn rx_pool(&self) -> BufferConfig {
        self.rx.clone().unwrap_or_else(|| BufferConfig {
            name: "rx".to_string(),
            ..self.pool.clone()
        })
    }
}

/// Deserialize a duration from a human-readable string (e.g., "60s", "5m").
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Deserialize a size from an integer or a human-readable string ("16KB").
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Int(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Int(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [general]
        duration = "10s"
        warmup = "1s"
        threads = 1

        [workload]
        mtu = 576

        [workload.payload]
        min = 0
        max = "4KB"
    "#;

    #[test]
    fn test_default_config_parses() {
        let config = Config::parse(include_str!("../config/default.toml")).unwrap();
        assert_eq!(config.general.threads, 2);
        assert_eq!(config.pool.name, "tx");
        assert_eq!(config.pool.segment_count, 512);
        assert_eq!(config.workload.payload.max, 16 * 1024);
        let rx = config.rx_pool();
        assert_eq!(rx.name, "rx");
        assert_eq!(rx.reassembly.max_datagrams, 4);
        assert_eq!(rx.reassembly.timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(!config.workload.shuffle);
        assert_eq!(config.pool, BufferConfig::default());

        let rx = config.rx_pool();
        assert_eq!(rx.name, "rx");
        assert_eq!(rx.segment_capacity, config.pool.segment_capacity);
    }

    #[test]
    fn test_rejects_inverted_payload_range() {
        let bad = MINIMAL.replace("min = 0", "min = 8192");
        assert!(Config::parse(&bad).is_err());
    }

    #[test]
    fn test_link_frames_need_header_room() {
        let frames = MINIMAL.replace("mtu = 576", "mtu = 576\nlink_frames = true");
        assert!(Config::parse(&format!("{frames}\n[pool]\nheader_reserve = 12\n")).is_ok());
        assert!(Config::parse(&format!("{frames}\n[pool]\nheader_reserve = 8\n")).is_err());
        // Copy delivery never writes the header.
        assert!(Config::parse(&format!("{MINIMAL}\n[pool]\nheader_reserve = 8\n")).is_ok());
    }

    #[test]
    fn test_rejects_invalid_pool() {
        let bad = format!("{MINIMAL}\n[pool]\nsegment_count = 0\n");
        assert!(Config::parse(&bad).is_err());
    }
}
