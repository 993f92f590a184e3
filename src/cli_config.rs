use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Configuration and CLI
// =============================================================================

pub const ENV_PREFIX: &str = "DKRMGR_";

#[derive(Parser)]
#[command(name = "dkrmgr")]
#[command(about = "Tracks Docker container health, heals unhealthy containers and exports metrics")]
pub struct Args {
    /// Optional TOML config file; DKRMGR_* environment variables override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(short, long, default_value = "logs")]
    pub log_dir: PathBuf,

    #[arg(short = 'v', long, default_value = "info")]
    pub log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,
    #[serde(default = "default_scrape_interval", deserialize_with = "de_duration")]
    pub scrape_interval: Duration,
    #[serde(default = "default_inspect_timeout", deserialize_with = "de_duration")]
    pub inspect_timeout: Duration,
    #[serde(default = "default_cleanup_interval", deserialize_with = "de_duration")]
    pub cleanup_interval: Duration,
    #[serde(default = "default_backoff_min", deserialize_with = "de_duration")]
    pub restart_backoff_min: Duration,
    #[serde(default = "default_backoff_max", deserialize_with = "de_duration")]
    pub restart_backoff_max: Duration,
    #[serde(default = "default_status_interval", deserialize_with = "de_duration")]
    pub status_interval: Duration,
    #[serde(default)]
    pub heal_mode: bool,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}
const fn default_scrape_interval() -> Duration {
    Duration::from_secs(10)
}
const fn default_inspect_timeout() -> Duration {
    Duration::from_secs(5)
}
const fn default_cleanup_interval() -> Duration {
    Duration::from_secs(10)
}
const fn default_backoff_min() -> Duration {
    Duration::from_secs(10)
}
const fn default_backoff_max() -> Duration {
    Duration::from_secs(300)
}
const fn default_status_interval() -> Duration {
    Duration::from_secs(300)
}
const fn default_port() -> u16 {
    9102
}

impl Default for Config {
    fn default() -> Self {
        Self {
            docker_socket: default_docker_socket(),
            scrape_interval: default_scrape_interval(),
            inspect_timeout: default_inspect_timeout(),
            cleanup_interval: default_cleanup_interval(),
            restart_backoff_min: default_backoff_min(),
            restart_backoff_max: default_backoff_max(),
            status_interval: default_status_interval(),
            heal_mode: false,
            debug_mode: false,
            port: default_port(),
        }
    }
}

/// Durations in TOML are either integer seconds or strings like "10s".
fn de_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

/// Parses `1500ms`, `10s`, `5m`, `1h` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (number, unit_ms) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600_000)
    } else {
        (s, 1_000)
    };

    let value: u64 = number
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration: {s:?}"))?;
    let millis = value
        .checked_mul(unit_ms)
        .with_context(|| format!("Duration out of range: {s:?}"))?;
    Ok(Duration::from_millis(millis))
}

fn parse_bool(s: &str) -> Result<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => bail!("Invalid boolean: {other:?}"),
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// File (or defaults), then the process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from `DKRMGR_*` variables. Unknown variables with the
    /// prefix are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(field) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let context = || format!("Invalid value for {key}");

            match field {
                "DOCKER_SOCKET" => self.docker_socket = value,
                "SCRAPE_INTERVAL" => {
                    self.scrape_interval = parse_duration(&value).with_context(context)?
                }
                "INSPECT_TIMEOUT" => {
                    self.inspect_timeout = parse_duration(&value).with_context(context)?
                }
                "CLEANUP_INTERVAL" => {
                    self.cleanup_interval = parse_duration(&value).with_context(context)?
                }
                "RESTART_BACKOFF_MIN" => {
                    self.restart_backoff_min = parse_duration(&value).with_context(context)?
                }
                "RESTART_BACKOFF_MAX" => {
                    self.restart_backoff_max = parse_duration(&value).with_context(context)?
                }
                "STATUS_INTERVAL" => {
                    self.status_interval = parse_duration(&value).with_context(context)?
                }
                "HEAL_MODE" => self.heal_mode = parse_bool(&value).with_context(context)?,
                "DEBUG_MODE" => self.debug_mode = parse_bool(&value).with_context(context)?,
                "PORT" => self.port = value.trim().parse::<u16>().with_context(context)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("scrape_interval", self.scrape_interval),
            ("inspect_timeout", self.inspect_timeout),
            ("cleanup_interval", self.cleanup_interval),
            ("restart_backoff_min", self.restart_backoff_min),
            ("restart_backoff_max", self.restart_backoff_max),
            ("status_interval", self.status_interval),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                bail!("{name} must be greater than zero");
            }
        }

        if self.restart_backoff_min > self.restart_backoff_max {
            bail!(
                "restart_backoff_min ({:?}) exceeds restart_backoff_max ({:?})",
                self.restart_backoff_min,
                self.restart_backoff_max
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.docker_socket, "/var/run/docker.sock");
        assert_eq!(config.scrape_interval, Duration::from_secs(10));
        assert_eq!(config.inspect_timeout, Duration::from_secs(5));
        assert_eq!(config.cleanup_interval, Duration::from_secs(10));
        assert_eq!(config.restart_backoff_min, Duration::from_secs(10));
        assert_eq!(config.restart_backoff_max, Duration::from_secs(300));
        assert!(!config.heal_mode);
        assert_eq!(config.port, 9102);
        config.validate().unwrap();
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1500ms").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("-3s").is_err());
    }

    #[test]
    fn toml_accepts_seconds_and_strings() {
        let config: Config = toml::from_str(
            r#"
            scrape_interval = 15
            restart_backoff_max = "5m"
            heal_mode = true
            "#,
        )
        .unwrap();

        assert_eq!(config.scrape_interval, Duration::from_secs(15));
        assert_eq!(config.restart_backoff_max, Duration::from_secs(300));
        assert!(config.heal_mode);
        assert_eq!(config.inspect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn toml_rejects_unknown_keys() {
        assert!(toml::from_str::<Config>("scrape_intervall = 3").is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 9200\ndocker_socket = \"/run/docker.sock\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.port, 9200);
        assert_eq!(config.docker_socket, "/run/docker.sock");
    }

    #[test]
    fn from_file_missing_is_an_error() {
        let err = Config::from_file(Path::new("/nonexistent/dkrmgr.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn env_overrides_fields() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("DKRMGR_HEAL_MODE", "true"),
                ("DKRMGR_SCRAPE_INTERVAL", "2s"),
                ("DKRMGR_RESTART_BACKOFF_MIN", "500ms"),
                ("DKRMGR_PORT", "9300"),
                ("DKRMGR_DEBUG_MODE", "1"),
                ("DKRMGR_SOMETHING_ELSE", "ignored"),
                ("PATH", "/usr/bin"),
            ]))
            .unwrap();

        assert!(config.heal_mode);
        assert!(config.debug_mode);
        assert_eq!(config.scrape_interval, Duration::from_secs(2));
        assert_eq!(config.restart_backoff_min, Duration::from_millis(500));
        assert_eq!(config.port, 9300);
    }

    #[test]
    fn env_rejects_bad_values() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[("DKRMGR_PORT", "http")]))
            .unwrap_err();
        assert!(err.to_string().contains("DKRMGR_PORT"));

        assert!(config
            .apply_env(env(&[("DKRMGR_HEAL_MODE", "maybe")]))
            .is_err());
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let config = Config {
            restart_backoff_min: Duration::from_secs(600),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let config = Config {
            scrape_interval: Duration::ZERO,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("scrape_interval"));
    }
}
