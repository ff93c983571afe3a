use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::common::env::knob_env_name;
use crate::common::utils::human_duration;

/// Process-wide settings of the grid manager.
///
/// Read from a TOML file; every knob can be overridden by a `GM_<KNOB>` environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GridManagerConfig {
    /// Timeout of a single remote operation.
    #[serde(with = "human_duration")]
    pub gahp_call_timeout: Duration,
    /// Minimum time between two submit attempts of one job.
    #[serde(with = "human_duration")]
    pub submit_interval: Duration,
    /// Status poll interval while the remote job is not running yet.
    #[serde(with = "human_duration")]
    pub func_retry_interval: Duration,
    #[serde(with = "human_duration")]
    pub probe_interval: Duration,
    pub max_submit_attempts: u32,
    /// How many times a submission that may have partially succeeded is retried.
    pub max_retry_times: u32,

    /// Concurrent submissions allowed per resource.
    pub max_submits_allowed: usize,
    #[serde(with = "human_duration")]
    pub ping_interval: Duration,

    #[serde(with = "human_duration")]
    pub min_proxy_lifetime: Duration,
    #[serde(with = "human_duration")]
    pub proxy_expire_hold_grace: Duration,

    #[serde(with = "human_duration")]
    pub remote_status_stale_limit: Duration,
    #[serde(with = "human_duration")]
    pub check_remote_status_interval: Duration,
    /// How often pending job record updates are written to the queue.
    #[serde(with = "human_duration")]
    pub queue_flush_interval: Duration,

    pub gahp_path: Option<PathBuf>,
    pub gahp_args: Vec<String>,
    pub gahp_log: Option<PathBuf>,
    pub gahp_workers_min: u32,
    pub gahp_workers_max: u32,
    pub gahp_debug: u32,

    /// A configured base disables the staging server manager.
    pub staging_url_base: Option<String>,
    pub staging_server_path: Option<PathBuf>,

    pub scratch_dir: PathBuf,
    /// Alternate endpoint that job updates are reported to.
    pub report_to: Option<String>,
    /// Only jobs matching `attribute == value` are managed.
    pub constraint: Option<String>,
}

impl Default for GridManagerConfig {
    fn default() -> Self {
        Self {
            gahp_call_timeout: Duration::from_secs(600),
            submit_interval: Duration::from_secs(300),
            func_retry_interval: Duration::from_secs(15),
            probe_interval: Duration::from_secs(60),
            max_submit_attempts: 3,
            max_retry_times: 3,
            max_submits_allowed: 100,
            ping_interval: Duration::from_secs(300),
            min_proxy_lifetime: Duration::from_secs(180),
            proxy_expire_hold_grace: Duration::ZERO,
            remote_status_stale_limit: Duration::from_secs(15 * 60),
            check_remote_status_interval: Duration::from_secs(5 * 60),
            queue_flush_interval: Duration::from_secs(5),
            gahp_path: None,
            gahp_args: vec![],
            gahp_log: None,
            gahp_workers_min: 1,
            gahp_workers_max: 5,
            gahp_debug: 0,
            staging_url_base: None,
            staging_server_path: None,
            scratch_dir: std::env::temp_dir().join("gridmanager"),
            report_to: None,
            constraint: None,
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("gridmanager").join("config.toml"))
}

fn duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|e| e.to_string())
}

fn number<T: FromStr>(value: &str) -> Result<T, String>
where
    T::Err: Display,
{
    value.trim().parse::<T>().map_err(|e| e.to_string())
}

fn optional<T: From<String>>(value: &str) -> Result<Option<T>, String> {
    Ok((!value.is_empty()).then(|| T::from(value.to_string())))
}

fn path(value: &str) -> Result<PathBuf, String> {
    Ok(PathBuf::from(value))
}

fn list(value: &str) -> Result<Vec<String>, String> {
    Ok(value.split_whitespace().map(|s| s.to_string()).collect())
}

macro_rules! override_knobs {
    ($config: ident, $lookup: ident, $($field: ident => $parse: expr),* $(,)?) => {
        $(
            let name = knob_env_name(stringify!($field));
            if let Some(value) = $lookup(&name) {
                $config.$field = $parse(&value)
                    .map_err(|e| anyhow::anyhow!("Invalid value {value:?} of {name}: {e}"))?;
            }
        )*
    };
}

impl GridManagerConfig {
    pub fn from_toml(text: &str) -> crate::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Loads the configuration file. An explicit path must exist; the default one may be missing.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|path| path.exists()),
        };
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("Cannot read configuration {}", path.display()))?;
                log::debug!("Loading configuration from {}", path.display());
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies `GM_<KNOB>` overrides provided by `lookup`.
    pub fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) -> anyhow::Result<()> {
        override_knobs!(self, lookup,
            gahp_call_timeout => duration,
            submit_interval => duration,
            func_retry_interval => duration,
            probe_interval => duration,
            max_submit_attempts => number,
            max_retry_times => number,
            max_submits_allowed => number,
            ping_interval => duration,
            min_proxy_lifetime => duration,
            proxy_expire_hold_grace => duration,
            remote_status_stale_limit => duration,
            check_remote_status_interval => duration,
            queue_flush_interval => duration,
            gahp_path => optional,
            gahp_args => list,
            gahp_log => optional,
            gahp_workers_min => number,
            gahp_workers_max => number,
            gahp_debug => number,
            staging_url_base => optional,
            staging_server_path => optional,
            scratch_dir => path,
            report_to => optional,
            constraint => optional,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::GridManagerConfig;
    use crate::Map;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = GridManagerConfig::from_toml("").unwrap();
        assert_eq!(config.submit_interval, Duration::from_secs(300));
        assert_eq!(config.max_submit_attempts, 3);
        assert_eq!(config.max_submits_allowed, 100);
        assert!(config.staging_url_base.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let config = GridManagerConfig::from_toml(
            r#"
probe_interval = "2m"
ping_interval = "1h 30s"
max_submits_allowed = 4
gahp_path = "/usr/sbin/gahp"
gahp_args = ["--fast"]
"#,
        )
        .unwrap();
        assert_eq!(config.probe_interval, Duration::from_secs(120));
        assert_eq!(config.ping_interval, Duration::from_secs(3630));
        assert_eq!(config.max_submits_allowed, 4);
        assert_eq!(config.gahp_path, Some(PathBuf::from("/usr/sbin/gahp")));
        assert_eq!(config.gahp_args, vec!["--fast".to_string()]);
    }

    #[test]
    fn test_unknown_knob() {
        assert!(GridManagerConfig::from_toml("submit_intervall = \"1s\"").is_err());
    }

    #[test]
    fn test_overrides() {
        let mut env = Map::new();
        env.insert("GM_SUBMIT_INTERVAL".to_string(), "7m".to_string());
        env.insert("GM_MAX_RETRY_TIMES".to_string(), "7".to_string());
        env.insert("GM_STAGING_URL_BASE".to_string(), "gsiftp://host:2811".to_string());
        env.insert("GM_GAHP_ARGS".to_string(), "-a -b".to_string());

        let mut config = GridManagerConfig::default();
        config
            .apply_overrides(|name| env.get(name).cloned())
            .unwrap();
        assert_eq!(config.submit_interval, Duration::from_secs(420));
        assert_eq!(config.max_retry_times, 7);
        assert_eq!(
            config.staging_url_base.as_deref(),
            Some("gsiftp://host:2811")
        );
        assert_eq!(config.gahp_args, vec!["-a".to_string(), "-b".to_string()]);

        env.insert("GM_PROBE_INTERVAL".to_string(), "soon".to_string());
        assert!(
            config
                .apply_overrides(|name| env.get(name).cloned())
                .is_err()
        );
    }
}
