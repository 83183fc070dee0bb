//! Configuration loading: defaults, then the JSON file, then environment.
//!
//! | Variable         | Field                       | Format                 |
//! |------------------|-----------------------------|------------------------|
//! | `CONFIG_FILE`    | (file path)                 | default `config.json`  |
//! | `LISTEN_PORT`    | `http.port`                 | integer                |
//! | `LOG_LEVEL`      | `log_level`                 | `error` .. `trace`     |
//! | `RPC_TIMEOUT_MS` | `timeouts.rpc`              | milliseconds           |
//! | `BUS_HOSTNAME`   | `bus.hostname`              | string                 |
//! | `BUS_PORT`       | `bus.port`                  | integer                |
//! | `BUS_LOGIN`      | `bus.login`                 | string                 |
//! | `BUS_PASSWORD`   | `bus.password`              | string                 |
//! | `BUS_VHOST`      | `bus.vhost`                 | string                 |
//! | `BUS_HEARTBEAT`  | `bus.heartbeat`             | `"30s"`, `"1m"`, `30`  |

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rpc_gateway::domain::config::parse_duration;
use rpc_gateway::{GatewayConfig, LogLevel};

/// Variable naming the configuration file.
pub const CONFIG_FILE_VAR: &str = "CONFIG_FILE";

/// File read when `CONFIG_FILE` is unset.
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Load configuration from the process environment.
pub fn load_config() -> Result<GatewayConfig> {
    load_config_with(|key| std::env::var(key).ok())
}

/// Load configuration, reading variables through `lookup`.
pub fn load_config_with<F>(lookup: F) -> Result<GatewayConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let path = lookup(CONFIG_FILE_VAR).unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
    let mut config = read_config_file(Path::new(&path))?;

    apply_env_overrides(&mut config, &lookup)?;

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Parse `path` as JSON. A missing file yields the defaults.
pub fn read_config_file(path: &Path) -> Result<GatewayConfig> {
    if !path.exists() {
        return Ok(GatewayConfig::default());
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Overwrite fields of `config` from environment variables.
pub fn apply_env_overrides<F>(config: &mut GatewayConfig, lookup: &F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = parsed(lookup, "LISTEN_PORT")? {
        config.http.port = port;
    }
    if let Some(level) = parsed::<LogLevel, _>(lookup, "LOG_LEVEL")? {
        config.log_level = level;
    }
    if let Some(ms) = parsed::<u64, _>(lookup, "RPC_TIMEOUT_MS")? {
        config.timeouts.rpc = Duration::from_millis(ms);
    }

    if let Some(hostname) = var(lookup, "BUS_HOSTNAME") {
        config.bus.hostname = hostname;
    }
    if let Some(port) = parsed(lookup, "BUS_PORT")? {
        config.bus.port = port;
    }
    if let Some(login) = var(lookup, "BUS_LOGIN") {
        config.bus.login = login;
    }
    if let Some(password) = var(lookup, "BUS_PASSWORD") {
        config.bus.password = password;
    }
    if let Some(vhost) = var(lookup, "BUS_VHOST") {
        config.bus.vhost = vhost;
    }
    if let Some(heartbeat) = var(lookup, "BUS_HEARTBEAT") {
        config.bus.heartbeat =
            parse_duration(&heartbeat).map_err(|e| anyhow!("BUS_HEARTBEAT: {}", e))?;
    }

    Ok(())
}

// Empty values count as unset.
fn var<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|value| !value.trim().is_empty())
}

fn parsed<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    var(lookup, key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|e| anyhow!("{}: invalid value '{}': {}", key, value, e))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");

        let config = load_config_with(env(&[(CONFIG_FILE_VAR, path.to_str().unwrap())])).unwrap();

        assert_eq!(config.http.port, 8080);
        assert_eq!(config.timeouts.rpc, Duration::from_secs(20));
        assert_eq!(config.bus.hostname, "localhost");
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn test_file_values_applied() {
        let file = config_file(
            r#"{
                "http": { "port": 9000 },
                "bus": { "hostname": "rabbit", "heartbeat": "10s" },
                "timeouts": { "rpc": "500ms" },
                "log_level": "debug"
            }"#,
        );

        let config =
            load_config_with(env(&[(CONFIG_FILE_VAR, file.path().to_str().unwrap())])).unwrap();

        assert_eq!(config.http.port, 9000);
        assert_eq!(config.bus.hostname, "rabbit");
        assert_eq!(config.bus.heartbeat, Duration::from_secs(10));
        assert_eq!(config.bus.port, 5672);
        assert_eq!(config.timeouts.rpc, Duration::from_millis(500));
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_env_overrides_file() {
        let file = config_file(r#"{ "http": { "port": 9000 }, "bus": { "login": "file" } }"#);

        let config = load_config_with(env(&[
            (CONFIG_FILE_VAR, file.path().to_str().unwrap()),
            ("LISTEN_PORT", "9100"),
            ("LOG_LEVEL", "WARN"),
            ("RPC_TIMEOUT_MS", "1500"),
            ("BUS_HOSTNAME", "broker.internal"),
            ("BUS_PORT", "5673"),
            ("BUS_LOGIN", "gateway"),
            ("BUS_PASSWORD", "secret"),
            ("BUS_VHOST", "rpc"),
            ("BUS_HEARTBEAT", "1m"),
        ]))
        .unwrap();

        assert_eq!(config.http.port, 9100);
        assert_eq!(config.log_level, LogLevel::Warn);
        assert_eq!(config.timeouts.rpc, Duration::from_millis(1500));
        assert_eq!(config.bus.hostname, "broker.internal");
        assert_eq!(config.bus.port, 5673);
        assert_eq!(config.bus.login, "gateway");
        assert_eq!(config.bus.password, "secret");
        assert_eq!(config.bus.vhost, "rpc");
        assert_eq!(config.bus.heartbeat, Duration::from_secs(60));
    }

    #[test]
    fn test_empty_env_value_ignored() {
        let mut config = GatewayConfig::default();
        apply_env_overrides(&mut config, &env(&[("BUS_HOSTNAME", ""), ("LISTEN_PORT", " ")]))
            .unwrap();

        assert_eq!(config.bus.hostname, "localhost");
        assert_eq!(config.http.port, 8080);
    }

    #[test]
    fn test_invalid_env_value_rejected() {
        let mut config = GatewayConfig::default();
        let err = apply_env_overrides(&mut config, &env(&[("LISTEN_PORT", "eighty")]))
            .unwrap_err();

        assert!(err.to_string().contains("LISTEN_PORT"));
    }

    #[test]
    fn test_invalid_heartbeat_rejected() {
        let mut config = GatewayConfig::default();
        let err = apply_env_overrides(&mut config, &env(&[("BUS_HEARTBEAT", "soon")]))
            .unwrap_err();

        assert!(err.to_string().contains("BUS_HEARTBEAT"));
    }

    #[test]
    fn test_zero_timeout_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");

        let result = load_config_with(env(&[
            (CONFIG_FILE_VAR, path.to_str().unwrap()),
            ("RPC_TIMEOUT_MS", "0"),
        ]));

        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_file_rejected() {
        let file = config_file("{ not json");

        let err = read_config_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }
}
