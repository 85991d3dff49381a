//! Harness-level configuration: bind addresses, output directory, and the
//! fleet of worker addresses the coordinator dials. Loaded from environment
//! variables in the same `env_required`/`env_parse_or` idiom used elsewhere
//! in this codebase. Bespoke config-file formats are out of scope — the Job
//! itself is loaded separately, straight off JSON/YAML, in `job.rs`.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

fn env_required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.into()))
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Coordinator-side configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Comma-separated `host:port` list of workers to register, in order.
    pub worker_addresses: Vec<String>,
    /// Path to the Job config file (JSON or YAML).
    pub job_path: PathBuf,
    /// Directory `config.json` and `counters.txt` are written to.
    pub output_dir: PathBuf,
    /// Ambient /metrics bind port.
    pub metrics_port: u16,
}

impl CoordinatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let worker_addresses = env_required("WORKER_ADDRESSES")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        if worker_addresses.is_empty() {
            return Err(ConfigError::InvalidValue {
                var: "WORKER_ADDRESSES".into(),
                message: "must list at least one worker address".into(),
            });
        }

        Ok(Self {
            worker_addresses,
            job_path: PathBuf::from(env_required("JOB_CONFIG_PATH")?),
            output_dir: PathBuf::from(env_parse_or("OUTPUT_DIR", "./out".to_string())?),
            metrics_port: env_parse_or("METRICS_PORT", 9100u16)?,
        })
    }
}

/// Worker-side configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// RPC listen address, `:7000` by default per the external interface.
    pub bind_addr: String,
    /// Ambient /metrics bind port.
    pub metrics_port: u16,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_addr: env_parse_or("WORKER_BIND_ADDR", "0.0.0.0:7000".to_string())?,
            metrics_port: env_parse_or("METRICS_PORT", 9101u16)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn coordinator_config_requires_worker_addresses() {
        std::env::remove_var("WORKER_ADDRESSES");
        std::env::remove_var("JOB_CONFIG_PATH");
        assert!(matches!(
            CoordinatorConfig::from_env(),
            Err(ConfigError::MissingEnvVar(_))
        ));
    }

    #[test]
    #[serial]
    fn coordinator_config_parses_worker_list() {
        std::env::set_var("WORKER_ADDRESSES", "10.0.0.1:7000, 10.0.0.2:7000");
        std::env::set_var("JOB_CONFIG_PATH", "job.json");
        let cfg = CoordinatorConfig::from_env().unwrap();
        assert_eq!(cfg.worker_addresses, vec!["10.0.0.1:7000", "10.0.0.2:7000"]);
        std::env::remove_var("WORKER_ADDRESSES");
        std::env::remove_var("JOB_CONFIG_PATH");
    }

    #[test]
    fn worker_config_defaults_to_port_7000() {
        std::env::remove_var("WORKER_BIND_ADDR");
        let cfg = WorkerConfig::from_env().unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:7000");
    }
}
