// ABOUTME: Sandbox settings loaded from environment variables
// ABOUTME: Base image, network, quota, cosmetic text, build location and runtime timeouts

use crate::template::HardwareProfile;
use chunkhost_config as env_names;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://chunkhost.db";
pub const DEFAULT_BASE_IMAGE: &str = "ubuntu:22.04";
pub const DEFAULT_NETWORK: &str = "bridge";
pub const DEFAULT_MAX_PER_TENANT: usize = 3;
pub const DEFAULT_WELCOME_TEXT: &str = "Welcome to ChunkHost! 🚀";
pub const DEFAULT_WATERMARK_TEXT: &str = "ChunkHost VPS Service";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub database_url: String,
    pub base_image: String,
    pub network_mode: String,
    pub max_per_tenant: usize,
    pub welcome_text: String,
    pub watermark_text: String,
    pub hardware: HardwareProfile,

    /// Directory that holds transient provisioning scripts
    pub build_dir: PathBuf,
    pub build_timeout: Duration,
    pub run_timeout: Duration,
    pub stop_timeout: Duration,
    pub monitor_interval: Duration,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            network_mode: DEFAULT_NETWORK.to_string(),
            max_per_tenant: DEFAULT_MAX_PER_TENANT,
            welcome_text: DEFAULT_WELCOME_TEXT.to_string(),
            watermark_text: DEFAULT_WATERMARK_TEXT.to_string(),
            hardware: HardwareProfile::default(),
            build_dir: env::temp_dir(),
            build_timeout: Duration::from_secs(900),
            run_timeout: Duration::from_secs(120),
            stop_timeout: Duration::from_secs(10),
            monitor_interval: Duration::from_secs(300),
        }
    }
}

impl SandboxSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build settings from an arbitrary variable source; unset variables keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_per_tenant = match lookup(env_names::MAX_VPS_PER_USER) {
            Some(raw) => {
                let max = parse_number(env_names::MAX_VPS_PER_USER, &raw)?;
                if max == 0 {
                    return Err(ConfigError::InvalidValue {
                        name: env_names::MAX_VPS_PER_USER,
                        value: raw,
                        reason: "must be at least 1".to_string(),
                    });
                }
                max as usize
            }
            None => defaults.max_per_tenant,
        };

        let seconds = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(name) {
                Some(raw) => Ok(Duration::from_secs(parse_number(name, &raw)?)),
                None => Ok(default),
            }
        };

        Ok(Self {
            database_url: lookup(env_names::CHUNKHOST_DATABASE_URL)
                .unwrap_or(defaults.database_url),
            base_image: lookup(env_names::DEFAULT_OS_IMAGE).unwrap_or(defaults.base_image),
            network_mode: lookup(env_names::DOCKER_NETWORK).unwrap_or(defaults.network_mode),
            max_per_tenant,
            welcome_text: lookup(env_names::CHUNKHOST_WELCOME_MESSAGE)
                .unwrap_or(defaults.welcome_text),
            watermark_text: lookup(env_names::CHUNKHOST_WATERMARK)
                .unwrap_or(defaults.watermark_text),
            hardware: defaults.hardware,
            build_dir: lookup(env_names::CHUNKHOST_BUILD_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.build_dir),
            build_timeout: seconds(
                env_names::CHUNKHOST_BUILD_TIMEOUT_SECS,
                defaults.build_timeout,
            )?,
            run_timeout: seconds(env_names::CHUNKHOST_RUN_TIMEOUT_SECS, defaults.run_timeout)?,
            stop_timeout: seconds(
                env_names::CHUNKHOST_STOP_TIMEOUT_SECS,
                defaults.stop_timeout,
            )?,
            monitor_interval: seconds(
                env_names::CHUNKHOST_MONITOR_INTERVAL_SECS,
                defaults.monitor_interval,
            )?,
        })
    }

    /// Age below which an unrecorded container may still be mid-provisioning
    pub fn orphan_grace_period(&self) -> Duration {
        self.build_timeout.saturating_add(self.run_timeout)
    }
}

fn parse_number(name: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| ConfigError::InvalidValue {
            name,
            value: raw.to_string(),
            reason: e.to_string(),
        })
}
