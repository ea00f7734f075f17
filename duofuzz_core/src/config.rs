use crate::adapter::{BleTargetConfig, CharacteristicBinding, HttpTargetConfig};
use crate::adapter::ble::DEFAULT_MAX_WRITE_LEN;
use crate::collector::DEFAULT_FAILURE_SAMPLE_CAP;
use crate::controller::{KindSchedule, RunSettings};
use crate::corpus::{CorpusError, SeedCorpus};
use crate::mutator::MutationKind;
use reqwest::Url;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Problems that abort a run before the first send.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Failed to parse TOML from config file {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Invalid [fuzzer] settings: {0}")]
    Fuzzer(String),

    #[error("Invalid [http] settings: {0}")]
    Http(String),

    #[error("Invalid [ble] settings: {0}")]
    Ble(String),

    #[error(transparent)]
    Corpus(#[from] CorpusError),

    /// The BLE bridge could not be reached or refused the device.
    #[error("BLE bridge unavailable: {0}")]
    BridgeUnavailable(String),
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleMode {
    /// Every kind, every round.
    #[default]
    Sweep,
    /// `draws` kinds picked at random each round.
    Random,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    #[serde(default)]
    pub rng_seed: u64,
    /// Overrides the per-target default kind set.
    #[serde(default)]
    pub kinds: Option<Vec<MutationKind>>,
    #[serde(default)]
    pub force_mutation: Option<MutationKind>,
    #[serde(default)]
    pub schedule: ScheduleMode,
    #[serde(default = "default_draws")]
    pub draws: usize,
    #[serde(default = "default_failure_sample_cap")]
    pub failure_sample_cap: usize,
    #[serde(default)]
    pub send_delay_ms: u64,
}

pub fn default_iterations() -> u64 {
    1
}

fn default_draws() -> usize {
    1
}

fn default_failure_sample_cap() -> usize {
    DEFAULT_FAILURE_SAMPLE_CAP
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            rng_seed: 0,
            kinds: None,
            force_mutation: None,
            schedule: ScheduleMode::default(),
            draws: default_draws(),
            failure_sample_cap: default_failure_sample_cap(),
            send_delay_ms: 0,
        }
    }
}

impl FuzzerSettings {
    /// Resolves the kind schedule for a target whose default kind set is `target_defaults`.
    ///
    /// A forced mutation wins over everything else.
    pub fn schedule(&self, target_defaults: &[MutationKind]) -> Result<KindSchedule, ConfigError> {
        if let Some(kind) = self.force_mutation {
            return Ok(KindSchedule::Forced(kind));
        }
        let kinds = match &self.kinds {
            Some(kinds) => kinds.clone(),
            None => target_defaults.to_vec(),
        };
        if kinds.is_empty() {
            return Err(ConfigError::Fuzzer("kinds must name at least one mutation kind".into()));
        }
        match self.schedule {
            ScheduleMode::Sweep => Ok(KindSchedule::Sweep(kinds)),
            ScheduleMode::Random if self.draws == 0 => {
                Err(ConfigError::Fuzzer("draws must be at least 1".into()))
            }
            ScheduleMode::Random => Ok(KindSchedule::Random {
                pool: kinds,
                draws: self.draws,
            }),
        }
    }

    pub fn run_settings(&self) -> Result<RunSettings, ConfigError> {
        if self.iterations == 0 {
            return Err(ConfigError::Fuzzer("iterations must be at least 1".into()));
        }
        Ok(RunSettings {
            rng_seed: self.rng_seed,
            failure_sample_cap: self.failure_sample_cap,
            send_delay: Duration::from_millis(self.send_delay_ms),
        })
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HttpSettings {
    #[serde(default = "default_http_url")]
    pub url: String,
    #[serde(default = "default_http_path")]
    pub path: String,
    #[serde(default = "default_http_method")]
    pub method: String,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_http_seeds")]
    pub seeds: PathBuf,
}

pub fn default_http_url() -> String {
    "http://127.0.0.1:8000/datatb/product/".to_string()
}

fn default_http_path() -> String {
    "add/".to_string()
}

fn default_http_method() -> String {
    "POST".to_string()
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

fn default_http_seeds() -> PathBuf {
    PathBuf::from("seeds/http.json")
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            url: default_http_url(),
            path: default_http_path(),
            method: default_http_method(),
            timeout_ms: default_http_timeout_ms(),
            headers: BTreeMap::new(),
            seeds: default_http_seeds(),
        }
    }
}

impl HttpSettings {
    /// Resolves the endpoint (`url` joined with `path`) and validates the request settings.
    pub fn target_config(&self) -> Result<HttpTargetConfig, ConfigError> {
        let mut base = Url::parse(&self.url)
            .map_err(|e| ConfigError::Http(format!("invalid url '{}': {e}", self.url)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::Http(format!(
                "url '{}' must use http or https",
                self.url
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join(&self.path)
            .map_err(|e| ConfigError::Http(format!("invalid path '{}': {e}", self.path)))?;

        let method = reqwest::Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ConfigError::Http(format!("invalid method '{}'", self.method)))?;
        if self.timeout_ms == 0 {
            return Err(ConfigError::Http("timeout-ms must be greater than 0".into()));
        }

        Ok(HttpTargetConfig {
            endpoint,
            method,
            headers: self.headers.clone().into_iter().collect(),
            timeout: Duration::from_millis(self.timeout_ms),
        })
    }

    pub fn load_seeds(&self) -> Result<SeedCorpus, ConfigError> {
        Ok(SeedCorpus::load_from_file(&self.seeds)?)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CharacteristicSettings {
    pub field: String,
    pub uuid: Uuid,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BleSettings {
    #[serde(default = "default_bridge_addr")]
    pub bridge_addr: String,
    #[serde(default = "default_ble_device")]
    pub device: String,
    #[serde(default = "default_ble_seeds")]
    pub seeds: PathBuf,
    #[serde(default = "default_ble_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_write_len")]
    pub max_write_len: usize,
    #[serde(default)]
    pub error_codes: Vec<u8>,
    /// Seed field holding the lock state a write should lead to. Empty disables the check.
    #[serde(default = "default_expected_state_field")]
    pub expected_state_field: String,
    #[serde(default)]
    pub characteristics: Vec<CharacteristicSettings>,
}

fn default_expected_state_field() -> String {
    "to_state".to_string()
}

pub fn default_bridge_addr() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_ble_device() -> String {
    "Smart Lock [Group 2]".to_string()
}

fn default_ble_seeds() -> PathBuf {
    PathBuf::from("seeds/ble.json")
}

fn default_ble_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect_delay_ms() -> u64 {
    1_500
}

fn default_max_write_len() -> usize {
    DEFAULT_MAX_WRITE_LEN
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            bridge_addr: default_bridge_addr(),
            device: default_ble_device(),
            seeds: default_ble_seeds(),
            timeout_ms: default_ble_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_write_len: default_max_write_len(),
            error_codes: Vec::new(),
            expected_state_field: default_expected_state_field(),
            characteristics: Vec::new(),
        }
    }
}

impl BleSettings {
    pub fn target_config(&self) -> Result<BleTargetConfig, ConfigError> {
        if self.characteristics.is_empty() {
            return Err(ConfigError::Ble(
                "at least one [[ble.characteristics]] entry is required".into(),
            ));
        }
        let mut seen = HashSet::new();
        for binding in &self.characteristics {
            if !seen.insert(binding.field.as_str()) {
                return Err(ConfigError::Ble(format!(
                    "field '{}' is bound to more than one characteristic",
                    binding.field
                )));
            }
        }
        if self.max_write_len == 0 || self.max_write_len > DEFAULT_MAX_WRITE_LEN {
            return Err(ConfigError::Ble(format!(
                "max-write-len must be between 1 and {DEFAULT_MAX_WRITE_LEN}"
            )));
        }

        Ok(BleTargetConfig {
            bindings: self
                .characteristics
                .iter()
                .map(|c| CharacteristicBinding {
                    field: c.field.clone(),
                    characteristic: c.uuid,
                })
                .collect(),
            max_write_len: self.max_write_len,
            error_codes: self.error_codes.clone(),
            expected_state_field: Some(self.expected_state_field.clone())
                .filter(|field| !field.is_empty()),
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn load_seeds(&self) -> Result<SeedCorpus, ConfigError> {
        Ok(SeedCorpus::load_from_file(&self.seeds)?)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ReportSettings {
    /// Prefix of the timestamped results directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("fuzzing_results")
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DuofuzzConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub ble: BleSettings,
    #[serde(default)]
    pub report: ReportSettings,
}

impl DuofuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
