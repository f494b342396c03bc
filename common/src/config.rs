use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sleep::{parse_refresh_micros, SleepPlan};

pub const MAX_URL_LEN: usize = 255;
pub const MAX_REFRESH_LEN: usize = 9;
pub const MAX_SSID_LEN: usize = 32;
pub const MAX_WIFI_PASS_LEN: usize = 64;

pub const DEFAULT_REFRESH: &str = "100000";

// serde_json writes a control character as `\u00XX`, six bytes per input byte.
const JSON_ESCAPE_MAX: usize = 6;

/// Largest `AgentConfig::to_json` output for fields within their bounds.
pub const MAX_CONFIG_JSON_LEN: usize = r#"{"url1":"","url2":"","refresh":""}"#.len()
    + JSON_ESCAPE_MAX * (2 * MAX_URL_LEN + MAX_REFRESH_LEN);

/// Largest `NetworkConfig::to_json` output for fields within their bounds.
pub const MAX_NETWORK_JSON_LEN: usize = r#"{"wifi_ssid":"","wifi_pass":""}"#.len()
    + JSON_ESCAPE_MAX * (MAX_SSID_LEN + MAX_WIFI_PASS_LEN);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to decode config json: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode config json: {0}")]
    Encode(#[source] serde_json::Error),
}

/// The persisted record: two status URLs and the refresh interval, all kept
/// as strings exactly as the user typed them (after truncation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub url1: String,
    pub url2: String,
    pub refresh: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url1: String::new(),
            url2: String::new(),
            refresh: DEFAULT_REFRESH.to_string(),
        }
    }
}

impl AgentConfig {
    pub fn new(url1: &str, url2: &str, refresh: &str) -> Self {
        Self {
            url1: truncated(url1, MAX_URL_LEN),
            url2: truncated(url2, MAX_URL_LEN),
            refresh: truncated(refresh, MAX_REFRESH_LEN),
        }
    }

    pub fn sanitize(&mut self) {
        truncate_in_place(&mut self.url1, MAX_URL_LEN);
        truncate_in_place(&mut self.url2, MAX_URL_LEN);
        truncate_in_place(&mut self.refresh, MAX_REFRESH_LEN);
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_slice(raw).map_err(ConfigError::Decode)?;
        config.sanitize();
        Ok(config)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ConfigError> {
        serde_json::to_vec(self).map_err(ConfigError::Encode)
    }

    pub fn sleep_plan(&self) -> SleepPlan {
        SleepPlan::from_micros(parse_refresh_micros(&self.refresh))
    }
}

/// Station credentials entered through the portal. Stored next to, not
/// inside, the three-field [`AgentConfig`] record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        truncate_in_place(&mut self.wifi_ssid, MAX_SSID_LEN);
        truncate_in_place(&mut self.wifi_pass, MAX_WIFI_PASS_LEN);
    }

    pub fn has_station_credentials(&self) -> bool {
        let ssid = self.wifi_ssid.trim();
        !ssid.is_empty() && ssid != "CHANGE_ME"
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        let mut network: Self = serde_json::from_slice(raw).map_err(ConfigError::Decode)?;
        network.sanitize();
        Ok(network)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ConfigError> {
        serde_json::to_vec(self).map_err(ConfigError::Encode)
    }
}

/// Copies at most `max_len` bytes of `value`, backing off to the previous
/// char boundary so the result stays valid UTF-8.
pub fn truncated(value: &str, max_len: usize) -> String {
    let mut owned = value.to_string();
    truncate_in_place(&mut owned, max_len);
    owned
}

fn truncate_in_place(value: &mut String, max_len: usize) {
    if value.len() <= max_len {
        return;
    }

    let mut cut = max_len;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    value.truncate(cut);
}
