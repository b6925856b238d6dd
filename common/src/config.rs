use serde::{Deserialize, Serialize};
use thiserror::Error;

// IDF station config limits: 32-byte SSID, 64-byte passphrase.
pub const MAX_SSID_LEN: usize = 32;
pub const MAX_PASSWORD_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("ssid is empty")]
    EmptySsid,
    #[error("ssid is {0} bytes, limit is {MAX_SSID_LEN}")]
    SsidTooLong(usize),
    #[error("password is {0} bytes, limit is {MAX_PASSWORD_LEN}")]
    PasswordTooLong(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationCredential {
    pub ssid: String,
    pub password: String,
}

impl StationCredential {
    pub fn new(ssid: &str, password: &str) -> Result<Self, CredentialError> {
        if ssid.is_empty() {
            return Err(CredentialError::EmptySsid);
        }
        if ssid.len() > MAX_SSID_LEN {
            return Err(CredentialError::SsidTooLong(ssid.len()));
        }
        if password.len() > MAX_PASSWORD_LEN {
            return Err(CredentialError::PasswordTooLong(password.len()));
        }
        Ok(Self {
            ssid: ssid.to_string(),
            password: password.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    pub base_url: String,
    pub switch_path: String,
    pub temperature_path: String,
    pub humidity_path: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: "https://cloudswitch-default-rtdb.firebaseio.com".to_string(),
            switch_path: crate::paths::PATH_SWITCH.to_string(),
            temperature_path: crate::paths::PATH_TEMPERATURE.to_string(),
            humidity_path: crate::paths::PATH_HUMIDITY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    pub ap_ssid: String,
    pub ip: [u8; 4],
    pub channel: u8,
    pub max_clients: u8,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            ap_ssid: "ESP32_Setup".to_string(),
            ip: [192, 168, 4, 1],
            channel: 1,
            max_clients: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub cloud: CloudConfig,
    #[serde(default)]
    pub portal: PortalConfig,
}
