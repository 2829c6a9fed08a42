use std::{fs, path::Path, time::Duration};

use serde::Deserialize;

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub target: TargetConfig,

    pub scanner: ScannerConfig,

    #[serde(default)]
    pub login: LoginConfig,

    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// Directory for daily-rotated log files. Logging to files is disabled
    /// when unset.
    #[serde(default)]
    pub logging_dir: Option<String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let config: Config = toml::from_str(&fs::read_to_string(path)?)?;
        Ok(config)
    }
}

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Path of a newline-separated target list (bare addresses, CIDRs, or
    /// `start-end` spans).
    #[serde(default)]
    pub file: Option<String>,

    /// Inline target ranges, same formats as the file.
    #[serde(default)]
    pub ranges: Vec<String>,

    /// The protocol version written into handshakes. The login engine
    /// switches to whatever version the status response reports.
    pub protocol_version: i32,

    /// Per-read/write socket deadline in seconds. Defaults to 5.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl TargetConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(5))
    }
}

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ScannerConfig {
    /// Path to the range-scanner binary.
    #[serde(default = "default_scanner_binary")]
    pub binary: String,

    /// Packets per second handed to the range scanner.
    pub rate: u32,

    /// Port band to scan, e.g. `25565` or `25560-25600`.
    #[serde(default = "default_ports")]
    pub ports: String,

    /// How many ranges are scanned at the same time. Defaults to 4.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Classify from the status response only and never run the login
    /// engine.
    #[serde(default)]
    pub fast_mode: bool,
}

fn default_scanner_binary() -> String {
    "masscan".to_string()
}

fn default_ports() -> String {
    "25565".to_string()
}

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct LoginConfig {
    /// Username sent in Login Start. At most 16 characters.
    #[serde(default = "default_username")]
    pub username: String,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
        }
    }
}

fn default_username() -> String {
    "Steve".to_string()
}

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// OAuth application (client) id for the identity provider.
    pub client_id: String,

    /// Where the provider redirects after sign-in. Must be a loopback url
    /// registered on the application.
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,

    /// Skip the interactive sign-in by re-entering the chain with a stored
    /// refresh token. The MCPROBE_REFRESH_TOKEN environment variable takes
    /// precedence.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

fn default_redirect_uri() -> String {
    "http://localhost:8000/callback".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [target]
            ranges = ["10.0.0.0/24"]
            protocol_version = 765

            [scanner]
            rate = 10000
            "#,
        )
        .unwrap();
        assert_eq!(config.target.protocol_version, 765);
        assert_eq!(config.target.timeout(), Duration::from_secs(5));
        assert_eq!(config.scanner.binary, "masscan");
        assert_eq!(config.scanner.ports, "25565");
        assert!(!config.scanner.fast_mode);
        assert_eq!(config.login.username, "Steve");
        assert!(config.auth.is_none());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [target]
            protocol_version = 765
            addr = "example.com"

            [scanner]
            rate = 1000
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn auth_section_parses() {
        let config: Config = toml::from_str(
            r#"
            [target]
            protocol_version = 765

            [scanner]
            rate = 1000
            fast_mode = true

            [auth]
            client_id = "0000-1111"
            "#,
        )
        .unwrap();
        let auth = config.auth.unwrap();
        assert_eq!(auth.client_id, "0000-1111");
        assert_eq!(auth.redirect_uri, "http://localhost:8000/callback");
        assert!(config.scanner.fast_mode);
    }
}
