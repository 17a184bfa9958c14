//! Configuration loader and validator for the AQI notification bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    pub waqi: Waqi,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
}

/// World Air Quality Index API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Waqi {
    pub token: String,
    #[serde(default = "default_waqi_base_url")]
    pub base_url: String,
}

fn default_waqi_base_url() -> String {
    "https://api.waqi.info/".to_string()
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Store URL: `DATABASE_URL` env var wins, otherwise a SQLite file under
    /// `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/aqibot.db", self.app.data_dir))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }
    if cfg.waqi.token.trim().is_empty() {
        return Err(ConfigError::Invalid("waqi.token must be non-empty"));
    }
    if cfg.waqi.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("waqi.base_url must be non-empty"));
    }
    Ok(())
}

/// Example YAML config, also used as a fixture by tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"

waqi:
  token: "YOUR_WAQI_API_TOKEN"
  base_url: "https://api.waqi.info/"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
    }

    #[test]
    fn base_url_defaults_when_absent() {
        let yaml = r#"
app:
  data_dir: "./data"
telegram:
  bot_token: "t"
waqi:
  token: "w"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.waqi.base_url, "https://api.waqi.info/");
    }

    #[test]
    fn invalid_bot_token() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.telegram.bot_token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("telegram.bot_token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_waqi_token() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.waqi.token = "  ".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("waqi.token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.waqi.token, "YOUR_WAQI_API_TOKEN");
    }
}
