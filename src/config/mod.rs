mod schema;

pub use schema::*;

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid ignore_tables_regex: {0}")]
    InvalidRegex(#[from] regex::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.backends.is_empty() {
        return Err(ConfigError::Invalid("at least one backend is required".into()));
    }
    let mut names: Vec<&str> = config.backends.iter().map(|b| b.name.as_str()).collect();
    names.sort_unstable();
    if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
        return Err(ConfigError::Invalid(format!(
            "backend name '{}' is used twice",
            dup[0]
        )));
    }
    if config.router.max_concurrent_updates == 0 {
        return Err(ConfigError::Invalid(
            "router.max_concurrent_updates must be at least 1".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_backend_names_rejected() {
        let config: Config = toml::from_str(
            r#"
[[backends]]
name = "a"
host = "h1"

[[backends]]
name = "a"
host = "h2"
"#,
        )
        .unwrap();
        assert!(matches!(validate(&config), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            load_config("/nonexistent/schemaproxy.toml"),
            Err(ConfigError::IoError(_))
        ));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }
}
