use std::collections::HashSet;

use regex::Regex;

use crate::config::{ConfigError, RouterConfig};

use super::TableKey;

/// System schemas present on every server; never treated as duplicates
pub const BUILTIN_IGNORED_SCHEMAS: [&str; 4] =
    ["mysql", "information_schema", "performance_schema", "sys"];

/// Tables and schemas that may legitimately exist on more than one backend
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    names: HashSet<String>,
    pattern: Option<Regex>,
}

impl IgnoreList {
    pub fn new<I, S>(names: I, pattern: Option<&str>) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            names: names
                .into_iter()
                .map(|n| n.as_ref().trim().to_lowercase())
                .filter(|n| !n.is_empty())
                .collect(),
            pattern: pattern.map(Regex::new).transpose()?,
        })
    }

    pub fn from_config(config: &RouterConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            &config.ignore_tables,
            config.ignore_tables_regex.as_deref(),
        )?)
    }

    /// A schema entry covers the schema and every table in it
    pub fn is_ignored(&self, key: &TableKey) -> bool {
        if BUILTIN_IGNORED_SCHEMAS.contains(&key.schema_name()) {
            return true;
        }
        if self.names.contains(key.schema_name()) {
            return true;
        }
        let qualified = key.to_string();
        if !key.is_schema() && self.names.contains(&qualified) {
            return true;
        }
        self.pattern
            .as_ref()
            .map_or(false, |re| re.is_match(&qualified))
    }
}
