use crate::ident::KeyEncoding;
use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database: DatabaseConfig,
    pub identifiers: IdentifierConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub driver: String,
    pub host: Option<String>,
    pub database: Option<PathBuf>,
    pub user: Option<String>,
    pub secret: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: "sqlite".to_string(),
            host: None,
            database: None,
            user: None,
            secret: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentifierConfig {
    pub encoding: KeyEncoding,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Where a credential lives. Secrets are never written inline in the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretRef {
    Env(String),
    File(PathBuf),
}

impl SecretRef {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        if let Some(var) = raw.strip_prefix("env:") {
            if var.trim().is_empty() {
                bail!("secret reference `env:` needs a variable name");
            }
            return Ok(SecretRef::Env(var.trim().to_string()));
        }
        if let Some(path) = raw.strip_prefix("file:") {
            if path.trim().is_empty() {
                bail!("secret reference `file:` needs a path");
            }
            return Ok(SecretRef::File(PathBuf::from(path.trim())));
        }
        Err(anyhow!(
            "database.secret must be a reference (`env:<VAR>` or `file:<path>`), not a literal value"
        ))
    }
}

// Names where the secret lives, never the secret itself.
impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretRef::Env(var) => write!(f, "env:{var}"),
            SecretRef::File(path) => write!(f, "file:{}", path.to_string_lossy()),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.to_string_lossy()))?;
        Self::from_toml(&text)
            .with_context(|| format!("invalid config {}", path.to_string_lossy()))
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let cfg: Config = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let db = &self.database;
        if !db.driver.eq_ignore_ascii_case("sqlite") {
            bail!(
                "unsupported database.driver `{}` (supported: sqlite)",
                db.driver
            );
        }
        self.secret_ref()?;
        Ok(())
    }

    pub fn secret_ref(&self) -> anyhow::Result<Option<SecretRef>> {
        self.database
            .secret
            .as_deref()
            .map(SecretRef::parse)
            .transpose()
    }

    /// Settings that the sqlite driver accepts but has no use for.
    pub fn ignored_database_settings(&self) -> Vec<&'static str> {
        let db = &self.database;
        let mut out = Vec::new();
        if db.host.is_some() {
            out.push("host");
        }
        if db.user.is_some() {
            out.push("user");
        }
        if db.secret.is_some() {
            out.push("secret");
        }
        out
    }
}
