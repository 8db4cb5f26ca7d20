use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Registered users, keyed by username.
    #[serde(default)]
    pub users: BTreeMap<String, UserConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Blob store backend: `local` or `s3`.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Root directory for the `local` backend.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Settings for the `s3` backend.
    #[serde(default)]
    pub s3: Option<S3StorageConfig>,
}

fn default_backend() -> String {
    "local".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3StorageConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    /// Maximum tokens per text segment handed to the embedder.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    700
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Dimensionality of the bundled local embedder.
    #[serde(default = "default_dims")]
    pub dims: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dims: default_dims(),
        }
    }
}

fn default_dims() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct UserConfig {
    /// `admin` or `standard`.
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "standard".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate storage
    match config.storage.backend.as_str() {
        "local" => {
            if config.storage.root.is_none() {
                anyhow::bail!("storage.root must be set when storage.backend is 'local'");
            }
        }
        "s3" => {
            if config.storage.s3.is_none() {
                anyhow::bail!("[storage.s3] must be configured when storage.backend is 's3'");
            }
        }
        other => anyhow::bail!(
            "Unknown storage backend: '{}'. Must be local or s3.",
            other
        ),
    }

    // Validate ingestion
    if config.ingestion.max_tokens == 0 {
        anyhow::bail!("ingestion.max_tokens must be > 0");
    }

    // Validate embedding
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }

    // Validate users
    for (username, user) in &config.users {
        if !crate::permission::is_valid_username(username) {
            anyhow::bail!("invalid username in [users]: '{}'", username);
        }
        match user.role.as_str() {
            "admin" | "standard" => {}
            other => anyhow::bail!(
                "Unknown role '{}' for user '{}'. Must be admin or standard.",
                other,
                username
            ),
        }
    }

    Ok(config)
}
