//! Projector process configuration, read once at startup.

use anyhow::{Context, bail};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LensKind {
    Relational,
    Semantic,
    Graph,
    Translator,
}

impl std::str::FromStr for LensKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relational" => Ok(Self::Relational),
            "semantic" => Ok(Self::Semantic),
            "graph" => Ok(Self::Graph),
            "translator" => Ok(Self::Translator),
            other => bail!("unknown lens '{other}' (expected relational|semantic|graph|translator)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub model_type: String,
    pub model_id: String,
    pub model_version: String,
    pub template_id: String,
    pub vector_dim: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_type: "hash".to_string(),
            model_id: "hash-embed".to_string(),
            model_version: "1".to_string(),
            template_id: crate::lenses::semantic::DEFAULT_TEMPLATE_ID.to_string(),
            vector_dim: 384,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    pub lens: LensKind,
    pub port: u16,
    pub database_url: Option<String>,
    /// Gateway ingest endpoint + key; required by the translator lens.
    pub gateway_url: Option<String>,
    pub gateway_api_key: Option<String>,
    pub health_interval_s: u64,
    pub metrics_interval_s: u64,
    pub state_hash_interval_s: u64,
    pub embedding: EmbeddingConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

impl ProjectorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let lens: LensKind = std::env::var("MNX_PROJECTOR_LENS")
            .context("MNX_PROJECTOR_LENS must be set")?
            .parse()?;

        let embedding = EmbeddingConfig {
            model_type: std::env::var("MNX_EMBEDDING_MODEL_TYPE").unwrap_or_else(|_| "hash".into()),
            model_id: std::env::var("MNX_EMBEDDING_MODEL_ID").unwrap_or_else(|_| "hash-embed".into()),
            model_version: std::env::var("MNX_EMBEDDING_MODEL_VERSION").unwrap_or_else(|_| "1".into()),
            template_id: std::env::var("MNX_EMBEDDING_TEMPLATE_ID")
                .unwrap_or_else(|_| crate::lenses::semantic::DEFAULT_TEMPLATE_ID.into()),
            vector_dim: env_parse("MNX_EMBEDDING_VECTOR_DIM", 384usize)?,
        };

        let config = Self {
            lens,
            port: env_parse("MNX_PROJECTOR_PORT", 8081u16)?,
            database_url: std::env::var("DATABASE_URL").ok(),
            gateway_url: std::env::var("MNX_GATEWAY_URL").ok(),
            gateway_api_key: std::env::var("MNX_GATEWAY_API_KEY").ok(),
            health_interval_s: env_parse("MNX_HEALTH_INTERVAL_S", 30u64)?,
            metrics_interval_s: env_parse("MNX_METRICS_INTERVAL_S", 15u64)?,
            state_hash_interval_s: env_parse("MNX_STATE_HASH_INTERVAL_S", 60u64)?,
            embedding,
        };

        if config.lens == LensKind::Translator && config.gateway_url.is_none() {
            bail!("translator lens requires MNX_GATEWAY_URL");
        }
        Ok(config)
    }
}
