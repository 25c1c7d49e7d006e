use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub cache: CacheConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Root directory holding the per-project `vector-store/`, `metadata/`
    /// and `locks/` trees.
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// A section heading only starts a new chunk once the current one has
    /// accumulated at least this many characters.
    #[serde(default = "default_min_section_chars")]
    pub min_section_chars: usize,
    /// Chunks flush unconditionally past this size, heading or not.
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    /// Approximate overlap carried from one chunk into the next.
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

fn default_min_section_chars() -> usize {
    2000
}
fn default_max_chunk_chars() -> usize {
    4000
}
fn default_overlap_chars() -> usize {
    400
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_section_chars: default_min_section_chars(),
            max_chunk_chars: default_max_chunk_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    /// Age after which a cross-process lock is presumed abandoned and may be
    /// reclaimed by a new acquirer.
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_stale_timeout_secs() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    10
}
fn default_backoff_min_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    3000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_timeout_secs: default_stale_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_min_ms: default_backoff_min_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.max_chunk_chars == 0 {
        anyhow::bail!("chunking.max_chunk_chars must be > 0");
    }
    if config.chunking.min_section_chars >= config.chunking.max_chunk_chars {
        anyhow::bail!("chunking.min_section_chars must be < chunking.max_chunk_chars");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chunk_chars {
        anyhow::bail!("chunking.overlap_chars must be < chunking.max_chunk_chars");
    }

    // Validate lock
    if config.lock.max_attempts == 0 {
        anyhow::bail!("lock.max_attempts must be >= 1");
    }
    if config.lock.backoff_min_ms > config.lock.backoff_max_ms {
        anyhow::bail!("lock.backoff_min_ms must be <= lock.backoff_max_ms");
    }

    Ok(config)
}
