//! Configuration: built-in defaults, merged with `ikup.toml`, merged with
//! `IKUP_*` environment variables, merged with CLI flags (highest
//! precedence, applied by the caller after [`Config::load`]).
//!
//! No process-wide singleton: [`Config`] is a plain value, constructed once
//! in `main` and threaded explicitly from there (spec.md §9).

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::idspace::{IDSpace, Subspace};

#[derive(Debug, Clone)]
pub struct Config {
    pub id_database_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub id_space: IDSpace,
    pub id_subspace: Option<Subspace>,
    pub max_num_ids: u64,
    pub cleanup_probability: f64,
    pub max_db_age_days: u64,
    pub max_images: u64,
    pub max_total_size_bytes: u64,
    pub cleanup_target: f64,
    pub thumbnail_file_size_tolerance: f64,
    pub file_max_size: Option<u64>,
    pub stream_max_size: Option<u64>,
    pub chunk_size: usize,
    pub allow_concurrent_uploads: bool,
    pub upload_stall_timeout_secs: f64,
    pub upload_progress_update_interval_secs: f64,
    pub use_line_feeds: bool,
}

/// Mirror of [`Config`] with every field optional, for deserializing
/// `ikup.toml` (which need not set every key) and for env overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PartialConfig {
    pub id_database_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub id_space: Option<String>,
    pub id_subspace: Option<String>,
    pub max_num_ids: Option<u64>,
    pub cleanup_probability: Option<f64>,
    pub max_db_age_days: Option<u64>,
    pub max_images: Option<u64>,
    pub max_total_size_bytes: Option<u64>,
    pub cleanup_target: Option<f64>,
    pub thumbnail_file_size_tolerance: Option<f64>,
    pub file_max_size: Option<u64>,
    pub stream_max_size: Option<u64>,
    pub chunk_size: Option<usize>,
    pub allow_concurrent_uploads: Option<bool>,
    pub upload_stall_timeout_secs: Option<f64>,
    pub upload_progress_update_interval_secs: Option<f64>,
    pub use_line_feeds: Option<bool>,
}

impl Config {
    pub fn defaults() -> Config {
        let base = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
        Config {
            id_database_dir: base.join("kitgfx").join("db"),
            cache_dir: base.join("kitgfx").join("cache"),
            id_space: IDSpace::Bit8Diacritic,
            id_subspace: None,
            max_num_ids: 1024,
            cleanup_probability: 0.02,
            max_db_age_days: 14,
            max_images: 1024,
            max_total_size_bytes: 512 * 1024 * 1024,
            cleanup_target: 0.8,
            thumbnail_file_size_tolerance: 0.05,
            file_max_size: None,
            stream_max_size: None,
            chunk_size: 4096,
            allow_concurrent_uploads: true,
            upload_stall_timeout_secs: 5.0,
            upload_progress_update_interval_secs: 1.0,
            use_line_feeds: false,
        }
    }

    /// Load defaults, merge `ikup.toml` from the user config dir if it
    /// exists, then merge `IKUP_*` environment variables.
    pub fn load() -> Result<Config> {
        let mut config = Config::defaults();

        if let Some(dir) = dirs::config_dir() {
            let path = dir.join("kitgfx").join("ikup.toml");
            if let Ok(text) = std::fs::read_to_string(&path) {
                let partial: PartialConfig = toml::from_str(&text)
                    .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
                config.merge(partial)?;
            }
        }

        config.merge(env_overrides())?;
        Ok(config)
    }

    pub fn merge(&mut self, p: PartialConfig) -> Result<()> {
        if let Some(v) = p.id_database_dir {
            self.id_database_dir = v;
        }
        if let Some(v) = p.cache_dir {
            self.cache_dir = v;
        }
        if let Some(v) = p.id_space {
            self.id_space = IDSpace::parse(&v)?;
        }
        if let Some(v) = p.id_subspace {
            self.id_subspace = Some(Subspace::parse(&v)?);
        }
        if let Some(v) = p.max_num_ids {
            self.max_num_ids = v;
        }
        if let Some(v) = p.cleanup_probability {
            self.cleanup_probability = v;
        }
        if let Some(v) = p.max_db_age_days {
            self.max_db_age_days = v;
        }
        if let Some(v) = p.max_images {
            self.max_images = v;
        }
        if let Some(v) = p.max_total_size_bytes {
            self.max_total_size_bytes = v;
        }
        if let Some(v) = p.cleanup_target {
            self.cleanup_target = v;
        }
        if let Some(v) = p.thumbnail_file_size_tolerance {
            self.thumbnail_file_size_tolerance = v;
        }
        if p.file_max_size.is_some() {
            self.file_max_size = p.file_max_size;
        }
        if p.stream_max_size.is_some() {
            self.stream_max_size = p.stream_max_size;
        }
        if let Some(v) = p.chunk_size {
            self.chunk_size = v;
        }
        if let Some(v) = p.allow_concurrent_uploads {
            self.allow_concurrent_uploads = v;
        }
        if let Some(v) = p.upload_stall_timeout_secs {
            self.upload_stall_timeout_secs = v;
        }
        if let Some(v) = p.upload_progress_update_interval_secs {
            self.upload_progress_update_interval_secs = v;
        }
        if let Some(v) = p.use_line_feeds {
            self.use_line_feeds = v;
        }
        Ok(())
    }

    pub fn to_toml(&self) -> String {
        format!(
            "id_database_dir = {:?}\ncache_dir = {:?}\nid_space = {:?}\nid_subspace = {:?}\n\
             max_num_ids = {}\ncleanup_probability = {}\nmax_db_age_days = {}\n\
             max_images = {}\nmax_total_size_bytes = {}\ncleanup_target = {}\n\
             thumbnail_file_size_tolerance = {}\nfile_max_size = {:?}\nstream_max_size = {:?}\n\
             chunk_size = {}\nallow_concurrent_uploads = {}\nupload_stall_timeout_secs = {}\n\
             upload_progress_update_interval_secs = {}\nuse_line_feeds = {}\n",
            self.id_database_dir.display(),
            self.cache_dir.display(),
            self.id_space.name(),
            self.id_subspace.map(|s| format!("{}:{}", s.begin, s.end)),
            self.max_num_ids,
            self.cleanup_probability,
            self.max_db_age_days,
            self.max_images,
            self.max_total_size_bytes,
            self.cleanup_target,
            self.thumbnail_file_size_tolerance,
            self.file_max_size,
            self.stream_max_size,
            self.chunk_size,
            self.allow_concurrent_uploads,
            self.upload_stall_timeout_secs,
            self.upload_progress_update_interval_secs,
            self.use_line_feeds,
        )
    }
}

/// Bind `IKUP_*` environment variables onto config keys, e.g.
/// `IKUP_MAX_NUM_IDS=2000` overrides `max_num_ids`.
fn env_overrides() -> PartialConfig {
    let mut p = PartialConfig::default();
    let get = |key: &str| std::env::var(format!("IKUP_{key}")).ok();

    p.id_database_dir = get("ID_DATABASE_DIR").map(PathBuf::from);
    p.cache_dir = get("CACHE_DIR").map(PathBuf::from);
    p.id_space = get("ID_SPACE");
    p.id_subspace = get("ID_SUBSPACE");
    p.max_num_ids = get("MAX_NUM_IDS").and_then(|v| v.parse().ok());
    p.cleanup_probability = get("CLEANUP_PROBABILITY").and_then(|v| v.parse().ok());
    p.max_db_age_days = get("MAX_DB_AGE_DAYS").and_then(|v| v.parse().ok());
    p.max_images = get("MAX_IMAGES").and_then(|v| v.parse().ok());
    p.max_total_size_bytes = get("MAX_TOTAL_SIZE_BYTES").and_then(|v| v.parse().ok());
    p.cleanup_target = get("CLEANUP_TARGET").and_then(|v| v.parse().ok());
    p.thumbnail_file_size_tolerance =
        get("THUMBNAIL_FILE_SIZE_TOLERANCE").and_then(|v| v.parse().ok());
    p.file_max_size = get("FILE_MAX_SIZE").and_then(|v| v.parse().ok());
    p.stream_max_size = get("STREAM_MAX_SIZE").and_then(|v| v.parse().ok());
    p.chunk_size = get("CHUNK_SIZE").and_then(|v| v.parse().ok());
    p.allow_concurrent_uploads = get("ALLOW_CONCURRENT_UPLOADS").and_then(|v| v.parse().ok());
    p.upload_stall_timeout_secs = get("UPLOAD_STALL_TIMEOUT_SECS").and_then(|v| v.parse().ok());
    p.upload_progress_update_interval_secs =
        get("UPLOAD_PROGRESS_UPDATE_INTERVAL_SECS").and_then(|v| v.parse().ok());
    p.use_line_feeds = get("USE_LINE_FEEDS").and_then(|v| v.parse().ok());
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overrides_only_set_fields() {
        let mut config = Config::defaults();
        let max_num_ids = config.max_num_ids;
        let mut partial = PartialConfig::default();
        partial.cleanup_probability = Some(0.5);
        config.merge(partial).unwrap();
        assert_eq!(config.cleanup_probability, 0.5);
        assert_eq!(config.max_num_ids, max_num_ids);
    }

    #[test]
    fn merge_rejects_bad_id_space() {
        let mut config = Config::defaults();
        let mut partial = PartialConfig::default();
        partial.id_space = Some("7bit".into());
        assert!(config.merge(partial).is_err());
    }
}
