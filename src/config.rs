use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::encoder::MIN_BUFFER_CAPACITY;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Time between capture passes.
    pub interval_ms: u64,
    /// Size of each capture buffer in bytes.
    pub buffer_capacity: usize,
    /// Number of method names kept by the name cache.
    pub name_cache_capacity: usize,
    /// Frames recorded per thread; the innermost ones are kept.
    pub max_frames: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            interval_ms: 1000,
            buffer_capacity: 100 * 1024,
            name_cache_capacity: 8192,
            max_frames: 512,
        }
    }
}

impl SamplerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SamplerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(Error::InvalidConfig("interval_ms must be positive"));
        }
        if self.buffer_capacity < MIN_BUFFER_CAPACITY {
            return Err(Error::InvalidConfig("buffer_capacity too small for an empty batch"));
        }
        if self.name_cache_capacity == 0 {
            return Err(Error::InvalidConfig("name_cache_capacity must be positive"));
        }
        if self.max_frames == 0 {
            return Err(Error::InvalidConfig("max_frames must be positive"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}
