use serde::Deserialize;

use crate::error::{GfxError, GfxResult};

/// staging buffer 中没有任何可用 region 时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GfxStagingFallback {
    /// 阻塞等待所有 region 的提交完成，然后重置整个 buffer
    #[default]
    WaitAndReset,
    /// 先在最大值以内扩容 buffer，已经到达最大值时再退化为 WaitAndReset
    Grow,
}

/// 资源核心的配置，可以直接构造，也可以从 TOML 中读取
///
/// ```toml
/// max_staging_buffer_size = 134217728
/// staging_fallback = "grow"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GfxConfig {
    /// staging buffer 的上限，超过这个大小的上传会被拆分成多次提交
    pub max_staging_buffer_size: u64,
    /// staging buffer 的最小尺寸，避免频繁重建
    pub min_staging_buffer_size: u64,
    /// staging region 的对齐，必须是 2 的幂
    pub staging_alignment: u64,
    /// submit ring 中 command buffer 的数量，必须是 2 的幂
    pub submit_ring_capacity: u32,
    /// 每次提交都等待上一次提交的 semaphore，使得提交之间在 GPU 上有序
    pub chain_submissions: bool,
    pub staging_fallback: GfxStagingFallback,
}

impl Default for GfxConfig {
    fn default() -> Self {
        Self {
            max_staging_buffer_size: 128 * 1024 * 1024,
            min_staging_buffer_size: 4 * 2048 * 2048,
            staging_alignment: 16,
            submit_ring_capacity: 64,
            chain_submissions: true,
            staging_fallback: GfxStagingFallback::WaitAndReset,
        }
    }
}

impl GfxConfig {
    pub fn from_toml_str(s: &str) -> GfxResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| GfxError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> GfxResult<()> {
        if !self.staging_alignment.is_power_of_two() {
            return Err(GfxError::Config(format!("staging_alignment {} is not a power of two", self.staging_alignment)));
        }
        if !self.submit_ring_capacity.is_power_of_two() {
            return Err(GfxError::Config(format!(
                "submit_ring_capacity {} is not a power of two",
                self.submit_ring_capacity
            )));
        }
        if self.min_staging_buffer_size > self.max_staging_buffer_size {
            return Err(GfxError::Config(format!(
                "min_staging_buffer_size {} > max_staging_buffer_size {}",
                self.min_staging_buffer_size, self.max_staging_buffer_size
            )));
        }
        if self.max_staging_buffer_size < self.staging_alignment {
            return Err(GfxError::Config("max_staging_buffer_size is smaller than the alignment".to_string()));
        }
        Ok(())
    }
}
