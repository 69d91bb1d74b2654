//! 错误类型
//!
//! 所有对外 API 都返回 [`GfxResult`]。参数校验错误与后端（Vulkan 调用）错误作为返回值交给调用者；
//! 句柄过期、重复销毁这类内部不变量被破坏的情况属于程序缺陷，由 debug 断言捕获。

use ash::vk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GfxError {
    /// upload/download 的范围超出了资源的实际大小
    #[error("argument out of range: {context} (offset: {offset}, size: {size}, limit: {limit})")]
    ArgumentOutOfRange {
        context: &'static str,
        offset: u64,
        size: u64,
        limit: u64,
    },

    /// 句柄为空，或者（release 下）句柄已经过期
    #[error("{kind} not found")]
    NotFound { kind: &'static str },

    /// Vulkan 调用失败
    #[error("{what} failed: {result:?}")]
    Runtime { what: &'static str, result: vk::Result },

    /// 所有的 ring slot 都处于 encoding 状态，没有任何一个提交能被回收
    #[error("submit ring exhausted: all {capacity} command buffers are being encoded")]
    RingExhausted { capacity: u32 },

    /// 单次 image 上传需要的 staging 空间超过了配置的最大值
    #[error("staging buffer too small: need {needed} bytes, max is {max}")]
    StagingTooSmall { needed: u64, max: u64 },

    /// 无法计算尺寸、或者不支持 blit 的 texture 格式
    #[error("unsupported format: {0:?}")]
    UnsupportedFormat(vk::Format),

    /// 配置不合法
    #[error("invalid config: {0}")]
    Config(String),

    /// 其他的后端错误（loader 失败、headless 模拟检测到的非法使用等）
    #[error("backend error: {0}")]
    Backend(String),
}

pub type GfxResult<T> = Result<T, GfxError>;

/// 将 `VkResult` 转换为 [`GfxResult`]，附带调用名称
pub(crate) trait VkResultExt<T> {
    fn gfx_context(self, what: &'static str) -> GfxResult<T>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    #[inline]
    fn gfx_context(self, what: &'static str) -> GfxResult<T> {
        self.map_err(|result| GfxError::Runtime { what, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_result_context() {
        let err = Err::<(), _>(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).gfx_context("vkAllocateMemory").unwrap_err();
        assert!(matches!(
            err,
            GfxError::Runtime {
                what: "vkAllocateMemory",
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            }
        ));
        assert!(err.to_string().contains("vkAllocateMemory"));
    }
}
