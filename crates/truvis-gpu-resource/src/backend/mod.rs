//! 后端能力接口
//!
//! 资源核心只通过 [`GfxBackend`] 与底层图形 API 交互，native handle 统一使用 `ash::vk` 中的类型。
//! - [`vulkan::GfxVulkanBackend`]：基于 ash + vk-mem 的真实实现
//! - [`headless::GfxHeadlessBackend`]：在 CPU 上模拟 GPU 执行，用于测试

pub mod headless;
pub mod vulkan;

use ash::vk;

use crate::commands::barrier::{GfxBufferBarrier, GfxImageBarrier};
use crate::commands::submit_info::GfxSubmitInfo;
use crate::error::GfxResult;
use crate::resources::deferred_queue::GfxTeardown;
use crate::resources::resource_data::{
    GfxBufferDesc, GfxBufferResource, GfxImageViewDesc, GfxSamplerDesc, GfxTextureDesc,
};

pub trait GfxBackend {
    // command pool & command buffer
    fn create_command_pool(&self, debug_name: &str) -> GfxResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool, debug_name: &str) -> GfxResult<vk::CommandBuffer>;
    /// 以 ONE_TIME_SUBMIT 开始录制
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> GfxResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GfxResult<()>;
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> GfxResult<()>;

    // synchronization
    fn create_fence(&self, signaled: bool, debug_name: &str) -> GfxResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn create_semaphore(&self, debug_name: &str) -> GfxResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    /// 非阻塞查询；设备丢失时返回 false 并记录错误
    fn poll_fence(&self, fence: vk::Fence) -> bool;
    /// 等待所有 fence，超时返回 `Ok(false)`
    fn wait_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> GfxResult<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> GfxResult<()>;
    fn queue_submit(&self, submit_info: &GfxSubmitInfo, fence: vk::Fence) -> GfxResult<()>;
    fn device_wait_idle(&self) -> GfxResult<()>;

    // command recording
    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]);
    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );
    /// src 与 dst 可以是同一个 image 的不同 mip
    #[allow(clippy::too_many_arguments)]
    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    );
    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        buffer_barriers: &[GfxBufferBarrier],
        image_barriers: &[GfxImageBarrier],
    );

    // resources
    fn create_buffer(&self, desc: &GfxBufferDesc, debug_name: &str) -> GfxResult<GfxBufferResource>;
    fn create_image(&self, desc: &GfxTextureDesc, debug_name: &str) -> GfxResult<vk::Image>;
    fn create_image_view(
        &self,
        image: vk::Image,
        desc: &GfxImageViewDesc,
        debug_name: &str,
    ) -> GfxResult<vk::ImageView>;
    fn create_sampler(&self, desc: &GfxSamplerDesc, debug_name: &str) -> GfxResult<vk::Sampler>;
    fn create_query_pool(&self, query_type: vk::QueryType, count: u32, debug_name: &str)
    -> GfxResult<vk::QueryPool>;

    /// 写入 host visible buffer 的映射内存，并 flush
    fn write_mapped(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> GfxResult<()>;
    /// invalidate 之后读取 host visible buffer 的映射内存
    fn read_mapped(&self, buffer: vk::Buffer, offset: vk::DeviceSize, out: &mut [u8]) -> GfxResult<()>;
    fn flush_mapped(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()>;
    /// 让 GPU 的写入对 host 可见，non-coherent 内存在读取之前需要调用
    fn invalidate_mapped(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()>;

    /// 真正释放一个 native 对象，调用者保证 GPU 已经不再使用它
    fn execute_teardown(&self, action: GfxTeardown);
}
