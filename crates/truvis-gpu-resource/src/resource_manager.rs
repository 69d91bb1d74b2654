use std::rc::Rc;

use ash::vk;

use crate::backend::GfxBackend;
use crate::commands::barrier::GfxImageBarrier;
use crate::commands::submit_ring::{GfxCommandRecorder, GfxSubmitRing};
use crate::commands::submit_token::GfxSubmitToken;
use crate::config::GfxConfig;
use crate::error::{GfxError, GfxResult};
use crate::resources::deferred_queue::{GfxDeferredQueue, GfxTeardown};
use crate::resources::format::GfxFormat;
use crate::resources::pool::{GfxHandle, GfxPool};
use crate::resources::resource_data::{
    GfxBufferDesc, GfxBufferHandle, GfxBufferResource, GfxImageViewDesc, GfxPipelineHandle, GfxPipelineResource,
    GfxQueryPoolHandle, GfxQueryPoolResource, GfxSamplerDesc, GfxSamplerHandle, GfxSamplerResource, GfxTextureDesc,
    GfxTextureHandle, GfxTextureRange, GfxTextureResource,
};
use crate::staging::staging_ring::{GfxStagingContext, GfxStagingRing};

/// 资源管理器当前的状态统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GfxResourceStats {
    /// 不包含 staging buffer
    pub buffers: u32,
    pub textures: u32,
    pub samplers: u32,
    pub pipelines: u32,
    pub query_pools: u32,
    pub pending_deferred: usize,
    pub in_flight_submissions: u32,
    pub staging_buffer_size: vk::DeviceSize,
    pub staging_regions_in_flight: usize,
}

/// 空句柄返回 NotFound；过期句柄是程序缺陷，debug 下断言失败
fn resolve<'a, T>(pool: &'a GfxPool<T>, handle: GfxHandle<T>, kind: &'static str) -> GfxResult<&'a T> {
    if handle.is_empty() {
        return Err(GfxError::NotFound { kind });
    }
    pool.get(handle).ok_or_else(|| {
        debug_assert!(false, "stale {kind} handle: {handle:?}");
        GfxError::NotFound { kind }
    })
}

fn resolve_mut<'a, T>(pool: &'a mut GfxPool<T>, handle: GfxHandle<T>, kind: &'static str) -> GfxResult<&'a mut T> {
    if handle.is_empty() {
        return Err(GfxError::NotFound { kind });
    }
    pool.get_mut(handle).ok_or_else(|| {
        debug_assert!(false, "stale {kind} handle: {handle:?}");
        GfxError::NotFound { kind }
    })
}

/// GPU 资源的统一入口
///
/// 创建资源得到句柄；销毁时句柄立即失效，native 对象的释放推迟到所有可能引用它的提交完成之后。
/// 上传到 device local 的资源会经过 staging ring。
///
/// 需要手动调用 [`Self::destroy`]。
pub struct GfxResourceManager<B: GfxBackend> {
    backend: Rc<B>,
    config: GfxConfig,

    buffers: GfxPool<GfxBufferResource>,
    textures: GfxPool<GfxTextureResource>,
    samplers: GfxPool<GfxSamplerResource>,
    pipelines: GfxPool<GfxPipelineResource>,
    query_pools: GfxPool<GfxQueryPoolResource>,

    ring: GfxSubmitRing<B>,
    deferred: GfxDeferredQueue,
    staging: GfxStagingRing,

    destroyed: bool,
}

// new & init
impl<B: GfxBackend> GfxResourceManager<B> {
    pub fn new(backend: B, config: GfxConfig) -> GfxResult<Self> {
        let _span = tracy_client::span!("GfxResourceManager::new");
        config.validate()?;

        let backend = Rc::new(backend);
        let ring = GfxSubmitRing::new(backend.clone(), config.submit_ring_capacity, config.chain_submissions)?;
        let staging = GfxStagingRing::new(&config);
        log::info!(
            "resource manager created: ring capacity {}, staging {}..{} bytes, fallback {:?}",
            config.submit_ring_capacity,
            config.min_staging_buffer_size,
            config.max_staging_buffer_size,
            config.staging_fallback
        );

        Ok(Self {
            backend,
            config,
            buffers: GfxPool::new(),
            textures: GfxPool::new(),
            samplers: GfxPool::new(),
            pipelines: GfxPool::new(),
            query_pools: GfxPool::new(),
            ring,
            deferred: GfxDeferredQueue::new(),
            staging,
            destroyed: false,
        })
    }

    fn staging_parts(&mut self) -> (&mut GfxStagingRing, GfxStagingContext<'_, B>) {
        (
            &mut self.staging,
            GfxStagingContext {
                backend: &*self.backend,
                ring: &mut self.ring,
                buffers: &mut self.buffers,
                deferred: &mut self.deferred,
            },
        )
    }
}

// destroy
impl<B: GfxBackend> GfxResourceManager<B> {
    /// 等待 GPU 空闲，执行所有延迟任务，释放所有仍然存活的资源，最后销毁 submit ring
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        let _span = tracy_client::span!("GfxResourceManager::destroy");

        if let Err(e) = self.ring.wait_all() {
            log::error!("failed to wait for submissions while destroying: {e}");
        }
        if let Err(e) = self.deferred.wait_all(&mut self.ring) {
            log::error!("failed to drain deferred tasks while destroying: {e}");
        }
        if let Err(e) = self.backend.device_wait_idle() {
            log::error!("device wait idle failed while destroying: {e}");
        }

        let backend = &*self.backend;
        let mut leaked = 0;
        for (_, buffer) in self.buffers.drain() {
            backend.execute_teardown(GfxTeardown::Buffer(*buffer.buffer()));
            leaked += 1;
        }
        // view 必须先于 image 释放
        let textures: Vec<_> = self.textures.drain().map(|(_, texture)| texture).collect();
        for texture in &textures {
            backend.execute_teardown(GfxTeardown::ImageView(*texture.view()));
        }
        for texture in textures.iter().filter(|texture| *texture.owns_image()) {
            backend.execute_teardown(GfxTeardown::Image(*texture.image()));
        }
        leaked += textures.len();
        for (_, sampler) in self.samplers.drain() {
            backend.execute_teardown(GfxTeardown::Sampler(*sampler.sampler()));
            leaked += 1;
        }
        for (_, pipeline) in self.pipelines.drain() {
            backend.execute_teardown(GfxTeardown::Pipeline(*pipeline.pipeline()));
            backend.execute_teardown(GfxTeardown::PipelineLayout(*pipeline.layout()));
            leaked += 1;
        }
        for (_, query_pool) in self.query_pools.drain() {
            backend.execute_teardown(GfxTeardown::QueryPool(*query_pool.pool()));
            leaked += 1;
        }
        if !self.staging.buffer_handle().is_empty() {
            leaked -= 1;
        }
        if leaked > 0 {
            log::warn!("{leaked} resources were still alive when the resource manager was destroyed");
        }

        self.staging.forget_buffer();
        self.ring.destroy();
        self.destroyed = true;
        log::info!("resource manager destroyed");
    }
}

impl<B: GfxBackend> Drop for GfxResourceManager<B> {
    fn drop(&mut self) {
        debug_assert!(
            self.destroyed || std::thread::panicking(),
            "GfxResourceManager dropped without calling destroy()"
        );
    }
}

// buffer
impl<B: GfxBackend> GfxResourceManager<B> {
    pub fn create_buffer(&mut self, desc: &GfxBufferDesc, name: &str) -> GfxResult<GfxBufferHandle> {
        let _span = tracy_client::span!("GfxResourceManager::create_buffer");
        if desc.size == 0 {
            return Err(GfxError::ArgumentOutOfRange {
                context: "buffer size must not be zero",
                offset: 0,
                size: 0,
                limit: 0,
            });
        }
        let resource = self.backend.create_buffer(desc, name)?;
        Ok(self.buffers.create(resource))
    }

    /// 创建之后立即上传初始数据，上传失败时 buffer 会被销毁
    pub fn create_buffer_with_data(&mut self, desc: &GfxBufferDesc, data: &[u8], name: &str) -> GfxResult<GfxBufferHandle> {
        let handle = self.create_buffer(desc, name)?;
        if let Err(e) = self.upload_buffer(handle, 0, data) {
            self.destroy_buffer(handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// 句柄立即失效，native buffer 在最近 acquire 的提交完成后释放
    pub fn destroy_buffer(&mut self, handle: GfxBufferHandle) {
        debug_assert!(
            handle.is_empty() || handle != self.staging.buffer_handle(),
            "the staging buffer is owned by the staging ring"
        );
        if let Some(buffer) = self.buffers.destroy(handle) {
            self.deferred.push(&self.ring, GfxTeardown::Buffer(*buffer.buffer()), None);
        }
    }

    #[inline]
    pub fn get_buffer(&self, handle: GfxBufferHandle) -> Option<&GfxBufferResource> {
        self.buffers.get(handle)
    }

    /// 写入 buffer：host visible 直接写入映射内存，device local 通过 staging 上传
    pub fn upload_buffer(&mut self, handle: GfxBufferHandle, offset: vk::DeviceSize, data: &[u8]) -> GfxResult<()> {
        let _span = tracy_client::span!("GfxResourceManager::upload_buffer");
        resolve(&self.buffers, handle, "buffer")?.check_range(offset, data.len() as u64, "buffer upload")?;

        let (staging, mut ctx) = self.staging_parts();
        staging.buffer_sub_data(&mut ctx, handle, offset, data)
    }

    pub fn upload_buffer_pod<T: bytemuck::Pod>(
        &mut self,
        handle: GfxBufferHandle,
        offset: vk::DeviceSize,
        data: &[T],
    ) -> GfxResult<()> {
        self.upload_buffer(handle, offset, bytemuck::cast_slice(data))
    }

    /// 读取 buffer 的内容
    ///
    /// device local 的 buffer 会阻塞到拷贝完成；host visible 的 buffer 直接读取映射内存，
    /// 调用者需要自己保证 GPU 的写入已经完成。
    pub fn download_buffer(&mut self, handle: GfxBufferHandle, offset: vk::DeviceSize, out: &mut [u8]) -> GfxResult<()> {
        let _span = tracy_client::span!("GfxResourceManager::download_buffer");
        resolve(&self.buffers, handle, "buffer")?.check_range(offset, out.len() as u64, "buffer download")?;

        let (staging, mut ctx) = self.staging_parts();
        staging.get_buffer_sub_data(&mut ctx, handle, offset, out)
    }

    pub fn flush_mapped_memory(&self, handle: GfxBufferHandle, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()> {
        let buffer = resolve(&self.buffers, handle, "buffer")?;
        buffer.check_range(offset, size, "mapped memory flush")?;
        if !buffer.is_mapped() {
            return Err(GfxError::Backend(format!("buffer '{}' is not host visible", buffer.name())));
        }
        self.backend.flush_mapped(*buffer.buffer(), offset, size)
    }

    /// GPU 写入 host visible buffer 之后、host 读取之前调用
    pub fn invalidate_mapped_memory(
        &self,
        handle: GfxBufferHandle,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> GfxResult<()> {
        let buffer = resolve(&self.buffers, handle, "buffer")?;
        buffer.check_range(offset, size, "mapped memory invalidate")?;
        if !buffer.is_mapped() {
            return Err(GfxError::Backend(format!("buffer '{}' is not host visible", buffer.name())));
        }
        self.backend.invalidate_mapped(*buffer.buffer(), offset, size)
    }
}

// texture
impl<B: GfxBackend> GfxResourceManager<B> {
    /// 创建 image 以及覆盖整个 image 的默认 view
    pub fn create_texture(&mut self, desc: &GfxTextureDesc, name: &str) -> GfxResult<GfxTextureHandle> {
        let _span = tracy_client::span!("GfxResourceManager::create_texture");
        let extent = desc.extent;
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 || desc.array_layers == 0 {
            return Err(GfxError::ArgumentOutOfRange {
                context: "texture extent and layer count must not be zero",
                offset: 0,
                size: 0,
                limit: 0,
            });
        }
        let max_mips = 32 - extent.width.max(extent.height).max(extent.depth).leading_zeros();
        if desc.mip_levels == 0 || desc.mip_levels > max_mips {
            return Err(GfxError::ArgumentOutOfRange {
                context: "texture mip levels",
                offset: 0,
                size: desc.mip_levels as u64,
                limit: max_mips as u64,
            });
        }

        let image = self.backend.create_image(desc, name)?;
        let view = match self.backend.create_image_view(image, &desc.full_view(), name) {
            Ok(view) => view,
            Err(e) => {
                // image 还没有被任何命令使用，可以立即释放
                self.backend.execute_teardown(GfxTeardown::Image(image));
                return Err(e);
            }
        };
        Ok(self.textures.create(GfxTextureResource::new_owning(image, view, desc, name)))
    }

    /// 创建之后上传所有 mip 与 layer，数据按 [`GfxTextureRange`] 的顺序排列
    pub fn create_texture_with_data(
        &mut self,
        desc: &GfxTextureDesc,
        data: &[u8],
        name: &str,
    ) -> GfxResult<GfxTextureHandle> {
        let handle = self.create_texture(desc, name)?;
        let range = match self.textures.get(handle) {
            Some(texture) => GfxTextureRange::full(texture),
            None => return Err(GfxError::NotFound { kind: "texture" }),
        };
        if let Err(e) = self.upload_texture(handle, &range, data) {
            self.destroy_texture(handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// 共享 `texture` 的 image，创建另外一个 view；销毁时只释放 view
    ///
    /// view 需要先于拥有 image 的 texture 销毁
    pub fn create_texture_view(
        &mut self,
        texture: GfxTextureHandle,
        view_desc: GfxImageViewDesc,
        name: &str,
    ) -> GfxResult<GfxTextureHandle> {
        let source = resolve(&self.textures, texture, "texture")?;
        let mip_end = view_desc.base_mip_level as u64 + view_desc.mip_level_count as u64;
        if view_desc.mip_level_count == 0 || mip_end > *source.mip_levels() as u64 {
            return Err(GfxError::ArgumentOutOfRange {
                context: "texture view mip levels",
                offset: view_desc.base_mip_level as u64,
                size: view_desc.mip_level_count as u64,
                limit: *source.mip_levels() as u64,
            });
        }
        let layer_end = view_desc.base_array_layer as u64 + view_desc.array_layer_count as u64;
        if view_desc.array_layer_count == 0 || layer_end > *source.array_layers() as u64 {
            return Err(GfxError::ArgumentOutOfRange {
                context: "texture view array layers",
                offset: view_desc.base_array_layer as u64,
                size: view_desc.array_layer_count as u64,
                limit: *source.array_layers() as u64,
            });
        }

        let view = self.backend.create_image_view(*source.image(), &view_desc, name)?;
        let resource = source.new_view_of(view, view_desc, name);
        Ok(self.textures.create(resource))
    }

    pub fn destroy_texture(&mut self, handle: GfxTextureHandle) {
        if let Some(texture) = self.textures.destroy(handle) {
            self.deferred.push(&self.ring, GfxTeardown::ImageView(*texture.view()), None);
            if *texture.owns_image() {
                self.deferred.push(&self.ring, GfxTeardown::Image(*texture.image()), None);
            }
        }
    }

    #[inline]
    pub fn get_texture(&self, handle: GfxTextureHandle) -> Option<&GfxTextureResource> {
        self.textures.get(handle)
    }

    /// 上传 texture 的一部分，`data` 的长度必须与 `range` 需要的字节数一致
    pub fn upload_texture(&mut self, handle: GfxTextureHandle, range: &GfxTextureRange, data: &[u8]) -> GfxResult<()> {
        let _span = tracy_client::span!("GfxResourceManager::upload_texture");
        let texture = resolve_mut(&mut self.textures, handle, "texture")?;
        range.validate(texture)?;
        let needed = range.total_bytes(*texture.format())?;
        if data.len() as u64 != needed {
            return Err(GfxError::ArgumentOutOfRange {
                context: "texture data size does not match the range",
                offset: 0,
                size: data.len() as u64,
                limit: needed,
            });
        }

        let mut ctx = GfxStagingContext {
            backend: &*self.backend,
            ring: &mut self.ring,
            buffers: &mut self.buffers,
            deferred: &mut self.deferred,
        };
        self.staging.image_data_2d(&mut ctx, texture, range, data)
    }

    /// 以 mip 0 为源，逐级 blit 生成其余的 mip
    ///
    /// 所有 layer 都会生成，完成之后整个 image 处于 SHADER_READ_ONLY_OPTIMAL。只有一级 mip 时直接返回空 token。
    pub fn generate_mipmap(&mut self, handle: GfxTextureHandle) -> GfxResult<GfxSubmitToken> {
        let _span = tracy_client::span!("GfxResourceManager::generate_mipmap");
        let texture = resolve(&self.textures, handle, "texture")?;
        let mip_levels = *texture.mip_levels();
        if mip_levels <= 1 {
            return Ok(GfxSubmitToken::empty());
        }

        let format = *texture.format();
        let aspect = texture.aspect();
        let blittable = GfxFormat::block(format).is_some_and(|block| block.width == 1 && block.height == 1);
        if !blittable || aspect != vk::ImageAspectFlags::COLOR {
            return Err(GfxError::UnsupportedFormat(format));
        }
        let image = *texture.image();
        let extent = *texture.extent();
        let layers = *texture.array_layers();
        let base_layout = *texture.layout();

        let level_end = |mip: u32| vk::Offset3D {
            x: (extent.width >> mip).max(1) as i32,
            y: (extent.height >> mip).max(1) as i32,
            z: (extent.depth >> mip).max(1) as i32,
        };
        let transition = |mip: u32, layer: u32, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout| {
            GfxImageBarrier::new()
                .image(image)
                .image_aspect_flag(aspect)
                .subresource(mip, layer)
                .layout_transfer(old_layout, new_layout)
        };

        let recorder = self.ring.acquire()?;
        let cmd = recorder.command_buffer();
        for layer in 0..layers {
            self.backend.cmd_pipeline_barrier(
                cmd,
                &[],
                &[transition(0, layer, base_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .src_mask(vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::MEMORY_WRITE)
                    .dst_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_READ)],
            );

            for mip in 1..mip_levels {
                self.backend.cmd_pipeline_barrier(
                    cmd,
                    &[],
                    &[transition(mip, layer, vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                        .src_mask(vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE)
                        .dst_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)],
                );

                let layers_of = |mip_level: u32| vk::ImageSubresourceLayers {
                    aspect_mask: aspect,
                    mip_level,
                    base_array_layer: layer,
                    layer_count: 1,
                };
                self.backend.cmd_blit_image(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[vk::ImageBlit {
                        src_subresource: layers_of(mip - 1),
                        src_offsets: [vk::Offset3D::default(), level_end(mip - 1)],
                        dst_subresource: layers_of(mip),
                        dst_offsets: [vk::Offset3D::default(), level_end(mip)],
                    }],
                    vk::Filter::LINEAR,
                );

                // 作为下一级的源
                self.backend.cmd_pipeline_barrier(
                    cmd,
                    &[],
                    &[transition(mip, layer, vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                        .src_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)
                        .dst_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_READ)],
                );
            }

            let to_shader_read = (0..mip_levels)
                .map(|mip| {
                    transition(mip, layer, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                        .src_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_READ)
                        .dst_mask(vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::MEMORY_READ)
                })
                .collect::<Vec<_>>();
            self.backend.cmd_pipeline_barrier(cmd, &[], &to_shader_read);
        }

        let token = self.ring.submit(recorder)?;
        resolve_mut(&mut self.textures, handle, "texture")?.set_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        log::debug!("generated {} mip levels for {handle:?}", mip_levels - 1);
        Ok(token)
    }
}

// sampler & pipeline & query pool
impl<B: GfxBackend> GfxResourceManager<B> {
    pub fn create_sampler(&mut self, desc: &GfxSamplerDesc, name: &str) -> GfxResult<GfxSamplerHandle> {
        let sampler = self.backend.create_sampler(desc, name)?;
        Ok(self.samplers.create(GfxSamplerResource::new(sampler, *desc, name)))
    }

    pub fn destroy_sampler(&mut self, handle: GfxSamplerHandle) {
        if let Some(sampler) = self.samplers.destroy(handle) {
            self.deferred.push(&self.ring, GfxTeardown::Sampler(*sampler.sampler()), None);
        }
    }

    #[inline]
    pub fn get_sampler(&self, handle: GfxSamplerHandle) -> Option<&GfxSamplerResource> {
        self.samplers.get(handle)
    }

    /// 托管外部创建的 pipeline，之后由资源管理器负责释放 pipeline 与 layout
    pub fn register_pipeline(&mut self, pipeline: GfxPipelineResource) -> GfxPipelineHandle {
        self.pipelines.create(pipeline)
    }

    pub fn destroy_pipeline(&mut self, handle: GfxPipelineHandle) {
        if let Some(pipeline) = self.pipelines.destroy(handle) {
            self.deferred.push(&self.ring, GfxTeardown::Pipeline(*pipeline.pipeline()), None);
            self.deferred.push(&self.ring, GfxTeardown::PipelineLayout(*pipeline.layout()), None);
        }
    }

    #[inline]
    pub fn get_pipeline(&self, handle: GfxPipelineHandle) -> Option<&GfxPipelineResource> {
        self.pipelines.get(handle)
    }

    pub fn create_query_pool(&mut self, query_type: vk::QueryType, count: u32, name: &str) -> GfxResult<GfxQueryPoolHandle> {
        if count == 0 {
            return Err(GfxError::ArgumentOutOfRange {
                context: "query pool must hold at least one query",
                offset: 0,
                size: 0,
                limit: 0,
            });
        }
        let pool = self.backend.create_query_pool(query_type, count, name)?;
        Ok(self.query_pools.create(GfxQueryPoolResource::new(pool, query_type, count, name)))
    }

    pub fn destroy_query_pool(&mut self, handle: GfxQueryPoolHandle) {
        if let Some(query_pool) = self.query_pools.destroy(handle) {
            self.deferred.push(&self.ring, GfxTeardown::QueryPool(*query_pool.pool()), None);
        }
    }

    #[inline]
    pub fn get_query_pool(&self, handle: GfxQueryPoolHandle) -> Option<&GfxQueryPoolResource> {
        self.query_pools.get(handle)
    }
}

// commands
impl<B: GfxBackend> GfxResourceManager<B> {
    #[inline]
    pub fn acquire_command_buffer(&mut self) -> GfxResult<GfxCommandRecorder> {
        self.ring.acquire()
    }

    /// 录制 buffer 之间的拷贝，每个 region 都会检查范围
    pub fn cmd_copy_buffer(
        &self,
        recorder: &GfxCommandRecorder,
        src: GfxBufferHandle,
        dst: GfxBufferHandle,
        regions: &[vk::BufferCopy],
    ) -> GfxResult<()> {
        let src_buffer = resolve(&self.buffers, src, "buffer")?;
        let dst_buffer = resolve(&self.buffers, dst, "buffer")?;
        for region in regions {
            src_buffer.check_range(region.src_offset, region.size, "copy source")?;
            dst_buffer.check_range(region.dst_offset, region.size, "copy destination")?;
        }
        self.backend.cmd_copy_buffer(recorder.command_buffer(), *src_buffer.buffer(), *dst_buffer.buffer(), regions);
        Ok(())
    }

    /// 提交之后顺便执行已经可以执行的延迟任务
    pub fn submit(&mut self, recorder: GfxCommandRecorder) -> GfxResult<GfxSubmitToken> {
        let token = self.ring.submit(recorder)?;
        self.process_deferred_tasks();
        Ok(token)
    }

    #[inline]
    pub fn is_ready(&self, token: GfxSubmitToken) -> bool {
        self.ring.is_ready(token)
    }

    #[inline]
    pub fn wait(&mut self, token: GfxSubmitToken) -> GfxResult<()> {
        self.ring.wait(token)
    }

    #[inline]
    pub fn wait_all(&mut self) -> GfxResult<()> {
        self.ring.wait_all()
    }

    #[inline]
    pub fn wait_semaphore(&mut self, semaphore: vk::Semaphore) {
        self.ring.wait_semaphore(semaphore);
    }

    #[inline]
    pub fn signal_semaphore(&mut self, semaphore: vk::Semaphore, value: u64) {
        self.ring.signal_semaphore(semaphore, value);
    }

    #[inline]
    pub fn take_last_submit_semaphore(&mut self) -> Option<vk::Semaphore> {
        self.ring.take_last_submit_semaphore()
    }

    #[inline]
    pub fn last_submit_token(&self) -> GfxSubmitToken {
        self.ring.last_submit_token()
    }

    #[inline]
    pub fn next_submit_token(&self) -> GfxSubmitToken {
        self.ring.next_submit_token()
    }
}

// deferred tasks
impl<B: GfxBackend> GfxResourceManager<B> {
    /// 非阻塞，每次提交或每帧调用一次
    pub fn process_deferred_tasks(&mut self) -> usize {
        self.deferred.process(&self.ring)
    }

    /// 阻塞直到所有延迟任务执行完毕
    pub fn wait_deferred_tasks(&mut self) -> GfxResult<()> {
        self.deferred.wait_all(&mut self.ring)
    }
}

// getters
impl<B: GfxBackend> GfxResourceManager<B> {
    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[inline]
    pub fn config(&self) -> &GfxConfig {
        &self.config
    }

    #[inline]
    pub fn staging(&self) -> &GfxStagingRing {
        &self.staging
    }

    pub fn stats(&self) -> GfxResourceStats {
        let staging_buffers = u32::from(!self.staging.buffer_handle().is_empty());
        GfxResourceStats {
            buffers: self.buffers.len() - staging_buffers,
            textures: self.textures.len(),
            samplers: self.samplers.len(),
            pipelines: self.pipelines.len(),
            query_pools: self.query_pools.len(),
            pending_deferred: self.deferred.len(),
            in_flight_submissions: self.ring.in_flight(),
            staging_buffer_size: self.staging.buffer_size(),
            staging_regions_in_flight: self.staging.in_flight_regions(&self.ring),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{GfxHeadlessBackend, HeadlessCompletion};
    use crate::config::GfxStagingFallback;
    use crate::resources::resource_data::GfxStorageType;

    fn small_config() -> GfxConfig {
        GfxConfig {
            max_staging_buffer_size: 1024,
            min_staging_buffer_size: 256,
            staging_alignment: 16,
            submit_ring_capacity: 8,
            ..Default::default()
        }
    }

    fn manager(completion: HeadlessCompletion, config: GfxConfig) -> (GfxHeadlessBackend, GfxResourceManager<GfxHeadlessBackend>) {
        let gpu = GfxHeadlessBackend::new(completion);
        let manager = GfxResourceManager::new(gpu.clone(), config).unwrap();
        (gpu, manager)
    }

    fn device_buffer(manager: &mut GfxResourceManager<GfxHeadlessBackend>, size: u64) -> GfxBufferHandle {
        manager
            .create_buffer(&GfxBufferDesc::new(size, vk::BufferUsageFlags::STORAGE_BUFFER), "device")
            .unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn assert_staging_partition(manager: &GfxResourceManager<GfxHeadlessBackend>) {
        let staging = manager.staging();
        let mut spans: Vec<_> = staging.regions().map(|r| (*r.offset(), *r.size())).collect();
        spans.sort();
        assert_eq!(spans.iter().map(|(_, size)| size).sum::<u64>(), staging.buffer_size());
        for pair in spans.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }
    }

    #[test]
    fn test_multi_chunk_round_trip() {
        let (gpu, mut manager) = manager(HeadlessCompletion::OnWait, small_config());
        let buffer = device_buffer(&mut manager, 3000);
        let data = pattern(2500);

        manager.upload_buffer(buffer, 16, &data).unwrap();
        assert_staging_partition(&manager);

        let mut out = vec![0; data.len()];
        manager.download_buffer(buffer, 16, &mut out).unwrap();
        assert_eq!(out, data);
        assert_staging_partition(&manager);

        assert!(manager.staging().buffer_size() <= 1024);
        assert!(gpu.violations().is_empty());
        manager.destroy();
    }

    #[test]
    fn test_upload_larger_than_max_staging() {
        let (gpu, mut manager) = manager(HeadlessCompletion::OnWait, small_config());
        let buffer = device_buffer(&mut manager, 2000);
        let data = pattern(2000);

        manager.upload_buffer(buffer, 0, &data).unwrap();
        assert!(gpu.submission_log().len() >= 2);
        assert_eq!(manager.staging().buffer_size(), 1024);

        manager.wait_all().unwrap();
        let native = *manager.get_buffer(buffer).unwrap().buffer();
        assert_eq!(gpu.buffer_bytes(native).unwrap(), data);
        assert!(gpu.violations().is_empty());
        manager.destroy();
    }

    #[test]
    fn test_destroy_waits_for_submission() {
        let (gpu, mut manager) = manager(HeadlessCompletion::Manual, small_config());
        let src = device_buffer(&mut manager, 64);
        let dst = device_buffer(&mut manager, 64);
        let native_dst = *manager.get_buffer(dst).unwrap().buffer();

        let recorder = manager.acquire_command_buffer().unwrap();
        manager
            .cmd_copy_buffer(&recorder, src, dst, &[vk::BufferCopy { src_offset: 0, dst_offset: 0, size: 64 }])
            .unwrap();
        manager.submit(recorder).unwrap();

        manager.destroy_buffer(dst);
        assert!(manager.get_buffer(dst).is_none());
        assert_eq!(manager.process_deferred_tasks(), 0);
        assert!(gpu.is_alive_buffer(native_dst));

        gpu.signal_oldest();
        assert!(gpu.is_alive_buffer(native_dst));
        assert_eq!(manager.process_deferred_tasks(), 1);
        assert!(!gpu.is_alive_buffer(native_dst));
        assert_eq!(gpu.teardowns(), vec![GfxTeardown::Buffer(native_dst)]);

        assert!(gpu.violations().is_empty());
        manager.destroy();
    }

    #[test]
    fn test_out_of_range_arguments() {
        let (_gpu, mut manager) = manager(HeadlessCompletion::Immediate, small_config());
        let buffer = device_buffer(&mut manager, 64);

        assert!(matches!(
            manager.upload_buffer(buffer, 60, &[0; 8]),
            Err(GfxError::ArgumentOutOfRange { offset: 60, size: 8, limit: 64, .. })
        ));
        let mut out = [0; 65];
        assert!(matches!(manager.download_buffer(buffer, 0, &mut out), Err(GfxError::ArgumentOutOfRange { .. })));

        let other = device_buffer(&mut manager, 16);
        let recorder = manager.acquire_command_buffer().unwrap();
        let copy = vk::BufferCopy { src_offset: 0, dst_offset: 0, size: 32 };
        assert!(matches!(
            manager.cmd_copy_buffer(&recorder, buffer, other, &[copy]),
            Err(GfxError::ArgumentOutOfRange { .. })
        ));
        manager.submit(recorder).unwrap();

        assert!(matches!(
            manager.create_buffer(&GfxBufferDesc::new(0, vk::BufferUsageFlags::VERTEX_BUFFER), "empty"),
            Err(GfxError::ArgumentOutOfRange { .. })
        ));
        manager.destroy();
    }

    #[test]
    fn test_resolved_reference_borrows_only_the_pool() {
        let mut buffers = GfxPool::new();
        let mut samplers = GfxPool::new();
        let buffer = buffers.create(7u32);
        let sampler = samplers.create(9u32);

        // 引用只与 pool 绑定，另一个 pool 仍然可以可变借用
        let value = resolve(&buffers, buffer, "buffer").unwrap();
        *resolve_mut(&mut samplers, sampler, "sampler").unwrap() += 1;
        assert_eq!(*value + samplers.get(sampler).copied().unwrap(), 17);

        assert!(matches!(resolve(&buffers, GfxHandle::empty(), "buffer"), Err(GfxError::NotFound { kind: "buffer" })));
        assert!(matches!(
            resolve_mut(&mut samplers, GfxHandle::empty(), "sampler"),
            Err(GfxError::NotFound { kind: "sampler" })
        ));
    }

    #[test]
    fn test_empty_handle_is_not_found() {
        let (_gpu, mut manager) = manager(HeadlessCompletion::Immediate, small_config());
        assert!(matches!(
            manager.upload_buffer(GfxBufferHandle::empty(), 0, &[1]),
            Err(GfxError::NotFound { kind: "buffer" })
        ));
        assert!(matches!(
            manager.upload_texture(GfxTextureHandle::empty(), &GfxTextureRange::new_2d(1, 1), &[0; 4]),
            Err(GfxError::NotFound { kind: "texture" })
        ));
        // 空句柄的销毁是 no-op
        manager.destroy_buffer(GfxBufferHandle::empty());
        manager.destroy_texture(GfxTextureHandle::empty());
        assert_eq!(manager.stats().pending_deferred, 0);
        manager.destroy();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "stale")]
    fn test_stale_handle_asserts_in_debug() {
        let (_gpu, mut manager) = manager(HeadlessCompletion::Immediate, small_config());
        let buffer = device_buffer(&mut manager, 16);
        manager.destroy_buffer(buffer);
        let _ = manager.upload_buffer(buffer, 0, &[1]);
    }

    #[test]
    fn test_host_visible_upload_skips_staging() {
        let (gpu, mut manager) = manager(HeadlessCompletion::Manual, small_config());
        let desc = GfxBufferDesc::new(32, vk::BufferUsageFlags::UNIFORM_BUFFER).storage(GfxStorageType::HostVisible);
        let buffer = manager.create_buffer_with_data(&desc, &[5; 32], "uniform").unwrap();
        manager.upload_buffer_pod(buffer, 16, &[0x0403_0201u32]).unwrap();
        manager.flush_mapped_memory(buffer, 0, 32).unwrap();

        let mut out = [0; 8];
        manager.download_buffer(buffer, 14, &mut out).unwrap();
        assert_eq!(out, [5, 5, 1, 2, 3, 4, 5, 5]);
        assert!(gpu.submission_log().is_empty());
        assert_eq!(manager.staging().buffer_size(), 0);
        manager.destroy();
    }

    #[test]
    fn test_texture_upload_all_mips_and_layers() {
        let (gpu, mut manager) = manager(HeadlessCompletion::Immediate, small_config());
        let desc = GfxTextureDesc::new_2d(vk::Format::R8G8B8A8_UNORM, 4, 4).mip_levels(2).array_layers(2);
        // [mip0 layer0: 64][mip0 layer1: 64][mip1 layer0: 16][mip1 layer1: 16]
        let data = pattern(160);
        let handle = manager.create_texture_with_data(&desc, &data, "texture").unwrap();

        let texture = manager.get_texture(handle).unwrap();
        let image = *texture.image();
        assert_eq!(*texture.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(gpu.image_subresource_bytes(image, 0, 0).unwrap(), data[0..64]);
        assert_eq!(gpu.image_subresource_bytes(image, 0, 1).unwrap(), data[64..128]);
        assert_eq!(gpu.image_subresource_bytes(image, 1, 0).unwrap(), data[128..144]);
        assert_eq!(gpu.image_subresource_bytes(image, 1, 1).unwrap(), data[144..160]);
        for (mip, layer) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            assert_eq!(gpu.image_layout(image, mip, layer), Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));
        }
        // 只有一次提交
        assert_eq!(gpu.submission_log().len(), 1);

        // 只更新 mip 1 的第二个 layer
        let range = GfxTextureRange::new_2d(2, 2).mips(1, 1).layers(1, 1);
        manager.upload_texture(handle, &range, &[9; 16]).unwrap();
        assert_eq!(gpu.image_subresource_bytes(image, 1, 1).unwrap(), vec![9; 16]);
        assert_eq!(gpu.image_subresource_bytes(image, 1, 0).unwrap(), data[128..144]);

        assert!(matches!(
            manager.upload_texture(handle, &range, &[9; 15]),
            Err(GfxError::ArgumentOutOfRange { size: 15, limit: 16, .. })
        ));
        assert!(gpu.violations().is_empty());
        assert_staging_partition(&manager);
        manager.destroy();
    }

    #[test]
    fn test_texture_larger_than_max_staging() {
        let (_gpu, mut manager) = manager(HeadlessCompletion::Immediate, small_config());
        let desc = GfxTextureDesc::new_2d(vk::Format::R8G8B8A8_UNORM, 32, 32);
        let handle = manager.create_texture(&desc, "big").unwrap();
        let range = GfxTextureRange::new_2d(32, 32);
        assert!(matches!(
            manager.upload_texture(handle, &range, &[0; 4096]),
            Err(GfxError::StagingTooSmall { needed: 4096, max: 1024 })
        ));
        manager.destroy();
    }

    #[test]
    fn test_texture_view_does_not_own_image() {
        let (gpu, mut manager) = manager(HeadlessCompletion::Immediate, small_config());
        let desc = GfxTextureDesc::new_2d(vk::Format::R8G8B8A8_UNORM, 8, 8).mip_levels(3);
        let texture = manager.create_texture(&desc, "texture").unwrap();

        let mut view_desc = desc.full_view();
        view_desc.base_mip_level = 1;
        view_desc.mip_level_count = 2;
        let view = manager.create_texture_view(texture, view_desc, "mip view").unwrap();
        let native_view = *manager.get_texture(view).unwrap().view();

        view_desc.mip_level_count = 3;
        assert!(matches!(
            manager.create_texture_view(texture, view_desc, "bad view"),
            Err(GfxError::ArgumentOutOfRange { .. })
        ));

        manager.destroy_texture(view);
        manager.wait_deferred_tasks().unwrap();
        assert_eq!(gpu.teardowns(), vec![GfxTeardown::ImageView(native_view)]);
        assert!(manager.get_texture(texture).is_some());
        manager.destroy();
    }

    #[test]
    fn test_backend_failure_propagates() {
        let (gpu, mut manager) = manager(HeadlessCompletion::Immediate, small_config());

        gpu.fail_next_allocation();
        assert!(matches!(
            manager.create_buffer(&GfxBufferDesc::new(64, vk::BufferUsageFlags::VERTEX_BUFFER), "vb"),
            Err(GfxError::Runtime {
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                ..
            })
        ));

        // staging buffer 的分配失败同样交给调用者，之后可以重试
        let buffer = device_buffer(&mut manager, 64);
        gpu.fail_next_allocation();
        assert!(matches!(manager.upload_buffer(buffer, 0, &[1; 64]), Err(GfxError::Runtime { .. })));
        manager.upload_buffer(buffer, 0, &[1; 64]).unwrap();

        let native = *manager.get_buffer(buffer).unwrap().buffer();
        assert_eq!(gpu.buffer_bytes(native).unwrap(), vec![1; 64]);
        assert_eq!(manager.stats().buffers, 1);
        manager.destroy();
    }

    #[test]
    fn test_grow_policy_avoids_blocking() {
        let config = GfxConfig {
            staging_fallback: GfxStagingFallback::Grow,
            ..small_config()
        };
        let (gpu, mut manager) = manager(HeadlessCompletion::Manual, config);
        let a = device_buffer(&mut manager, 256);
        let b = device_buffer(&mut manager, 256);

        // Manual 模式下任何阻塞等待都会卡住，这里必须通过扩容完成
        manager.upload_buffer(a, 0, &[1; 200]).unwrap();
        manager.upload_buffer(b, 0, &[2; 200]).unwrap();
        assert_eq!(manager.staging().buffer_size(), 512);
        assert_eq!(gpu.pending_submissions(), 3);
        assert_eq!(manager.stats().pending_deferred, 1);

        gpu.complete_all();
        assert_eq!(manager.process_deferred_tasks(), 1);
        let native_a = *manager.get_buffer(a).unwrap().buffer();
        let native_b = *manager.get_buffer(b).unwrap().buffer();
        assert_eq!(gpu.buffer_bytes(native_a).unwrap()[..200], [1; 200]);
        assert_eq!(gpu.buffer_bytes(native_b).unwrap()[..200], [2; 200]);
        assert!(gpu.violations().is_empty());
        manager.destroy();
    }

    #[test]
    fn test_grow_waits_when_the_semaphore_chain_was_taken() {
        let config = GfxConfig {
            staging_fallback: GfxStagingFallback::Grow,
            ..small_config()
        };
        let (gpu, mut manager) = manager(HeadlessCompletion::Manual, config);
        let a = device_buffer(&mut manager, 256);
        let b = device_buffer(&mut manager, 256);

        manager.upload_buffer(a, 0, &[1; 200]).unwrap();
        assert!(manager.take_last_submit_semaphore().is_some());

        // 之后的提交不再排在 a 的上传之后，staging 只能等待并重置，不能扩容
        gpu.set_completion(HeadlessCompletion::OnWait);
        manager.upload_buffer(b, 0, &[2; 200]).unwrap();
        assert!(gpu.submission_log()[1].waits.is_empty());
        assert_eq!(manager.staging().buffer_size(), 256);
        assert_eq!(manager.stats().pending_deferred, 0);

        let native_a = *manager.get_buffer(a).unwrap().buffer();
        assert_eq!(gpu.buffer_bytes(native_a).unwrap()[..200], [1; 200]);

        manager.wait_all().unwrap();
        let native_b = *manager.get_buffer(b).unwrap().buffer();
        assert_eq!(gpu.buffer_bytes(native_b).unwrap()[..200], [2; 200]);
        assert!(gpu.violations().is_empty());
        manager.destroy();
    }

    #[test]
    fn test_destroy_waits_for_command_buffers_still_recording() {
        let (gpu, mut manager) = manager(HeadlessCompletion::Manual, small_config());
        let src = device_buffer(&mut manager, 64);
        let dst = device_buffer(&mut manager, 64);
        let other = device_buffer(&mut manager, 64);
        let native_src = *manager.get_buffer(src).unwrap().buffer();

        let recorder = manager.acquire_command_buffer().unwrap();
        manager
            .cmd_copy_buffer(&recorder, src, dst, &[vk::BufferCopy { src_offset: 0, dst_offset: 0, size: 64 }])
            .unwrap();
        // 录制期间的内部上传使用另外一个 slot，并且先完成
        manager.upload_buffer(other, 0, &[3; 64]).unwrap();
        manager.destroy_buffer(src);

        assert!(gpu.signal_oldest());
        assert_eq!(manager.process_deferred_tasks(), 0);
        assert!(gpu.is_alive_buffer(native_src));

        manager.submit(recorder).unwrap();
        assert!(gpu.is_alive_buffer(native_src));
        assert!(gpu.signal_oldest());
        assert_eq!(manager.process_deferred_tasks(), 1);
        assert!(!gpu.is_alive_buffer(native_src));

        assert!(gpu.violations().is_empty());
        manager.destroy();
    }

    #[test]
    fn test_generate_mipmap() {
        let (gpu, mut manager) = manager(HeadlessCompletion::Immediate, small_config());
        let desc = GfxTextureDesc::new_2d(vk::Format::R8_UNORM, 4, 4).mip_levels(3).array_layers(2);
        let handle = manager.create_texture(&desc, "mipmapped").unwrap();

        // 每个 2x2 的象限是同一个值
        let quadrants = [1, 1, 2, 2, 1, 1, 2, 2, 3, 3, 4, 4, 3, 3, 4, 4];
        for layer in 0..2 {
            let data = quadrants.map(|v| v + 10 * layer as u8);
            manager.upload_texture(handle, &GfxTextureRange::new_2d(4, 4).layers(layer, 1), &data).unwrap();
        }
        let token = manager.generate_mipmap(handle).unwrap();
        assert!(!token.is_empty());
        assert!(manager.is_ready(token));

        let image = *manager.get_texture(handle).unwrap().image();
        assert_eq!(gpu.image_subresource_bytes(image, 1, 0).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(gpu.image_subresource_bytes(image, 1, 1).unwrap(), vec![11, 12, 13, 14]);
        assert_eq!(gpu.image_subresource_bytes(image, 2, 0).unwrap(), vec![4]);
        assert_eq!(gpu.image_subresource_bytes(image, 2, 1).unwrap(), vec![14]);
        for mip in 0..3 {
            for layer in 0..2 {
                assert_eq!(gpu.image_layout(image, mip, layer), Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));
            }
        }
        assert_eq!(*manager.get_texture(handle).unwrap().layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert!(gpu.violations().is_empty());

        // 一级 mip 不需要提交；压缩格式不能 blit
        let single = manager.create_texture(&GfxTextureDesc::new_2d(vk::Format::R8_UNORM, 4, 4), "single").unwrap();
        let submissions = gpu.submission_log().len();
        assert!(manager.generate_mipmap(single).unwrap().is_empty());
        assert_eq!(gpu.submission_log().len(), submissions);
        let bc = GfxTextureDesc::new_2d(vk::Format::BC1_RGBA_UNORM_BLOCK, 8, 8).mip_levels(2);
        let bc = manager.create_texture(&bc, "bc1").unwrap();
        assert!(matches!(
            manager.generate_mipmap(bc),
            Err(GfxError::UnsupportedFormat(vk::Format::BC1_RGBA_UNORM_BLOCK))
        ));
        manager.destroy();
    }

    #[test]
    fn test_texture_upload_with_row_length() {
        let (gpu, mut manager) = manager(HeadlessCompletion::Immediate, small_config());
        let desc = GfxTextureDesc::new_2d(vk::Format::R8G8B8A8_UNORM, 2, 2);
        let handle = manager.create_texture(&desc, "padded").unwrap();

        // 每行 3 个像素，最后一个是填充
        let data = pattern(24);
        let range = GfxTextureRange::new_2d(2, 2).row_length(3);
        manager.upload_texture(handle, &range, &data).unwrap();

        let image = *manager.get_texture(handle).unwrap().image();
        let expected: Vec<u8> = data[0..8].iter().chain(&data[12..20]).copied().collect();
        assert_eq!(gpu.image_subresource_bytes(image, 0, 0).unwrap(), expected);

        assert!(matches!(
            manager.upload_texture(handle, &range, &data[..16]),
            Err(GfxError::ArgumentOutOfRange { size: 16, limit: 24, .. })
        ));
        assert!(matches!(
            manager.upload_texture(handle, &GfxTextureRange::new_2d(2, 2).row_length(1), &data[..8]),
            Err(GfxError::ArgumentOutOfRange { .. })
        ));
        assert!(gpu.violations().is_empty());
        manager.destroy();
    }

    #[test]
    fn test_invalidate_mapped_memory() {
        let (gpu, mut manager) = manager(HeadlessCompletion::Immediate, small_config());
        let desc = GfxBufferDesc::new(64, vk::BufferUsageFlags::STORAGE_BUFFER).storage(GfxStorageType::HostVisible);
        let readback = manager.create_buffer(&desc, "readback").unwrap();
        let device = device_buffer(&mut manager, 64);

        manager.invalidate_mapped_memory(readback, 16, 32).unwrap();
        let native = *manager.get_buffer(readback).unwrap().buffer();
        assert_eq!(gpu.invalidations(), vec![(native, 16, 32)]);

        assert!(matches!(
            manager.invalidate_mapped_memory(readback, 48, 32),
            Err(GfxError::ArgumentOutOfRange { .. })
        ));
        assert!(matches!(manager.invalidate_mapped_memory(device, 0, 16), Err(GfxError::Backend(_))));
        assert_eq!(gpu.invalidations().len(), 1);
        manager.destroy();
    }

    #[test]
    fn test_stats_and_clean_shutdown() {
        let (gpu, mut manager) = manager(HeadlessCompletion::OnWait, small_config());
        let buffer = manager
            .create_buffer_with_data(&GfxBufferDesc::new(128, vk::BufferUsageFlags::INDEX_BUFFER), &pattern(128), "ib")
            .unwrap();
        let texture = manager
            .create_texture_with_data(&GfxTextureDesc::new_2d(vk::Format::R8_UNORM, 8, 8), &pattern(64), "r8")
            .unwrap();
        let sampler = manager.create_sampler(&GfxSamplerDesc::default(), "linear").unwrap();
        let query_pool = manager.create_query_pool(vk::QueryType::TIMESTAMP, 4, "timestamps").unwrap();
        let (pipeline, layout) = gpu.create_fake_pipeline();
        let pipeline =
            manager.register_pipeline(GfxPipelineResource::new(pipeline, layout, vk::PipelineBindPoint::GRAPHICS, "pso"));

        let stats = manager.stats();
        assert_eq!(
            (stats.buffers, stats.textures, stats.samplers, stats.pipelines, stats.query_pools),
            (1, 1, 1, 1, 1)
        );
        assert_eq!(stats.staging_buffer_size, 256);

        manager.destroy_sampler(sampler);
        manager.destroy_pipeline(pipeline);
        manager.destroy_query_pool(query_pool);
        manager.wait_deferred_tasks().unwrap();
        assert_eq!(manager.stats().pending_deferred, 0);

        // buffer 与 texture 留给 destroy 释放
        let _ = (buffer, texture);
        manager.destroy();
        assert_eq!(gpu.live_resources(), 0);
        assert_eq!(gpu.live_sync_objects(), 0);
        assert!(gpu.violations().is_empty());
    }
}
