use std::collections::VecDeque;

use ash::vk;
use derive_getters::Getters;

use crate::backend::GfxBackend;
use crate::commands::barrier::{GfxBarrierMask, GfxBufferBarrier, GfxImageBarrier};
use crate::commands::submit_ring::GfxSubmitRing;
use crate::commands::submit_token::GfxSubmitToken;
use crate::config::{GfxConfig, GfxStagingFallback};
use crate::error::{GfxError, GfxResult};
use crate::resources::deferred_queue::{GfxDeferredQueue, GfxTeardown};
use crate::resources::pool::GfxPool;
use crate::resources::resource_data::{
    GfxBufferDesc, GfxBufferHandle, GfxBufferResource, GfxStorageType, GfxTextureRange, GfxTextureResource,
};

/// staging buffer 中的一段，`token` 是最近一次使用这段内存的提交
#[derive(Debug, Clone, Copy, PartialEq, Eq, Getters)]
pub struct GfxStagingRegion {
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    token: GfxSubmitToken,
}

impl GfxStagingRegion {
    #[inline]
    fn free(offset: vk::DeviceSize, size: vk::DeviceSize) -> Self {
        Self {
            offset,
            size,
            token: GfxSubmitToken::empty(),
        }
    }
}

/// region 复用时需要的提交状态查询
pub trait GfxSubmitTracker {
    fn is_ready(&self, token: GfxSubmitToken) -> bool;
    fn wait(&mut self, token: GfxSubmitToken) -> GfxResult<()>;
}

impl<B: GfxBackend> GfxSubmitTracker for GfxSubmitRing<B> {
    #[inline]
    fn is_ready(&self, token: GfxSubmitToken) -> bool {
        GfxSubmitRing::is_ready(self, token)
    }

    #[inline]
    fn wait(&mut self, token: GfxSubmitToken) -> GfxResult<()> {
        GfxSubmitRing::wait(self, token)
    }
}

/// staging 操作需要借用的资源管理器内部状态
pub struct GfxStagingContext<'a, B: GfxBackend> {
    pub backend: &'a B,
    pub ring: &'a mut GfxSubmitRing<B>,
    pub buffers: &'a mut GfxPool<GfxBufferResource>,
    pub deferred: &'a mut GfxDeferredQueue,
}

/// host -> device 传输使用的环形 staging buffer
///
/// buffer 被划分为若干 region，所有 region 的尺寸之和始终等于 buffer 的尺寸（region 被取出使用的期间除外），
/// 且互不重叠。region 的 token 完成之后就可以再次使用。
pub struct GfxStagingRing {
    buffer: GfxBufferHandle,
    vk_buffer: vk::Buffer,
    buffer_size: vk::DeviceSize,
    buffer_counter: u32,

    min_size: vk::DeviceSize,
    max_size: vk::DeviceSize,
    alignment: vk::DeviceSize,
    fallback: GfxStagingFallback,

    regions: VecDeque<GfxStagingRegion>,
}

// new & init
impl GfxStagingRing {
    pub fn new(config: &GfxConfig) -> Self {
        debug_assert!(config.staging_alignment.is_power_of_two());
        Self {
            buffer: GfxBufferHandle::empty(),
            vk_buffer: vk::Buffer::null(),
            buffer_size: 0,
            buffer_counter: 0,
            min_size: config.min_staging_buffer_size,
            max_size: config.max_staging_buffer_size,
            alignment: config.staging_alignment,
            fallback: config.staging_fallback,
            regions: VecDeque::new(),
        }
    }

    /// 资源管理器销毁时调用，staging buffer 本身随 buffer pool 一起释放
    pub(crate) fn forget_buffer(&mut self) {
        self.buffer = GfxBufferHandle::empty();
        self.vk_buffer = vk::Buffer::null();
        self.buffer_size = 0;
        self.regions.clear();
    }
}

// getters
impl GfxStagingRing {
    #[inline]
    pub fn buffer_handle(&self) -> GfxBufferHandle {
        self.buffer
    }

    #[inline]
    pub fn buffer_size(&self) -> vk::DeviceSize {
        self.buffer_size
    }

    #[inline]
    pub fn max_size(&self) -> vk::DeviceSize {
        self.max_size
    }

    pub fn regions(&self) -> impl Iterator<Item = &GfxStagingRegion> {
        self.regions.iter()
    }

    pub fn in_flight_regions(&self, tracker: &impl GfxSubmitTracker) -> usize {
        self.regions.iter().filter(|region| !tracker.is_ready(region.token)).count()
    }

    #[inline]
    pub fn align(&self, size: vk::DeviceSize) -> vk::DeviceSize {
        (size + self.alignment - 1) & !(self.alignment - 1)
    }
}

// buffer management
impl GfxStagingRing {
    /// 保证 staging buffer 至少有 `size` 字节（不超过配置的最大值）
    ///
    /// 需要重建时会先等待所有 region 完成，旧的 buffer 通过延迟销毁队列释放
    pub fn ensure_capacity<B: GfxBackend>(
        &mut self,
        ctx: &mut GfxStagingContext<'_, B>,
        size: vk::DeviceSize,
    ) -> GfxResult<()> {
        let needed = self.align(size).max(self.min_size).min(self.max_size);
        if !self.buffer.is_empty() && (needed <= self.buffer_size || self.buffer_size == self.max_size) {
            return Ok(());
        }

        let _span = tracy_client::span!("GfxStagingRing::ensure_capacity");
        let old_size = self.buffer_size;
        if !self.buffer.is_empty() {
            self.wait_and_reset(&mut *ctx.ring)?;
            self.release_buffer(ctx, None);
        }
        if old_size + needed > self.max_size {
            // 旧 buffer 真正释放之后再分配，保证总的 staging 内存不超过最大值
            ctx.deferred.wait_all(&mut *ctx.ring)?;
        }

        self.allocate_buffer(ctx, needed)
    }

    fn allocate_buffer<B: GfxBackend>(
        &mut self,
        ctx: &mut GfxStagingContext<'_, B>,
        size: vk::DeviceSize,
    ) -> GfxResult<()> {
        let desc = GfxBufferDesc::new(size, vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
            .storage(GfxStorageType::HostVisible);
        let name = format!("staging buffer {}", self.buffer_counter);
        let resource = ctx.backend.create_buffer(&desc, &name)?;
        log::info!("allocated {name}: {size} bytes (max {})", self.max_size);

        self.buffer_counter += 1;
        self.vk_buffer = *resource.buffer();
        self.buffer = ctx.buffers.create(resource);
        self.buffer_size = size;
        self.regions.clear();
        self.regions.push_back(GfxStagingRegion::free(0, size));
        Ok(())
    }

    /// 旧 buffer 的释放等到 `token` 完成；None 表示使用 ring 的 next token
    fn release_buffer<B: GfxBackend>(&mut self, ctx: &mut GfxStagingContext<'_, B>, token: Option<GfxSubmitToken>) {
        if let Some(resource) = ctx.buffers.destroy(self.buffer) {
            ctx.deferred.push(ctx.ring, GfxTeardown::Buffer(*resource.buffer()), token);
        }
        self.forget_buffer();
    }

    /// 在不等待的情况下扩容，旧 buffer 在最近一次提交完成后释放
    ///
    /// 要求所有仍在使用旧 buffer 的提交都通过 semaphore 链排在最近一次提交之前，否则返回 false，
    /// 由调用者等待并重置
    fn try_grow<B: GfxBackend>(
        &mut self,
        ctx: &mut GfxStagingContext<'_, B>,
        aligned: vk::DeviceSize,
    ) -> GfxResult<bool> {
        if self.buffer.is_empty() || !ctx.ring.chain_submissions() {
            return Ok(false);
        }
        let unordered = self
            .regions
            .iter()
            .any(|region| !ctx.ring.is_ready(region.token) && !ctx.ring.is_in_current_chain(region.token));
        if unordered {
            log::debug!("staging regions are in flight outside the current semaphore chain, not growing");
            return Ok(false);
        }
        let new_size = self.align(self.buffer_size.saturating_mul(2).max(self.buffer_size + aligned)).min(self.max_size);
        if new_size <= self.buffer_size || self.buffer_size + new_size > self.max_size {
            return Ok(false);
        }

        log::info!("growing staging buffer from {} to {new_size} bytes without waiting", self.buffer_size);
        let retire_token = ctx.ring.last_submit_token();
        self.release_buffer(ctx, Some(retire_token));
        self.allocate_buffer(ctx, new_size)?;
        Ok(true)
    }
}

// region management
impl GfxStagingRing {
    /// 取出一段可用的 region，尺寸可能小于请求（调用者需要分多次传输）
    pub fn next_free_region<B: GfxBackend>(
        &mut self,
        ctx: &mut GfxStagingContext<'_, B>,
        size: vk::DeviceSize,
    ) -> GfxResult<GfxStagingRegion> {
        let aligned = self.align(size);
        self.ensure_capacity(ctx, aligned)?;

        if self.fallback == GfxStagingFallback::Grow && !self.has_ready_region(&*ctx.ring) {
            self.try_grow(ctx, aligned)?;
        }
        self.claim_region(aligned, &mut *ctx.ring)
    }

    /// 优先使用可用的 region；全部在使用中时阻塞等待并重置
    pub fn claim_region<T: GfxSubmitTracker>(
        &mut self,
        aligned: vk::DeviceSize,
        tracker: &mut T,
    ) -> GfxResult<GfxStagingRegion> {
        if let Some(region) = self.take_ready_region(aligned, tracker) {
            return Ok(region);
        }

        log::warn!(
            "no staging region is ready ({} in flight, buffer {} bytes), waiting for transfers",
            self.regions.len(),
            self.buffer_size
        );
        self.wait_and_reset(tracker)?;
        self.take_ready_region(aligned, tracker)
            .ok_or_else(|| GfxError::Backend("staging buffer has no memory to hand out".to_string()))
    }

    /// 等待所有 region 完成，然后把整个 buffer 重置为一个空闲 region
    pub fn wait_and_reset<T: GfxSubmitTracker>(&mut self, tracker: &mut T) -> GfxResult<()> {
        let _span = tracy_client::span!("GfxStagingRing::wait_and_reset");
        for region in &self.regions {
            tracker.wait(region.token)?;
        }
        self.regions.clear();
        if self.buffer_size > 0 {
            self.regions.push_back(GfxStagingRegion::free(0, self.buffer_size));
        }
        Ok(())
    }

    /// 归还一段 region，`token` 是使用它的提交
    #[inline]
    pub fn return_region(&mut self, mut region: GfxStagingRegion, token: GfxSubmitToken) {
        region.token = token;
        self.regions.push_back(region);
    }

    fn has_ready_region(&self, tracker: &impl GfxSubmitTracker) -> bool {
        self.regions.iter().any(|region| tracker.is_ready(region.token))
    }

    /// 第一个足够大的可用 region（多余的部分拆分出来放回队首）；
    /// 否则合并相邻的可用 region 后再找一次；仍然没有则返回最大的可用 region
    fn take_ready_region(&mut self, aligned: vk::DeviceSize, tracker: &impl GfxSubmitTracker) -> Option<GfxStagingRegion> {
        if let Some(region) = self.take_first_fit(aligned, tracker) {
            return Some(region);
        }
        if self.coalesce_ready(tracker) {
            if let Some(region) = self.take_first_fit(aligned, tracker) {
                return Some(region);
            }
        }

        let largest = self
            .regions
            .iter()
            .enumerate()
            .filter(|(_, region)| tracker.is_ready(region.token))
            .max_by_key(|(_, region)| region.size)
            .map(|(index, _)| index)?;
        self.regions.remove(largest).map(|region| GfxStagingRegion::free(region.offset, region.size))
    }

    fn take_first_fit(&mut self, aligned: vk::DeviceSize, tracker: &impl GfxSubmitTracker) -> Option<GfxStagingRegion> {
        let index = self
            .regions
            .iter()
            .position(|region| region.size >= aligned && tracker.is_ready(region.token))?;
        let region = self.regions.remove(index)?;
        if region.size > aligned {
            self.regions.push_front(GfxStagingRegion::free(region.offset + aligned, region.size - aligned));
        }
        Some(GfxStagingRegion::free(region.offset, aligned))
    }

    /// 合并地址相邻的可用 region，返回是否发生了合并
    fn coalesce_ready(&mut self, tracker: &impl GfxSubmitTracker) -> bool {
        let (mut ready, in_flight): (Vec<_>, Vec<_>) =
            self.regions.drain(..).partition(|region| tracker.is_ready(region.token));
        ready.sort_by_key(|region| region.offset);

        let before = ready.len();
        let mut merged: Vec<GfxStagingRegion> = Vec::with_capacity(ready.len());
        for region in ready {
            match merged.last_mut() {
                Some(last) if last.offset + last.size == region.offset => last.size += region.size,
                _ => merged.push(GfxStagingRegion::free(region.offset, region.size)),
            }
        }
        let coalesced = merged.len() != before;

        self.regions.extend(merged);
        self.regions.extend(in_flight);
        coalesced
    }
}

// transfers
impl GfxStagingRing {
    /// 向 buffer 写入数据
    ///
    /// host visible 的目标直接写入映射内存；否则分块拷贝到 staging，再录制 copy 命令并提交
    pub fn buffer_sub_data<B: GfxBackend>(
        &mut self,
        ctx: &mut GfxStagingContext<'_, B>,
        dst: GfxBufferHandle,
        dst_offset: vk::DeviceSize,
        data: &[u8],
    ) -> GfxResult<()> {
        let _span = tracy_client::span!("GfxStagingRing::buffer_sub_data");
        if data.is_empty() {
            return Ok(());
        }

        let (dst_buffer, dst_usage, mapped) = {
            let resource = ctx.buffers.get(dst).ok_or(GfxError::NotFound { kind: "buffer" })?;
            (*resource.buffer(), *resource.usage(), resource.is_mapped())
        };
        if mapped {
            return ctx.backend.write_mapped(dst_buffer, dst_offset, data);
        }

        let mut remaining = data;
        let mut dst_offset = dst_offset;
        while !remaining.is_empty() {
            let region = self.next_free_region(ctx, remaining.len() as vk::DeviceSize)?;
            let chunk = (remaining.len() as vk::DeviceSize).min(region.size);

            let token = match self.record_buffer_upload(ctx, &region, dst_buffer, dst_usage, dst_offset, &remaining[..chunk as usize]) {
                Ok(token) => token,
                Err(e) => {
                    self.return_region(region, GfxSubmitToken::empty());
                    return Err(e);
                }
            };
            self.return_region(region, token);

            remaining = &remaining[chunk as usize..];
            dst_offset += chunk;
        }
        Ok(())
    }

    fn record_buffer_upload<B: GfxBackend>(
        &self,
        ctx: &mut GfxStagingContext<'_, B>,
        region: &GfxStagingRegion,
        dst_buffer: vk::Buffer,
        dst_usage: vk::BufferUsageFlags,
        dst_offset: vk::DeviceSize,
        chunk: &[u8],
    ) -> GfxResult<GfxSubmitToken> {
        let size = chunk.len() as vk::DeviceSize;
        ctx.backend.write_mapped(self.vk_buffer, region.offset, chunk)?;

        let recorder = ctx.ring.acquire()?;
        let cmd = recorder.command_buffer();
        ctx.backend.cmd_copy_buffer(
            cmd,
            self.vk_buffer,
            dst_buffer,
            &[vk::BufferCopy {
                src_offset: region.offset,
                dst_offset,
                size,
            }],
        );
        ctx.backend.cmd_pipeline_barrier(
            cmd,
            &[GfxBufferBarrier::new().mask(GfxBarrierMask::after_buffer_upload(dst_usage)).buffer(
                dst_buffer,
                dst_offset,
                size,
            )],
            &[],
        );
        ctx.ring.submit(recorder)
    }

    /// 从 buffer 读取数据
    ///
    /// host visible 的 buffer 直接读取映射内存（调用者负责同步）；否则分块拷贝到 staging，等待完成后读回
    pub fn get_buffer_sub_data<B: GfxBackend>(
        &mut self,
        ctx: &mut GfxStagingContext<'_, B>,
        src: GfxBufferHandle,
        src_offset: vk::DeviceSize,
        out: &mut [u8],
    ) -> GfxResult<()> {
        let _span = tracy_client::span!("GfxStagingRing::get_buffer_sub_data");
        if out.is_empty() {
            return Ok(());
        }

        let (src_buffer, mapped) = {
            let resource = ctx.buffers.get(src).ok_or(GfxError::NotFound { kind: "buffer" })?;
            (*resource.buffer(), resource.is_mapped())
        };
        if mapped {
            return ctx.backend.read_mapped(src_buffer, src_offset, out);
        }

        let mut done = 0usize;
        while done < out.len() {
            let remaining = (out.len() - done) as vk::DeviceSize;
            let region = self.next_free_region(ctx, remaining)?;
            let chunk = remaining.min(region.size);
            let src_offset = src_offset + done as vk::DeviceSize;

            let result = self.record_buffer_download(ctx, &region, src_buffer, src_offset, chunk).and_then(|token| {
                ctx.ring.wait(token)?;
                ctx.backend.read_mapped(self.vk_buffer, region.offset, &mut out[done..done + chunk as usize])?;
                Ok(token)
            });
            match result {
                Ok(token) => self.return_region(region, token),
                Err(e) => {
                    self.return_region(region, GfxSubmitToken::empty());
                    return Err(e);
                }
            }
            done += chunk as usize;
        }
        Ok(())
    }

    fn record_buffer_download<B: GfxBackend>(
        &self,
        ctx: &mut GfxStagingContext<'_, B>,
        region: &GfxStagingRegion,
        src_buffer: vk::Buffer,
        src_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> GfxResult<GfxSubmitToken> {
        let recorder = ctx.ring.acquire()?;
        let cmd = recorder.command_buffer();
        ctx.backend.cmd_pipeline_barrier(
            cmd,
            &[GfxBufferBarrier::new().mask(GfxBarrierMask::before_transfer_read()).buffer(src_buffer, src_offset, size)],
            &[],
        );
        ctx.backend.cmd_copy_buffer(
            cmd,
            src_buffer,
            self.vk_buffer,
            &[vk::BufferCopy {
                src_offset,
                dst_offset: region.offset,
                size,
            }],
        );
        ctx.backend.cmd_pipeline_barrier(
            cmd,
            &[GfxBufferBarrier::new().mask(GfxBarrierMask::before_host_read()).buffer(self.vk_buffer, region.offset, size)],
            &[],
        );
        ctx.ring.submit(recorder)
    }

    /// 上传 texture 的若干 mip 与 layer
    ///
    /// 整个上传使用一段连续的 region 和一次提交，不会拆分；每个 (mip, layer) 经过
    /// UNDEFINED -> TRANSFER_DST -> SHADER_READ_ONLY 的 layout 转换
    pub fn image_data_2d<B: GfxBackend>(
        &mut self,
        ctx: &mut GfxStagingContext<'_, B>,
        texture: &mut GfxTextureResource,
        range: &GfxTextureRange,
        data: &[u8],
    ) -> GfxResult<()> {
        let _span = tracy_client::span!("GfxStagingRing::image_data_2d");

        let format = *texture.format();
        let total = range.total_bytes(format)?;
        if (data.len() as u64) < total {
            return Err(GfxError::ArgumentOutOfRange {
                context: "image data is shorter than the texture range",
                offset: 0,
                size: data.len() as u64,
                limit: total,
            });
        }
        if self.align(total) > self.max_size {
            return Err(GfxError::StagingTooSmall {
                needed: total,
                max: self.max_size,
            });
        }

        self.ensure_capacity(ctx, total)?;
        let mut region = self.next_free_region(ctx, total)?;
        if region.size < total {
            // image 不能分块，需要一段完整的 region
            self.return_region(region, GfxSubmitToken::empty());
            self.wait_and_reset(&mut *ctx.ring)?;
            region = self.next_free_region(ctx, total)?;
        }
        debug_assert!(region.size >= total);

        match self.record_image_upload(ctx, texture, range, &region, &data[..total as usize]) {
            Ok(token) => {
                texture.set_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
                self.return_region(region, token);
                Ok(())
            }
            Err(e) => {
                self.return_region(region, GfxSubmitToken::empty());
                Err(e)
            }
        }
    }

    fn record_image_upload<B: GfxBackend>(
        &self,
        ctx: &mut GfxStagingContext<'_, B>,
        texture: &GfxTextureResource,
        range: &GfxTextureRange,
        region: &GfxStagingRegion,
        data: &[u8],
    ) -> GfxResult<GfxSubmitToken> {
        ctx.backend.write_mapped(self.vk_buffer, region.offset, data)?;

        let image = *texture.image();
        let format = *texture.format();
        let aspect = texture.aspect();

        let recorder = ctx.ring.acquire()?;
        let cmd = recorder.command_buffer();

        let mut offset = 0;
        for mip in 0..range.num_mip_levels {
            let extent = range.mip_extent(mip);
            let level_bytes = range.level_bytes(format, mip)?;
            let mip_level = range.mip_level + mip;

            for layer in 0..range.num_layers {
                let array_layer = range.layer + layer;

                ctx.backend.cmd_pipeline_barrier(
                    cmd,
                    &[],
                    &[GfxImageBarrier::new()
                        .image(image)
                        .image_aspect_flag(aspect)
                        .subresource(mip_level, array_layer)
                        .layout_transfer(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                        .src_mask(vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE)
                        .dst_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)],
                );
                ctx.backend.cmd_copy_buffer_to_image(
                    cmd,
                    self.vk_buffer,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[vk::BufferImageCopy {
                        buffer_offset: region.offset + offset,
                        buffer_row_length: range.row_length,
                        buffer_image_height: 0,
                        image_subresource: vk::ImageSubresourceLayers {
                            aspect_mask: aspect,
                            mip_level,
                            base_array_layer: array_layer,
                            layer_count: 1,
                        },
                        image_offset: vk::Offset3D {
                            x: range.offset.x >> mip,
                            y: range.offset.y >> mip,
                            z: range.offset.z >> mip,
                        },
                        image_extent: extent,
                    }],
                );
                ctx.backend.cmd_pipeline_barrier(
                    cmd,
                    &[],
                    &[GfxImageBarrier::new()
                        .image(image)
                        .image_aspect_flag(aspect)
                        .subresource(mip_level, array_layer)
                        .layout_transfer(
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        )
                        .src_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)
                        .dst_mask(
                            vk::PipelineStageFlags2::ALL_COMMANDS,
                            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
                        )],
                );

                offset += level_bytes;
            }
        }

        ctx.ring.submit(recorder)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;

    /// 手动控制哪些 token 已经完成
    #[derive(Default)]
    struct FakeTracker {
        done: HashSet<u32>,
        waited: Vec<GfxSubmitToken>,
    }

    impl GfxSubmitTracker for FakeTracker {
        fn is_ready(&self, token: GfxSubmitToken) -> bool {
            token.is_empty() || self.done.contains(&token.submit_id)
        }

        fn wait(&mut self, token: GfxSubmitToken) -> GfxResult<()> {
            self.waited.push(token);
            self.done.insert(token.submit_id);
            Ok(())
        }
    }

    fn token(id: u32) -> GfxSubmitToken {
        GfxSubmitToken {
            slot_index: 0,
            submit_id: id,
        }
    }

    fn staging(size: u64) -> GfxStagingRing {
        let mut staging = GfxStagingRing::new(&GfxConfig::default());
        staging.buffer_size = size;
        staging.regions.push_back(GfxStagingRegion::free(0, size));
        staging
    }

    fn region(offset: u64, size: u64, id: u32) -> GfxStagingRegion {
        GfxStagingRegion {
            offset,
            size,
            token: token(id),
        }
    }

    /// 尺寸之和等于 buffer 的尺寸，且互不重叠
    fn assert_partition(staging: &GfxStagingRing) {
        let mut spans: Vec<_> = staging.regions().map(|r| (r.offset, r.size)).collect();
        spans.sort();
        assert_eq!(spans.iter().map(|(_, size)| size).sum::<u64>(), staging.buffer_size());
        for pair in spans.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0, "overlapping regions: {pair:?}");
        }
    }

    #[test]
    fn test_align() {
        let staging = staging(1024);
        assert_eq!(staging.align(1), 16);
        assert_eq!(staging.align(16), 16);
        assert_eq!(staging.align(17), 32);
    }

    #[test]
    fn test_first_fit_splits_leftover() {
        let mut staging = staging(1024);
        let mut tracker = FakeTracker::default();

        let got = staging.claim_region(112, &mut tracker).unwrap();
        assert_eq!((got.offset, got.size), (0, 112));
        assert_eq!(staging.regions().next().map(|r| (r.offset, r.size)), Some((112, 912)));

        staging.return_region(got, token(1));
        assert_partition(&staging);
        assert!(tracker.waited.is_empty());
    }

    #[test]
    fn test_falls_back_to_largest_ready() {
        let mut staging = staging(1024);
        staging.regions = VecDeque::from([region(0, 256, 1), region(256, 512, 2), region(768, 256, 3)]);
        let mut tracker = FakeTracker::default();
        tracker.done.insert(2);

        let got = staging.claim_region(600, &mut tracker).unwrap();
        assert_eq!((got.offset, got.size), (256, 512));
        assert!(got.token.is_empty());
        assert!(tracker.waited.is_empty());
    }

    #[test]
    fn test_coalesces_adjacent_ready_regions() {
        let mut staging = staging(1024);
        staging.regions = VecDeque::from([region(256, 256, 0), region(512, 512, 9), region(0, 256, 3)]);
        let mut tracker = FakeTracker::default();
        tracker.done.insert(3);

        let got = staging.claim_region(400, &mut tracker).unwrap();
        assert_eq!((got.offset, got.size), (0, 400));
        staging.return_region(got, token(10));
        assert_partition(&staging);
        assert!(tracker.waited.is_empty());
    }

    #[test]
    fn test_waits_and_resets_when_nothing_ready() {
        let mut staging = staging(1024);
        staging.regions = VecDeque::from([region(0, 512, 1), region(512, 512, 2)]);
        let mut tracker = FakeTracker::default();

        let got = staging.claim_region(2048, &mut tracker).unwrap();
        assert_eq!(tracker.waited, vec![token(1), token(2)]);
        // 请求超过 buffer 尺寸时拿到整个 buffer
        assert_eq!((got.offset, got.size), (0, 1024));
        assert_eq!(staging.regions().count(), 0);
    }

    #[test]
    fn test_random_uploads_keep_partition() {
        let mut rng = StdRng::seed_from_u64(0x5354_4147);
        let mut staging = staging(4096);
        let mut tracker = FakeTracker::default();
        let mut next_id = 1;
        let mut in_flight: Vec<u32> = Vec::new();

        for _ in 0..2000 {
            let size = staging.align(rng.gen_range(1..=3000));
            let got = staging.claim_region(size, &mut tracker).unwrap();
            assert!(got.size > 0);
            assert!(got.offset + got.size <= staging.buffer_size());

            staging.return_region(got, token(next_id));
            in_flight.push(next_id);
            next_id += 1;
            assert_partition(&staging);

            // 随机完成一些提交
            in_flight.retain(|id| {
                if rng.gen_bool(0.4) {
                    tracker.done.insert(*id);
                    false
                } else {
                    true
                }
            });
        }
    }
}
