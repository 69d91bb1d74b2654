//! 在 CPU 上模拟 GPU 执行的后端
//!
//! - native handle 是递增的假值
//! - 提交的 command buffer 在"完成"时才真正执行（拷贝、blit、layout 转换），因此过早复用 staging 内存会读到错误的数据
//! - blit 总是按最近点采样，只支持非压缩格式
//! - 检测到的非法使用（释放仍被 pending 提交引用的对象、重复释放、layout 不匹配等）记录在 violations 中
//!
//! 何时完成由 [`HeadlessCompletion`] 决定；状态放在 `Arc<Mutex>` 里，测试可以从其他线程 signal。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ash::vk::{self, Handle};

use crate::backend::GfxBackend;
use crate::commands::barrier::{GfxBufferBarrier, GfxImageBarrier};
use crate::commands::submit_info::GfxSubmitInfo;
use crate::error::{GfxError, GfxResult};
use crate::resources::deferred_queue::GfxTeardown;
use crate::resources::format::GfxFormat;
use crate::resources::resource_data::{
    GfxBufferDesc, GfxBufferResource, GfxImageViewDesc, GfxSamplerDesc, GfxStorageType, GfxTextureDesc,
};

/// 提交何时完成
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadlessCompletion {
    /// 提交时立即完成
    Immediate,
    /// 有人等待 fence（或 device idle）时按提交顺序完成
    OnWait,
    /// 只有测试显式 signal 时才完成，等待会阻塞
    Manual,
}

/// 一次 queue submit 的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GfxHeadlessSubmitRecord {
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    pub waits: Vec<vk::Semaphore>,
    pub signals: Vec<(vk::Semaphore, u64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdState {
    Initial,
    Recording,
    Executable,
    Pending,
}

#[derive(Debug, Clone)]
enum SimCommand {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    ImageBarrier {
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        range: vk::ImageSubresourceRange,
    },
    BlitImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageBlit>,
    },
    BufferBarrier(vk::Buffer),
}

impl SimCommand {
    fn references(&self, action: GfxTeardown) -> bool {
        match (self, action) {
            (SimCommand::CopyBuffer { src, dst, .. }, GfxTeardown::Buffer(buffer)) => *src == buffer || *dst == buffer,
            (SimCommand::CopyBufferToImage { src, .. }, GfxTeardown::Buffer(buffer)) => *src == buffer,
            (SimCommand::CopyBufferToImage { dst, .. }, GfxTeardown::Image(image)) => *dst == image,
            (SimCommand::ImageBarrier { image: i, .. }, GfxTeardown::Image(image)) => *i == image,
            (SimCommand::BlitImage { src, dst, .. }, GfxTeardown::Image(image)) => *src == image || *dst == image,
            (SimCommand::BufferBarrier(b), GfxTeardown::Buffer(buffer)) => *b == buffer,
            _ => false,
        }
    }
}

struct SimCommandBuffer {
    pool: vk::CommandPool,
    state: CmdState,
    commands: Vec<SimCommand>,
}

struct SimBuffer {
    data: Vec<u8>,
    host_visible: bool,
}

struct SimSubresource {
    bytes: Vec<u8>,
    layout: vk::ImageLayout,
}

struct SimImage {
    format: vk::Format,
    extent: vk::Extent3D,
    mip_levels: u32,
    array_layers: u32,
    /// 下标为 `mip * array_layers + layer`
    subresources: Vec<SimSubresource>,
}

impl SimImage {
    fn mip_extent(&self, mip: u32) -> vk::Extent3D {
        vk::Extent3D {
            width: (self.extent.width >> mip).max(1),
            height: (self.extent.height >> mip).max(1),
            depth: (self.extent.depth >> mip).max(1),
        }
    }

    fn subresource(&self, mip: u32, layer: u32) -> Option<&SimSubresource> {
        if mip >= self.mip_levels || layer >= self.array_layers {
            return None;
        }
        self.subresources.get((mip * self.array_layers + layer) as usize)
    }

    fn subresource_mut(&mut self, mip: u32, layer: u32) -> Option<&mut SimSubresource> {
        if mip >= self.mip_levels || layer >= self.array_layers {
            return None;
        }
        self.subresources.get_mut((mip * self.array_layers + layer) as usize)
    }
}

struct SimSubmission {
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

struct SimState {
    completion: HeadlessCompletion,
    next_raw: u64,

    command_pools: HashSet<vk::CommandPool>,
    command_buffers: HashMap<vk::CommandBuffer, SimCommandBuffer>,
    fences: HashMap<vk::Fence, bool>,
    semaphores: HashSet<vk::Semaphore>,

    buffers: HashMap<vk::Buffer, SimBuffer>,
    images: HashMap<vk::Image, SimImage>,
    image_views: HashMap<vk::ImageView, vk::Image>,
    samplers: HashSet<vk::Sampler>,
    query_pools: HashSet<vk::QueryPool>,
    pipelines: HashSet<vk::Pipeline>,
    pipeline_layouts: HashSet<vk::PipelineLayout>,

    pending: VecDeque<SimSubmission>,
    submission_log: Vec<GfxHeadlessSubmitRecord>,
    teardowns: Vec<GfxTeardown>,
    invalidations: Vec<(vk::Buffer, vk::DeviceSize, vk::DeviceSize)>,
    violations: Vec<String>,
    fail_next_allocation: bool,
}

impl SimState {
    fn new(completion: HeadlessCompletion) -> Self {
        Self {
            completion,
            next_raw: 1,
            command_pools: HashSet::new(),
            command_buffers: HashMap::new(),
            fences: HashMap::new(),
            semaphores: HashSet::new(),
            buffers: HashMap::new(),
            images: HashMap::new(),
            image_views: HashMap::new(),
            samplers: HashSet::new(),
            query_pools: HashSet::new(),
            pipelines: HashSet::new(),
            pipeline_layouts: HashSet::new(),
            pending: VecDeque::new(),
            submission_log: Vec::new(),
            teardowns: Vec::new(),
            invalidations: Vec::new(),
            violations: Vec::new(),
            fail_next_allocation: false,
        }
    }

    fn next_handle<T: Handle>(&mut self) -> T {
        let raw = self.next_raw;
        self.next_raw += 1;
        T::from_raw(raw)
    }

    fn violation(&mut self, message: String) {
        log::error!("headless backend: {message}");
        self.violations.push(message);
    }

    fn take_allocation_failure(&mut self, what: &'static str) -> GfxResult<()> {
        if std::mem::take(&mut self.fail_next_allocation) {
            return Err(GfxError::Runtime {
                what,
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            });
        }
        Ok(())
    }

    fn is_fence_pending(&self, fence: vk::Fence) -> bool {
        self.pending.iter().any(|sub| sub.fence == fence)
    }

    fn referenced_by_pending(&self, action: GfxTeardown) -> bool {
        self.pending.iter().any(|sub| {
            self.command_buffers
                .get(&sub.command_buffer)
                .is_some_and(|cmd| cmd.commands.iter().any(|command| command.references(action)))
        })
    }

    fn record(&mut self, cmd: vk::CommandBuffer, command: SimCommand) {
        match self.command_buffers.get_mut(&cmd) {
            Some(buffer) if buffer.state == CmdState::Recording => buffer.commands.push(command),
            Some(buffer) => {
                let state = buffer.state;
                self.violation(format!("recording into {cmd:?} in state {state:?}"));
            }
            None => self.violation(format!("recording into unknown command buffer {cmd:?}")),
        }
    }

    /// 完成第 `index` 个 pending 的提交：执行其中的命令并 signal fence
    fn complete_at(&mut self, index: usize) -> bool {
        let Some(sub) = self.pending.remove(index) else {
            return false;
        };
        let commands = self.command_buffers.get(&sub.command_buffer).map(|cmd| cmd.commands.clone()).unwrap_or_default();
        for command in &commands {
            self.execute(command);
        }
        if let Some(signaled) = self.fences.get_mut(&sub.fence) {
            *signaled = true;
        }
        if let Some(cmd) = self.command_buffers.get_mut(&sub.command_buffer) {
            cmd.state = CmdState::Executable;
        }
        true
    }

    fn complete_all(&mut self) {
        while self.complete_at(0) {}
    }

    fn execute(&mut self, command: &SimCommand) {
        match command {
            SimCommand::CopyBuffer { src, dst, regions } => self.execute_copy_buffer(*src, *dst, regions),
            SimCommand::CopyBufferToImage {
                src,
                dst,
                layout,
                regions,
            } => self.execute_copy_buffer_to_image(*src, *dst, *layout, regions),
            SimCommand::ImageBarrier {
                image,
                old_layout,
                new_layout,
                range,
            } => self.execute_image_barrier(*image, *old_layout, *new_layout, *range),
            SimCommand::BlitImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
            } => self.execute_blit_image(*src, *src_layout, *dst, *dst_layout, regions),
            SimCommand::BufferBarrier(_) => {}
        }
    }

    fn execute_copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        let Some(mut src_buffer) = self.buffers.remove(&src) else {
            self.violation(format!("copy from unknown buffer {src:?}"));
            return;
        };

        for region in regions {
            let src_range = region.src_offset as usize..(region.src_offset + region.size) as usize;
            let dst_range = region.dst_offset as usize..(region.dst_offset + region.size) as usize;
            if src_range.end > src_buffer.data.len() {
                self.violation(format!("copy reads past the end of {src:?}"));
                continue;
            }

            if src == dst {
                if dst_range.end > src_buffer.data.len() {
                    self.violation(format!("copy writes past the end of {dst:?}"));
                    continue;
                }
                src_buffer.data.copy_within(src_range, dst_range.start);
                continue;
            }
            match self.buffers.get_mut(&dst) {
                Some(dst_buffer) if dst_range.end <= dst_buffer.data.len() => {
                    dst_buffer.data[dst_range].copy_from_slice(&src_buffer.data[src_range]);
                }
                Some(_) => self.violations.push(format!("copy writes past the end of {dst:?}")),
                None => self.violations.push(format!("copy into unknown buffer {dst:?}")),
            }
        }

        self.buffers.insert(src, src_buffer);
    }

    fn execute_copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        if layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
            self.violation(format!("copy into {dst:?} declared with layout {layout:?}"));
        }

        let mut problems = Vec::new();
        match (self.buffers.get(&src), self.images.get_mut(&dst)) {
            (Some(src_buffer), Some(image)) => {
                for region in regions {
                    copy_region_into_image(&src_buffer.data, image, region, &mut problems);
                }
            }
            _ => problems.push(format!("copy between unknown objects {src:?} -> {dst:?}")),
        }
        for problem in problems {
            self.violation(problem);
        }
    }

    fn execute_blit_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
    ) {
        if src_layout != vk::ImageLayout::TRANSFER_SRC_OPTIMAL {
            self.violation(format!("blit from {src:?} declared with layout {src_layout:?}"));
        }
        if dst_layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
            self.violation(format!("blit into {dst:?} declared with layout {dst_layout:?}"));
        }

        let mut problems = Vec::new();
        for region in regions {
            let src_sub = region.src_subresource;
            let dst_sub = region.dst_subresource;
            if src_sub.layer_count != dst_sub.layer_count {
                problems.push(format!("blit layer counts differ: {} vs {}", src_sub.layer_count, dst_sub.layer_count));
                continue;
            }
            for i in 0..src_sub.layer_count {
                // 先拷出源数据，src 和 dst 可能是同一个 image
                let source = self.images.get(&src).and_then(|image| {
                    let sub = image.subresource(src_sub.mip_level, src_sub.base_array_layer + i)?;
                    Some((sub.bytes.clone(), sub.layout, image.mip_extent(src_sub.mip_level), image.format))
                });
                let Some((src_bytes, current_src_layout, src_extent, format)) = source else {
                    problems.push(format!("blit from missing subresource of {src:?} mip {}", src_sub.mip_level));
                    continue;
                };
                if current_src_layout != vk::ImageLayout::TRANSFER_SRC_OPTIMAL {
                    problems.push(format!(
                        "blit from {src:?} mip {} while it is in {current_src_layout:?}",
                        src_sub.mip_level
                    ));
                }

                let Some(image) = self.images.get_mut(&dst) else {
                    problems.push(format!("blit into unknown image {dst:?}"));
                    continue;
                };
                let dst_format = image.format;
                let dst_extent = image.mip_extent(dst_sub.mip_level);
                let Some(dst_data) = image.subresource_mut(dst_sub.mip_level, dst_sub.base_array_layer + i) else {
                    problems.push(format!("blit into missing subresource of {dst:?} mip {}", dst_sub.mip_level));
                    continue;
                };
                if dst_data.layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
                    problems.push(format!(
                        "blit into {dst:?} mip {} while it is in {:?}",
                        dst_sub.mip_level, dst_data.layout
                    ));
                }
                if dst_format != format {
                    problems.push(format!("blit between formats {format:?} and {dst_format:?}"));
                    continue;
                }
                blit_nearest(&src_bytes, src_extent, region.src_offsets, dst_data, dst_extent, region.dst_offsets, format, &mut problems);
            }
        }
        for problem in problems {
            self.violation(problem);
        }
    }

    fn execute_image_barrier(
        &mut self,
        image_handle: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        range: vk::ImageSubresourceRange,
    ) {
        let mut problems = Vec::new();
        match self.images.get_mut(&image_handle) {
            Some(image) => {
                let level_count = if range.level_count == vk::REMAINING_MIP_LEVELS {
                    image.mip_levels.saturating_sub(range.base_mip_level)
                } else {
                    range.level_count
                };
                let layer_count = if range.layer_count == vk::REMAINING_ARRAY_LAYERS {
                    image.array_layers.saturating_sub(range.base_array_layer)
                } else {
                    range.layer_count
                };

                for mip in range.base_mip_level..range.base_mip_level + level_count {
                    for layer in range.base_array_layer..range.base_array_layer + layer_count {
                        let Some(sub) = image.subresource_mut(mip, layer) else {
                            problems.push(format!("barrier on missing subresource {image_handle:?} mip {mip} layer {layer}"));
                            continue;
                        };
                        if old_layout != vk::ImageLayout::UNDEFINED && old_layout != sub.layout {
                            problems.push(format!(
                                "barrier on {image_handle:?} mip {mip} layer {layer} expects {old_layout:?} but it is {:?}",
                                sub.layout
                            ));
                        }
                        sub.layout = new_layout;
                    }
                }
            }
            None => problems.push(format!("barrier on unknown image {image_handle:?}")),
        }
        for problem in problems {
            self.violation(problem);
        }
    }
}

fn copy_region_into_image(src: &[u8], image: &mut SimImage, region: &vk::BufferImageCopy, problems: &mut Vec<String>) {
    let Some(block) = GfxFormat::block(image.format) else {
        problems.push(format!("copy into image with unsupported format {:?}", image.format));
        return;
    };
    let sub = region.image_subresource;
    let extent = region.image_extent;
    let mip_extent = image.mip_extent(sub.mip_level);

    let row_bytes = extent.width.div_ceil(block.width) as usize * block.bytes as usize;
    let rows = extent.height.div_ceil(block.height) as usize;
    // buffer 中相邻两行的间距，0 表示紧密排列
    let row_texels = if region.buffer_row_length == 0 {
        extent.width
    } else {
        region.buffer_row_length
    };
    let row_pitch = row_texels.div_ceil(block.width) as usize * block.bytes as usize;
    let image_rows = if region.buffer_image_height == 0 {
        rows
    } else {
        region.buffer_image_height.div_ceil(block.height) as usize
    };
    let layer_bytes = row_pitch * image_rows * extent.depth as usize;
    let mip_row_bytes = mip_extent.width.div_ceil(block.width) as usize * block.bytes as usize;
    let mip_rows = mip_extent.height.div_ceil(block.height) as usize;

    let x_bytes = (region.image_offset.x as u32 / block.width) as usize * block.bytes as usize;
    let y_rows = (region.image_offset.y as u32 / block.height) as usize;
    let z = region.image_offset.z as usize;

    for i in 0..sub.layer_count {
        let layer = sub.base_array_layer + i;
        let Some(dst) = image.subresource_mut(sub.mip_level, layer) else {
            problems.push(format!("copy into missing subresource mip {} layer {layer}", sub.mip_level));
            continue;
        };
        if dst.layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
            problems.push(format!(
                "copy into mip {} layer {layer} while it is in {:?}",
                sub.mip_level, dst.layout
            ));
        }

        for d in 0..extent.depth as usize {
            for row in 0..rows {
                let src_offset = region.buffer_offset as usize + i as usize * layer_bytes + (d * image_rows + row) * row_pitch;
                let dst_offset = ((z + d) * mip_rows + y_rows + row) * mip_row_bytes + x_bytes;
                if src_offset + row_bytes > src.len() || dst_offset + row_bytes > dst.bytes.len() {
                    problems.push(format!("image copy row out of bounds (mip {} layer {layer})", sub.mip_level));
                    return;
                }
                dst.bytes[dst_offset..dst_offset + row_bytes].copy_from_slice(&src[src_offset..src_offset + row_bytes]);
            }
        }
    }
}

/// 按最近点采样把 `src_box` 缩放到 `dst_box`，只处理 z = 0 的切片
#[allow(clippy::too_many_arguments)]
fn blit_nearest(
    src: &[u8],
    src_extent: vk::Extent3D,
    src_box: [vk::Offset3D; 2],
    dst: &mut SimSubresource,
    dst_extent: vk::Extent3D,
    dst_box: [vk::Offset3D; 2],
    format: vk::Format,
    problems: &mut Vec<String>,
) {
    let block = match GfxFormat::block(format) {
        Some(block) if block.width == 1 && block.height == 1 => block,
        _ => {
            problems.push(format!("blit with unsupported format {format:?}"));
            return;
        }
    };
    let texel = block.bytes as usize;

    let (sx0, sy0) = (src_box[0].x as i64, src_box[0].y as i64);
    let (sw, sh) = (src_box[1].x as i64 - sx0, src_box[1].y as i64 - sy0);
    let (dx0, dy0) = (dst_box[0].x as i64, dst_box[0].y as i64);
    let (dw, dh) = (dst_box[1].x as i64 - dx0, dst_box[1].y as i64 - dy0);
    if sw <= 0 || sh <= 0 || dw <= 0 || dh <= 0 {
        problems.push("blit with an empty or mirrored region".to_string());
        return;
    }
    if sx0 < 0
        || sy0 < 0
        || dx0 < 0
        || dy0 < 0
        || sx0 + sw > src_extent.width as i64
        || sy0 + sh > src_extent.height as i64
        || dx0 + dw > dst_extent.width as i64
        || dy0 + dh > dst_extent.height as i64
    {
        problems.push("blit region out of bounds".to_string());
        return;
    }

    for y in 0..dh {
        let src_y = sy0 + (2 * y + 1) * sh / (2 * dh);
        for x in 0..dw {
            let src_x = sx0 + (2 * x + 1) * sw / (2 * dw);
            let from = (src_y as usize * src_extent.width as usize + src_x as usize) * texel;
            let to = ((dy0 + y) as usize * dst_extent.width as usize + (dx0 + x) as usize) * texel;
            dst.bytes[to..to + texel].copy_from_slice(&src[from..from + texel]);
        }
    }
}

struct Shared {
    state: Mutex<SimState>,
    completed: Condvar,
}

/// CPU 上模拟的后端，Clone 之后共享同一个"设备"
#[derive(Clone)]
pub struct GfxHeadlessBackend {
    shared: Arc<Shared>,
}

// new & init
impl GfxHeadlessBackend {
    pub fn new(completion: HeadlessCompletion) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState::new(completion)),
                completed: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_completion(&self, completion: HeadlessCompletion) {
        self.lock().completion = completion;
    }

    /// 下一次 buffer/image 分配返回 `ERROR_OUT_OF_DEVICE_MEMORY`
    pub fn fail_next_allocation(&self) {
        self.lock().fail_next_allocation = true;
    }

    /// 外部创建的 pipeline 与 layout，用于测试 pipeline 的托管
    pub fn create_fake_pipeline(&self) -> (vk::Pipeline, vk::PipelineLayout) {
        let mut state = self.lock();
        let pipeline = state.next_handle();
        let layout = state.next_handle();
        state.pipelines.insert(pipeline);
        state.pipeline_layouts.insert(layout);
        (pipeline, layout)
    }
}

// 控制 GPU 的进度
impl GfxHeadlessBackend {
    /// 完成最早的一次 pending 提交
    pub fn signal_oldest(&self) -> bool {
        let completed = self.lock().complete_at(0);
        self.shared.completed.notify_all();
        completed
    }

    /// 完成使用 `fence` 的那一次提交，可以不按提交顺序
    pub fn signal_fence(&self, fence: vk::Fence) -> bool {
        let completed = {
            let mut state = self.lock();
            match state.pending.iter().position(|sub| sub.fence == fence) {
                Some(index) => state.complete_at(index),
                None => false,
            }
        };
        self.shared.completed.notify_all();
        completed
    }

    pub fn complete_all(&self) {
        self.lock().complete_all();
        self.shared.completed.notify_all();
    }
}

// 检查模拟状态
impl GfxHeadlessBackend {
    pub fn pending_submissions(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn submission_log(&self) -> Vec<GfxHeadlessSubmitRecord> {
        self.lock().submission_log.clone()
    }

    pub fn teardowns(&self) -> Vec<GfxTeardown> {
        self.lock().teardowns.clone()
    }

    /// `invalidate_mapped` 调用过的范围
    pub fn invalidations(&self) -> Vec<(vk::Buffer, vk::DeviceSize, vk::DeviceSize)> {
        self.lock().invalidations.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    /// 仍然存活的 fence、semaphore 与 command pool
    pub fn live_sync_objects(&self) -> usize {
        let state = self.lock();
        state.fences.len() + state.semaphores.len() + state.command_pools.len()
    }

    /// 仍然存活的资源对象（buffer、image、view、sampler、query pool、pipeline 与 layout）
    pub fn live_resources(&self) -> usize {
        let state = self.lock();
        state.buffers.len()
            + state.images.len()
            + state.image_views.len()
            + state.samplers.len()
            + state.query_pools.len()
            + state.pipelines.len()
            + state.pipeline_layouts.len()
    }

    pub fn is_alive_buffer(&self, buffer: vk::Buffer) -> bool {
        self.lock().buffers.contains_key(&buffer)
    }

    pub fn buffer_bytes(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.lock().buffers.get(&buffer).map(|b| b.data.clone())
    }

    pub fn image_subresource_bytes(&self, image: vk::Image, mip: u32, layer: u32) -> Option<Vec<u8>> {
        self.lock().images.get(&image)?.subresource(mip, layer).map(|sub| sub.bytes.clone())
    }

    pub fn image_layout(&self, image: vk::Image, mip: u32, layer: u32) -> Option<vk::ImageLayout> {
        self.lock().images.get(&image)?.subresource(mip, layer).map(|sub| sub.layout)
    }
}

impl GfxBackend for GfxHeadlessBackend {
    fn create_command_pool(&self, _debug_name: &str) -> GfxResult<vk::CommandPool> {
        let mut state = self.lock();
        let pool = state.next_handle();
        state.command_pools.insert(pool);
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.lock();
        if !state.command_pools.remove(&pool) {
            state.violation(format!("destroying unknown command pool {pool:?}"));
            return;
        }
        let busy = state.pending.iter().any(|sub| {
            state.command_buffers.get(&sub.command_buffer).is_some_and(|cmd| cmd.pool == pool)
        });
        if busy {
            state.violation(format!("destroying {pool:?} while its command buffers are pending"));
        }
        state.command_buffers.retain(|_, cmd| cmd.pool != pool);
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool, _debug_name: &str) -> GfxResult<vk::CommandBuffer> {
        let mut state = self.lock();
        if !state.command_pools.contains(&pool) {
            return Err(GfxError::Backend(format!("allocating from unknown command pool {pool:?}")));
        }
        let cmd = state.next_handle();
        state.command_buffers.insert(
            cmd,
            SimCommandBuffer {
                pool,
                state: CmdState::Initial,
                commands: Vec::new(),
            },
        );
        Ok(cmd)
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> GfxResult<()> {
        let mut state = self.lock();
        let Some(buffer) = state.command_buffers.get_mut(&cmd) else {
            return Err(GfxError::Backend(format!("begin on unknown command buffer {cmd:?}")));
        };
        match buffer.state {
            CmdState::Initial | CmdState::Executable => {
                buffer.state = CmdState::Recording;
                buffer.commands.clear();
                Ok(())
            }
            other => {
                state.violation(format!("begin on {cmd:?} in state {other:?}"));
                Err(GfxError::Backend(format!("command buffer {cmd:?} cannot begin in state {other:?}")))
            }
        }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GfxResult<()> {
        let mut state = self.lock();
        match state.command_buffers.get_mut(&cmd) {
            Some(buffer) if buffer.state == CmdState::Recording => {
                buffer.state = CmdState::Executable;
                Ok(())
            }
            _ => Err(GfxError::Backend(format!("end on {cmd:?} which is not recording"))),
        }
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> GfxResult<()> {
        let mut state = self.lock();
        let Some(buffer) = state.command_buffers.get_mut(&cmd) else {
            return Err(GfxError::Backend(format!("reset on unknown command buffer {cmd:?}")));
        };
        if buffer.state == CmdState::Pending {
            state.violation(format!("reset on pending command buffer {cmd:?}"));
            return Err(GfxError::Backend(format!("command buffer {cmd:?} is pending")));
        }
        buffer.state = CmdState::Initial;
        buffer.commands.clear();
        Ok(())
    }

    fn create_fence(&self, signaled: bool, _debug_name: &str) -> GfxResult<vk::Fence> {
        let mut state = self.lock();
        let fence = state.next_handle();
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.lock();
        if state.is_fence_pending(fence) {
            state.violation(format!("destroying {fence:?} while a submission uses it"));
        }
        if state.fences.remove(&fence).is_none() {
            state.violation(format!("destroying unknown fence {fence:?}"));
        }
    }

    fn create_semaphore(&self, _debug_name: &str) -> GfxResult<vk::Semaphore> {
        let mut state = self.lock();
        let semaphore = state.next_handle();
        state.semaphores.insert(semaphore);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.lock();
        if !state.semaphores.remove(&semaphore) {
            state.violation(format!("destroying unknown semaphore {semaphore:?}"));
        }
    }

    fn poll_fence(&self, fence: vk::Fence) -> bool {
        self.lock().fences.get(&fence).copied().unwrap_or(false)
    }

    fn wait_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> GfxResult<bool> {
        let deadline = (timeout_ns != u64::MAX).then(|| Instant::now() + Duration::from_nanos(timeout_ns));
        let mut state = self.lock();

        loop {
            let unsignaled: Vec<vk::Fence> =
                fences.iter().copied().filter(|fence| !state.fences.get(fence).copied().unwrap_or(false)).collect();
            if unsignaled.is_empty() {
                return Ok(true);
            }
            if let Some(fence) = unsignaled.iter().find(|fence| !state.is_fence_pending(**fence)) {
                // 永远不会被 signal
                return Err(GfxError::Backend(format!("waiting on {fence:?} which was never submitted")));
            }

            let completion = state.completion;
            match completion {
                HeadlessCompletion::Immediate | HeadlessCompletion::OnWait => {
                    while unsignaled.iter().any(|fence| state.is_fence_pending(*fence)) {
                        state.complete_at(0);
                    }
                    self.shared.completed.notify_all();
                }
                HeadlessCompletion::Manual => match deadline {
                    None => {
                        state = self.shared.completed.wait(state).unwrap_or_else(PoisonError::into_inner);
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Ok(false);
                        }
                        state = self
                            .shared
                            .completed
                            .wait_timeout(state, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                },
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> GfxResult<()> {
        let mut state = self.lock();
        if state.is_fence_pending(fence) {
            state.violation(format!("reset on pending fence {fence:?}"));
            return Err(GfxError::Backend(format!("fence {fence:?} is pending")));
        }
        match state.fences.get_mut(&fence) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(GfxError::Backend(format!("reset on unknown fence {fence:?}"))),
        }
    }

    fn queue_submit(&self, submit_info: &GfxSubmitInfo, fence: vk::Fence) -> GfxResult<()> {
        let mut state = self.lock();
        let cmd = submit_info.command_buffer();

        match state.command_buffers.get_mut(&cmd) {
            Some(buffer) if buffer.state == CmdState::Executable => buffer.state = CmdState::Pending,
            _ => {
                state.violation(format!("submitting {cmd:?} which is not executable"));
                return Err(GfxError::Backend(format!("command buffer {cmd:?} is not executable")));
            }
        }
        let fence_ready = matches!(state.fences.get(&fence), Some(false)) && !state.is_fence_pending(fence);
        if !fence_ready {
            state.violation(format!("submitting with {fence:?} which is signaled, pending or unknown"));
        }
        let unknown_semaphores: Vec<_> = submit_info
            .wait_infos()
            .iter()
            .chain(submit_info.signal_infos())
            .filter(|info| !state.semaphores.contains(&info.semaphore))
            .map(|info| info.semaphore)
            .collect();
        for semaphore in unknown_semaphores {
            state.violation(format!("submission references unknown semaphore {semaphore:?}"));
        }

        state.submission_log.push(GfxHeadlessSubmitRecord {
            command_buffer: cmd,
            fence,
            waits: submit_info.wait_infos().iter().map(|info| info.semaphore).collect(),
            signals: submit_info.signal_infos().iter().map(|info| (info.semaphore, info.value)).collect(),
        });
        state.pending.push_back(SimSubmission {
            command_buffer: cmd,
            fence,
        });

        if state.completion == HeadlessCompletion::Immediate {
            state.complete_all();
            drop(state);
            self.shared.completed.notify_all();
        }
        Ok(())
    }

    fn device_wait_idle(&self) -> GfxResult<()> {
        let mut state = self.lock();
        let completion = state.completion;
        match completion {
            HeadlessCompletion::Immediate | HeadlessCompletion::OnWait => {
                state.complete_all();
                drop(state);
                self.shared.completed.notify_all();
            }
            HeadlessCompletion::Manual => {
                while !state.pending.is_empty() {
                    state = self.shared.completed.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        Ok(())
    }

    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.lock().record(
            cmd,
            SimCommand::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.lock().record(
            cmd,
            SimCommand::CopyBufferToImage {
                src,
                dst,
                layout: dst_layout,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        _filter: vk::Filter,
    ) {
        self.lock().record(
            cmd,
            SimCommand::BlitImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        buffer_barriers: &[GfxBufferBarrier],
        image_barriers: &[GfxImageBarrier],
    ) {
        let mut state = self.lock();
        for barrier in buffer_barriers {
            state.record(cmd, SimCommand::BufferBarrier(barrier.inner().buffer));
        }
        for barrier in image_barriers {
            let inner = barrier.inner();
            state.record(
                cmd,
                SimCommand::ImageBarrier {
                    image: inner.image,
                    old_layout: inner.old_layout,
                    new_layout: inner.new_layout,
                    range: inner.subresource_range,
                },
            );
        }
    }

    fn create_buffer(&self, desc: &GfxBufferDesc, debug_name: &str) -> GfxResult<GfxBufferResource> {
        let mut state = self.lock();
        state.take_allocation_failure("vmaCreateBuffer")?;

        let buffer = state.next_handle();
        state.buffers.insert(
            buffer,
            SimBuffer {
                data: vec![0; desc.size as usize],
                host_visible: desc.storage == GfxStorageType::HostVisible,
            },
        );
        Ok(GfxBufferResource::new(buffer, desc, debug_name))
    }

    fn create_image(&self, desc: &GfxTextureDesc, _debug_name: &str) -> GfxResult<vk::Image> {
        let mut state = self.lock();
        state.take_allocation_failure("vmaCreateImage")?;

        let mut subresources = Vec::with_capacity((desc.mip_levels * desc.array_layers) as usize);
        for mip in 0..desc.mip_levels {
            let width = (desc.extent.width >> mip).max(1);
            let height = (desc.extent.height >> mip).max(1);
            let depth = (desc.extent.depth >> mip).max(1) as u64;
            let size = GfxFormat::level_size(desc.format, width, height)? * depth;
            for _ in 0..desc.array_layers {
                subresources.push(SimSubresource {
                    bytes: vec![0; size as usize],
                    layout: vk::ImageLayout::UNDEFINED,
                });
            }
        }

        let image = state.next_handle();
        state.images.insert(
            image,
            SimImage {
                format: desc.format,
                extent: desc.extent,
                mip_levels: desc.mip_levels,
                array_layers: desc.array_layers,
                subresources,
            },
        );
        Ok(image)
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        _desc: &GfxImageViewDesc,
        _debug_name: &str,
    ) -> GfxResult<vk::ImageView> {
        let mut state = self.lock();
        if !state.images.contains_key(&image) {
            return Err(GfxError::Backend(format!("creating a view of unknown image {image:?}")));
        }
        let view = state.next_handle();
        state.image_views.insert(view, image);
        Ok(view)
    }

    fn create_sampler(&self, _desc: &GfxSamplerDesc, _debug_name: &str) -> GfxResult<vk::Sampler> {
        let mut state = self.lock();
        let sampler = state.next_handle();
        state.samplers.insert(sampler);
        Ok(sampler)
    }

    fn create_query_pool(&self, _query_type: vk::QueryType, count: u32, _debug_name: &str) -> GfxResult<vk::QueryPool> {
        if count == 0 {
            return Err(GfxError::Runtime {
                what: "vkCreateQueryPool",
                result: vk::Result::ERROR_INITIALIZATION_FAILED,
            });
        }
        let mut state = self.lock();
        let pool = state.next_handle();
        state.query_pools.insert(pool);
        Ok(pool)
    }

    fn write_mapped(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> GfxResult<()> {
        let mut state = self.lock();
        let Some(target) = state.buffers.get_mut(&buffer) else {
            return Err(GfxError::Backend(format!("writing to unknown buffer {buffer:?}")));
        };
        let end = offset as usize + data.len();
        if !target.host_visible || end > target.data.len() {
            return Err(GfxError::Backend(format!("invalid mapped write to {buffer:?} at {offset}+{}", data.len())));
        }
        target.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn read_mapped(&self, buffer: vk::Buffer, offset: vk::DeviceSize, out: &mut [u8]) -> GfxResult<()> {
        let state = self.lock();
        let Some(source) = state.buffers.get(&buffer) else {
            return Err(GfxError::Backend(format!("reading from unknown buffer {buffer:?}")));
        };
        let end = offset as usize + out.len();
        if !source.host_visible || end > source.data.len() {
            return Err(GfxError::Backend(format!("invalid mapped read from {buffer:?} at {offset}+{}", out.len())));
        }
        out.copy_from_slice(&source.data[offset as usize..end]);
        Ok(())
    }

    fn flush_mapped(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()> {
        let state = self.lock();
        match state.buffers.get(&buffer) {
            Some(target) if target.host_visible && offset + size <= target.data.len() as u64 => Ok(()),
            _ => Err(GfxError::Backend(format!("invalid flush of {buffer:?} at {offset}+{size}"))),
        }
    }

    fn invalidate_mapped(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()> {
        let mut state = self.lock();
        match state.buffers.get(&buffer) {
            Some(target) if target.host_visible && offset + size <= target.data.len() as u64 => {
                state.invalidations.push((buffer, offset, size));
                Ok(())
            }
            _ => Err(GfxError::Backend(format!("invalid invalidate of {buffer:?} at {offset}+{size}"))),
        }
    }

    fn execute_teardown(&self, action: GfxTeardown) {
        let mut state = self.lock();
        state.teardowns.push(action);

        let existed = match action {
            GfxTeardown::Buffer(buffer) => state.buffers.remove(&buffer).is_some(),
            GfxTeardown::Image(image) => state.images.remove(&image).is_some(),
            GfxTeardown::ImageView(view) => state.image_views.remove(&view).is_some(),
            GfxTeardown::Sampler(sampler) => state.samplers.remove(&sampler),
            GfxTeardown::Pipeline(pipeline) => state.pipelines.remove(&pipeline),
            GfxTeardown::PipelineLayout(layout) => state.pipeline_layouts.remove(&layout),
            GfxTeardown::QueryPool(pool) => state.query_pools.remove(&pool),
        };
        if !existed {
            state.violation(format!("{action:?} is unknown or already destroyed"));
            return;
        }
        if state.referenced_by_pending(action) {
            state.violation(format!("{action:?} destroyed while a pending submission uses it"));
        }
    }
}
