use ash::vk;

/// barrier 使用的 src 和 dst 访问 mask
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GfxBarrierMask {
    pub src_stage: vk::PipelineStageFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl GfxBarrierMask {
    /// transfer 写入 buffer 之后，根据 buffer 的用途决定后续的可见性
    ///
    /// index/vertex/indirect 需要额外的专用 stage；其余用途统一使用 ALL_COMMANDS
    pub fn after_buffer_upload(usage: vk::BufferUsageFlags) -> Self {
        let mut dst_stage = vk::PipelineStageFlags2::ALL_COMMANDS;
        let mut dst_access = vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE;

        if usage.contains(vk::BufferUsageFlags::INDIRECT_BUFFER) {
            dst_stage |= vk::PipelineStageFlags2::DRAW_INDIRECT;
            dst_access |= vk::AccessFlags2::INDIRECT_COMMAND_READ;
        }
        if usage.contains(vk::BufferUsageFlags::INDEX_BUFFER) {
            dst_stage |= vk::PipelineStageFlags2::VERTEX_INPUT;
            dst_access |= vk::AccessFlags2::INDEX_READ;
        }
        if usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER) {
            dst_stage |= vk::PipelineStageFlags2::VERTEX_INPUT;
            dst_access |= vk::AccessFlags2::VERTEX_ATTRIBUTE_READ;
        }

        Self {
            src_stage: vk::PipelineStageFlags2::TRANSFER,
            dst_stage,
            src_access: vk::AccessFlags2::TRANSFER_WRITE,
            dst_access,
        }
    }

    /// 把 buffer 拷贝到 staging 之后，host 读取之前
    pub fn before_host_read() -> Self {
        Self {
            src_stage: vk::PipelineStageFlags2::TRANSFER,
            dst_stage: vk::PipelineStageFlags2::HOST,
            src_access: vk::AccessFlags2::TRANSFER_WRITE,
            dst_access: vk::AccessFlags2::HOST_READ,
        }
    }

    /// 从 buffer 中拷贝出数据之前，等待之前所有的写入
    pub fn before_transfer_read() -> Self {
        Self {
            src_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            dst_stage: vk::PipelineStageFlags2::TRANSFER,
            src_access: vk::AccessFlags2::MEMORY_WRITE,
            dst_access: vk::AccessFlags2::TRANSFER_READ,
        }
    }
}

/// 便捷创建 image memory barrier 的结构体
#[derive(Clone, Copy, Debug)]
pub struct GfxImageBarrier {
    inner: vk::ImageMemoryBarrier2<'static>,
}

impl Default for GfxImageBarrier {
    fn default() -> Self {
        Self {
            inner: vk::ImageMemoryBarrier2 {
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::UNDEFINED,
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_array_layer: 0,
                    layer_count: 1,
                    base_mip_level: 0,
                    level_count: 1,
                },
                ..Default::default()
            },
        }
    }
}

impl GfxImageBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inner(&self) -> &vk::ImageMemoryBarrier2<'static> {
        &self.inner
    }

    /// builder
    #[inline]
    pub fn layout_transfer(mut self, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        self.inner.old_layout = old_layout;
        self.inner.new_layout = new_layout;
        self
    }

    /// builder
    #[inline]
    pub fn src_mask(mut self, src_stage_mask: vk::PipelineStageFlags2, src_access_mask: vk::AccessFlags2) -> Self {
        self.inner.src_stage_mask = src_stage_mask;
        self.inner.src_access_mask = src_access_mask;
        self
    }

    /// builder
    #[inline]
    pub fn dst_mask(mut self, dst_stage_mask: vk::PipelineStageFlags2, dst_access_mask: vk::AccessFlags2) -> Self {
        self.inner.dst_stage_mask = dst_stage_mask;
        self.inner.dst_access_mask = dst_access_mask;
        self
    }

    /// builder
    #[inline]
    pub fn image_aspect_flag(mut self, aspect_mask: vk::ImageAspectFlags) -> Self {
        self.inner.subresource_range.aspect_mask = aspect_mask;
        self
    }

    /// builder
    ///
    /// 只作用于一个 mip 的一个 layer
    #[inline]
    pub fn subresource(mut self, mip_level: u32, array_layer: u32) -> Self {
        self.inner.subresource_range.base_mip_level = mip_level;
        self.inner.subresource_range.level_count = 1;
        self.inner.subresource_range.base_array_layer = array_layer;
        self.inner.subresource_range.layer_count = 1;
        self
    }

    /// builder
    #[inline]
    pub fn image(mut self, image: vk::Image) -> Self {
        self.inner.image = image;
        self
    }
}

#[derive(Clone, Copy, Debug)]
pub struct GfxBufferBarrier {
    inner: vk::BufferMemoryBarrier2<'static>,
}

impl Default for GfxBufferBarrier {
    fn default() -> Self {
        Self {
            inner: vk::BufferMemoryBarrier2 {
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                ..Default::default()
            },
        }
    }
}

impl GfxBufferBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inner(&self) -> &vk::BufferMemoryBarrier2<'static> {
        &self.inner
    }

    #[inline]
    pub fn mask(mut self, mask: GfxBarrierMask) -> Self {
        self.inner.src_stage_mask = mask.src_stage;
        self.inner.dst_stage_mask = mask.dst_stage;
        self.inner.src_access_mask = mask.src_access;
        self.inner.dst_access_mask = mask.dst_access;
        self
    }

    #[inline]
    pub fn buffer(mut self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> Self {
        self.inner.buffer = buffer;
        self.inner.offset = offset;
        self.inner.size = size;
        self
    }
}
