use ash::vk;
use derive_getters::Getters;

use crate::error::{GfxError, GfxResult};
use crate::resources::format::GfxFormat;
use crate::resources::pool::GfxHandle;

pub type GfxBufferHandle = GfxHandle<GfxBufferResource>;
pub type GfxTextureHandle = GfxHandle<GfxTextureResource>;
pub type GfxSamplerHandle = GfxHandle<GfxSamplerResource>;
pub type GfxPipelineHandle = GfxHandle<GfxPipelineResource>;
pub type GfxQueryPoolHandle = GfxHandle<GfxQueryPoolResource>;

// --- Buffer ---

/// Buffer 所在的内存类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GfxStorageType {
    /// device local，只能通过 staging 上传
    #[default]
    Device,
    /// host visible，持久 map，可以直接读写
    HostVisible,
}

#[derive(Debug, Clone)]
pub struct GfxBufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub storage: GfxStorageType,
}

impl GfxBufferDesc {
    #[inline]
    pub fn new(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            storage: GfxStorageType::Device,
        }
    }

    /// builder
    #[inline]
    pub fn storage(mut self, storage: GfxStorageType) -> Self {
        self.storage = storage;
        self
    }

    /// 实际创建 buffer 时使用的 usage：总是可以作为 transfer 的目标和来源
    #[inline]
    pub fn native_usage(&self) -> vk::BufferUsageFlags {
        self.usage | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST
    }
}

#[derive(Debug, Getters)]
pub struct GfxBufferResource {
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    storage: GfxStorageType,
    name: String,
}

impl GfxBufferResource {
    pub fn new(buffer: vk::Buffer, desc: &GfxBufferDesc, name: impl Into<String>) -> Self {
        Self {
            buffer,
            size: desc.size,
            usage: desc.usage,
            storage: desc.storage,
            name: name.into(),
        }
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.storage == GfxStorageType::HostVisible
    }

    /// 检查 `[offset, offset + size)` 是否落在 buffer 内
    pub fn check_range(&self, offset: u64, size: u64, context: &'static str) -> GfxResult<()> {
        match offset.checked_add(size) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(GfxError::ArgumentOutOfRange {
                context,
                offset,
                size,
                limit: self.size,
            }),
        }
    }
}

// --- Texture ---

#[derive(Debug, Clone)]
pub struct GfxTextureDesc {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
}

impl GfxTextureDesc {
    pub fn new_2d(format: vk::Format, width: u32, height: u32) -> Self {
        Self {
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            usage: vk::ImageUsageFlags::SAMPLED,
        }
    }

    /// builder
    #[inline]
    pub fn mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// builder
    #[inline]
    pub fn array_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    /// builder
    #[inline]
    pub fn usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    #[inline]
    pub fn native_usage(&self) -> vk::ImageUsageFlags {
        self.usage | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC
    }

    pub fn view_type(&self) -> vk::ImageViewType {
        match self.image_type {
            vk::ImageType::TYPE_1D if self.array_layers > 1 => vk::ImageViewType::TYPE_1D_ARRAY,
            vk::ImageType::TYPE_1D => vk::ImageViewType::TYPE_1D,
            vk::ImageType::TYPE_3D => vk::ImageViewType::TYPE_3D,
            _ if self.array_layers > 1 => vk::ImageViewType::TYPE_2D_ARRAY,
            _ => vk::ImageViewType::TYPE_2D,
        }
    }

    /// 覆盖整个 image 的 view
    pub fn full_view(&self) -> GfxImageViewDesc {
        GfxImageViewDesc {
            view_type: self.view_type(),
            format: self.format,
            aspect: GfxFormat::aspect_mask(self.format),
            base_mip_level: 0,
            mip_level_count: self.mip_levels,
            base_array_layer: 0,
            array_layer_count: self.array_layers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GfxImageViewDesc {
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub base_mip_level: u32,
    pub mip_level_count: u32,
    pub base_array_layer: u32,
    pub array_layer_count: u32,
}

impl GfxImageViewDesc {
    #[inline]
    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: self.base_mip_level,
            level_count: self.mip_level_count,
            base_array_layer: self.base_array_layer,
            layer_count: self.array_layer_count,
        }
    }
}

#[derive(Debug, Getters)]
pub struct GfxTextureResource {
    image: vk::Image,
    view: vk::ImageView,
    view_desc: GfxImageViewDesc,
    format: vk::Format,
    extent: vk::Extent3D,
    mip_levels: u32,
    array_layers: u32,
    usage: vk::ImageUsageFlags,
    /// view 类型的 texture 不拥有 image，销毁时只释放 view
    owns_image: bool,
    /// 最近一次上传之后的 layout
    layout: vk::ImageLayout,
    name: String,
}

impl GfxTextureResource {
    pub(crate) fn new_owning(
        image: vk::Image,
        view: vk::ImageView,
        desc: &GfxTextureDesc,
        name: impl Into<String>,
    ) -> Self {
        Self {
            image,
            view,
            view_desc: desc.full_view(),
            format: desc.format,
            extent: desc.extent,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
            usage: desc.usage,
            owns_image: true,
            layout: vk::ImageLayout::UNDEFINED,
            name: name.into(),
        }
    }

    /// 共享 `self` 的 image，但使用另外一个 view
    pub(crate) fn new_view_of(&self, view: vk::ImageView, view_desc: GfxImageViewDesc, name: impl Into<String>) -> Self {
        Self {
            image: self.image,
            view,
            view_desc,
            format: view_desc.format,
            extent: self.extent,
            mip_levels: self.mip_levels,
            array_layers: self.array_layers,
            usage: self.usage,
            owns_image: false,
            layout: self.layout,
            name: name.into(),
        }
    }

    #[inline]
    pub(crate) fn set_layout(&mut self, layout: vk::ImageLayout) {
        self.layout = layout;
    }

    #[inline]
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        GfxFormat::aspect_mask(self.format)
    }
}

/// texture 上传的目标范围
///
/// 数据按照 mip 优先排列：`[mip0 layer0][mip0 layer1]..[mip1 layer0]..`，
/// 每个 mip 的尺寸由 `extent` 逐级减半得到。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GfxTextureRange {
    pub offset: vk::Offset3D,
    pub extent: vk::Extent3D,
    pub mip_level: u32,
    pub num_mip_levels: u32,
    pub layer: u32,
    pub num_layers: u32,
    /// 数据中一行的像素数，0 表示紧密排列；非 0 时只能上传一个 mip
    pub row_length: u32,
}

impl GfxTextureRange {
    pub fn new_2d(width: u32, height: u32) -> Self {
        Self {
            offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_level: 0,
            num_mip_levels: 1,
            layer: 0,
            num_layers: 1,
            row_length: 0,
        }
    }

    /// 覆盖 texture 所有 mip 与 layer
    pub fn full(texture: &GfxTextureResource) -> Self {
        Self {
            offset: vk::Offset3D::default(),
            extent: texture.extent,
            mip_level: 0,
            num_mip_levels: texture.mip_levels,
            layer: 0,
            num_layers: texture.array_layers,
            row_length: 0,
        }
    }

    /// builder
    #[inline]
    pub fn mips(mut self, mip_level: u32, num_mip_levels: u32) -> Self {
        self.mip_level = mip_level;
        self.num_mip_levels = num_mip_levels;
        self
    }

    /// builder
    #[inline]
    pub fn layers(mut self, layer: u32, num_layers: u32) -> Self {
        self.layer = layer;
        self.num_layers = num_layers;
        self
    }

    /// builder
    #[inline]
    pub fn row_length(mut self, row_length: u32) -> Self {
        self.row_length = row_length;
        self
    }

    /// 第 `relative_mip` 个 mip 的尺寸
    #[inline]
    pub fn mip_extent(&self, relative_mip: u32) -> vk::Extent3D {
        vk::Extent3D {
            width: (self.extent.width >> relative_mip).max(1),
            height: (self.extent.height >> relative_mip).max(1),
            depth: (self.extent.depth >> relative_mip).max(1),
        }
    }

    /// 第 `relative_mip` 个 mip 的一个 layer 在数据中占用的字节数，包含行尾的填充
    pub fn level_bytes(&self, format: vk::Format, relative_mip: u32) -> GfxResult<u64> {
        let extent = self.mip_extent(relative_mip);
        let width = if self.row_length == 0 {
            extent.width
        } else {
            self.row_length
        };
        Ok(GfxFormat::level_size(format, width, extent.height)? * extent.depth as u64)
    }

    /// 单个 layer 在所有 mip 上占用的字节数
    pub fn bytes_per_layer(&self, format: vk::Format) -> GfxResult<u64> {
        (0..self.num_mip_levels).try_fold(0u64, |acc, mip| Ok(acc + self.level_bytes(format, mip)?))
    }

    #[inline]
    pub fn total_bytes(&self, format: vk::Format) -> GfxResult<u64> {
        Ok(self.bytes_per_layer(format)? * self.num_layers as u64)
    }

    /// 检查范围是否落在 texture 内
    pub fn validate(&self, texture: &GfxTextureResource) -> GfxResult<()> {
        let out_of_range = |context: &'static str, offset: u64, size: u64, limit: u64| {
            Err(GfxError::ArgumentOutOfRange {
                context,
                offset,
                size,
                limit,
            })
        };

        if self.extent.width == 0 || self.extent.height == 0 || self.extent.depth == 0 {
            return out_of_range("texture range extent is zero", 0, 0, 0);
        }
        if self.num_mip_levels == 0 || self.num_layers == 0 {
            return out_of_range("texture range has no mip levels or layers", 0, 0, 0);
        }
        if self.offset.x < 0 || self.offset.y < 0 || self.offset.z < 0 {
            return out_of_range("texture range offset is negative", 0, 0, 0);
        }
        if self.row_length != 0 {
            if self.row_length < self.extent.width {
                return out_of_range("texture row length", 0, self.extent.width as u64, self.row_length as u64);
            }
            if self.num_mip_levels != 1 {
                return out_of_range("texture row length with several mip levels", 0, self.num_mip_levels as u64, 1);
            }
        }
        let mip_end = self.mip_level as u64 + self.num_mip_levels as u64;
        if mip_end > texture.mip_levels as u64 {
            return out_of_range("texture mip levels", self.mip_level as u64, self.num_mip_levels as u64, texture.mip_levels as u64);
        }
        let layer_end = self.layer as u64 + self.num_layers as u64;
        if layer_end > texture.array_layers as u64 {
            return out_of_range("texture array layers", self.layer as u64, self.num_layers as u64, texture.array_layers as u64);
        }

        let level_width = (texture.extent.width >> self.mip_level).max(1) as u64;
        let level_height = (texture.extent.height >> self.mip_level).max(1) as u64;
        let level_depth = (texture.extent.depth >> self.mip_level).max(1) as u64;
        if self.offset.x as u64 + self.extent.width as u64 > level_width {
            return out_of_range("texture width", self.offset.x as u64, self.extent.width as u64, level_width);
        }
        if self.offset.y as u64 + self.extent.height as u64 > level_height {
            return out_of_range("texture height", self.offset.y as u64, self.extent.height as u64, level_height);
        }
        if self.offset.z as u64 + self.extent.depth as u64 > level_depth {
            return out_of_range("texture depth", self.offset.z as u64, self.extent.depth as u64, level_depth);
        }
        Ok(())
    }
}

// --- Sampler ---

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GfxSamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    pub max_anisotropy: Option<f32>,
    pub compare_op: Option<vk::CompareOp>,
    pub max_lod: f32,
}

impl Default for GfxSamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_anisotropy: None,
            compare_op: None,
            max_lod: vk::LOD_CLAMP_NONE,
        }
    }
}

#[derive(Debug, Getters)]
pub struct GfxSamplerResource {
    sampler: vk::Sampler,
    desc: GfxSamplerDesc,
    name: String,
}

impl GfxSamplerResource {
    pub(crate) fn new(sampler: vk::Sampler, desc: GfxSamplerDesc, name: impl Into<String>) -> Self {
        Self {
            sampler,
            desc,
            name: name.into(),
        }
    }
}

// --- Pipeline ---

/// 外部创建好的 pipeline，交给资源管理器托管生命周期
///
/// pipeline 与 layout 一起销毁。
#[derive(Debug, Getters)]
pub struct GfxPipelineResource {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
    name: String,
}

impl GfxPipelineResource {
    pub fn new(
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        bind_point: vk::PipelineBindPoint,
        name: impl Into<String>,
    ) -> Self {
        Self {
            pipeline,
            layout,
            bind_point,
            name: name.into(),
        }
    }
}

// --- Query Pool ---

#[derive(Debug, Getters)]
pub struct GfxQueryPoolResource {
    pool: vk::QueryPool,
    query_type: vk::QueryType,
    query_count: u32,
    name: String,
}

impl GfxQueryPoolResource {
    pub(crate) fn new(pool: vk::QueryPool, query_type: vk::QueryType, query_count: u32, name: impl Into<String>) -> Self {
        Self {
            pool,
            query_type,
            query_count,
            name: name.into(),
        }
    }
}
