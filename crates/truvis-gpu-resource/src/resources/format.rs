use ash::vk;

use crate::error::{GfxError, GfxResult};

/// 一个 texel block 的尺寸；非压缩格式的 block 就是一个像素
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GfxFormatBlock {
    pub bytes: u32,
    pub width: u32,
    pub height: u32,
}

impl GfxFormatBlock {
    const fn pixel(bytes: u32) -> Self {
        Self {
            bytes,
            width: 1,
            height: 1,
        }
    }

    const fn compressed(bytes: u32) -> Self {
        Self {
            bytes,
            width: 4,
            height: 4,
        }
    }
}

/// Vulkan 格式相关的工具
pub struct GfxFormat;

impl GfxFormat {
    pub fn block(format: vk::Format) -> Option<GfxFormatBlock> {
        use vk::Format as F;

        let block = match format {
            F::R8_UNORM | F::R8_SNORM | F::R8_UINT | F::R8_SINT | F::R8_SRGB | F::S8_UINT => GfxFormatBlock::pixel(1),

            F::R8G8_UNORM
            | F::R8G8_SNORM
            | F::R8G8_UINT
            | F::R8G8_SINT
            | F::R16_UNORM
            | F::R16_SFLOAT
            | F::R16_UINT
            | F::R16_SINT
            | F::D16_UNORM
            | F::R5G6B5_UNORM_PACK16 => GfxFormatBlock::pixel(2),

            F::R8G8B8_UNORM | F::R8G8B8_SRGB | F::B8G8R8_UNORM | F::B8G8R8_SRGB | F::D16_UNORM_S8_UINT => {
                GfxFormatBlock::pixel(3)
            }

            F::R8G8B8A8_UNORM
            | F::R8G8B8A8_SNORM
            | F::R8G8B8A8_UINT
            | F::R8G8B8A8_SINT
            | F::R8G8B8A8_SRGB
            | F::B8G8R8A8_UNORM
            | F::B8G8R8A8_SRGB
            | F::A2B10G10R10_UNORM_PACK32
            | F::A2R10G10B10_UNORM_PACK32
            | F::B10G11R11_UFLOAT_PACK32
            | F::E5B9G9R9_UFLOAT_PACK32
            | F::R16G16_UNORM
            | F::R16G16_SFLOAT
            | F::R16G16_UINT
            | F::R32_SFLOAT
            | F::R32_UINT
            | F::R32_SINT
            | F::D32_SFLOAT
            | F::D24_UNORM_S8_UINT
            | F::X8_D24_UNORM_PACK32 => GfxFormatBlock::pixel(4),

            F::R16G16B16_UNORM | F::R16G16B16_SFLOAT => GfxFormatBlock::pixel(6),

            F::R16G16B16A16_UNORM
            | F::R16G16B16A16_SFLOAT
            | F::R16G16B16A16_UINT
            | F::R32G32_SFLOAT
            | F::R32G32_UINT
            | F::R32G32_SINT
            | F::D32_SFLOAT_S8_UINT => GfxFormatBlock::pixel(8),

            F::R32G32B32_SFLOAT | F::R32G32B32_UINT | F::R32G32B32_SINT => GfxFormatBlock::pixel(12),

            F::R32G32B32A32_SFLOAT | F::R32G32B32A32_UINT | F::R32G32B32A32_SINT => GfxFormatBlock::pixel(16),

            F::BC1_RGB_UNORM_BLOCK
            | F::BC1_RGB_SRGB_BLOCK
            | F::BC1_RGBA_UNORM_BLOCK
            | F::BC1_RGBA_SRGB_BLOCK
            | F::BC4_UNORM_BLOCK
            | F::BC4_SNORM_BLOCK
            | F::ETC2_R8G8B8_UNORM_BLOCK
            | F::ETC2_R8G8B8_SRGB_BLOCK
            | F::ETC2_R8G8B8A1_UNORM_BLOCK
            | F::EAC_R11_UNORM_BLOCK => GfxFormatBlock::compressed(8),

            F::BC2_UNORM_BLOCK
            | F::BC2_SRGB_BLOCK
            | F::BC3_UNORM_BLOCK
            | F::BC3_SRGB_BLOCK
            | F::BC5_UNORM_BLOCK
            | F::BC5_SNORM_BLOCK
            | F::BC6H_UFLOAT_BLOCK
            | F::BC6H_SFLOAT_BLOCK
            | F::BC7_UNORM_BLOCK
            | F::BC7_SRGB_BLOCK
            | F::ETC2_R8G8B8A8_UNORM_BLOCK
            | F::ETC2_R8G8B8A8_SRGB_BLOCK
            | F::EAC_R11G11_UNORM_BLOCK
            | F::ASTC_4X4_UNORM_BLOCK
            | F::ASTC_4X4_SRGB_BLOCK => GfxFormatBlock::compressed(16),

            _ => return None,
        };
        Some(block)
    }

    /// 一个 `width x height` 的 2D 区域占用的字节数，压缩格式按 block 向上取整
    pub fn level_size(format: vk::Format, width: u32, height: u32) -> GfxResult<u64> {
        let block = Self::block(format).ok_or(GfxError::UnsupportedFormat(format))?;
        let blocks_x = width.div_ceil(block.width) as u64;
        let blocks_y = height.div_ceil(block.height) as u64;
        Ok(blocks_x * blocks_y * block.bytes as u64)
    }

    pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
        match format {
            vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
                vk::ImageAspectFlags::DEPTH
            }
            vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            }
            vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
            _ => vk::ImageAspectFlags::COLOR,
        }
    }
}
