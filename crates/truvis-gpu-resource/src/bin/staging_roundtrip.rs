//! 在真实的 Vulkan 设备上验证 staging 上传与回读
//!
//! 用法：`staging-roundtrip [config.toml]`，不指定配置时使用较小的 staging buffer，
//! 强制上传被拆分成多次提交。

use anyhow::Context;
use ash::vk;
use truvis_gpu_resource::backend::vulkan::GfxVulkanBackend;
use truvis_gpu_resource::config::{GfxConfig, GfxStagingFallback};
use truvis_gpu_resource::resource_manager::GfxResourceManager;
use truvis_gpu_resource::resources::resource_data::{GfxBufferDesc, GfxTextureDesc, GfxTextureRange};

fn load_config() -> anyhow::Result<GfxConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("failed to read {path}"))?;
            Ok(GfxConfig::from_toml_str(&text)?)
        }
        None => Ok(GfxConfig {
            max_staging_buffer_size: 1024,
            min_staging_buffer_size: 256,
            submit_ring_capacity: 8,
            staging_fallback: GfxStagingFallback::Grow,
            ..Default::default()
        }),
    }
}

fn run(manager: &mut GfxResourceManager<GfxVulkanBackend>) -> anyhow::Result<()> {
    // buffer：数据远大于 staging 上限
    let pattern = (0..10_000u32).map(|i| (i * 7 % 251) as u8).collect::<Vec<_>>();
    let desc = GfxBufferDesc::new(pattern.len() as u64, vk::BufferUsageFlags::STORAGE_BUFFER);
    let buffer = manager.create_buffer_with_data(&desc, &pattern, "roundtrip")?;

    let mut readback = vec![0u8; pattern.len()];
    manager.download_buffer(buffer, 0, &mut readback)?;
    anyhow::ensure!(readback == pattern, "buffer readback does not match the uploaded data");
    log::info!("buffer roundtrip ok: {} bytes", pattern.len());

    // 部分更新
    manager.upload_buffer(buffer, 100, &[0xAB; 300])?;
    let mut window = [0u8; 302];
    manager.download_buffer(buffer, 99, &mut window)?;
    anyhow::ensure!(window[0] == pattern[99] && window[301] == pattern[400], "partial update touched neighbours");
    anyhow::ensure!(window[1..301].iter().all(|b| *b == 0xAB), "partial update was lost");

    // texture：两级 mip
    let texture_desc = GfxTextureDesc::new_2d(vk::Format::R8G8B8A8_UNORM, 8, 8).mip_levels(2);
    let texels = vec![0x7Fu8; (8 * 8 + 4 * 4) * 4];
    let texture = manager.create_texture_with_data(&texture_desc, &texels, "roundtrip texture")?;
    let range = manager.get_texture(texture).map(GfxTextureRange::full).context("texture vanished")?;
    manager.upload_texture(texture, &range, &texels)?;
    let token = manager.generate_mipmap(texture)?;
    manager.wait(token)?;

    manager.destroy_buffer(buffer);
    manager.destroy_texture(texture);
    manager.wait_all()?;
    manager.wait_deferred_tasks()?;

    let stats = manager.stats();
    log::info!("final stats: {:?}", stats);
    anyhow::ensure!(stats.pending_deferred == 0, "deferred tasks left after wait");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    truvis_crate_tools::init_log::init_log();

    let config = load_config()?;
    let backend = GfxVulkanBackend::new_headless("staging-roundtrip")?;
    let mut manager = GfxResourceManager::new(backend, config)?;

    let result = run(&mut manager);
    manager.destroy();
    result
}
