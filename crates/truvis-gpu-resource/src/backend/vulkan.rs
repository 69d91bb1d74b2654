use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char};
use std::mem::ManuallyDrop;

use ash::vk;
use itertools::Itertools;
use vk_mem::Alloc;

use crate::backend::GfxBackend;
use crate::commands::barrier::{GfxBufferBarrier, GfxImageBarrier};
use crate::commands::submit_info::GfxSubmitInfo;
use crate::error::{GfxError, GfxResult, VkResultExt};
use crate::resources::deferred_queue::GfxTeardown;
use crate::resources::resource_data::{
    GfxBufferDesc, GfxBufferResource, GfxImageViewDesc, GfxSamplerDesc, GfxStorageType, GfxTextureDesc,
};

/// vma 分配的内存，以及 host visible buffer 的持久映射地址
struct GfxVulkanAllocation {
    allocation: vk_mem::Allocation,
    mapped: Option<*mut u8>,
}

/// 基于 ash + vk-mem 的后端
///
/// 只创建一个同时支持 graphics/compute/transfer 的队列，不依赖窗口系统。
/// 需要 Vulkan 1.3：使用 synchronization2 提交与 barrier。
///
/// 作为资源管理器中最后一个被释放的对象，在 Drop 中销毁 device 和 instance。
pub struct GfxVulkanBackend {
    _vk_entry: ash::Entry,
    instance: ash::Instance,
    pdevice: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    queue_family_index: u32,
    debug_utils: Option<ash::ext::debug_utils::Device>,

    /// 需要在 device 之前销毁
    allocator: ManuallyDrop<vk_mem::Allocator>,
    buffers: RefCell<HashMap<vk::Buffer, GfxVulkanAllocation>>,
    images: RefCell<HashMap<vk::Image, GfxVulkanAllocation>>,
}

// new & init
impl GfxVulkanBackend {
    /// 不需要 surface 的初始化，优先选择独立显卡
    pub fn new_headless(app_name: &str) -> GfxResult<Self> {
        let _span = tracy_client::span!("GfxVulkanBackend::new_headless");

        let vk_entry =
            unsafe { ash::Entry::load() }.map_err(|e| GfxError::Backend(format!("failed to load vulkan: {e}")))?;
        let (instance, debug_utils_enabled) = Self::create_instance(&vk_entry, app_name)?;

        let (pdevice, queue_family_index) = match Self::pick_physical_device(&instance) {
            Ok(picked) => picked,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        let device = match Self::create_device(&instance, pdevice, queue_family_index) {
            Ok(device) => device,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let mut vma_ci = vk_mem::AllocatorCreateInfo::new(&instance, &device, pdevice);
        vma_ci.vulkan_api_version = vk::API_VERSION_1_3;
        let allocator = match unsafe { vk_mem::Allocator::new(vma_ci) }.gfx_context("vmaCreateAllocator") {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe {
                    device.destroy_device(None);
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        let debug_utils = debug_utils_enabled.then(|| ash::ext::debug_utils::Device::new(&instance, &device));

        Ok(Self {
            _vk_entry: vk_entry,
            instance,
            pdevice,
            device,
            queue,
            queue_family_index,
            debug_utils,
            allocator: ManuallyDrop::new(allocator),
            buffers: RefCell::new(HashMap::new()),
            images: RefCell::new(HashMap::new()),
        })
    }

    fn create_instance(vk_entry: &ash::Entry, app_name: &str) -> GfxResult<(ash::Instance, bool)> {
        let app_name = CString::new(app_name).map_err(|e| GfxError::Backend(e.to_string()))?;
        let app_info = vk::ApplicationInfo::default()
            .api_version(vk::API_VERSION_1_3) // 版本过低时，有些函数无法正确加载
            .application_name(app_name.as_c_str())
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"truvis")
            .engine_version(vk::make_api_version(0, 1, 0, 0));

        // debug utils 只用于给对象命名，没有也可以运行
        let available_exts = unsafe { vk_entry.enumerate_instance_extension_properties(None) }
            .gfx_context("vkEnumerateInstanceExtensionProperties")?;
        let debug_utils_enabled = available_exts
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == ash::ext::debug_utils::NAME);
        let enabled_exts: Vec<*const c_char> =
            if debug_utils_enabled { vec![ash::ext::debug_utils::NAME.as_ptr()] } else { vec![] };
        log::info!("instance extensions: debug utils {}", debug_utils_enabled);

        let enabled_layers = Self::validation_layers(vk_entry)?;
        let mut enabled_layers_str = String::new();
        for layer in &enabled_layers {
            enabled_layers_str.push_str(&format!("\n\t{:?}", unsafe { CStr::from_ptr(*layer) }));
        }
        log::info!("instance layers: {}", enabled_layers_str);

        let instance_ci = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&enabled_exts)
            .enabled_layer_names(&enabled_layers);
        let instance = unsafe { vk_entry.create_instance(&instance_ci, None) }.gfx_context("vkCreateInstance")?;

        Ok((instance, debug_utils_enabled))
    }

    /// debug 构建下如果安装了 validation layer 就开启
    fn validation_layers(vk_entry: &ash::Entry) -> GfxResult<Vec<*const c_char>> {
        const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
        if !cfg!(debug_assertions) {
            return Ok(vec![]);
        }

        let available_layers =
            unsafe { vk_entry.enumerate_instance_layer_properties() }.gfx_context("vkEnumerateInstanceLayerProperties")?;
        let found = available_layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);
        Ok(if found { vec![VALIDATION_LAYER.as_ptr()] } else { vec![] })
    }

    fn pick_physical_device(instance: &ash::Instance) -> GfxResult<(vk::PhysicalDevice, u32)> {
        let pdevices = unsafe { instance.enumerate_physical_devices() }.gfx_context("vkEnumeratePhysicalDevices")?;

        let candidates = pdevices
            .into_iter()
            .filter_map(|pdevice| {
                let props = unsafe { instance.get_physical_device_properties(pdevice) };
                let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
                log::info!("found gpu: {:?}, api version {}", name, Self::version_str(props.api_version));
                if props.api_version < vk::API_VERSION_1_3 {
                    return None;
                }

                // 全能的 Queue：graphics, compute, transfer
                let required = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;
                let queue_family_index = unsafe { instance.get_physical_device_queue_family_properties(pdevice) }
                    .iter()
                    .position(|family| family.queue_flags.contains(required))?;
                Some((pdevice, queue_family_index as u32, props.device_type))
            })
            .collect_vec();

        // 优先使用独立显卡
        candidates
            .iter()
            .find_or_first(|(_, _, device_type)| *device_type == vk::PhysicalDeviceType::DISCRETE_GPU)
            .map(|(pdevice, queue_family_index, _)| (*pdevice, *queue_family_index))
            .ok_or_else(|| GfxError::Backend("no physical device supports vulkan 1.3 with a universal queue".to_string()))
    }

    fn create_device(instance: &ash::Instance, pdevice: vk::PhysicalDevice, queue_family_index: u32) -> GfxResult<ash::Device> {
        let queue_priorities = [1.0];
        let queue_ci = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities);

        let mut vk13_features = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
        let mut vk12_features = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
        let device_ci = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_ci))
            .push_next(&mut vk13_features)
            .push_next(&mut vk12_features);

        unsafe { instance.create_device(pdevice, &device_ci, None) }.gfx_context("vkCreateDevice")
    }

    fn version_str(version: u32) -> String {
        format!(
            "{}.{}.{}",
            vk::api_version_major(version),
            vk::api_version_minor(version),
            vk::api_version_patch(version)
        )
    }
}

// getters
impl GfxVulkanBackend {
    #[inline]
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.pdevice
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }
}

// tools
impl GfxVulkanBackend {
    fn set_debug_name<T: vk::Handle>(&self, handle: T, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT::default().object_name(name.as_c_str()).object_handle(handle);
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(&name_info) } {
            log::warn!("failed to set debug name {:?}: {:?}", name, e);
        }
    }

    fn mapped_ptr(&self, buffer: vk::Buffer) -> GfxResult<*mut u8> {
        self.buffers
            .borrow()
            .get(&buffer)
            .and_then(|alloc| alloc.mapped)
            .ok_or_else(|| GfxError::Backend(format!("buffer {buffer:?} is not host visible")))
    }

    fn free_buffer(&self, buffer: vk::Buffer) {
        let Some(mut alloc) = self.buffers.borrow_mut().remove(&buffer) else {
            log::error!("teardown of unknown buffer {buffer:?}");
            return;
        };
        unsafe {
            if alloc.mapped.is_some() {
                self.allocator.unmap_memory(&mut alloc.allocation);
            }
            self.allocator.destroy_buffer(buffer, &mut alloc.allocation);
        }
    }

    fn free_image(&self, image: vk::Image) {
        let Some(mut alloc) = self.images.borrow_mut().remove(&image) else {
            log::error!("teardown of unknown image {image:?}");
            return;
        };
        unsafe {
            self.allocator.destroy_image(image, &mut alloc.allocation);
        }
    }
}

impl Drop for GfxVulkanBackend {
    fn drop(&mut self) {
        log::info!("destroying vulkan backend");
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("device wait idle failed: {:?}", e);
            }

            let buffers = self.buffers.get_mut().keys().copied().collect_vec();
            let images = self.images.get_mut().keys().copied().collect_vec();
            if !buffers.is_empty() || !images.is_empty() {
                log::warn!("{} buffers and {} images leaked, freeing", buffers.len(), images.len());
            }
            buffers.into_iter().for_each(|buffer| self.free_buffer(buffer));
            images.into_iter().for_each(|image| self.free_image(image));

            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

impl GfxBackend for GfxVulkanBackend {
    fn create_command_pool(&self, debug_name: &str) -> GfxResult<vk::CommandPool> {
        let pool_ci = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { self.device.create_command_pool(&pool_ci, None) }.gfx_context("vkCreateCommandPool")?;
        self.set_debug_name(pool, debug_name);
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool, debug_name: &str) -> GfxResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&info) }
            .gfx_context("vkAllocateCommandBuffers")?
            .into_iter()
            .next()
            .ok_or_else(|| GfxError::Backend("vkAllocateCommandBuffers returned nothing".to_string()))?;
        self.set_debug_name(cmd, debug_name);
        Ok(cmd)
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> GfxResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }.gfx_context("vkBeginCommandBuffer")
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GfxResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }.gfx_context("vkEndCommandBuffer")
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> GfxResult<()> {
        unsafe { self.device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty()) }
            .gfx_context("vkResetCommandBuffer")
    }

    fn create_fence(&self, signaled: bool, debug_name: &str) -> GfxResult<vk::Fence> {
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default().flags(flags), None) }
            .gfx_context("vkCreateFence")?;
        self.set_debug_name(fence, debug_name);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn create_semaphore(&self, debug_name: &str) -> GfxResult<vk::Semaphore> {
        let semaphore = unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
            .gfx_context("vkCreateSemaphore")?;
        self.set_debug_name(semaphore, debug_name);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn poll_fence(&self, fence: vk::Fence) -> bool {
        match unsafe { self.device.get_fence_status(fence) } {
            Ok(signaled) => signaled,
            Err(e) => {
                log::error!("vkGetFenceStatus failed: {:?}", e);
                false
            }
        }
    }

    fn wait_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> GfxResult<bool> {
        if fences.is_empty() {
            return Ok(true);
        }
        let _span = tracy_client::span!("GfxVulkanBackend::wait_fences");
        match unsafe { self.device.wait_for_fences(fences, true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(result) => Err(GfxError::Runtime {
                what: "vkWaitForFences",
                result,
            }),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> GfxResult<()> {
        unsafe { self.device.reset_fences(std::slice::from_ref(&fence)) }.gfx_context("vkResetFences")
    }

    fn queue_submit(&self, submit_info: &GfxSubmitInfo, fence: vk::Fence) -> GfxResult<()> {
        let _span = tracy_client::span!("GfxVulkanBackend::queue_submit");

        let cmd_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(submit_info.command_buffer())];
        let wait_infos = submit_info.vk_wait_infos();
        let signal_infos = submit_info.vk_signal_infos();
        let submit = vk::SubmitInfo2::default()
            .command_buffer_infos(&cmd_infos)
            .wait_semaphore_infos(&wait_infos)
            .signal_semaphore_infos(&signal_infos);

        unsafe { self.device.queue_submit2(self.queue, std::slice::from_ref(&submit), fence) }
            .gfx_context("vkQueueSubmit2")
    }

    fn device_wait_idle(&self) -> GfxResult<()> {
        unsafe { self.device.device_wait_idle() }.gfx_context("vkDeviceWaitIdle")
    }

    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, regions) };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer_to_image(cmd, src, dst, dst_layout, regions) };
    }

    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        unsafe { self.device.cmd_blit_image(cmd, src, src_layout, dst, dst_layout, regions, filter) };
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        buffer_barriers: &[GfxBufferBarrier],
        image_barriers: &[GfxImageBarrier],
    ) {
        let buffer_barriers = buffer_barriers.iter().map(|b| *b.inner()).collect_vec();
        let image_barriers = image_barriers.iter().map(|b| *b.inner()).collect_vec();
        let dependency_info = vk::DependencyInfo::default()
            .buffer_memory_barriers(&buffer_barriers)
            .image_memory_barriers(&image_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(cmd, &dependency_info) };
    }

    fn create_buffer(&self, desc: &GfxBufferDesc, debug_name: &str) -> GfxResult<GfxBufferResource> {
        let _span = tracy_client::span!("GfxVulkanBackend::create_buffer");

        let buffer_ci = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.native_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let alloc_ci = match desc.storage {
            GfxStorageType::Device => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            },
            GfxStorageType::HostVisible => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::Auto,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
                ..Default::default()
            },
        };

        let (buffer, mut allocation) =
            unsafe { self.allocator.create_buffer(&buffer_ci, &alloc_ci) }.gfx_context("vmaCreateBuffer")?;

        // host visible 的 buffer 持久映射
        let mapped = match desc.storage {
            GfxStorageType::Device => None,
            GfxStorageType::HostVisible => match unsafe { self.allocator.map_memory(&mut allocation) } {
                Ok(ptr) => Some(ptr),
                Err(result) => {
                    unsafe { self.allocator.destroy_buffer(buffer, &mut allocation) };
                    return Err(GfxError::Runtime {
                        what: "vmaMapMemory",
                        result,
                    });
                }
            },
        };

        self.set_debug_name(buffer, debug_name);
        self.buffers.borrow_mut().insert(buffer, GfxVulkanAllocation { allocation, mapped });
        Ok(GfxBufferResource::new(buffer, desc, debug_name))
    }

    fn create_image(&self, desc: &GfxTextureDesc, debug_name: &str) -> GfxResult<vk::Image> {
        let _span = tracy_client::span!("GfxVulkanBackend::create_image");

        let image_ci = vk::ImageCreateInfo::default()
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.native_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };

        let (image, allocation) =
            unsafe { self.allocator.create_image(&image_ci, &alloc_ci) }.gfx_context("vmaCreateImage")?;
        self.set_debug_name(image, debug_name);
        self.images.borrow_mut().insert(image, GfxVulkanAllocation { allocation, mapped: None });
        Ok(image)
    }

    fn create_image_view(&self, image: vk::Image, desc: &GfxImageViewDesc, debug_name: &str) -> GfxResult<vk::ImageView> {
        let view_ci = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(desc.view_type)
            .format(desc.format)
            .subresource_range(desc.subresource_range());
        let view = unsafe { self.device.create_image_view(&view_ci, None) }.gfx_context("vkCreateImageView")?;
        self.set_debug_name(view, debug_name);
        Ok(view)
    }

    fn create_sampler(&self, desc: &GfxSamplerDesc, debug_name: &str) -> GfxResult<vk::Sampler> {
        let sampler_ci = vk::SamplerCreateInfo::default()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .anisotropy_enable(desc.max_anisotropy.is_some())
            .max_anisotropy(desc.max_anisotropy.unwrap_or(1.0))
            .compare_enable(desc.compare_op.is_some())
            .compare_op(desc.compare_op.unwrap_or(vk::CompareOp::NEVER))
            .min_lod(0.0)
            .max_lod(desc.max_lod)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK);
        let sampler = unsafe { self.device.create_sampler(&sampler_ci, None) }.gfx_context("vkCreateSampler")?;
        self.set_debug_name(sampler, debug_name);
        Ok(sampler)
    }

    fn create_query_pool(&self, query_type: vk::QueryType, count: u32, debug_name: &str) -> GfxResult<vk::QueryPool> {
        let pool_ci = vk::QueryPoolCreateInfo::default().query_type(query_type).query_count(count);
        let pool = unsafe { self.device.create_query_pool(&pool_ci, None) }.gfx_context("vkCreateQueryPool")?;
        self.set_debug_name(pool, debug_name);
        Ok(pool)
    }

    fn write_mapped(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> GfxResult<()> {
        let ptr = self.mapped_ptr(buffer)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        self.flush_mapped(buffer, offset, data.len() as vk::DeviceSize)
    }

    fn read_mapped(&self, buffer: vk::Buffer, offset: vk::DeviceSize, out: &mut [u8]) -> GfxResult<()> {
        let ptr = self.mapped_ptr(buffer)?;
        self.invalidate_mapped(buffer, offset, out.len() as vk::DeviceSize)?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn flush_mapped(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()> {
        let buffers = self.buffers.borrow();
        let alloc = buffers
            .get(&buffer)
            .filter(|alloc| alloc.mapped.is_some())
            .ok_or_else(|| GfxError::Backend(format!("buffer {buffer:?} is not host visible")))?;
        self.allocator.flush_allocation(&alloc.allocation, offset, size).gfx_context("vmaFlushAllocation")
    }

    fn invalidate_mapped(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()> {
        let buffers = self.buffers.borrow();
        let alloc = buffers
            .get(&buffer)
            .filter(|alloc| alloc.mapped.is_some())
            .ok_or_else(|| GfxError::Backend(format!("buffer {buffer:?} is not host visible")))?;
        self.allocator
            .invalidate_allocation(&alloc.allocation, offset, size)
            .gfx_context("vmaInvalidateAllocation")
    }

    fn execute_teardown(&self, action: GfxTeardown) {
        log::trace!("teardown {:?}", action);
        unsafe {
            match action {
                GfxTeardown::Buffer(buffer) => self.free_buffer(buffer),
                GfxTeardown::Image(image) => self.free_image(image),
                GfxTeardown::ImageView(view) => self.device.destroy_image_view(view, None),
                GfxTeardown::Sampler(sampler) => self.device.destroy_sampler(sampler, None),
                GfxTeardown::Pipeline(pipeline) => self.device.destroy_pipeline(pipeline, None),
                GfxTeardown::PipelineLayout(layout) => self.device.destroy_pipeline_layout(layout, None),
                GfxTeardown::QueryPool(pool) => self.device.destroy_query_pool(pool, None),
            }
        }
    }
}
