//! 基于 ash + vk-mem 的 [`GfxBackend`] 实现
//!
//! 不依赖窗口：只创建 instance、device、两个队列、VMA allocator 以及 bindless 纹理数组。

mod bindless;
mod debug_messenger;
mod device;
mod instance;
mod physical_device;

use std::ffi::CString;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;

use ash::vk;
use itertools::Itertools;
use vk_mem::Alloc;

use crate::backend::{GfxBackend, GfxBindlessWrite, GfxQueueType};
use crate::commands::barrier::GfxImageBarrier;
use crate::commands::submit_info::GfxSubmitInfo;
use crate::error::{GfxError, GfxResult};
use crate::resources::buffer::{GfxBuffer, GfxBufferDesc};
use crate::resources::image::{GfxImage, GfxImageDesc};
use crate::resources::pipeline::{GfxPipeline, GfxSemaphoreType};
use crate::resources::sampler::GfxSamplerDesc;
use crate::vulkan::bindless::GfxBindlessTable;
use crate::vulkan::debug_messenger::GfxDebugMsger;
use crate::vulkan::device::{GfxDevice, GfxQueue};
use crate::vulkan::instance::GfxInstance;
use crate::vulkan::physical_device::GfxPhysicalDevice;

/// 创建 [`VulkanBackend`] 的参数
#[derive(Clone, Debug)]
pub struct VulkanBackendDesc {
    pub app_name: String,
    pub enable_validation: bool,
    /// bindless 纹理数组的长度，应当等于纹理表的容量
    pub bindless_texture_capacity: u32,
}

/// VMA 的一次分配
pub struct VmaAllocation(vk_mem::Allocation);

// SAFETY: VmaAllocation 只是 VMA 内部对象的句柄，VMA 自身对 allocator 的访问是线程安全的
unsafe impl Send for VmaAllocation {}
unsafe impl Sync for VmaAllocation {}

pub struct VulkanBackend {
    // 字段的销毁顺序在 Drop 中手动控制
    _entry: ash::Entry,
    instance: ManuallyDrop<GfxInstance>,
    debug_msger: ManuallyDrop<Option<GfxDebugMsger>>,
    pdevice: GfxPhysicalDevice,
    device: ManuallyDrop<GfxDevice>,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    allocator: ManuallyDrop<vk_mem::Allocator>,
    bindless: ManuallyDrop<GfxBindlessTable>,
    name: String,
}

// SAFETY: 所有 vk handle 都可以跨线程使用；需要外部同步的 vk::Queue 放在 Mutex 中，
// command pool 的外部同步由调用方保证（见 GfxBackend 的文档）
unsafe impl Send for VulkanBackend {}
unsafe impl Sync for VulkanBackend {}

// new & destroy
impl VulkanBackend {
    pub fn new(desc: &VulkanBackendDesc) -> GfxResult<Self> {
        let _span = tracy_client::span!("VulkanBackend::new");

        let entry = unsafe { ash::Entry::load()? };
        let instance = GfxInstance::new(&entry, &desc.app_name, desc.enable_validation)?;

        // 之后任意一步失败，都需要销毁之前创建的对象
        let debug_msger = if instance.debug_utils && desc.enable_validation {
            match GfxDebugMsger::new(&entry, &instance.instance) {
                Ok(msger) => Some(msger),
                Err(e) => {
                    log::warn!("failed to create debug messenger: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let cleanup_instance = |instance: GfxInstance, debug_msger: Option<GfxDebugMsger>| {
            if let Some(msger) = debug_msger {
                msger.destroy();
            }
            instance.destroy();
        };

        let pdevice = match GfxPhysicalDevice::pick(&instance.instance) {
            Ok(pdevice) => pdevice,
            Err(e) => {
                cleanup_instance(instance, debug_msger);
                return Err(e);
            }
        };
        let device = match GfxDevice::new(&instance.instance, &pdevice) {
            Ok(device) => device,
            Err(e) => {
                cleanup_instance(instance, debug_msger);
                return Err(e);
            }
        };

        // vma 需要在 Instance 和 Device 之后创建，并先于它们销毁
        let allocator = {
            let mut vma_ci = vk_mem::AllocatorCreateInfo::new(&instance.instance, &device.device, pdevice.handle);
            vma_ci.vulkan_api_version = vk::API_VERSION_1_3;
            vma_ci.flags = vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;
            unsafe { vk_mem::Allocator::new(vma_ci) }
        };
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                device.destroy();
                cleanup_instance(instance, debug_msger);
                return Err(e.into());
            }
        };

        let bindless = match GfxBindlessTable::new(&device.device, desc.bindless_texture_capacity) {
            Ok(bindless) => bindless,
            Err(e) => {
                drop(allocator);
                device.destroy();
                cleanup_instance(instance, debug_msger);
                return Err(e);
            }
        };

        let debug_utils = instance
            .debug_utils
            .then(|| ash::ext::debug_utils::Device::new(&instance.instance, &device.device));

        log::info!(
            "vulkan backend ready on {}, dedicated transfer queue: {}",
            pdevice.name(),
            !device.shares_single_queue()
        );

        Ok(Self {
            name: format!("vulkan({})", pdevice.name()),
            _entry: entry,
            instance: ManuallyDrop::new(instance),
            debug_msger: ManuallyDrop::new(debug_msger),
            pdevice,
            device: ManuallyDrop::new(device),
            debug_utils,
            allocator: ManuallyDrop::new(allocator),
            bindless: ManuallyDrop::new(bindless),
        })
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            log::error!("wait idle failed while destroying backend: {}", e);
        }
        unsafe {
            let bindless = ManuallyDrop::take(&mut self.bindless);
            bindless.destroy(&self.device.device);
            ManuallyDrop::drop(&mut self.allocator);
            ManuallyDrop::take(&mut self.device).destroy();
            if let Some(msger) = ManuallyDrop::take(&mut self.debug_msger) {
                msger.destroy();
            }
            ManuallyDrop::take(&mut self.instance).destroy();
        }
    }
}

// getters
impl VulkanBackend {
    #[inline]
    pub fn device(&self) -> &ash::Device {
        &self.device.device
    }
    #[inline]
    pub fn instance(&self) -> &ash::Instance {
        &self.instance.instance
    }
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.pdevice.handle
    }
    /// pipeline layout 需要包含这个 set layout 才能访问 bindless 纹理
    #[inline]
    pub fn bindless_set_layout(&self) -> vk::DescriptorSetLayout {
        self.bindless.layout
    }
    #[inline]
    pub fn bindless_set(&self) -> vk::DescriptorSet {
        self.bindless.set
    }
}

// tools
impl VulkanBackend {
    fn queue(&self, queue: GfxQueueType) -> &GfxQueue {
        match queue {
            GfxQueueType::Graphics => &self.device.gfx_queue,
            GfxQueueType::Transfer => &self.device.transfer_queue,
        }
    }

    fn set_debug_name<T: vk::Handle>(&self, handle: T, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT::default().object_handle(handle).object_name(&name);
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(&name_info) } {
            log::debug!("failed to set debug name: {}", e);
        }
    }

    fn check_format_support(&self, desc: &GfxImageDesc) -> GfxResult<()> {
        let props = unsafe {
            self.instance.instance.get_physical_device_format_properties(self.pdevice.handle, desc.format)
        };
        let features = props.optimal_tiling_features;

        let mut required = vk::FormatFeatureFlags::empty();
        if desc.usage.contains(vk::ImageUsageFlags::SAMPLED) {
            required |= vk::FormatFeatureFlags::SAMPLED_IMAGE;
        }
        if desc.usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT) {
            required |= vk::FormatFeatureFlags::COLOR_ATTACHMENT;
        }
        if desc.usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT) {
            required |= vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        // mip 通过 linear blit 生成
        if desc.mip_levels > 1 {
            required |= vk::FormatFeatureFlags::BLIT_SRC
                | vk::FormatFeatureFlags::BLIT_DST
                | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR;
        }

        if features.contains(required) { Ok(()) } else { Err(GfxError::UnsupportedFormat(desc.format)) }
    }
}

impl GfxBackend for VulkanBackend {
    type Allocation = VmaAllocation;

    fn name(&self) -> &str {
        &self.name
    }

    fn queue_family_index(&self, queue: GfxQueueType) -> u32 {
        self.queue(queue).family_index
    }

    fn bindless_texture_capacity(&self) -> u32 {
        self.bindless.capacity
    }

    fn create_buffer(&self, desc: &GfxBufferDesc) -> GfxResult<GfxBuffer<VmaAllocation>> {
        let _span = tracy_client::span!("VulkanBackend::create_buffer");

        let buffer_ci = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let alloc_ci = if desc.host_visible {
            vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                ..Default::default()
            }
        } else {
            vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            }
        };

        let (buffer, mut allocation) = unsafe { self.allocator.create_buffer(&buffer_ci, &alloc_ci) }.map_err(|e| {
            match e {
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                    GfxError::OutOfMemory {
                        what: format!("buffer `{}` ({} bytes)", desc.name, desc.size),
                    }
                }
                other => GfxError::from(other),
            }
        })?;

        let mut mapped_ptr = None;
        if desc.host_visible {
            match unsafe { self.allocator.map_memory(&mut allocation) } {
                Ok(ptr) => mapped_ptr = NonNull::new(ptr),
                Err(e) => {
                    unsafe { self.allocator.destroy_buffer(buffer, &mut allocation) };
                    return Err(e.into());
                }
            }
        }

        let device_address = desc.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS).then(|| unsafe {
            self.device.device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
        });

        self.set_debug_name(buffer, &format!("Buffer::{}", desc.name));

        // SAFETY: mapped_ptr 来自 map_memory，在 destroy_buffer 中 unmap
        Ok(unsafe {
            GfxBuffer::from_raw_parts(
                buffer,
                VmaAllocation(allocation),
                desc.size,
                desc.usage,
                mapped_ptr,
                device_address,
                desc.name.clone(),
            )
        })
    }

    #[allow(unused_unsafe)]
    fn flush_buffer(
        &self,
        buffer: &GfxBuffer<VmaAllocation>,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> GfxResult<()> {
        unsafe { self.allocator.flush_allocation(&buffer.allocation().0, offset, size)? };
        Ok(())
    }

    fn destroy_buffer(&self, buffer: GfxBuffer<VmaAllocation>) {
        let (handle, VmaAllocation(mut allocation), mapped_ptr) = buffer.into_raw_parts();
        unsafe {
            if mapped_ptr.is_some() {
                self.allocator.unmap_memory(&mut allocation);
            }
            self.allocator.destroy_buffer(handle, &mut allocation);
        }
    }

    fn create_image(&self, desc: &GfxImageDesc) -> GfxResult<GfxImage<VmaAllocation>> {
        let _span = tracy_client::span!("VulkanBackend::create_image");
        self.check_format_support(desc)?;

        let image_ci = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };

        let (image, mut allocation) = unsafe { self.allocator.create_image(&image_ci, &alloc_ci) }.map_err(|e| {
            match e {
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                    GfxError::OutOfMemory {
                        what: format!("image `{}` ({}x{})", desc.name, desc.extent.width, desc.extent.height),
                    }
                }
                other => GfxError::from(other),
            }
        })?;

        // 覆盖所有 mip 的默认 view
        let view_ci = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect,
                base_mip_level: 0,
                level_count: desc.mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = match unsafe { self.device.device.create_image_view(&view_ci, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe { self.allocator.destroy_image(image, &mut allocation) };
                return Err(e.into());
            }
        };

        self.set_debug_name(image, &format!("Image::{}", desc.name));
        self.set_debug_name(view, &format!("ImageView::{}", desc.name));

        Ok(GfxImage::from_raw_parts(image, view, VmaAllocation(allocation), desc))
    }

    fn destroy_image(&self, image: GfxImage<VmaAllocation>) {
        let (image, view, VmaAllocation(mut allocation)) = image.into_raw_parts();
        unsafe {
            self.device.device.destroy_image_view(view, None);
            self.allocator.destroy_image(image, &mut allocation);
        }
    }

    fn create_sampler(&self, desc: &GfxSamplerDesc) -> GfxResult<vk::Sampler> {
        let mut desc = *desc;
        if self.pdevice.features.sampler_anisotropy == vk::FALSE {
            desc.max_anisotropy = None;
        }
        let sampler = unsafe { self.device.device.create_sampler(&desc.create_info(), None)? };
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.device.destroy_sampler(sampler, None) };
    }

    fn destroy_pipeline(&self, pipeline: GfxPipeline) {
        unsafe {
            self.device.device.destroy_pipeline(pipeline.pipeline, None);
            self.device.device.destroy_pipeline_layout(pipeline.layout, None);
        }
    }

    fn create_semaphore(&self, semaphore_type: GfxSemaphoreType, name: &str) -> GfxResult<vk::Semaphore> {
        let semaphore = match semaphore_type {
            GfxSemaphoreType::Binary => unsafe {
                self.device.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
            },
            GfxSemaphoreType::Timeline { initial_value } => {
                let mut timeline_type_ci = vk::SemaphoreTypeCreateInfo::default()
                    .semaphore_type(vk::SemaphoreType::TIMELINE)
                    .initial_value(initial_value);
                let semaphore_ci = vk::SemaphoreCreateInfo::default().push_next(&mut timeline_type_ci);
                unsafe { self.device.device.create_semaphore(&semaphore_ci, None)? }
            }
        };
        self.set_debug_name(semaphore, &format!("Semaphore::{}", name));
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.device.destroy_semaphore(semaphore, None) };
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> GfxResult<u64> {
        Ok(unsafe { self.device.device.get_semaphore_counter_value(semaphore)? })
    }

    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64) -> GfxResult<()> {
        let semaphores = [semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(&values);
        match unsafe { self.device.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(GfxError::Timeout { value }),
            Err(e) => Err(e.into()),
        }
    }

    fn create_command_pool(&self, queue: GfxQueueType, name: &str) -> GfxResult<vk::CommandPool> {
        let pool_ci = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_family_index(queue))
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { self.device.device.create_command_pool(&pool_ci, None)? };
        self.set_debug_name(pool, &format!("CommandPool::{}", name));
        Ok(pool)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> GfxResult<()> {
        unsafe { self.device.device.reset_command_pool(pool, vk::CommandPoolResetFlags::empty())? };
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool, name: &str) -> GfxResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.device.device.allocate_command_buffers(&alloc_info)? }[0];
        self.set_debug_name(command_buffer, &format!("CommandBuffer::{}", name));
        Ok(command_buffer)
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        if command_buffers.is_empty() {
            return;
        }
        unsafe { self.device.device.free_command_buffers(pool, command_buffers) };
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> GfxResult<()> {
        unsafe {
            self.device
                .device
                .begin_command_buffer(command_buffer, &vk::CommandBufferBeginInfo::default().flags(flags))?
        };
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()> {
        unsafe { self.device.device.end_command_buffer(command_buffer)? };
        Ok(())
    }

    fn cmd_image_barriers(&self, command_buffer: vk::CommandBuffer, barriers: &[GfxImageBarrier]) {
        let barriers = barriers.iter().map(|barrier| *barrier.inner()).collect_vec();
        let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        unsafe { self.device.device.cmd_pipeline_barrier2(command_buffer, &dependency_info) };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_image: vk::Image,
        regions: &[vk::BufferImageCopy2<'_>],
    ) {
        let copy_info = vk::CopyBufferToImageInfo2::default()
            .src_buffer(src_buffer)
            .dst_image(dst_image)
            .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .regions(regions);
        unsafe { self.device.device.cmd_copy_buffer_to_image2(command_buffer, &copy_info) };
    }

    fn cmd_blit_image(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        regions: &[vk::ImageBlit2<'_>],
        filter: vk::Filter,
    ) {
        let blit_info = vk::BlitImageInfo2::default()
            .src_image(image)
            .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .dst_image(image)
            .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .regions(regions)
            .filter(filter);
        unsafe { self.device.device.cmd_blit_image2(command_buffer, &blit_info) };
    }

    fn submit(&self, queue: GfxQueueType, submits: &[GfxSubmitInfo]) -> GfxResult<()> {
        let _span = tracy_client::span!("VulkanBackend::submit");
        let submit_infos = submits.iter().map(|submit| submit.submit_info()).collect_vec();
        let queue = self.queue(queue).queue.lock();
        unsafe { self.device.device.queue_submit2(*queue, &submit_infos, vk::Fence::null())? };
        Ok(())
    }

    fn write_bindless_textures(&self, writes: &[GfxBindlessWrite]) {
        self.bindless.write_textures(&self.device.device, writes);
    }

    fn wait_idle(&self) -> GfxResult<()> {
        // vkDeviceWaitIdle 要求所有 queue 都被外部同步
        let _gfx_queue = self.device.gfx_queue.queue.lock();
        let _transfer_queue =
            (!self.device.shares_single_queue()).then(|| self.device.transfer_queue.queue.lock());
        unsafe { self.device.device.device_wait_idle()? };
        Ok(())
    }
}
