use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::error::GfxResult;
use crate::vulkan::physical_device::GfxPhysicalDevice;

/// 一个 vk::Queue 以及它的 family
///
/// 同一个 vk::Queue 可能同时作为 graphics 和 transfer 使用，此时两者共享同一把锁
#[derive(Clone)]
pub(crate) struct GfxQueue {
    pub(crate) family_index: u32,
    pub(crate) queue: Arc<Mutex<vk::Queue>>,
}

/// 逻辑设备以及 graphics / transfer 两个队列
pub(crate) struct GfxDevice {
    pub(crate) device: ash::Device,
    pub(crate) gfx_queue: GfxQueue,
    pub(crate) transfer_queue: GfxQueue,
}

impl GfxDevice {
    pub(crate) fn new(instance: &ash::Instance, pdevice: &GfxPhysicalDevice) -> GfxResult<Self> {
        let _span = tracy_client::span!("GfxDevice::new");

        // transfer 队列的来源：
        // 1. 专用的 transfer family
        // 2. gfx family 的第二个 queue
        // 3. 与 graphics 共享同一个 queue
        let priorities = [1.0_f32, 1.0];
        let mut queue_create_infos = Vec::new();
        match pdevice.transfer_family {
            Some(transfer_family) => {
                queue_create_infos.push(
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(pdevice.gfx_family)
                        .queue_priorities(&priorities[..1]),
                );
                queue_create_infos.push(
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(transfer_family)
                        .queue_priorities(&priorities[..1]),
                );
            }
            None => {
                let count = pdevice.gfx_queue_count.min(2) as usize;
                queue_create_infos.push(
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(pdevice.gfx_family)
                        .queue_priorities(&priorities[..count]),
                );
            }
        }

        let basic_features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(pdevice.features.sampler_anisotropy == vk::TRUE)
            .shader_int64(pdevice.features.shader_int64 == vk::TRUE);
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .buffer_device_address(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true) // 即使一些 descriptor 是 invalid
            .descriptor_binding_sampled_image_update_after_bind(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
        let mut all_features = vk::PhysicalDeviceFeatures2::default()
            .features(basic_features)
            .push_next(&mut features12)
            .push_next(&mut features13);

        let device_ci = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .push_next(&mut all_features);

        let device = unsafe { instance.create_device(pdevice.handle, &device_ci, None)? };

        let gfx_queue = GfxQueue {
            family_index: pdevice.gfx_family,
            queue: Arc::new(Mutex::new(unsafe { device.get_device_queue(pdevice.gfx_family, 0) })),
        };
        let transfer_queue = match pdevice.transfer_family {
            Some(transfer_family) => GfxQueue {
                family_index: transfer_family,
                queue: Arc::new(Mutex::new(unsafe { device.get_device_queue(transfer_family, 0) })),
            },
            None if pdevice.gfx_queue_count >= 2 => GfxQueue {
                family_index: pdevice.gfx_family,
                queue: Arc::new(Mutex::new(unsafe { device.get_device_queue(pdevice.gfx_family, 1) })),
            },
            None => gfx_queue.clone(),
        };

        Ok(Self {
            device,
            gfx_queue,
            transfer_queue,
        })
    }

    /// graphics 和 transfer 是否是同一个 vk::Queue
    #[inline]
    pub(crate) fn shares_single_queue(&self) -> bool {
        Arc::ptr_eq(&self.gfx_queue.queue, &self.transfer_queue.queue)
    }

    pub(crate) fn destroy(self) {
        log::info!("destroying device");
        unsafe {
            self.device.destroy_device(None);
        }
    }
}
