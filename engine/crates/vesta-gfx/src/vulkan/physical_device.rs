use std::ffi::CStr;

use ash::vk;
use itertools::Itertools;

use crate::error::{GfxError, GfxResult};

/// 选中的物理显卡，以及会用到的 queue family
pub(crate) struct GfxPhysicalDevice {
    pub(crate) handle: vk::PhysicalDevice,
    pub(crate) props: vk::PhysicalDeviceProperties,
    pub(crate) features: vk::PhysicalDeviceFeatures,

    /// graphics + compute + transfer
    pub(crate) gfx_family: u32,
    pub(crate) gfx_queue_count: u32,
    /// 专用的 transfer family，不存在时为 None
    pub(crate) transfer_family: Option<u32>,
}

impl GfxPhysicalDevice {
    /// 优先选择独立显卡；不满足能力要求的显卡会被跳过
    pub(crate) fn pick(instance: &ash::Instance) -> GfxResult<Self> {
        let pdevices = unsafe { instance.enumerate_physical_devices()? };

        let mut rejected = Vec::new();
        let candidates = pdevices
            .into_iter()
            .filter_map(|pdevice| match Self::new(instance, pdevice) {
                Ok(device) => Some(device),
                Err(reason) => {
                    rejected.push(reason);
                    None
                }
            })
            .collect_vec();

        candidates
            .into_iter()
            // 优先使用独立显卡
            .find_or_first(|device| device.props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU)
            .ok_or_else(|| GfxError::NoSuitableDevice(rejected.join("; ")))
    }

    fn new(instance: &ash::Instance, pdevice: vk::PhysicalDevice) -> Result<Self, String> {
        let props = unsafe { instance.get_physical_device_properties(pdevice) };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy().into_owned();

        if props.api_version < vk::API_VERSION_1_3 {
            return Err(format!("{name}: vulkan 1.3 is required"));
        }

        // 检查必须的 features
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut features12).push_next(&mut features13);
        unsafe { instance.get_physical_device_features2(pdevice, &mut features2) };
        let features = features2.features;

        let required = [
            ("timelineSemaphore", features12.timeline_semaphore),
            ("bufferDeviceAddress", features12.buffer_device_address),
            ("runtimeDescriptorArray", features12.runtime_descriptor_array),
            ("descriptorBindingPartiallyBound", features12.descriptor_binding_partially_bound),
            (
                "descriptorBindingSampledImageUpdateAfterBind",
                features12.descriptor_binding_sampled_image_update_after_bind,
            ),
            ("synchronization2", features13.synchronization2),
        ];
        let missing = required.iter().filter(|(_, supported)| *supported == vk::FALSE).map(|(name, _)| *name).join(", ");
        if !missing.is_empty() {
            return Err(format!("{name}: missing features [{missing}]"));
        }

        // 找到符合条件的 queue family
        let queue_family_props = unsafe { instance.get_physical_device_queue_family_properties(pdevice) };
        let find_queue_family = |include_flags: vk::QueueFlags, exclude_flags: vk::QueueFlags| {
            queue_family_props
                .iter()
                .enumerate()
                .find(|(_, props)| props.queue_flags.contains(include_flags) && (props.queue_flags & exclude_flags).is_empty())
                .map(|(family_idx, props)| (family_idx as u32, props.queue_count))
        };

        // 全能的 Queue：graphics, compute, transfer
        let Some((gfx_family, gfx_queue_count)) = find_queue_family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            vk::QueueFlags::empty(),
        ) else {
            return Err(format!("{name}: no graphics queue family"));
        };

        // Transfer Only
        let transfer_family = find_queue_family(vk::QueueFlags::TRANSFER, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            .map(|(family_idx, _)| family_idx);

        log::info!(
            "found gpu: {} ({:?}), gfx family: {}, transfer family: {:?}",
            name,
            props.device_type,
            gfx_family,
            transfer_family
        );

        Ok(Self {
            handle: pdevice,
            props,
            features,
            gfx_family,
            gfx_queue_count,
            transfer_family,
        })
    }

    #[inline]
    pub(crate) fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.props.device_name.as_ptr()) }.to_string_lossy().into_owned()
    }
}
