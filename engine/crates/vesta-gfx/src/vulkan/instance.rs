use std::ffi::{CStr, CString, c_char};

use ash::vk;
use itertools::Itertools;

use crate::error::{GfxError, GfxResult};
use crate::vulkan::debug_messenger::GfxDebugMsger;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// 创建好的 instance，以及实际启用了哪些可选功能
pub(crate) struct GfxInstance {
    pub(crate) instance: ash::Instance,
    /// 是否启用了 VK_EXT_debug_utils
    pub(crate) debug_utils: bool,
}

impl GfxInstance {
    /// 设置所需的 layers 和 extensions，创建 vk instance
    ///
    /// 不需要 surface 相关的 extension；validation layer 和 debug utils 不可用时只打印警告
    pub(crate) fn new(entry: &ash::Entry, app_name: &str, enable_validation: bool) -> GfxResult<Self> {
        let _span = tracy_client::span!("GfxInstance::new");

        let app_name = CString::new(app_name).unwrap_or_else(|_| c"vesta".to_owned());
        let app_info = vk::ApplicationInfo::default()
            .api_version(vk::API_VERSION_1_3) // 版本过低时，有些函数无法正确加载
            .application_name(app_name.as_c_str())
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"vesta")
            .engine_version(vk::make_api_version(0, 1, 0, 0));

        let supported_exts = unsafe { entry.enumerate_instance_extension_properties(None)? };
        let debug_utils = supported_exts
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == vk::EXT_DEBUG_UTILS_NAME);
        if !debug_utils {
            log::warn!("VK_EXT_debug_utils is not supported, debug names and messenger are disabled");
        }

        let mut enabled_exts: Vec<*const c_char> = Vec::new();
        if debug_utils {
            // 1. debug messenger
            // 2. 为 vulkan object 设置 debug name
            enabled_exts.push(vk::EXT_DEBUG_UTILS_NAME.as_ptr());
        }

        let mut enabled_layers: Vec<*const c_char> = Vec::new();
        if enable_validation {
            let supported_layers = unsafe { entry.enumerate_instance_layer_properties()? };
            let has_validation = supported_layers
                .iter()
                .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);
            if has_validation {
                enabled_layers.push(VALIDATION_LAYER.as_ptr());
            } else {
                log::warn!("validation layer requested but {:?} is not installed", VALIDATION_LAYER);
            }
        }

        log::info!(
            "instance extensions: [{}], layers: [{}]",
            enabled_exts.iter().map(|ext| unsafe { CStr::from_ptr(*ext) }.to_string_lossy()).join(", "),
            enabled_layers.iter().map(|layer| unsafe { CStr::from_ptr(*layer) }.to_string_lossy()).join(", ")
        );

        let mut instance_ci = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&enabled_exts)
            .enabled_layer_names(&enabled_layers);

        // 让 instance 创建过程中的消息也能被捕获
        let mut debug_utils_messenger_ci = GfxDebugMsger::debug_utils_messenger_ci();
        if debug_utils {
            instance_ci = instance_ci.push_next(&mut debug_utils_messenger_ci);
        }

        let instance = unsafe { entry.create_instance(&instance_ci, None) }.map_err(|e| match e {
            vk::Result::ERROR_INCOMPATIBLE_DRIVER => {
                GfxError::MissingCapability("vulkan 1.3 capable driver".to_string())
            }
            other => GfxError::from(other),
        })?;

        Ok(Self { instance, debug_utils })
    }

    pub(crate) fn destroy(self) {
        log::info!("destroying instance");
        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}
