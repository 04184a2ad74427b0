use ash::vk;
use thiserror::Error;

/// GFX 层的错误
///
/// 初始化阶段的错误（找不到设备、缺少能力）对上层来说是致命的；
/// 资源创建阶段的错误只会让当前调用失败。
#[derive(Debug, Error)]
pub enum GfxError {
    #[error("failed to load vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("vulkan call failed: {0}")]
    Vulkan(vk::Result),

    #[error("no suitable physical device: {0}")]
    NoSuitableDevice(String),

    #[error("required device capability is missing: {0}")]
    MissingCapability(String),

    #[error("out of memory while allocating {what}")]
    OutOfMemory { what: String },

    #[error("timed out waiting for semaphore to reach {value}")]
    Timeout { value: u64 },

    #[error("unsupported format {0:?}")]
    UnsupportedFormat(vk::Format),

    #[error("buffer `{name}` is not host visible")]
    NotHostVisible { name: String },

    #[error("write of {len} bytes at offset {offset} exceeds buffer size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("device lost")]
    DeviceLost,
}

impl From<vk::Result> for GfxError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => GfxError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => GfxError::OutOfMemory {
                what: format!("{result:?}"),
            },
            vk::Result::TIMEOUT => GfxError::Timeout { value: 0 },
            other => GfxError::Vulkan(other),
        }
    }
}

pub type GfxResult<T> = Result<T, GfxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_result_mapping() {
        assert!(matches!(GfxError::from(vk::Result::ERROR_DEVICE_LOST), GfxError::DeviceLost));
        assert!(matches!(GfxError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY), GfxError::OutOfMemory { .. }));
        assert!(matches!(
            GfxError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            GfxError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED)
        ));
    }
}
