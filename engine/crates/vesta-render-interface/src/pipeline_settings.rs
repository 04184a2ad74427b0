use std::{fmt::Display, ops::Deref};

use ash::vk;
use serde::{Deserialize, Serialize};

/// 渲染器默认配置
pub struct DefaultRendererSettings;
impl DefaultRendererSettings {
    /// 流式加载的纹理统一使用的格式
    pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
    /// 占位纹理的颜色，RGBA8
    pub const FALLBACK_TEXEL: [u8; 4] = [255, 0, 255, 255];
}

/// 各个资源表的容量，创建之后不会增长
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableCapacities {
    pub buffers: usize,
    /// 同时也是 bindless 纹理数组的长度
    pub textures: usize,
    pub pipelines: usize,
    pub framebuffers: usize,
    pub semaphores: usize,
}
impl Default for TableCapacities {
    fn default() -> Self {
        Self {
            buffers: 4096,
            textures: 1024,
            pipelines: 256,
            framebuffers: 64,
            semaphores: 256,
        }
    }
}

/// 后台纹理加载线程的配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    /// 加载线程在输入队列上阻塞等待的时长
    pub loader_idle_timeout_ms: u64,
    /// 解码线程池的大小，0 表示由 rayon 决定
    pub decode_threads: usize,
}
impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            loader_idle_timeout_ms: 1,
            decode_threads: 0,
        }
    }
}

/// 渲染器的配置，从 toml 文件中读取，缺失的字段使用默认值
///
/// frames in flight 不在这里：它是编译期常量 `FrameCounter::FIF_COUNT`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererSettings {
    pub app_name: String,
    pub enable_validation: bool,
    pub capacities: TableCapacities,
    pub streaming: StreamingSettings,
}
impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            app_name: "vesta".to_string(),
            enable_validation: cfg!(debug_assertions),
            capacities: TableCapacities::default(),
            streaming: StreamingSettings::default(),
        }
    }
}

/// 帧标签（A/B/C）
///
/// 表示当前处于 Frames in Flight 的哪一帧。
/// 通过 `Deref` 转换为索引 0/1/2。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLabel {
    A,
    B,
    C,
}
impl Deref for FrameLabel {
    type Target = usize;
    #[inline]
    fn deref(&self) -> &Self::Target {
        match self {
            Self::A => &Self::INDEX[0],
            Self::B => &Self::INDEX[1],
            Self::C => &Self::INDEX[2],
        }
    }
}
impl Display for FrameLabel {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
            Self::C => write!(f, "C"),
        }
    }
}
impl FrameLabel {
    const INDEX: [usize; 3] = [0, 1, 2];

    #[inline]
    pub fn from_usize(idx: usize) -> Self {
        match idx % Self::INDEX.len() {
            0 => Self::A,
            1 => Self::B,
            _ => Self::C,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_use_defaults() {
        let settings: RendererSettings = toml::from_str(
            r#"
            app_name = "demo"

            [capacities]
            textures = 16
            "#,
        )
        .unwrap();

        assert_eq!(settings.app_name, "demo");
        assert_eq!(settings.capacities.textures, 16);
        assert_eq!(settings.capacities.buffers, TableCapacities::default().buffers);
        assert_eq!(settings.streaming, StreamingSettings::default());
    }

    #[test]
    fn test_frame_label_index() {
        assert_eq!(*FrameLabel::from_usize(2), 2);
        assert_eq!(FrameLabel::from_usize(4), FrameLabel::B);
        assert_eq!(FrameLabel::C.to_string(), "C");
    }
}
