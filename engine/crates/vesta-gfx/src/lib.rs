//! Vesta 的 GFX 层
//!
//! 上层只依赖 [`backend::GfxBackend`] 这一组 GPU 能力：
//! - [`vulkan::VulkanBackend`]：基于 ash + vk-mem 的真实实现
//! - [`headless::HeadlessBackend`]：进程内模拟的设备，用于测试与工具

pub mod backend;
pub mod commands;
pub mod error;
pub mod headless;
pub mod resources;
pub mod utilities;
pub mod vulkan;
