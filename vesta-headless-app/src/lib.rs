//! 无窗口的演示程序
//!
//! 配置从 toml 文件读取，演示逻辑对 [`vesta_gfx::backend::GfxBackend`] 泛型，
//! 可执行文件使用 Vulkan，测试使用 Headless。

pub mod app_config;
pub mod demo;
