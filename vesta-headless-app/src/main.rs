use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use vesta_crate_tools::config::load_toml_config_or_default;
use vesta_crate_tools::init_log::init_log;
use vesta_gfx::vulkan::{VulkanBackend, VulkanBackendDesc};
use vesta_headless_app::app_config::AppConfig;
use vesta_headless_app::demo::run_demo;
use vesta_renderer::renderer::Renderer;

fn panic_handler(info: &std::panic::PanicHookInfo) {
    log::error!("{}", info);
}

fn init_env() {
    std::panic::set_hook(Box::new(panic_handler));

    init_log();

    tracy_client::Client::start();
    tracy_client::set_thread_name!("RenderThread");
}

/// 用法: vesta-headless [图片路径...]
///
/// 配置文件默认为当前目录下的 vesta.toml，可以通过 VESTA_CONFIG 环境变量指定
fn main() -> anyhow::Result<()> {
    init_env();

    let config_path =
        std::env::var_os("VESTA_CONFIG").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("vesta.toml"));
    let config: AppConfig = load_toml_config_or_default(&config_path)?;
    let image_paths = std::env::args_os().skip(1).map(PathBuf::from).collect::<Vec<_>>();

    let bindless_texture_capacity =
        u32::try_from(config.renderer.capacities.textures).context("texture table capacity does not fit in u32")?;
    let backend = VulkanBackend::new(&VulkanBackendDesc {
        app_name: config.renderer.app_name.clone(),
        enable_validation: config.renderer.enable_validation,
        bindless_texture_capacity,
    })
    .context("failed to initialize vulkan")?;
    let backend = Arc::new(backend);

    let mut renderer = Renderer::new(backend, config.renderer.clone())?;
    let report = run_demo(&mut renderer, &config.demo, image_paths)?;
    log::info!(
        "demo finished after {} frames, {} textures live, all batches resolved: {}",
        report.frames,
        report.live_textures,
        report.all_resolved()
    );

    renderer.shutdown()?;
    Ok(())
}
