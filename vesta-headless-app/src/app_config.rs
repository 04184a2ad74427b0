use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use vesta_render_interface::pipeline_settings::RendererSettings;

/// 演示程序的参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoSettings {
    /// 运行的帧数
    pub frame_count: u64,
    /// 生成的棋盘格图片数量，作为一个 raw 批次提交
    pub generated_images: u32,
    /// 生成图片的边长
    pub generated_extent: u32,
    /// 额外加载的图片文件，与命令行参数合并为一个批次
    pub image_paths: Vec<PathBuf>,
    /// 每隔多少帧打印一次状态
    pub report_interval: u64,
}
impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            frame_count: 120,
            generated_images: 8,
            generated_extent: 256,
            image_paths: vec![],
            report_interval: 30,
        }
    }
}

/// vesta.toml 的全部内容
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub renderer: RendererSettings,
    pub demo: DemoSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_app_config() {
        let config: AppConfig = toml::from_str(
            r#"
            [renderer]
            app_name = "vesta-demo"

            [renderer.streaming]
            decode_threads = 2

            [demo]
            frame_count = 10
            image_paths = ["a.png", "b.jpg"]
            "#,
        )
        .unwrap();

        assert_eq!(config.renderer.app_name, "vesta-demo");
        assert_eq!(config.renderer.streaming.decode_threads, 2);
        assert_eq!(config.demo.frame_count, 10);
        assert_eq!(config.demo.image_paths, vec![PathBuf::from("a.png"), PathBuf::from("b.jpg")]);
        assert_eq!(config.demo.generated_images, DemoSettings::default().generated_images);
    }
}
