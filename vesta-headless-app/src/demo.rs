use std::path::PathBuf;

use anyhow::Context;
use ash::vk;
use vesta_asset::handle::{BatchStatus, ImageBatchId};
use vesta_asset::loader::RawImage;
use vesta_gfx::backend::GfxBackend;
use vesta_gfx::resources::buffer::GfxBufferDesc;
use vesta_render_interface::pipeline_settings::DefaultRendererSettings;
use vesta_renderer::renderer::Renderer;

use crate::app_config::DemoSettings;

/// 演示结束时的统计
#[derive(Clone, Debug)]
pub struct DemoReport {
    pub frames: u64,
    pub batches: Vec<(ImageBatchId, BatchStatus)>,
    pub live_textures: usize,
}

impl DemoReport {
    pub fn all_resolved(&self) -> bool {
        self.batches
            .iter()
            .all(|(_, status)| matches!(status, BatchStatus::Ready | BatchStatus::Failed | BatchStatus::Retired))
    }
}

/// 棋盘格图片，每个格子 `cell` 像素
pub fn checkerboard(extent: u32, cell: u32, color: [u8; 4]) -> RawImage {
    let cell = cell.max(1);
    let mut pixels = Vec::with_capacity((extent * extent * 4) as usize);
    for y in 0..extent {
        for x in 0..extent {
            if ((x / cell) + (y / cell)) % 2 == 0 {
                pixels.extend_from_slice(&color);
            } else {
                pixels.extend_from_slice(&[32, 32, 32, 255]);
            }
        }
    }
    RawImage::new(extent, extent, pixels)
}

/// 把 RawImage 编码为 png，用于演示压缩数据的加载
fn encode_png(image: &RawImage) -> anyhow::Result<Vec<u8>> {
    let buffer = image::RgbaImage::from_raw(image.extent.width, image.extent.height, image.pixels.clone())
        .context("pixel buffer does not match the extent")?;
    let mut bytes = Vec::new();
    buffer
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode png")?;
    Ok(bytes)
}

/// 提交演示用的纹理批次，然后运行 `settings.frame_count` 帧
///
/// 每一帧创建并立即销毁一个 staging buffer，用来观察延迟销毁
pub fn run_demo<B: GfxBackend>(
    renderer: &mut Renderer<B>,
    settings: &DemoSettings,
    extra_paths: Vec<PathBuf>,
) -> anyhow::Result<DemoReport> {
    let format = DefaultRendererSettings::TEXTURE_FORMAT;
    let mut batches = Vec::new();

    if settings.generated_images > 0 {
        let images = (0..settings.generated_images)
            .map(|i| {
                let shade = (i * 40 % 256) as u8;
                checkerboard(settings.generated_extent, 16, [255, shade, 255 - shade, 255])
            })
            .collect::<Vec<_>>();
        let compressed = encode_png(&images[0])?;

        let formats = vec![format; images.len()];
        batches.push(renderer.load_raw_images(images, formats)?);
        batches.push(renderer.load_compressed_images(vec![compressed], vec![format])?);
    }

    let paths = settings.image_paths.iter().cloned().chain(extra_paths).collect::<Vec<_>>();
    if !paths.is_empty() {
        let formats = vec![vk::Format::R8G8B8A8_SRGB; paths.len()];
        batches.push(renderer.load_image_files(paths, formats)?);
    }
    log::info!("submitted {} texture batches", batches.len());

    for _ in 0..settings.frame_count {
        renderer.begin_frame()?;

        let scratch = renderer
            .resources_mut()
            .create_buffer(&GfxBufferDesc::staging(4096, "per-frame-scratch"))?;
        renderer.resources_mut().destroy_buffer(scratch);

        renderer.end_frame()?;
        tracy_client::frame_mark();

        let frame_id = renderer.frame_id();
        if settings.report_interval > 0 && frame_id % settings.report_interval == 0 {
            log::info!(
                "frame {}: {} textures live, {} batches completed, {} deletions pending",
                frame_id,
                renderer.resources().texture_count(),
                renderer.texture_streamer().completed_image_batches(),
                renderer.resources().pending_deletion_count()
            );
        }
    }

    let report = DemoReport {
        frames: renderer.frame_id(),
        batches: batches.iter().map(|id| (*id, renderer.batch_status(*id))).collect(),
        live_textures: renderer.resources().texture_count(),
    };
    for (id, status) in &report.batches {
        log::info!("{}: {:?}", id, status);
    }
    Ok(report)
}
