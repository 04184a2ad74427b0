use std::path::PathBuf;
use std::sync::Arc;

use ash::vk;
use vesta_asset::handle::{BatchOutcome, BatchStatus, ImageBatchId};
use vesta_asset::loader::RawImage;
use vesta_asset::texture_streamer::TextureStreamer;
use vesta_gfx::backend::{GfxBackend, GfxQueueType};
use vesta_render_interface::bindless_manager::BindlessManager;
use vesta_render_interface::frame_counter::FrameCounter;
use vesta_render_interface::gfx_resource_manager::GfxResourceManager;
use vesta_render_interface::pipeline_settings::{FrameLabel, RendererSettings};

use crate::cmd_allocator::CmdAllocator;
use crate::error::{RendererError, RendererResult};
use crate::frame_pacer::FramePacer;

/// 渲染器核心
///
/// 持有 GPU 资源表、bindless 数组、纹理流式加载以及帧同步，提供帧级生命周期管理。
///
/// # 渲染流程
/// ```ignore
/// let cmd = renderer.begin_frame()?;  // 等待 GPU、清理资源、处理上传完成的纹理
/// // 录制命令...
/// renderer.end_frame()?;              // 提交命令、推进帧计数
/// // ...
/// renderer.shutdown()?;
/// ```
///
/// 字段的声明顺序也是没有调用 shutdown 时的 drop 顺序：加载线程最先退出，资源表最后释放。
pub struct Renderer<B: GfxBackend> {
    texture_streamer: TextureStreamer<B>,
    cmd_allocator: CmdAllocator<B>,
    frame_pacer: FramePacer<B>,
    bindless_manager: BindlessManager<B>,
    gfx_resource_manager: GfxResourceManager<B>,

    /// 正在录制的这一帧的 command buffer
    frame_cmd: Option<vk::CommandBuffer>,

    settings: RendererSettings,
    backend: Arc<B>,
}

// new & init
impl<B: GfxBackend> Renderer<B> {
    pub fn new(backend: Arc<B>, settings: RendererSettings) -> RendererResult<Self> {
        let _span = tracy_client::span!("Renderer::new");

        let bindless_capacity = backend.bindless_texture_capacity();
        if settings.capacities.textures > bindless_capacity as usize {
            return Err(RendererError::BindlessCapacityTooSmall {
                textures: settings.capacities.textures,
                bindless: bindless_capacity,
            });
        }

        let mut gfx_resource_manager = GfxResourceManager::new(backend.clone(), &settings.capacities)?;
        let mut bindless_manager = BindlessManager::new(backend.clone())?;
        // 占位纹理需要最先进入 texture 表
        let texture_streamer = TextureStreamer::new(
            backend.clone(),
            &settings.streaming,
            &mut gfx_resource_manager,
            &mut bindless_manager,
        )?;
        let cmd_allocator = CmdAllocator::new(backend.clone())?;
        let frame_pacer = FramePacer::new(backend.clone())?;

        log::info!(
            "renderer `{}` created on backend `{}`, {} frames in flight",
            settings.app_name,
            backend.name(),
            FrameCounter::FIF_COUNT
        );

        Ok(Self {
            texture_streamer,
            cmd_allocator,
            frame_pacer,
            bindless_manager,
            gfx_resource_manager,
            frame_cmd: None,
            settings,
            backend,
        })
    }
}

// destroy
impl<B: GfxBackend> Renderer<B> {
    /// 关闭流程：
    /// 1. 停止加载线程
    /// 2. 等待 device idle
    /// 3. 处理 FIF_COUNT + 1 次延迟销毁队列
    /// 4. 销毁剩余的所有对象
    pub fn shutdown(self) -> RendererResult<()> {
        let _span = tracy_client::span!("Renderer::shutdown");

        let Self {
            mut texture_streamer,
            cmd_allocator,
            frame_pacer,
            bindless_manager,
            mut gfx_resource_manager,
            backend,
            ..
        } = self;

        texture_streamer.stop_loader();
        backend.wait_idle()?;

        let mut freed = 0;
        for _ in 0..=FrameCounter::FIF_COUNT {
            freed += gfx_resource_manager.service_deletion_queues();
        }
        log::info!("shutdown: {} resources freed by the deletion queues", freed);

        texture_streamer.destroy();
        cmd_allocator.destroy();
        frame_pacer.destroy();
        bindless_manager.destroy();
        gfx_resource_manager.destroy();

        log::info!("renderer shut down");
        Ok(())
    }
}

// phase call
impl<B: GfxBackend> Renderer<B> {
    /// # Phase: Begin Frame
    ///
    /// 返回这一帧的 graphics command buffer，已经处于录制状态
    pub fn begin_frame(&mut self) -> RendererResult<vk::CommandBuffer> {
        let _span = tracy_client::span!("Renderer::begin_frame");
        if self.frame_cmd.is_some() {
            return Err(RendererError::FrameInProgress {
                frame_id: self.frame_pacer.frame_id(),
            });
        }

        // 等待 fif 的同一帧渲染完成
        self.frame_pacer.wait_for_frame_slot()?;

        // 清理 fif 资源
        self.gfx_resource_manager.service_deletion_queues();
        let frame_label = self.frame_pacer.frame_label();
        self.cmd_allocator.reset_frame_commands(frame_label)?;

        let cmd = self.cmd_allocator.alloc_command_buffer(frame_label, "frame")?;
        self.backend.begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;

        // 上传完成的纹理
        self.texture_streamer.tick_image_uploads(cmd, &mut self.gfx_resource_manager, &mut self.bindless_manager);

        self.frame_cmd = Some(cmd);
        Ok(cmd)
    }

    /// # Phase: End Frame
    pub fn end_frame(&mut self) -> RendererResult<()> {
        let _span = tracy_client::span!("Renderer::end_frame");
        let Some(cmd) = self.frame_cmd.take() else {
            return Err(RendererError::FrameNotStarted);
        };

        self.backend.end_command_buffer(cmd)?;

        // 设置当前帧结束的 semaphore，用于保护当前帧的资源
        let submit_info = self.frame_pacer.frame_submit_info(
            &[cmd],
            self.texture_streamer.upload_timeline(),
            self.texture_streamer.observed_upload_value(),
        );
        self.backend.submit(GfxQueueType::Graphics, std::slice::from_ref(&submit_info))?;

        self.frame_pacer.advance();
        Ok(())
    }

    /// 纹理加载，转发给 TextureStreamer
    pub fn load_raw_images(&self, images: Vec<RawImage>, formats: Vec<vk::Format>) -> RendererResult<ImageBatchId> {
        Ok(self.texture_streamer.load_raw_images(images, formats)?)
    }

    pub fn load_compressed_images(
        &self,
        bytes: Vec<Vec<u8>>,
        formats: Vec<vk::Format>,
    ) -> RendererResult<ImageBatchId> {
        Ok(self.texture_streamer.load_compressed_images(bytes, formats)?)
    }

    pub fn load_image_files(&self, paths: Vec<PathBuf>, formats: Vec<vk::Format>) -> RendererResult<ImageBatchId> {
        Ok(self.texture_streamer.load_image_files(paths, formats)?)
    }

    #[inline]
    pub fn batch_status(&self, id: ImageBatchId) -> BatchStatus {
        self.texture_streamer.batch_status(id)
    }

    /// 取走已经结束的批次的结果，见 [`TextureStreamer::retire_batch`]
    #[inline]
    pub fn retire_batch(&mut self, id: ImageBatchId) -> Option<BatchOutcome> {
        self.texture_streamer.retire_batch(id)
    }
}

// getters
impl<B: GfxBackend> Renderer<B> {
    #[inline]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }
    #[inline]
    pub fn settings(&self) -> &RendererSettings {
        &self.settings
    }
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_pacer.frame_id()
    }
    #[inline]
    pub fn frame_label(&self) -> FrameLabel {
        self.frame_pacer.frame_label()
    }
    #[inline]
    pub fn frame_pacer(&self) -> &FramePacer<B> {
        &self.frame_pacer
    }
    #[inline]
    pub fn resources(&self) -> &GfxResourceManager<B> {
        &self.gfx_resource_manager
    }
    #[inline]
    pub fn resources_mut(&mut self) -> &mut GfxResourceManager<B> {
        &mut self.gfx_resource_manager
    }
    #[inline]
    pub fn bindless(&self) -> &BindlessManager<B> {
        &self.bindless_manager
    }
    #[inline]
    pub fn texture_streamer(&self) -> &TextureStreamer<B> {
        &self.texture_streamer
    }
    #[inline]
    pub fn is_recording(&self) -> bool {
        self.frame_cmd.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use vesta_gfx::headless::{HeadlessBackend, HeadlessObjectKind};
    use vesta_gfx::resources::buffer::GfxBufferDesc;

    fn renderer() -> (Arc<HeadlessBackend>, Renderer<HeadlessBackend>) {
        let backend = Arc::new(HeadlessBackend::new());
        let renderer = Renderer::new(backend.clone(), RendererSettings::default()).unwrap();
        (backend, renderer)
    }

    fn run_frame(renderer: &mut Renderer<HeadlessBackend>) {
        renderer.begin_frame().unwrap();
        renderer.end_frame().unwrap();
    }

    fn assert_clean(backend: &HeadlessBackend) {
        assert!(backend.validation_errors().is_empty(), "{:?}", backend.validation_errors());
        for kind in [
            HeadlessObjectKind::Buffer,
            HeadlessObjectKind::Image,
            HeadlessObjectKind::ImageView,
            HeadlessObjectKind::Sampler,
            HeadlessObjectKind::Semaphore,
            HeadlessObjectKind::CommandPool,
            HeadlessObjectKind::CommandBuffer,
        ] {
            assert_eq!(backend.live_object_count(kind), 0, "{:?} leaked", kind);
        }
    }

    #[test]
    fn test_frame_submissions_signal_frame_timeline() {
        let (backend, mut renderer) = renderer();
        for _ in 0..5 {
            run_frame(&mut renderer);
        }
        assert_eq!(renderer.frame_id(), 5);
        assert_eq!(renderer.frame_pacer().completed_frames().unwrap(), 5);

        let frame_timeline = renderer.frame_pacer().frame_timeline();
        let upload_timeline = renderer.texture_streamer().upload_timeline();
        let frames = backend
            .submissions_on(GfxQueueType::Graphics)
            .into_iter()
            .filter(|submission| submission.signals.iter().any(|(semaphore, _)| *semaphore == frame_timeline))
            .collect::<Vec<_>>();
        assert_eq!(frames.len(), 5);
        for (frame_id, submission) in frames.iter().enumerate() {
            assert_eq!(submission.signals, vec![(frame_timeline, frame_id as u64 + 1)]);
            assert_eq!(submission.waits, vec![(upload_timeline, 0)]);
        }

        renderer.shutdown().unwrap();
        assert_clean(&backend);
    }

    #[test]
    fn test_deferred_buffer_destruction() {
        let (backend, mut renderer) = renderer();

        renderer.begin_frame().unwrap();
        let buffer = renderer
            .resources_mut()
            .create_buffer(&GfxBufferDesc::new(256, vk::BufferUsageFlags::STORAGE_BUFFER, "scratch"))
            .unwrap();
        renderer.resources_mut().destroy_buffer(buffer);
        renderer.end_frame().unwrap();

        // 接下来的 FIF_COUNT - 1 帧仍然可以访问
        for _ in 0..FrameCounter::FIF_COUNT - 1 {
            renderer.begin_frame().unwrap();
            assert!(renderer.resources().get_buffer(buffer).is_some());
            renderer.end_frame().unwrap();
        }

        renderer.begin_frame().unwrap();
        assert!(renderer.resources().get_buffer(buffer).is_none());
        renderer.end_frame().unwrap();

        renderer.shutdown().unwrap();
        assert_clean(&backend);
    }

    #[test]
    fn test_streamed_texture_becomes_ready() {
        let (backend, mut renderer) = renderer();
        let batch = renderer
            .load_raw_images(vec![RawImage::new(4, 4, vec![255; 64])], vec![vk::Format::R8G8B8A8_UNORM])
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while renderer.batch_status(batch) != BatchStatus::Ready {
            assert!(Instant::now() < deadline, "batch never became ready");
            run_frame(&mut renderer);
            std::thread::sleep(Duration::from_millis(1));
        }

        let Some(BatchOutcome::Ready(textures)) = renderer.retire_batch(batch) else {
            panic!("batch {} should be ready", batch);
        };
        let texture = textures[0];
        assert_eq!(renderer.batch_status(batch), BatchStatus::Retired);
        assert_eq!(renderer.resources().get_texture(texture).unwrap().mip_levels(), 3);
        // 占位纹理 + 上传的纹理
        assert_eq!(renderer.resources().texture_count(), 2);

        // 之后的提交等待 upload timeline
        run_frame(&mut renderer);
        let last = backend.submissions_on(GfxQueueType::Graphics).pop().unwrap();
        assert_eq!(last.waits, vec![(renderer.texture_streamer().upload_timeline(), 1)]);

        renderer.shutdown().unwrap();
        assert_clean(&backend);
    }

    #[test]
    fn test_texture_table_must_fit_bindless_array() {
        let backend = Arc::new(HeadlessBackend::new().with_bindless_capacity(1));
        let result = Renderer::new(backend.clone(), RendererSettings::default());
        assert!(matches!(
            result,
            Err(RendererError::BindlessCapacityTooSmall { textures: 1024, bindless: 1 })
        ));
        assert_clean(&backend);

        let mut settings = RendererSettings::default();
        settings.capacities.textures = 1;
        let renderer = Renderer::new(backend.clone(), settings).unwrap();
        assert_eq!(renderer.resources().texture_count(), 1);
        renderer.shutdown().unwrap();
        assert_clean(&backend);
    }

    #[test]
    fn test_oversized_table_is_an_error() {
        let backend = Arc::new(HeadlessBackend::new());
        let mut settings = RendererSettings::default();
        settings.capacities.buffers = usize::MAX;
        let result = Renderer::new(backend.clone(), settings);
        assert!(matches!(result, Err(RendererError::Resource(_))));
        assert_clean(&backend);
    }

    #[test]
    fn test_frame_call_order_is_checked() {
        let (backend, mut renderer) = renderer();
        assert!(matches!(renderer.end_frame(), Err(RendererError::FrameNotStarted)));

        renderer.begin_frame().unwrap();
        assert!(renderer.is_recording());
        assert!(matches!(renderer.begin_frame(), Err(RendererError::FrameInProgress { frame_id: 0 })));
        renderer.end_frame().unwrap();

        renderer.shutdown().unwrap();
        assert_clean(&backend);
    }

    #[test]
    fn test_shutdown_frees_pending_deletions() {
        let (backend, mut renderer) = renderer();
        run_frame(&mut renderer);
        let buffer = renderer
            .resources_mut()
            .create_buffer(&GfxBufferDesc::staging(64, "upload"))
            .unwrap();
        renderer.resources_mut().destroy_buffer(buffer);
        assert_eq!(renderer.resources().pending_deletion_count(), 1);

        renderer.shutdown().unwrap();
        assert_clean(&backend);
    }
}
