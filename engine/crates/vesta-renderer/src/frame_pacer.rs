use std::sync::Arc;

use ash::vk;
use vesta_gfx::backend::GfxBackend;
use vesta_gfx::commands::submit_info::GfxSubmitInfo;
use vesta_gfx::error::GfxResult;
use vesta_gfx::resources::pipeline::GfxSemaphoreType;
use vesta_render_interface::frame_counter::FrameCounter;
use vesta_render_interface::pipeline_settings::FrameLabel;

/// 帧同步
///
/// frame timeline 的值表示已经完成的帧数：第 F 帧的提交 signal F + 1。
/// 开始第 F 帧之前，如果 F >= FIF_COUNT，需要等待 timeline 达到 F - FIF_COUNT + 1，
/// 也就是使用同一个 FrameLabel 的上一帧已经执行完毕。
pub struct FramePacer<B: GfxBackend> {
    backend: Arc<B>,
    frame_counter: FrameCounter,
    frame_timeline: vk::Semaphore,
    wait_timeout_ns: u64,
    destroyed: bool,
}

// new & init
impl<B: GfxBackend> FramePacer<B> {
    const WAIT_SEMAPHORE_TIMEOUT_NS: u64 = 30 * 1000 * 1000 * 1000; // 30s

    pub fn new(backend: Arc<B>) -> GfxResult<Self> {
        let frame_timeline = backend.create_semaphore(GfxSemaphoreType::Timeline { initial_value: 0 }, "frame-timeline")?;
        Ok(Self {
            backend,
            frame_counter: FrameCounter::default(),
            frame_timeline,
            wait_timeout_ns: Self::WAIT_SEMAPHORE_TIMEOUT_NS,
            destroyed: false,
        })
    }

    /// builder
    #[inline]
    pub fn with_wait_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.wait_timeout_ns = timeout_ns;
        self
    }
}

// destroy
impl<B: GfxBackend> FramePacer<B> {
    pub fn destroy(mut self) {
        self.destroy_mut();
    }

    fn destroy_mut(&mut self) {
        if self.destroyed {
            return;
        }
        self.backend.destroy_semaphore(self.frame_timeline);
        self.destroyed = true;
    }
}
impl<B: GfxBackend> Drop for FramePacer<B> {
    fn drop(&mut self) {
        self.destroy_mut();
    }
}

// phase call
impl<B: GfxBackend> FramePacer<B> {
    /// 当前帧需要等待的 timeline 值，不需要等待时为 None
    pub fn required_completion(&self) -> Option<u64> {
        let frame_id = self.frame_counter.frame_id();
        let fif_count = FrameCounter::fif_count() as u64;
        (frame_id >= fif_count).then(|| frame_id - fif_count + 1)
    }

    /// # Phase: Begin Frame
    ///
    /// 等待 fif 的同一帧渲染完成，渲染线程只会在这里阻塞
    pub fn wait_for_frame_slot(&self) -> GfxResult<()> {
        let _span = tracy_client::span!("wait fif timeline");
        match self.required_completion() {
            Some(value) => self.backend.wait_semaphore(self.frame_timeline, value, self.wait_timeout_ns),
            None => Ok(()),
        }
    }

    /// 当前帧的提交：signal frame timeline 为 F + 1，并等待 upload timeline 达到 `upload_value`
    pub fn frame_submit_info(
        &self,
        commands: &[vk::CommandBuffer],
        upload_timeline: vk::Semaphore,
        upload_value: u64,
    ) -> GfxSubmitInfo {
        GfxSubmitInfo::new(commands)
            .wait(upload_timeline, vk::PipelineStageFlags2::ALL_COMMANDS, Some(upload_value))
            .signal(
                self.frame_timeline,
                vk::PipelineStageFlags2::ALL_COMMANDS,
                Some(self.frame_counter.frame_id() + 1),
            )
    }

    /// # Phase: End Frame
    #[inline]
    pub fn advance(&mut self) {
        self.frame_counter.next_frame();
    }
}

// getters
impl<B: GfxBackend> FramePacer<B> {
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_counter.frame_id()
    }
    #[inline]
    pub fn frame_label(&self) -> FrameLabel {
        self.frame_counter.frame_label()
    }
    #[inline]
    pub fn frame_name(&self) -> String {
        self.frame_counter.frame_name()
    }
    #[inline]
    pub fn frame_timeline(&self) -> vk::Semaphore {
        self.frame_timeline
    }

    /// GPU 已经执行完的帧数
    pub fn completed_frames(&self) -> GfxResult<u64> {
        self.backend.semaphore_value(self.frame_timeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesta_gfx::backend::GfxQueueType;
    use vesta_gfx::error::GfxError;
    use vesta_gfx::headless::HeadlessBackend;

    #[test]
    fn test_no_wait_for_first_frames() {
        let backend = Arc::new(HeadlessBackend::new());
        let mut pacer = FramePacer::new(backend).unwrap();
        for _ in 0..FrameCounter::FIF_COUNT {
            assert_eq!(pacer.required_completion(), None);
            pacer.advance();
        }
        assert_eq!(pacer.required_completion(), Some(1));
        pacer.advance();
        assert_eq!(pacer.required_completion(), Some(2));
    }

    #[test]
    fn test_cpu_run_ahead_is_bounded() {
        let backend = Arc::new(HeadlessBackend::new().with_manual_queue(GfxQueueType::Graphics));
        let upload = backend.create_semaphore(GfxSemaphoreType::Timeline { initial_value: 0 }, "upload").unwrap();
        let mut pacer = FramePacer::new(backend.clone()).unwrap().with_wait_timeout_ns(20 * 1000 * 1000);

        for _ in 0..FrameCounter::FIF_COUNT {
            pacer.wait_for_frame_slot().unwrap();
            backend.submit(GfxQueueType::Graphics, &[pacer.frame_submit_info(&[], upload, 0)]).unwrap();
            pacer.advance();
        }

        // GPU 一帧都没有完成，第 FIF_COUNT 帧需要等待
        assert!(matches!(pacer.wait_for_frame_slot(), Err(GfxError::Timeout { value: 1 })));

        assert!(backend.complete_next(GfxQueueType::Graphics));
        pacer.wait_for_frame_slot().unwrap();
        assert_eq!(pacer.completed_frames().unwrap(), 1);

        let signals = backend
            .submissions()
            .iter()
            .flat_map(|submission| submission.signals.clone())
            .map(|(_, value)| value)
            .collect::<Vec<_>>();
        assert_eq!(signals, vec![1, 2, 3]);

        backend.wait_idle().unwrap();
        pacer.destroy();
        backend.destroy_semaphore(upload);
        assert!(backend.validation_errors().is_empty());
    }
}
