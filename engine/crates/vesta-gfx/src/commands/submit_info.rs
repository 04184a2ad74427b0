use ash::vk;
use itertools::Itertools;

/// 关于 submitInfo 的封装，更易用
///
/// timeline semaphore 的 value 通过 `wait` / `signal` 的 `value` 传入；binary semaphore 传 None
#[derive(Default)]
pub struct GfxSubmitInfo {
    command_buffers: Vec<vk::CommandBufferSubmitInfo<'static>>,
    wait_infos: Vec<vk::SemaphoreSubmitInfo<'static>>,
    signal_infos: Vec<vk::SemaphoreSubmitInfo<'static>>,
}

impl GfxSubmitInfo {
    pub fn new(commands: &[vk::CommandBuffer]) -> Self {
        let command_buffers = commands
            .iter()
            .map(|cmd| vk::CommandBufferSubmitInfo::default().command_buffer(*cmd))
            .collect_vec();

        Self {
            command_buffers,
            wait_infos: vec![],
            signal_infos: vec![],
        }
    }

    /// 不带任何 command buffer 的提交，只用来操作 semaphore
    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    pub fn submit_info(&self) -> vk::SubmitInfo2<'_> {
        vk::SubmitInfo2::default()
            // 暂时不使用该 flag
            .flags(vk::SubmitFlags::empty())
            .command_buffer_infos(&self.command_buffers)
            .wait_semaphore_infos(&self.wait_infos)
            .signal_semaphore_infos(&self.signal_infos)
    }

    #[inline]
    pub fn wait(mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2, value: Option<u64>) -> Self {
        self.wait_infos.push(
            vk::SemaphoreSubmitInfo::default()
                .semaphore(semaphore)
                .stage_mask(stage)
                .value(value.unwrap_or_default()),
        );
        self
    }

    #[inline]
    pub fn signal(mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2, value: Option<u64>) -> Self {
        self.signal_infos.push(
            vk::SemaphoreSubmitInfo::default()
                .semaphore(semaphore)
                .stage_mask(stage)
                .value(value.unwrap_or_default()),
        );
        self
    }
}

// getters
impl GfxSubmitInfo {
    #[inline]
    pub fn command_buffers(&self) -> impl Iterator<Item = vk::CommandBuffer> + '_ {
        self.command_buffers.iter().map(|info| info.command_buffer)
    }

    /// (semaphore, value)
    #[inline]
    pub fn waits(&self) -> impl Iterator<Item = (vk::Semaphore, u64)> + '_ {
        self.wait_infos.iter().map(|info| (info.semaphore, info.value))
    }

    /// (semaphore, value)
    #[inline]
    pub fn signals(&self) -> impl Iterator<Item = (vk::Semaphore, u64)> + '_ {
        self.signal_infos.iter().map(|info| (info.semaphore, info.value))
    }
}
