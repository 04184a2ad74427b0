use ash::vk;

/// 外部创建好的 pipeline
///
/// pipeline 的状态描述不在这一层；这里只负责生命周期，
/// 交给资源表之后由资源表负责销毁 pipeline 和 layout。
pub struct GfxPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
    pub name: String,
}

impl GfxPipeline {
    pub fn new(
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        bind_point: vk::PipelineBindPoint,
        name: impl Into<String>,
    ) -> Self {
        Self {
            pipeline,
            layout,
            bind_point,
            name: name.into(),
        }
    }
}

/// semaphore 的类型
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GfxSemaphoreType {
    Binary,
    Timeline { initial_value: u64 },
}

/// 资源表持有的 semaphore
#[derive(Copy, Clone, Debug)]
pub struct GfxSemaphore {
    pub handle: vk::Semaphore,
    pub semaphore_type: GfxSemaphoreType,
}
