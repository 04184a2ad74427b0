use ash::vk;

use crate::commands::barrier::GfxImageBarrier;
use crate::commands::submit_info::GfxSubmitInfo;
use crate::error::GfxResult;
use crate::resources::buffer::{GfxBuffer, GfxBufferDesc};
use crate::resources::image::{GfxImage, GfxImageDesc};
use crate::resources::pipeline::{GfxPipeline, GfxSemaphoreType};
use crate::resources::sampler::GfxSamplerDesc;

/// 上层会用到的两种队列
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum GfxQueueType {
    /// graphics + compute + transfer 的全能队列，渲染线程独占
    Graphics,
    /// 专用的 transfer 队列，后台上传线程独占；没有专用 family 时退化为 graphics family
    Transfer,
}

/// bindless 纹理数组中的一次写入
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GfxBindlessWrite {
    pub slot: u32,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
}

/// 上层依赖的全部 GPU 能力
///
/// 所有方法都可以跨线程调用；同一个 queue 的 submit 由实现内部加锁。
/// command pool / command buffer 的外部同步由调用方保证：每个 pool 只在一个线程上使用。
pub trait GfxBackend: Send + Sync + 'static {
    /// 内存分配记录
    type Allocation: Send + Sync + 'static;

    fn name(&self) -> &str;

    fn queue_family_index(&self, queue: GfxQueueType) -> u32;

    /// bindless 纹理数组的长度
    fn bindless_texture_capacity(&self) -> u32;

    // buffer
    fn create_buffer(&self, desc: &GfxBufferDesc) -> GfxResult<GfxBuffer<Self::Allocation>>;
    /// 让 host 写入对 GPU 可见
    fn flush_buffer(
        &self,
        buffer: &GfxBuffer<Self::Allocation>,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> GfxResult<()>;
    fn destroy_buffer(&self, buffer: GfxBuffer<Self::Allocation>);

    // image
    fn create_image(&self, desc: &GfxImageDesc) -> GfxResult<GfxImage<Self::Allocation>>;
    fn destroy_image(&self, image: GfxImage<Self::Allocation>);

    // sampler
    fn create_sampler(&self, desc: &GfxSamplerDesc) -> GfxResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // pipeline 由外部创建，这里只负责销毁
    fn destroy_pipeline(&self, pipeline: GfxPipeline);

    // semaphore
    fn create_semaphore(&self, semaphore_type: GfxSemaphoreType, name: &str) -> GfxResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    /// 非阻塞地读取 timeline semaphore 的当前值
    fn semaphore_value(&self, semaphore: vk::Semaphore) -> GfxResult<u64>;
    /// 阻塞直到 timeline semaphore 的值 >= value，超时返回 `GfxError::Timeout`
    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64) -> GfxResult<()>;

    // command
    fn create_command_pool(&self, queue: GfxQueueType, name: &str) -> GfxResult<vk::CommandPool>;
    fn reset_command_pool(&self, pool: vk::CommandPool) -> GfxResult<()>;
    /// 会连带释放从该 pool 分配的所有 command buffer
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool, name: &str) -> GfxResult<vk::CommandBuffer>;
    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]);
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags)
    -> GfxResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()>;

    // command 录制
    fn cmd_image_barriers(&self, command_buffer: vk::CommandBuffer, barriers: &[GfxImageBarrier]);
    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_image: vk::Image,
        regions: &[vk::BufferImageCopy2<'_>],
    );
    /// 同一个 image 内的 blit：src 处于 TRANSFER_SRC_OPTIMAL，dst 处于 TRANSFER_DST_OPTIMAL
    fn cmd_blit_image(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        regions: &[vk::ImageBlit2<'_>],
        filter: vk::Filter,
    );

    fn submit(&self, queue: GfxQueueType, submits: &[GfxSubmitInfo]) -> GfxResult<()>;

    /// 一次性写入 bindless 纹理数组
    fn write_bindless_textures(&self, writes: &[GfxBindlessWrite]);

    fn wait_idle(&self) -> GfxResult<()>;
}
