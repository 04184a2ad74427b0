//! 进程内模拟的 GPU 设备
//!
//! - buffer 的内存是 host 上的一段堆内存，始终是映射状态
//! - timeline semaphore 就是一个计数器
//! - 录制的命令按 command buffer 记录下来，submit 时整体存入提交日志
//! - 某个队列可以切换为手动完成模式：提交先排队，由 `complete_next` 按 FIFO 顺序完成，
//!   用来模拟 GPU 的延迟
//! - 重复销毁、timeline 回退等 API 误用会记录为 validation error

use std::collections::{HashMap, HashSet, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ash::vk;
use ash::vk::Handle;
use parking_lot::{Condvar, Mutex};

use crate::backend::{GfxBackend, GfxBindlessWrite, GfxQueueType};
use crate::commands::barrier::GfxImageBarrier;
use crate::commands::submit_info::GfxSubmitInfo;
use crate::error::{GfxError, GfxResult};
use crate::resources::buffer::{GfxBuffer, GfxBufferDesc};
use crate::resources::image::{GfxImage, GfxImageDesc};
use crate::resources::pipeline::{GfxPipeline, GfxSemaphoreType};
use crate::resources::sampler::GfxSamplerDesc;

/// 一段 host 内存，模拟 buffer 的 device memory
pub struct HeadlessAllocation {
    memory: Option<(NonNull<u8>, usize)>,
}

// SAFETY: memory 由 Box<[u8]> 转换而来，只被拥有它的 GfxBuffer 访问
unsafe impl Send for HeadlessAllocation {}
unsafe impl Sync for HeadlessAllocation {}

impl HeadlessAllocation {
    fn host(len: usize) -> Self {
        let memory = vec![0u8; len.max(1)].into_boxed_slice();
        let len = memory.len();
        let ptr = Box::into_raw(memory) as *mut u8;
        Self {
            memory: NonNull::new(ptr).map(|ptr| (ptr, len)),
        }
    }

    fn none() -> Self {
        Self { memory: None }
    }

    fn ptr(&self) -> Option<NonNull<u8>> {
        self.memory.map(|(ptr, _)| ptr)
    }
}

impl Drop for HeadlessAllocation {
    fn drop(&mut self) {
        if let Some((ptr, len)) = self.memory.take() {
            // SAFETY: ptr/len 来自 Box::into_raw，只释放一次
            unsafe {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len)));
            }
        }
    }
}

/// 录制到 command buffer 中的命令
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeadlessCommand {
    ImageBarrier {
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_queue_family: u32,
        dst_queue_family: u32,
        base_mip_level: u32,
        level_count: u32,
    },
    CopyBufferToImage {
        buffer: vk::Buffer,
        image: vk::Image,
        buffer_offset: vk::DeviceSize,
        mip_level: u32,
        extent: vk::Extent3D,
    },
    BlitImage {
        image: vk::Image,
        src_mip_level: u32,
        dst_mip_level: u32,
    },
}

/// 一次 submit 的记录
#[derive(Clone, Debug)]
pub struct HeadlessSubmission {
    pub queue: GfxQueueType,
    pub command_buffers: Vec<vk::CommandBuffer>,
    /// 提交时这些 command buffer 中录制的全部命令
    pub commands: Vec<HeadlessCommand>,
    pub waits: Vec<(vk::Semaphore, u64)>,
    pub signals: Vec<(vk::Semaphore, u64)>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HeadlessObjectKind {
    Buffer,
    Image,
    ImageView,
    Sampler,
    Pipeline,
    PipelineLayout,
    Semaphore,
    CommandPool,
    CommandBuffer,
}

#[derive(Default)]
struct HeadlessState {
    live_objects: HashMap<u64, HeadlessObjectKind>,
    semaphore_values: HashMap<vk::Semaphore, u64>,
    timeline_semaphores: HashSet<vk::Semaphore>,
    recording: HashMap<vk::CommandBuffer, Vec<HeadlessCommand>>,
    pool_buffers: HashMap<vk::CommandPool, Vec<vk::CommandBuffer>>,
    submissions: Vec<HeadlessSubmission>,
    /// 手动完成模式下尚未完成的提交，元素是要 signal 的 (semaphore, value)
    in_flight: HashMap<GfxQueueType, VecDeque<Vec<(vk::Semaphore, u64)>>>,
    bindless_updates: Vec<Vec<GfxBindlessWrite>>,
    validation_errors: Vec<String>,
}

impl HeadlessState {
    fn validation_error(&mut self, msg: String) {
        log::error!("[headless validation] {}", msg);
        self.validation_errors.push(msg);
    }

    fn register(&mut self, raw: u64, kind: HeadlessObjectKind) {
        self.live_objects.insert(raw, kind);
    }

    fn unregister(&mut self, raw: u64, kind: HeadlessObjectKind) {
        match self.live_objects.remove(&raw) {
            Some(live_kind) if live_kind == kind => {}
            Some(live_kind) => {
                self.validation_error(format!("destroying {raw:#x} as {kind:?}, but it is a {live_kind:?}"));
            }
            None => {
                self.validation_error(format!("destroying {kind:?} {raw:#x} which is not alive"));
            }
        }
    }

    fn apply_signals(&mut self, signals: &[(vk::Semaphore, u64)]) {
        for &(semaphore, value) in signals {
            if !self.timeline_semaphores.contains(&semaphore) {
                continue;
            }
            let current = self.semaphore_values.entry(semaphore).or_default();
            *current = (*current).max(value);
        }
    }
}

/// 进程内模拟的 GPU 设备，见模块文档
pub struct HeadlessBackend {
    next_handle: AtomicU64,
    manual_queues: HashSet<GfxQueueType>,
    graphics_family: u32,
    transfer_family: u32,
    bindless_capacity: u32,
    fail_allocations: AtomicBool,

    state: Mutex<HeadlessState>,
    signaled: Condvar,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

// new & builder
impl HeadlessBackend {
    /// 所有提交立即完成；graphics 和 transfer 使用不同的 queue family
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            manual_queues: HashSet::new(),
            graphics_family: 0,
            transfer_family: 1,
            bindless_capacity: 1024,
            fail_allocations: AtomicBool::new(false),
            state: Mutex::new(HeadlessState::default()),
            signaled: Condvar::new(),
        }
    }

    /// builder
    /// 该队列上的提交需要通过 `complete_next` 手动完成
    pub fn with_manual_queue(mut self, queue: GfxQueueType) -> Self {
        self.manual_queues.insert(queue);
        self
    }

    /// builder
    /// 模拟没有专用 transfer family 的设备
    pub fn with_shared_queue_family(mut self) -> Self {
        self.transfer_family = self.graphics_family;
        self
    }

    /// builder
    pub fn with_bindless_capacity(mut self, capacity: u32) -> Self {
        self.bindless_capacity = capacity;
        self
    }
}

// 测试控制
impl HeadlessBackend {
    /// 之后的 buffer / image 分配都返回 OutOfMemory
    pub fn set_fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::SeqCst);
    }

    /// 完成该队列上最早的一次提交
    pub fn complete_next(&self, queue: GfxQueueType) -> bool {
        let mut state = self.state.lock();
        let Some(signals) = state.in_flight.get_mut(&queue).and_then(|pending| pending.pop_front()) else {
            return false;
        };
        state.apply_signals(&signals);
        drop(state);
        self.signaled.notify_all();
        true
    }

    /// 完成该队列上所有的提交，返回完成的数量
    pub fn complete_all(&self, queue: GfxQueueType) -> usize {
        let mut count = 0;
        while self.complete_next(queue) {
            count += 1;
        }
        count
    }

    pub fn in_flight_count(&self, queue: GfxQueueType) -> usize {
        self.state.lock().in_flight.get(&queue).map_or(0, |pending| pending.len())
    }
}

// 检查
impl HeadlessBackend {
    pub fn submissions(&self) -> Vec<HeadlessSubmission> {
        self.state.lock().submissions.clone()
    }

    pub fn submissions_on(&self, queue: GfxQueueType) -> Vec<HeadlessSubmission> {
        self.state.lock().submissions.iter().filter(|submission| submission.queue == queue).cloned().collect()
    }

    /// 每个元素是一次 `write_bindless_textures` 调用
    pub fn bindless_updates(&self) -> Vec<Vec<GfxBindlessWrite>> {
        self.state.lock().bindless_updates.clone()
    }

    pub fn recorded_commands(&self, command_buffer: vk::CommandBuffer) -> Vec<HeadlessCommand> {
        self.state.lock().recording.get(&command_buffer).cloned().unwrap_or_default()
    }

    pub fn live_object_count(&self, kind: HeadlessObjectKind) -> usize {
        self.state.lock().live_objects.values().filter(|live_kind| **live_kind == kind).count()
    }

    pub fn is_alive<H: Handle>(&self, handle: H) -> bool {
        self.state.lock().live_objects.contains_key(&handle.as_raw())
    }

    pub fn validation_errors(&self) -> Vec<String> {
        self.state.lock().validation_errors.clone()
    }
}

// 内部工具
impl HeadlessBackend {
    fn new_handle<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn check_allocation(&self, what: &str) -> GfxResult<()> {
        if self.fail_allocations.load(Ordering::SeqCst) {
            return Err(GfxError::OutOfMemory { what: what.to_string() });
        }
        Ok(())
    }

    fn record(&self, command_buffer: vk::CommandBuffer, commands: impl IntoIterator<Item = HeadlessCommand>) {
        let mut state = self.state.lock();
        if !state.live_objects.contains_key(&command_buffer.as_raw()) {
            state.validation_error(format!("recording into unknown command buffer {command_buffer:?}"));
            return;
        }
        state.recording.entry(command_buffer).or_default().extend(commands);
    }
}

impl GfxBackend for HeadlessBackend {
    type Allocation = HeadlessAllocation;

    fn name(&self) -> &str {
        "headless"
    }

    fn queue_family_index(&self, queue: GfxQueueType) -> u32 {
        match queue {
            GfxQueueType::Graphics => self.graphics_family,
            GfxQueueType::Transfer => self.transfer_family,
        }
    }

    fn bindless_texture_capacity(&self) -> u32 {
        self.bindless_capacity
    }

    fn create_buffer(&self, desc: &GfxBufferDesc) -> GfxResult<GfxBuffer<HeadlessAllocation>> {
        self.check_allocation(&desc.name)?;

        let handle: vk::Buffer = self.new_handle();
        let allocation = if desc.host_visible {
            HeadlessAllocation::host(desc.size as usize)
        } else {
            HeadlessAllocation::none()
        };
        let device_address = desc
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .then_some(handle.as_raw() << 16);
        let mapped_ptr = allocation.ptr();

        self.state.lock().register(handle.as_raw(), HeadlessObjectKind::Buffer);

        // SAFETY: mapped_ptr 指向 allocation 持有的至少 size 字节的内存
        Ok(unsafe {
            GfxBuffer::from_raw_parts(
                handle,
                allocation,
                desc.size,
                desc.usage,
                mapped_ptr,
                device_address,
                desc.name.clone(),
            )
        })
    }

    fn flush_buffer(
        &self,
        buffer: &GfxBuffer<HeadlessAllocation>,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> GfxResult<()> {
        if offset + size > buffer.size() {
            return Err(GfxError::OutOfBounds {
                offset,
                len: size,
                size: buffer.size(),
            });
        }
        Ok(())
    }

    fn destroy_buffer(&self, buffer: GfxBuffer<HeadlessAllocation>) {
        let (handle, allocation, _) = buffer.into_raw_parts();
        self.state.lock().unregister(handle.as_raw(), HeadlessObjectKind::Buffer);
        drop(allocation);
    }

    fn create_image(&self, desc: &GfxImageDesc) -> GfxResult<GfxImage<HeadlessAllocation>> {
        self.check_allocation(&desc.name)?;

        let image: vk::Image = self.new_handle();
        let view: vk::ImageView = self.new_handle();
        {
            let mut state = self.state.lock();
            state.register(image.as_raw(), HeadlessObjectKind::Image);
            state.register(view.as_raw(), HeadlessObjectKind::ImageView);
        }
        Ok(GfxImage::from_raw_parts(image, view, HeadlessAllocation::none(), desc))
    }

    fn destroy_image(&self, image: GfxImage<HeadlessAllocation>) {
        let (image, view, _) = image.into_raw_parts();
        let mut state = self.state.lock();
        state.unregister(view.as_raw(), HeadlessObjectKind::ImageView);
        state.unregister(image.as_raw(), HeadlessObjectKind::Image);
    }

    fn create_sampler(&self, _desc: &GfxSamplerDesc) -> GfxResult<vk::Sampler> {
        let sampler: vk::Sampler = self.new_handle();
        self.state.lock().register(sampler.as_raw(), HeadlessObjectKind::Sampler);
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state.lock().unregister(sampler.as_raw(), HeadlessObjectKind::Sampler);
    }

    fn destroy_pipeline(&self, pipeline: GfxPipeline) {
        let mut state = self.state.lock();
        state.unregister(pipeline.pipeline.as_raw(), HeadlessObjectKind::Pipeline);
        state.unregister(pipeline.layout.as_raw(), HeadlessObjectKind::PipelineLayout);
    }

    fn create_semaphore(&self, semaphore_type: GfxSemaphoreType, _name: &str) -> GfxResult<vk::Semaphore> {
        let semaphore: vk::Semaphore = self.new_handle();
        let mut state = self.state.lock();
        state.register(semaphore.as_raw(), HeadlessObjectKind::Semaphore);
        if let GfxSemaphoreType::Timeline { initial_value } = semaphore_type {
            state.timeline_semaphores.insert(semaphore);
            state.semaphore_values.insert(semaphore, initial_value);
        }
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.unregister(semaphore.as_raw(), HeadlessObjectKind::Semaphore);
        state.timeline_semaphores.remove(&semaphore);
        state.semaphore_values.remove(&semaphore);
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> GfxResult<u64> {
        let state = self.state.lock();
        state
            .semaphore_values
            .get(&semaphore)
            .copied()
            .ok_or(GfxError::Vulkan(vk::Result::ERROR_UNKNOWN))
    }

    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64) -> GfxResult<()> {
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut state = self.state.lock();
        loop {
            let Some(current) = state.semaphore_values.get(&semaphore).copied() else {
                return Err(GfxError::Vulkan(vk::Result::ERROR_UNKNOWN));
            };
            if current >= value {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self.signaled.wait_until(&mut state, deadline).timed_out() {
                        let reached = state.semaphore_values.get(&semaphore).is_some_and(|current| *current >= value);
                        return if reached { Ok(()) } else { Err(GfxError::Timeout { value }) };
                    }
                }
                None => self.signaled.wait(&mut state),
            }
        }
    }

    fn create_command_pool(&self, _queue: GfxQueueType, _name: &str) -> GfxResult<vk::CommandPool> {
        let pool: vk::CommandPool = self.new_handle();
        let mut state = self.state.lock();
        state.register(pool.as_raw(), HeadlessObjectKind::CommandPool);
        state.pool_buffers.insert(pool, Vec::new());
        Ok(pool)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> GfxResult<()> {
        let mut state = self.state.lock();
        let buffers = state.pool_buffers.get(&pool).cloned().unwrap_or_default();
        for command_buffer in buffers {
            state.recording.insert(command_buffer, Vec::new());
        }
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state.unregister(pool.as_raw(), HeadlessObjectKind::CommandPool);
        let buffers = state.pool_buffers.remove(&pool).unwrap_or_default();
        for command_buffer in buffers {
            state.recording.remove(&command_buffer);
            state.live_objects.remove(&command_buffer.as_raw());
        }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool, _name: &str) -> GfxResult<vk::CommandBuffer> {
        let command_buffer: vk::CommandBuffer = self.new_handle();
        let mut state = self.state.lock();
        let Some(buffers) = state.pool_buffers.get_mut(&pool) else {
            state.validation_error(format!("allocating from unknown command pool {pool:?}"));
            return Err(GfxError::Vulkan(vk::Result::ERROR_UNKNOWN));
        };
        buffers.push(command_buffer);
        state.register(command_buffer.as_raw(), HeadlessObjectKind::CommandBuffer);
        state.recording.insert(command_buffer, Vec::new());
        Ok(command_buffer)
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for command_buffer in command_buffers {
            state.unregister(command_buffer.as_raw(), HeadlessObjectKind::CommandBuffer);
            state.recording.remove(command_buffer);
            if let Some(buffers) = state.pool_buffers.get_mut(&pool) {
                buffers.retain(|buffer| buffer != command_buffer);
            }
        }
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> GfxResult<()> {
        let mut state = self.state.lock();
        if !state.live_objects.contains_key(&command_buffer.as_raw()) {
            state.validation_error(format!("begin on unknown command buffer {command_buffer:?}"));
            return Err(GfxError::Vulkan(vk::Result::ERROR_UNKNOWN));
        }
        state.recording.insert(command_buffer, Vec::new());
        Ok(())
    }

    fn end_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> GfxResult<()> {
        Ok(())
    }

    fn cmd_image_barriers(&self, command_buffer: vk::CommandBuffer, barriers: &[GfxImageBarrier]) {
        self.record(
            command_buffer,
            barriers.iter().map(|barrier| {
                let inner = barrier.inner();
                HeadlessCommand::ImageBarrier {
                    image: inner.image,
                    old_layout: inner.old_layout,
                    new_layout: inner.new_layout,
                    src_queue_family: inner.src_queue_family_index,
                    dst_queue_family: inner.dst_queue_family_index,
                    base_mip_level: inner.subresource_range.base_mip_level,
                    level_count: inner.subresource_range.level_count,
                }
            }),
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_image: vk::Image,
        regions: &[vk::BufferImageCopy2<'_>],
    ) {
        self.record(
            command_buffer,
            regions.iter().map(|region| HeadlessCommand::CopyBufferToImage {
                buffer: src_buffer,
                image: dst_image,
                buffer_offset: region.buffer_offset,
                mip_level: region.image_subresource.mip_level,
                extent: region.image_extent,
            }),
        );
    }

    fn cmd_blit_image(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        regions: &[vk::ImageBlit2<'_>],
        _filter: vk::Filter,
    ) {
        self.record(
            command_buffer,
            regions.iter().map(|region| HeadlessCommand::BlitImage {
                image,
                src_mip_level: region.src_subresource.mip_level,
                dst_mip_level: region.dst_subresource.mip_level,
            }),
        );
    }

    fn submit(&self, queue: GfxQueueType, submits: &[GfxSubmitInfo]) -> GfxResult<()> {
        let mut state = self.state.lock();
        for submit in submits {
            let command_buffers = submit.command_buffers().collect::<Vec<_>>();
            let signals = submit.signals().collect::<Vec<_>>();

            // timeline 的 signal 值必须严格递增
            for &(semaphore, value) in &signals {
                if !state.timeline_semaphores.contains(&semaphore) {
                    continue;
                }
                let current = state.semaphore_values.get(&semaphore).copied().unwrap_or_default();
                let queued_max = state
                    .in_flight
                    .values()
                    .flatten()
                    .flatten()
                    .filter(|(pending, _)| *pending == semaphore)
                    .map(|(_, pending_value)| *pending_value)
                    .max()
                    .unwrap_or_default();
                if value <= current.max(queued_max) {
                    state.validation_error(format!(
                        "timeline {semaphore:?} signaled with {value}, but it already reached {}",
                        current.max(queued_max)
                    ));
                }
            }

            let commands = command_buffers
                .iter()
                .flat_map(|cmd| state.recording.get(cmd).cloned().unwrap_or_default())
                .collect();
            state.submissions.push(HeadlessSubmission {
                queue,
                command_buffers,
                commands,
                waits: submit.waits().collect(),
                signals: signals.clone(),
            });

            if self.manual_queues.contains(&queue) {
                state.in_flight.entry(queue).or_default().push_back(signals);
            } else {
                state.apply_signals(&signals);
            }
        }
        drop(state);
        self.signaled.notify_all();
        Ok(())
    }

    fn write_bindless_textures(&self, writes: &[GfxBindlessWrite]) {
        let mut state = self.state.lock();
        if let Some(write) = writes.iter().find(|write| write.slot >= self.bindless_capacity) {
            state.validation_error(format!(
                "bindless slot {} out of range ({})",
                write.slot, self.bindless_capacity
            ));
        }
        state.bindless_updates.push(writes.to_vec());
    }

    fn wait_idle(&self) -> GfxResult<()> {
        // 所有在途的提交都视为完成
        let queues = self.manual_queues.iter().copied().collect::<Vec<_>>();
        for queue in queues {
            self.complete_all(queue);
        }
        Ok(())
    }
}

/// 供测试使用：模拟外部创建 pipeline
impl HeadlessBackend {
    pub fn create_pipeline(&self, name: &str) -> GfxPipeline {
        let pipeline: vk::Pipeline = self.new_handle();
        let layout: vk::PipelineLayout = self.new_handle();
        let mut state = self.state.lock();
        state.register(pipeline.as_raw(), HeadlessObjectKind::Pipeline);
        state.register(layout.as_raw(), HeadlessObjectKind::PipelineLayout);
        GfxPipeline::new(pipeline, layout, vk::PipelineBindPoint::GRAPHICS, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_buffer_memory_is_mapped() {
        let backend = HeadlessBackend::new();
        let mut buffer = backend.create_buffer(&GfxBufferDesc::staging(16, "staging")).unwrap();
        buffer.write_bytes(4, &[9, 8, 7]).unwrap();
        backend.flush_buffer(&buffer, 0, 16).unwrap();
        assert_eq!(&buffer.mapped_bytes().unwrap()[4..7], &[9, 8, 7]);

        assert_eq!(backend.live_object_count(HeadlessObjectKind::Buffer), 1);
        backend.destroy_buffer(buffer);
        assert_eq!(backend.live_object_count(HeadlessObjectKind::Buffer), 0);
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_double_destroy_is_reported() {
        let backend = HeadlessBackend::new();
        let sampler = backend.create_sampler(&GfxSamplerDesc::default()).unwrap();
        backend.destroy_sampler(sampler);
        backend.destroy_sampler(sampler);
        assert_eq!(backend.validation_errors().len(), 1);
    }

    #[test]
    fn test_auto_queue_signals_on_submit() {
        let backend = HeadlessBackend::new();
        let timeline = backend.create_semaphore(GfxSemaphoreType::Timeline { initial_value: 0 }, "t").unwrap();
        backend
            .submit(
                GfxQueueType::Graphics,
                &[GfxSubmitInfo::empty().signal(timeline, vk::PipelineStageFlags2::ALL_COMMANDS, Some(3))],
            )
            .unwrap();
        assert_eq!(backend.semaphore_value(timeline).unwrap(), 3);
    }

    #[test]
    fn test_manual_queue_completes_in_order() {
        let backend = HeadlessBackend::new().with_manual_queue(GfxQueueType::Transfer);
        let timeline = backend.create_semaphore(GfxSemaphoreType::Timeline { initial_value: 0 }, "t").unwrap();
        for value in 1..=2 {
            backend
                .submit(
                    GfxQueueType::Transfer,
                    &[GfxSubmitInfo::empty().signal(timeline, vk::PipelineStageFlags2::ALL_COMMANDS, Some(value))],
                )
                .unwrap();
        }
        assert_eq!(backend.semaphore_value(timeline).unwrap(), 0);
        assert_eq!(backend.in_flight_count(GfxQueueType::Transfer), 2);

        assert!(backend.complete_next(GfxQueueType::Transfer));
        assert_eq!(backend.semaphore_value(timeline).unwrap(), 1);
        assert_eq!(backend.complete_all(GfxQueueType::Transfer), 1);
        assert_eq!(backend.semaphore_value(timeline).unwrap(), 2);
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_non_increasing_signal_is_reported() {
        let backend = HeadlessBackend::new();
        let timeline = backend.create_semaphore(GfxSemaphoreType::Timeline { initial_value: 5 }, "t").unwrap();
        backend
            .submit(
                GfxQueueType::Graphics,
                &[GfxSubmitInfo::empty().signal(timeline, vk::PipelineStageFlags2::ALL_COMMANDS, Some(5))],
            )
            .unwrap();
        assert_eq!(backend.validation_errors().len(), 1);
    }

    #[test]
    fn test_wait_semaphore_timeout_and_wakeup() {
        let backend = Arc::new(HeadlessBackend::new().with_manual_queue(GfxQueueType::Graphics));
        let timeline = backend.create_semaphore(GfxSemaphoreType::Timeline { initial_value: 0 }, "t").unwrap();

        let err = backend.wait_semaphore(timeline, 1, 1_000_000).unwrap_err();
        assert!(matches!(err, GfxError::Timeout { value: 1 }));

        backend
            .submit(
                GfxQueueType::Graphics,
                &[GfxSubmitInfo::empty().signal(timeline, vk::PipelineStageFlags2::ALL_COMMANDS, Some(1))],
            )
            .unwrap();
        let completer = {
            let backend = backend.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                backend.complete_next(GfxQueueType::Graphics);
            })
        };
        backend.wait_semaphore(timeline, 1, u64::MAX).unwrap();
        completer.join().unwrap();
    }

    #[test]
    fn test_commands_are_logged_on_submit() {
        let backend = HeadlessBackend::new();
        let pool = backend.create_command_pool(GfxQueueType::Graphics, "pool").unwrap();
        let cmd = backend.allocate_command_buffer(pool, "cmd").unwrap();
        let image = backend
            .create_image(&GfxImageDesc::sampled_texture(
                vk::Extent2D { width: 4, height: 4 },
                vk::Format::R8G8B8A8_UNORM,
                3,
                "img",
            ))
            .unwrap();

        backend.begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        backend.cmd_image_barriers(
            cmd,
            &[GfxImageBarrier::new()
                .image(image.handle())
                .layout_transfer(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .mip_range(0, 3)],
        );
        backend.end_command_buffer(cmd).unwrap();
        backend.submit(GfxQueueType::Graphics, &[GfxSubmitInfo::new(&[cmd])]).unwrap();

        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(
            submissions[0].commands,
            vec![HeadlessCommand::ImageBarrier {
                image: image.handle(),
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                src_queue_family: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
                base_mip_level: 0,
                level_count: 3,
            }]
        );

        backend.destroy_image(image);
        backend.destroy_command_pool(pool);
        assert_eq!(backend.live_object_count(HeadlessObjectKind::CommandBuffer), 0);
        assert!(backend.validation_errors().is_empty());
    }
}
