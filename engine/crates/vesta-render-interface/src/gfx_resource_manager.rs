use std::sync::Arc;

use ash::vk;
use itertools::Itertools;
use vesta_gfx::backend::GfxBackend;
use vesta_gfx::resources::buffer::{GfxBuffer, GfxBufferDesc};
use vesta_gfx::resources::image::{GfxImage, GfxImageDesc};
use vesta_gfx::resources::pipeline::{GfxPipeline, GfxSemaphore, GfxSemaphoreType};

use crate::arena::Arena;
use crate::deletion_queue::DeletionQueue;
use crate::error::{ArenaError, ResourceError, ResourceResult};
use crate::handles::{
    BufferTag, FramebufferTag, GfxBufferHandle, GfxFramebufferHandle, GfxPipelineHandle, GfxSemaphoreHandle,
    GfxTextureHandle, PipelineTag, SemaphoreTag, TextureTag,
};
use crate::pipeline_settings::TableCapacities;

/// 一组一起创建的 render target
pub struct GfxFramebufferDesc {
    pub extent: vk::Extent2D,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    pub name: String,
}

/// framebuffer 拥有它的所有 attachment
pub struct GfxFramebuffer<A> {
    pub extent: vk::Extent2D,
    pub color_attachments: Vec<GfxImage<A>>,
    pub depth_attachment: Option<GfxImage<A>>,
}

/// 资源管理器
///
/// 负责管理所有的 GPU 资源：Buffer、Texture、Pipeline、Framebuffer 和 Semaphore。
/// 每种资源存放在一个固定容量的 [`Arena`] 中，对外提供轻量级的 Handle。
///
/// `destroy_*` 只是将资源加入延迟销毁队列，句柄在之后的 `FIF_COUNT` 帧内仍然有效；
/// 每帧调用一次 [`Self::service_deletion_queues`] 真正释放到期的资源。
pub struct GfxResourceManager<B: GfxBackend> {
    backend: Arc<B>,

    buffers: Arena<GfxBuffer<B::Allocation>, BufferTag>,
    textures: Arena<GfxImage<B::Allocation>, TextureTag>,
    pipelines: Arena<GfxPipeline, PipelineTag>,
    framebuffers: Arena<GfxFramebuffer<B::Allocation>, FramebufferTag>,
    semaphores: Arena<GfxSemaphore, SemaphoreTag>,

    // 待销毁队列
    pending_destroy_buffers: DeletionQueue<BufferTag>,
    pending_destroy_textures: DeletionQueue<TextureTag>,
    pending_destroy_pipelines: DeletionQueue<PipelineTag>,
    pending_destroy_framebuffers: DeletionQueue<FramebufferTag>,
    pending_destroy_semaphores: DeletionQueue<SemaphoreTag>,

    destroyed: bool,
}

// new & init
impl<B: GfxBackend> GfxResourceManager<B> {
    /// 容量超过句柄能表示的范围时返回错误
    pub fn new(backend: Arc<B>, capacities: &TableCapacities) -> ResourceResult<Self> {
        log::info!(
            "resource tables: buffers {}, textures {}, pipelines {}, framebuffers {}, semaphores {}",
            capacities.buffers,
            capacities.textures,
            capacities.pipelines,
            capacities.framebuffers,
            capacities.semaphores
        );

        let table = |table: &'static str| move |source: ArenaError| ResourceError::Arena { table, source };
        Ok(Self {
            backend,

            buffers: Arena::new(capacities.buffers).map_err(table("buffer"))?,
            textures: Arena::new(capacities.textures).map_err(table("texture"))?,
            pipelines: Arena::new(capacities.pipelines).map_err(table("pipeline"))?,
            framebuffers: Arena::new(capacities.framebuffers).map_err(table("framebuffer"))?,
            semaphores: Arena::new(capacities.semaphores).map_err(table("semaphore"))?,

            pending_destroy_buffers: DeletionQueue::new(),
            pending_destroy_textures: DeletionQueue::new(),
            pending_destroy_pipelines: DeletionQueue::new(),
            pending_destroy_framebuffers: DeletionQueue::new(),
            pending_destroy_semaphores: DeletionQueue::new(),

            destroyed: false,
        })
    }
}

// destroy
impl<B: GfxBackend> GfxResourceManager<B> {
    pub fn destroy(mut self) {
        self.drain_all();
    }

    /// 立即释放所有资源，包括仍在待销毁队列中的
    ///
    /// 调用者需要保证 device 已经 idle
    pub fn drain_all(&mut self) {
        let _span = tracy_client::span!("GfxResourceManager::drain_all");

        self.pending_destroy_buffers.drain();
        self.pending_destroy_textures.drain();
        self.pending_destroy_pipelines.drain();
        self.pending_destroy_framebuffers.drain();
        self.pending_destroy_semaphores.drain();

        let mut count = 0;
        for (_, framebuffer) in self.framebuffers.drain() {
            Self::destroy_framebuffer_now(&self.backend, framebuffer);
            count += 1;
        }
        for (_, texture) in self.textures.drain() {
            self.backend.destroy_image(texture);
            count += 1;
        }
        for (_, buffer) in self.buffers.drain() {
            self.backend.destroy_buffer(buffer);
            count += 1;
        }
        for (_, pipeline) in self.pipelines.drain() {
            self.backend.destroy_pipeline(pipeline);
            count += 1;
        }
        for (_, semaphore) in self.semaphores.drain() {
            self.backend.destroy_semaphore(semaphore.handle);
            count += 1;
        }

        log::info!("resource manager drained, {} resources destroyed", count);
        self.destroyed = true;
    }

    fn destroy_framebuffer_now(backend: &B, framebuffer: GfxFramebuffer<B::Allocation>) {
        for image in framebuffer.color_attachments.into_iter().chain(framebuffer.depth_attachment) {
            backend.destroy_image(image);
        }
    }
}
impl<B: GfxBackend> Drop for GfxResourceManager<B> {
    fn drop(&mut self) {
        if !self.destroyed {
            log::warn!("GfxResourceManager dropped without drain_all, destroying remaining resources now");
            self.drain_all();
        }
    }
}

// Subsystem API
impl<B: GfxBackend> GfxResourceManager<B> {
    /// 所有待销毁队列倒数一帧，释放到期的资源，返回释放的数量
    ///
    /// 每帧在 frame pacing 的等待之后调用一次
    pub fn service_deletion_queues(&mut self) -> usize {
        let _span = tracy_client::span!("GfxResourceManager::service_deletion_queues");

        let mut freed = 0;
        for handle in self.pending_destroy_framebuffers.tick() {
            if let Some(framebuffer) = self.framebuffers.remove(handle) {
                Self::destroy_framebuffer_now(&self.backend, framebuffer);
                freed += 1;
            }
        }
        for handle in self.pending_destroy_textures.tick() {
            if let Some(texture) = self.textures.remove(handle) {
                self.backend.destroy_image(texture);
                freed += 1;
            }
        }
        for handle in self.pending_destroy_buffers.tick() {
            if let Some(buffer) = self.buffers.remove(handle) {
                self.backend.destroy_buffer(buffer);
                freed += 1;
            }
        }
        for handle in self.pending_destroy_pipelines.tick() {
            if let Some(pipeline) = self.pipelines.remove(handle) {
                self.backend.destroy_pipeline(pipeline);
                freed += 1;
            }
        }
        for handle in self.pending_destroy_semaphores.tick() {
            if let Some(semaphore) = self.semaphores.remove(handle) {
                self.backend.destroy_semaphore(semaphore.handle);
                freed += 1;
            }
        }

        if freed > 0 {
            log::debug!("freed {} resources", freed);
        }
        freed
    }

    /// 所有队列中等待销毁的资源数量
    pub fn pending_deletion_count(&self) -> usize {
        self.pending_destroy_buffers.len()
            + self.pending_destroy_textures.len()
            + self.pending_destroy_pipelines.len()
            + self.pending_destroy_framebuffers.len()
            + self.pending_destroy_semaphores.len()
    }

    #[inline]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }
}
// Buffer API
impl<B: GfxBackend> GfxResourceManager<B> {
    pub fn create_buffer(&mut self, desc: &GfxBufferDesc) -> ResourceResult<GfxBufferHandle> {
        if self.buffers.is_full() {
            return Err(ResourceError::exhausted("buffer", self.buffers.capacity()));
        }
        let buffer = self.backend.create_buffer(desc)?;
        self.register_buffer(buffer)
    }

    /// 表满时 buffer 会被立即销毁
    pub fn register_buffer(&mut self, buffer: GfxBuffer<B::Allocation>) -> ResourceResult<GfxBufferHandle> {
        if self.buffers.is_full() {
            let capacity = self.buffers.capacity();
            self.backend.destroy_buffer(buffer);
            return Err(ResourceError::exhausted("buffer", capacity));
        }
        self.buffers.insert(buffer).map_err(|source| ResourceError::Arena { table: "buffer", source })
    }

    /// 获取 Buffer 资源引用
    pub fn get_buffer(&self, handle: GfxBufferHandle) -> Option<&GfxBuffer<B::Allocation>> {
        self.buffers.get(handle)
    }

    /// 获取 Buffer 资源可变引用
    pub fn get_buffer_mut(&mut self, handle: GfxBufferHandle) -> Option<&mut GfxBuffer<B::Allocation>> {
        self.buffers.get_mut(handle)
    }

    /// 将 Buffer 加入待销毁队列，句柄无效时什么也不做
    pub fn destroy_buffer(&mut self, handle: GfxBufferHandle) {
        if self.buffers.contains(handle) {
            self.pending_destroy_buffers.push(handle);
        }
    }

    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }
}
// Texture API
impl<B: GfxBackend> GfxResourceManager<B> {
    pub fn create_texture(&mut self, desc: &GfxImageDesc) -> ResourceResult<GfxTextureHandle> {
        if self.textures.is_full() {
            return Err(ResourceError::exhausted("texture", self.textures.capacity()));
        }
        let image = self.backend.create_image(desc)?;
        self.register_texture(image)
    }

    /// 将已经创建好的 image 放入 texture 表；表满时 image 会被立即销毁
    pub fn register_texture(&mut self, image: GfxImage<B::Allocation>) -> ResourceResult<GfxTextureHandle> {
        if self.textures.is_full() {
            let capacity = self.textures.capacity();
            self.backend.destroy_image(image);
            return Err(ResourceError::exhausted("texture", capacity));
        }
        self.textures.insert(image).map_err(|source| ResourceError::Arena { table: "texture", source })
    }

    pub fn get_texture(&self, handle: GfxTextureHandle) -> Option<&GfxImage<B::Allocation>> {
        self.textures.get(handle)
    }

    pub fn destroy_texture(&mut self, handle: GfxTextureHandle) {
        if self.textures.contains(handle) {
            self.pending_destroy_textures.push(handle);
        }
    }

    pub fn iter_textures(&self) -> impl Iterator<Item = (GfxTextureHandle, &GfxImage<B::Allocation>)> + '_ {
        self.textures.iter()
    }

    #[inline]
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    #[inline]
    pub fn is_texture_table_full(&self) -> bool {
        self.textures.is_full()
    }
}
// Pipeline API
impl<B: GfxBackend> GfxResourceManager<B> {
    /// pipeline 由外部创建，交给资源表之后由资源表负责销毁
    pub fn register_pipeline(&mut self, pipeline: GfxPipeline) -> ResourceResult<GfxPipelineHandle> {
        if self.pipelines.is_full() {
            let capacity = self.pipelines.capacity();
            self.backend.destroy_pipeline(pipeline);
            return Err(ResourceError::exhausted("pipeline", capacity));
        }
        self.pipelines.insert(pipeline).map_err(|source| ResourceError::Arena { table: "pipeline", source })
    }

    pub fn get_pipeline(&self, handle: GfxPipelineHandle) -> Option<&GfxPipeline> {
        self.pipelines.get(handle)
    }

    pub fn destroy_pipeline(&mut self, handle: GfxPipelineHandle) {
        if self.pipelines.contains(handle) {
            self.pending_destroy_pipelines.push(handle);
        }
    }
}
// Framebuffer API
impl<B: GfxBackend> GfxResourceManager<B> {
    /// 创建所有 attachment；任意一个失败时，已经创建的会被销毁
    pub fn create_framebuffer(&mut self, desc: &GfxFramebufferDesc) -> ResourceResult<GfxFramebufferHandle> {
        let _span = tracy_client::span!("GfxResourceManager::create_framebuffer");

        if self.framebuffers.is_full() {
            return Err(ResourceError::exhausted("framebuffer", self.framebuffers.capacity()));
        }

        let mut color_attachments = Vec::with_capacity(desc.color_formats.len());
        for (idx, format) in desc.color_formats.iter().enumerate() {
            let image_desc = GfxImageDesc::color_attachment(desc.extent, *format, format!("{}-color-{}", desc.name, idx));
            match self.backend.create_image(&image_desc) {
                Ok(image) => color_attachments.push(image),
                Err(e) => {
                    color_attachments.into_iter().for_each(|image| self.backend.destroy_image(image));
                    return Err(e.into());
                }
            }
        }

        let depth_attachment = match desc.depth_format {
            Some(format) => {
                let image_desc = GfxImageDesc::depth_attachment(desc.extent, format, format!("{}-depth", desc.name));
                match self.backend.create_image(&image_desc) {
                    Ok(image) => Some(image),
                    Err(e) => {
                        color_attachments.into_iter().for_each(|image| self.backend.destroy_image(image));
                        return Err(e.into());
                    }
                }
            }
            None => None,
        };

        let framebuffer = GfxFramebuffer {
            extent: desc.extent,
            color_attachments,
            depth_attachment,
        };
        self.framebuffers.insert(framebuffer).map_err(|source| ResourceError::Arena {
            table: "framebuffer",
            source,
        })
    }

    pub fn get_framebuffer(&self, handle: GfxFramebufferHandle) -> Option<&GfxFramebuffer<B::Allocation>> {
        self.framebuffers.get(handle)
    }

    pub fn destroy_framebuffer(&mut self, handle: GfxFramebufferHandle) {
        if self.framebuffers.contains(handle) {
            self.pending_destroy_framebuffers.push(handle);
        }
    }
}
// Semaphore API
impl<B: GfxBackend> GfxResourceManager<B> {
    pub fn create_semaphore(
        &mut self,
        semaphore_type: GfxSemaphoreType,
        name: &str,
    ) -> ResourceResult<GfxSemaphoreHandle> {
        if self.semaphores.is_full() {
            return Err(ResourceError::exhausted("semaphore", self.semaphores.capacity()));
        }
        let handle = self.backend.create_semaphore(semaphore_type, name)?;
        self.semaphores
            .insert(GfxSemaphore { handle, semaphore_type })
            .map_err(|source| ResourceError::Arena { table: "semaphore", source })
    }

    pub fn get_semaphore(&self, handle: GfxSemaphoreHandle) -> Option<&GfxSemaphore> {
        self.semaphores.get(handle)
    }

    pub fn destroy_semaphore(&mut self, handle: GfxSemaphoreHandle) {
        if self.semaphores.contains(handle) {
            self.pending_destroy_semaphores.push(handle);
        }
    }

    /// 所有 live semaphore 的 vk handle，按 slot 顺序
    pub fn semaphore_handles(&self) -> Vec<vk::Semaphore> {
        self.semaphores.iter().map(|(_, semaphore)| semaphore.handle).collect_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_counter::FrameCounter;
    use vesta_gfx::headless::{HeadlessBackend, HeadlessObjectKind};

    fn small_capacities() -> TableCapacities {
        TableCapacities {
            buffers: 4,
            textures: 2,
            pipelines: 2,
            framebuffers: 2,
            semaphores: 2,
        }
    }

    fn manager() -> (Arc<HeadlessBackend>, GfxResourceManager<HeadlessBackend>) {
        let backend = Arc::new(HeadlessBackend::new());
        let manager = GfxResourceManager::new(backend.clone(), &small_capacities()).unwrap();
        (backend, manager)
    }

    #[test]
    fn test_destroyed_buffer_survives_fif_minus_one_services() {
        let (backend, mut manager) = manager();
        let handle = manager.create_buffer(&GfxBufferDesc::staging(64, "tmp")).unwrap();
        assert_eq!(manager.get_buffer(handle).unwrap().size(), 64);

        manager.destroy_buffer(handle);
        for _ in 0..FrameCounter::FIF_COUNT - 1 {
            assert_eq!(manager.service_deletion_queues(), 0);
            assert!(manager.get_buffer(handle).is_some());
            assert_eq!(backend.live_object_count(HeadlessObjectKind::Buffer), 1);
        }

        assert_eq!(manager.service_deletion_queues(), 1);
        assert!(manager.get_buffer(handle).is_none());
        assert_eq!(backend.live_object_count(HeadlessObjectKind::Buffer), 0);

        manager.drain_all();
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_destroy_invalid_handle_is_noop() {
        let (backend, mut manager) = manager();
        let handle = manager.create_buffer(&GfxBufferDesc::staging(16, "tmp")).unwrap();
        manager.destroy_buffer(handle);
        // 重复销毁不会重复入队
        manager.destroy_buffer(handle);
        assert_eq!(manager.pending_deletion_count(), 1);

        for _ in 0..FrameCounter::FIF_COUNT {
            manager.service_deletion_queues();
        }
        // 已经释放的句柄
        manager.destroy_buffer(handle);
        manager.destroy_texture(GfxTextureHandle::null());
        assert_eq!(manager.pending_deletion_count(), 0);

        manager.drain_all();
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_full_table_fails_only_that_call() {
        let (backend, mut manager) = manager();
        let desc = GfxImageDesc::sampled_texture(
            vk::Extent2D { width: 4, height: 4 },
            vk::Format::R8G8B8A8_UNORM,
            1,
            "tex",
        );
        manager.create_texture(&desc).unwrap();
        manager.create_texture(&desc).unwrap();
        assert!(manager.is_texture_table_full());

        let err = manager.create_texture(&desc).unwrap_err();
        assert!(matches!(err, ResourceError::Arena { table: "texture", .. }));
        // 失败的调用不会泄漏 image
        assert_eq!(backend.live_object_count(HeadlessObjectKind::Image), 2);

        // 其它表不受影响
        manager.create_buffer(&GfxBufferDesc::staging(16, "tmp")).unwrap();

        manager.drain_all();
        assert_eq!(backend.live_object_count(HeadlessObjectKind::Image), 0);
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_allocation_failure_is_reported() {
        let (backend, mut manager) = manager();
        backend.set_fail_allocations(true);
        let err = manager.create_buffer(&GfxBufferDesc::staging(16, "tmp")).unwrap_err();
        assert!(matches!(err, ResourceError::Gfx(_)));
        assert_eq!(manager.buffer_count(), 0);
        manager.drain_all();
    }

    #[test]
    fn test_framebuffer_owns_attachments() {
        let (backend, mut manager) = manager();
        let handle = manager
            .create_framebuffer(&GfxFramebufferDesc {
                extent: vk::Extent2D { width: 8, height: 8 },
                color_formats: vec![vk::Format::R8G8B8A8_UNORM, vk::Format::R16G16B16A16_SFLOAT],
                depth_format: Some(vk::Format::D32_SFLOAT),
                name: "gbuffer".to_string(),
            })
            .unwrap();
        let framebuffer = manager.get_framebuffer(handle).unwrap();
        assert_eq!(framebuffer.color_attachments.len(), 2);
        assert!(framebuffer.depth_attachment.is_some());
        assert_eq!(backend.live_object_count(HeadlessObjectKind::Image), 3);

        manager.destroy_framebuffer(handle);
        for _ in 0..FrameCounter::FIF_COUNT {
            manager.service_deletion_queues();
        }
        assert_eq!(backend.live_object_count(HeadlessObjectKind::Image), 0);
        manager.drain_all();
    }

    #[test]
    fn test_pipeline_and_semaphore_tables() {
        let (backend, mut manager) = manager();
        let pipeline = manager.register_pipeline(backend.create_pipeline("blit")).unwrap();
        let semaphore = manager.create_semaphore(GfxSemaphoreType::Timeline { initial_value: 0 }, "timeline").unwrap();

        assert_eq!(manager.get_pipeline(pipeline).unwrap().name, "blit");
        assert_eq!(
            manager.get_semaphore(semaphore).unwrap().semaphore_type,
            GfxSemaphoreType::Timeline { initial_value: 0 }
        );
        assert_eq!(manager.semaphore_handles().len(), 1);

        manager.destroy_pipeline(pipeline);
        manager.destroy_semaphore(semaphore);
        for _ in 0..FrameCounter::FIF_COUNT {
            manager.service_deletion_queues();
        }
        assert_eq!(backend.live_object_count(HeadlessObjectKind::Pipeline), 0);
        assert_eq!(backend.live_object_count(HeadlessObjectKind::Semaphore), 0);
        manager.drain_all();
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_drain_all_frees_pending_and_live() {
        let (backend, mut manager) = manager();
        let a = manager.create_buffer(&GfxBufferDesc::staging(16, "a")).unwrap();
        manager.create_buffer(&GfxBufferDesc::staging(16, "b")).unwrap();
        manager.destroy_buffer(a);

        manager.drain_all();
        assert_eq!(backend.live_object_count(HeadlessObjectKind::Buffer), 0);
        assert_eq!(manager.pending_deletion_count(), 0);
        assert!(backend.validation_errors().is_empty());
    }
}
