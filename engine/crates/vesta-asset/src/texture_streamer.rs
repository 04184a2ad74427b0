use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use ash::vk;
use crossbeam_channel::Sender;
use vesta_gfx::backend::{GfxBackend, GfxQueueType};
use vesta_gfx::resources::pipeline::GfxSemaphoreType;
use vesta_render_interface::bindless_manager::BindlessManager;
use vesta_render_interface::gfx_resource_manager::GfxResourceManager;
use vesta_render_interface::handles::GfxTextureHandle;
use vesta_render_interface::pipeline_settings::StreamingSettings;

use crate::error::{StreamError, StreamResult};
use crate::handle::{BatchOutcome, BatchStatus, ImageBatchId};
use crate::loader::{self, ImageLoadQueue, LoaderWorker, PendingTables, RawImage};
use crate::transfer::{self, PendingImage, QueueFamilies};

/// 纹理流式加载的渲染线程一侧
///
/// - 持有加载队列，任意线程都可以通过 [`Self::queue`] 提交请求
/// - 持有后台加载线程，以及它使用的 transfer command pool 和 upload timeline
/// - 每帧调用 [`Self::tick_image_uploads`]，把 GPU 已经上传完成的纹理放入 texture 表
///
/// batch id 同时也是 upload timeline 的 signal 值。
/// 已经被 tick 处理过的批次总是 {1..=completed} 这样一个前缀。
///
/// 结束的批次会一直被记录，直到调用者通过 [`Self::retire_batch`] 取走结果。
pub struct TextureStreamer<B: GfxBackend> {
    backend: Arc<B>,
    families: QueueFamilies,
    queue: ImageLoadQueue,

    upload_timeline: vk::Semaphore,
    transfer_pool: vk::CommandPool,
    pending: Arc<PendingTables<B::Allocation>>,
    submitted: Arc<AtomicU64>,

    recycle_sender: Sender<vk::CommandBuffer>,
    shutdown_sender: Sender<()>,
    worker: Option<JoinHandle<()>>,

    /// 最近一次 tick 读到的 upload timeline 的值
    observed_upload_value: u64,
    /// 已经完全放入 texture 表的最大 batch id
    completed: u64,
    failed: BTreeSet<u64>,
    batch_textures: HashMap<u64, Vec<GfxTextureHandle>>,
    /// 已经 retire 的批次为 {1..=retired_prefix} 加上 retired_above
    retired_prefix: u64,
    retired_above: BTreeSet<u64>,

    /// 1x1 的洋红色纹理，位于 bindless slot 0
    fallback_texture: GfxTextureHandle,

    destroyed: bool,
}

// new & init
impl<B: GfxBackend> TextureStreamer<B> {
    /// 上传占位纹理，创建 upload timeline，并启动后台加载线程
    ///
    /// 需要在 texture 表中创建任何其他纹理之前调用，占位纹理才会位于 slot 0
    pub fn new(
        backend: Arc<B>,
        settings: &StreamingSettings,
        resources: &mut GfxResourceManager<B>,
        bindless: &mut BindlessManager<B>,
    ) -> StreamResult<Self> {
        let _span = tracy_client::span!("TextureStreamer::new");

        let fallback_texture = transfer::upload_fallback_texture(backend.as_ref(), resources)?;
        if fallback_texture.index() != 0 {
            log::warn!("fallback texture landed at slot {}, not 0", fallback_texture.index());
        }
        bindless.register_texture(resources, fallback_texture);
        bindless.flush();

        let upload_timeline =
            backend.create_semaphore(GfxSemaphoreType::Timeline { initial_value: 0 }, "texture-upload-timeline")?;
        let transfer_pool = match backend.create_command_pool(GfxQueueType::Transfer, "texture-upload") {
            Ok(pool) => pool,
            Err(e) => {
                backend.destroy_semaphore(upload_timeline);
                return Err(e.into());
            }
        };
        let cleanup = |backend: &B| {
            backend.destroy_command_pool(transfer_pool);
            backend.destroy_semaphore(upload_timeline);
        };

        let decode_pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(settings.decode_threads)
            .thread_name(|index| format!("Vesta-Decode-{}", index))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                cleanup(backend.as_ref());
                return Err(e.into());
            }
        };

        let families = QueueFamilies::of(backend.as_ref());
        let (queue, channels, shutdown_sender, recycle_sender) = loader::load_channels();
        let pending = Arc::new(PendingTables::default());
        let submitted = Arc::new(AtomicU64::new(0));

        let worker = LoaderWorker {
            backend: backend.clone(),
            families,
            pending: pending.clone(),
            upload_timeline,
            submitted: submitted.clone(),
            command_pool: transfer_pool,
            channels,
            decode_pool,
            idle_timeout: Duration::from_millis(settings.loader_idle_timeout_ms.max(1)),
            free_command_buffers: Vec::new(),
            next_expected: 1,
            reorder: Default::default(),
        };
        let worker = match std::thread::Builder::new()
            .name("Vesta-Texture-Loader".to_string())
            .spawn(move || worker.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                cleanup(backend.as_ref());
                return Err(StreamError::Spawn(e));
            }
        };

        log::info!(
            "texture streamer started: graphics family {}, transfer family {}",
            families.graphics,
            families.transfer
        );

        Ok(Self {
            backend,
            families,
            queue,
            upload_timeline,
            transfer_pool,
            pending,
            submitted,
            recycle_sender,
            shutdown_sender,
            worker: Some(worker),
            observed_upload_value: 0,
            completed: 0,
            failed: BTreeSet::new(),
            batch_textures: HashMap::new(),
            retired_prefix: 0,
            retired_above: BTreeSet::new(),
            fallback_texture,
            destroyed: false,
        })
    }
}

// 提交请求
impl<B: GfxBackend> TextureStreamer<B> {
    /// 可以 clone 到其他线程的加载队列
    #[inline]
    pub fn queue(&self) -> &ImageLoadQueue {
        &self.queue
    }

    pub fn load_raw_images(&self, images: Vec<RawImage>, formats: Vec<vk::Format>) -> StreamResult<ImageBatchId> {
        self.queue.load_raw_images(images, formats)
    }

    pub fn load_compressed_images(
        &self,
        bytes: Vec<Vec<u8>>,
        formats: Vec<vk::Format>,
    ) -> StreamResult<ImageBatchId> {
        self.queue.load_compressed_images(bytes, formats)
    }

    pub fn load_image_files(&self, paths: Vec<PathBuf>, formats: Vec<vk::Format>) -> StreamResult<ImageBatchId> {
        self.queue.load_image_files(paths, formats)
    }
}

// 每帧
impl<B: GfxBackend> TextureStreamer<B> {
    /// # Phase: Before Render
    ///
    /// 在 graphics 队列正在录制的 command buffer 中：
    /// 1. 回收 GPU 已经完成的批次（command buffer 归还给加载线程，staging buffer 直接释放）
    /// 2. 按 id 顺序录制 acquire barrier 和 mip 生成，把纹理放入 texture 表
    /// 3. 一次性更新 bindless 数组
    ///
    /// pending 表正被加载线程占用时跳过这一帧。返回放入 texture 表的纹理数量。
    pub fn tick_image_uploads(
        &mut self,
        command_buffer: vk::CommandBuffer,
        resources: &mut GfxResourceManager<B>,
        bindless: &mut BindlessManager<B>,
    ) -> usize {
        let _span = tracy_client::span!("TextureStreamer::tick_image_uploads");

        let pending = self.pending.clone();
        let Some(mut batches) = pending.batches.try_lock() else {
            log::warn!("pending batch table is busy, skip this tick");
            return 0;
        };
        let Some(mut images) = pending.images.try_lock() else {
            log::warn!("pending image table is busy, skip this tick");
            return 0;
        };

        let value = match self.backend.semaphore_value(self.upload_timeline) {
            Ok(value) => value,
            Err(e) => {
                log::error!("failed to read upload timeline: {}", e);
                return 0;
            }
        };
        self.observed_upload_value = self.observed_upload_value.max(value);

        // 1. GPU 已经完成的批次
        let still_pending = batches.split_off(&value.saturating_add(1));
        let finished = std::mem::replace(&mut *batches, still_pending);
        for (id, batch) in finished {
            if let Some(command_buffer) = batch.command_buffer {
                // 加载线程已经退出时 pool 会在 destroy 中整体释放
                let _ = self.recycle_sender.send(command_buffer);
            }
            if let Some(staging_buffer) = batch.staging_buffer {
                self.backend.destroy_buffer(staging_buffer);
            }
            if batch.failed {
                self.failed.insert(id);
            } else {
                self.batch_textures.entry(id).or_default();
            }
        }

        // 2. 放入 texture 表
        let mut promoted = 0;
        while let Some(front) = images.front() {
            if front.batch_id > value {
                break;
            }
            if resources.is_texture_table_full() {
                log::warn!(
                    "texture table is full ({} textures), batch {} has to wait",
                    resources.texture_count(),
                    front.batch_id
                );
                break;
            }
            let Some(pending_image) = images.pop_front() else {
                break;
            };

            let batch_id = pending_image.batch_id;
            let handle = match resources.register_texture(pending_image.image) {
                Ok(handle) => handle,
                Err(e) => {
                    log::error!("failed to register texture of batch {}: {}", batch_id, e);
                    self.fail_batch(batch_id, &mut images, resources);
                    continue;
                }
            };
            // 没有 bindless slot 的纹理无法被着色器访问
            if bindless.register_texture(resources, handle).is_none() {
                log::error!("texture {:?} of batch {} has no bindless slot", handle, batch_id);
                resources.destroy_texture(handle);
                self.fail_batch(batch_id, &mut images, resources);
                continue;
            }
            if let Some(texture) = resources.get_texture(handle) {
                transfer::record_acquire_and_mips(self.backend.as_ref(), command_buffer, texture, self.families);
            }
            self.batch_textures.entry(batch_id).or_default().push(handle);
            promoted += 1;
        }

        // 3. 已经完成的前缀
        let reconciled = match images.front() {
            Some(front) if front.batch_id <= value => front.batch_id - 1,
            _ => value,
        };
        self.completed = self.completed.max(reconciled);

        drop(images);
        drop(batches);

        bindless.flush();
        promoted
    }

    /// 批次中的一张纹理无法放入 texture 表：
    /// 已经放入的纹理进入延迟销毁，同一批次还在排队的 image 直接销毁
    fn fail_batch(
        &mut self,
        batch_id: u64,
        images: &mut VecDeque<PendingImage<B::Allocation>>,
        resources: &mut GfxResourceManager<B>,
    ) {
        for handle in self.batch_textures.remove(&batch_id).unwrap_or_default() {
            resources.destroy_texture(handle);
        }
        // 同一批次的 image 在队列中是连续的；GPU 已经完成上传，可以直接销毁
        while images.front().is_some_and(|front| front.batch_id == batch_id) {
            if let Some(pending_image) = images.pop_front() {
                self.backend.destroy_image(pending_image.image);
            }
        }
        self.failed.insert(batch_id);
    }
}

// 查询
impl<B: GfxBackend> TextureStreamer<B> {
    /// 已经放入 texture 表的最大 batch id；所有更小的 id 也都已经完成
    #[inline]
    pub fn completed_image_batches(&self) -> u64 {
        self.completed
    }

    pub fn batch_status(&self, id: ImageBatchId) -> BatchStatus {
        let id = id.value();
        if id == 0 || id > self.queue.last_issued() {
            BatchStatus::Unknown
        } else if self.is_retired(id) {
            BatchStatus::Retired
        } else if self.failed.contains(&id) {
            BatchStatus::Failed
        } else if id <= self.completed {
            BatchStatus::Ready
        } else if id <= self.submitted.load(Ordering::Acquire) {
            BatchStatus::Uploading
        } else {
            BatchStatus::Queued
        }
    }

    /// 批次产生的纹理，顺序与提交时一致；只有 Ready 的批次才会返回
    pub fn texture_of(&self, id: ImageBatchId) -> Option<&[GfxTextureHandle]> {
        if self.batch_status(id) != BatchStatus::Ready {
            return None;
        }
        self.batch_textures.get(&id.value()).map(|textures| textures.as_slice())
    }

    /// 取走一个已经结束（Ready 或者 Failed）的批次的结果，之后它的状态为 Retired
    ///
    /// 其他状态的批次返回 None，没有任何影响。
    /// 返回的纹理句柄不再由 streamer 记录，纹理本身仍然在 texture 表中。
    pub fn retire_batch(&mut self, id: ImageBatchId) -> Option<BatchOutcome> {
        let outcome = match self.batch_status(id) {
            BatchStatus::Ready => BatchOutcome::Ready(self.batch_textures.remove(&id.value()).unwrap_or_default()),
            BatchStatus::Failed => {
                self.failed.remove(&id.value());
                BatchOutcome::Failed
            }
            _ => return None,
        };

        self.retired_above.insert(id.value());
        while self.retired_above.remove(&(self.retired_prefix + 1)) {
            self.retired_prefix += 1;
        }
        Some(outcome)
    }

    #[inline]
    fn is_retired(&self, id: u64) -> bool {
        id <= self.retired_prefix || self.retired_above.contains(&id)
    }

    /// 还没有被 retire 的已结束批次的数量
    #[inline]
    pub fn unretired_batch_count(&self) -> usize {
        self.batch_textures.len() + self.failed.len()
    }

    #[inline]
    pub fn observed_upload_value(&self) -> u64 {
        self.observed_upload_value
    }

    #[inline]
    pub fn upload_timeline(&self) -> vk::Semaphore {
        self.upload_timeline
    }

    #[inline]
    pub fn fallback_texture(&self) -> GfxTextureHandle {
        self.fallback_texture
    }
}

// destroy
impl<B: GfxBackend> TextureStreamer<B> {
    /// 通知加载线程退出并等待；可以重复调用
    ///
    /// 还在加载线程中排队的请求会被丢弃
    pub fn stop_loader(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.shutdown_sender.try_send(());
        if worker.join().is_err() {
            log::error!("texture loader thread panicked");
        }
    }

    /// 调用前 GPU 需要处于 idle 状态
    ///
    /// 占位纹理以及已经放入 texture 表的纹理属于 GfxResourceManager，不在这里释放
    pub fn destroy(mut self) {
        self.destroy_mut();
    }

    fn destroy_mut(&mut self) {
        if self.destroyed {
            return;
        }
        self.stop_loader();

        {
            let mut batches = self.pending.batches.lock();
            let mut images = self.pending.images.lock();
            for (_, batch) in std::mem::take(&mut *batches) {
                if let Some(staging_buffer) = batch.staging_buffer {
                    self.backend.destroy_buffer(staging_buffer);
                }
            }
            for pending_image in images.drain(..) {
                self.backend.destroy_image(pending_image.image);
            }
        }

        // command buffer 随 pool 一起释放
        self.backend.destroy_command_pool(self.transfer_pool);
        self.backend.destroy_semaphore(self.upload_timeline);
        self.destroyed = true;
    }
}
impl<B: GfxBackend> Drop for TextureStreamer<B> {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        log::info!("Dropping TextureStreamer");
        self.stop_loader();
        if let Err(e) = self.backend.wait_idle() {
            log::error!("failed to wait device idle: {}", e);
        }
        self.destroy_mut();
    }
}
