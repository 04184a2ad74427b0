use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ash::vk;
use crossbeam_channel::{Receiver, Select, Sender, TryRecvError};
use parking_lot::Mutex;
use rayon::prelude::*;
use vesta_gfx::backend::{GfxBackend, GfxQueueType};
use vesta_gfx::commands::submit_info::GfxSubmitInfo;
use vesta_gfx::utilities::format::texel_size;

use crate::error::{StreamError, StreamResult};
use crate::handle::ImageBatchId;
use crate::transfer::{self, PendingBatch, PendingImage, QueueFamilies};

/// 已经解码的像素，紧密排列，行之间没有 padding
#[derive(Clone, Debug)]
pub struct RawImage {
    pub extent: vk::Extent2D,
    pub pixels: Vec<u8>,
}

impl RawImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            extent: vk::Extent2D { width, height },
            pixels,
        }
    }
}

/// 后台线程中等待上传的 image
pub(crate) struct DecodedImage {
    pub(crate) extent: vk::Extent2D,
    pub(crate) format: vk::Format,
    pub(crate) pixels: Vec<u8>,
}

struct RawImageRequest {
    id: u64,
    images: Vec<RawImage>,
    formats: Vec<vk::Format>,
}

struct CompressedImageRequest {
    id: u64,
    bytes: Vec<Vec<u8>>,
    formats: Vec<vk::Format>,
}

struct ImageFileRequest {
    id: u64,
    paths: Vec<PathBuf>,
    formats: Vec<vk::Format>,
}

/// 两个 pending 表，由后台线程写入、渲染线程的 tick 读取
///
/// 加锁顺序固定为先 batches 再 images
pub(crate) struct PendingTables<A> {
    pub(crate) batches: Mutex<BTreeMap<u64, PendingBatch<A>>>,
    pub(crate) images: Mutex<VecDeque<PendingImage<A>>>,
}

impl<A> Default for PendingTables<A> {
    fn default() -> Self {
        Self {
            batches: Mutex::new(BTreeMap::new()),
            images: Mutex::new(VecDeque::new()),
        }
    }
}

fn check_count(images: usize, formats: usize) -> StreamResult<()> {
    if images != formats {
        return Err(StreamError::CountMismatch { images, formats });
    }
    Ok(())
}

fn validate_raw_images(images: &[RawImage], formats: &[vk::Format]) -> StreamResult<()> {
    check_count(images.len(), formats.len())?;
    for (index, (image, format)) in images.iter().zip(formats.iter()).enumerate() {
        let Some(texel) = texel_size(*format) else {
            return Err(StreamError::UnsupportedFormat { index, format: *format });
        };
        if image.extent.width == 0 || image.extent.height == 0 {
            return Err(StreamError::EmptyImage { index });
        }
        let expected = image.extent.width as usize * image.extent.height as usize * texel as usize;
        if image.pixels.len() != expected {
            return Err(StreamError::SizeMismatch {
                index,
                expected,
                actual: image.pixels.len(),
            });
        }
    }
    Ok(())
}

/// 解码的结果总是 RGBA8，只接受 RGBA8 的两种格式
fn validate_decode_formats(count: usize, formats: &[vk::Format]) -> StreamResult<()> {
    check_count(count, formats.len())?;
    match formats
        .iter()
        .enumerate()
        .find(|(_, format)| !matches!(**format, vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB))
    {
        Some((index, format)) => Err(StreamError::UnsupportedFormat { index, format: *format }),
        None => Ok(()),
    }
}

/// 纹理加载请求的入口
///
/// 可以 clone 到任意线程；提交时同步检查参数，随后分配 batch id 并立即返回，不等待解码。
/// 参数错误不会消耗 batch id。
#[derive(Clone)]
pub struct ImageLoadQueue {
    last_issued: Arc<AtomicU64>,
    raw_sender: Sender<RawImageRequest>,
    compressed_sender: Sender<CompressedImageRequest>,
    file_sender: Sender<ImageFileRequest>,
}

impl ImageLoadQueue {
    /// 已解码的像素，`formats[i]` 描述 `images[i]` 的像素格式
    pub fn load_raw_images(&self, images: Vec<RawImage>, formats: Vec<vk::Format>) -> StreamResult<ImageBatchId> {
        validate_raw_images(&images, &formats)?;
        let id = self.reserve_batch_id();
        self.send_raw_images(id, images, formats)?;
        Ok(id)
    }

    /// 需要解码的图片文件内容（png / jpeg 等）
    pub fn load_compressed_images(
        &self,
        bytes: Vec<Vec<u8>>,
        formats: Vec<vk::Format>,
    ) -> StreamResult<ImageBatchId> {
        validate_decode_formats(bytes.len(), &formats)?;
        let id = self.reserve_batch_id();
        self.compressed_sender
            .send(CompressedImageRequest {
                id: id.value(),
                bytes,
                formats,
            })
            .map_err(|_| StreamError::LoaderStopped)?;
        Ok(id)
    }

    /// 图片文件的路径，读取与解码都在后台完成
    pub fn load_image_files(&self, paths: Vec<PathBuf>, formats: Vec<vk::Format>) -> StreamResult<ImageBatchId> {
        validate_decode_formats(paths.len(), &formats)?;
        let id = self.reserve_batch_id();
        self.file_sender
            .send(ImageFileRequest {
                id: id.value(),
                paths,
                formats,
            })
            .map_err(|_| StreamError::LoaderStopped)?;
        Ok(id)
    }

    /// 最近分配的 batch id，0 表示还没有分配过
    #[inline]
    pub fn last_issued(&self) -> u64 {
        self.last_issued.load(Ordering::Acquire)
    }

    pub(crate) fn reserve_batch_id(&self) -> ImageBatchId {
        ImageBatchId(self.last_issued.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub(crate) fn send_raw_images(
        &self,
        id: ImageBatchId,
        images: Vec<RawImage>,
        formats: Vec<vk::Format>,
    ) -> StreamResult<()> {
        self.raw_sender
            .send(RawImageRequest {
                id: id.value(),
                images,
                formats,
            })
            .map_err(|_| StreamError::LoaderStopped)
    }
}

/// 后台线程持有的 channel 接收端
pub(crate) struct LoaderChannels {
    raw: Receiver<RawImageRequest>,
    compressed: Receiver<CompressedImageRequest>,
    file: Receiver<ImageFileRequest>,
    pub(crate) shutdown: Receiver<()>,
    pub(crate) recycle: Receiver<vk::CommandBuffer>,
}

/// 创建加载队列以及后台线程需要的接收端
pub(crate) fn load_channels() -> (ImageLoadQueue, LoaderChannels, Sender<()>, Sender<vk::CommandBuffer>) {
    let (raw_sender, raw) = crossbeam_channel::unbounded();
    let (compressed_sender, compressed) = crossbeam_channel::unbounded();
    let (file_sender, file) = crossbeam_channel::unbounded();
    let (shutdown_sender, shutdown) = crossbeam_channel::bounded(1);
    let (recycle_sender, recycle) = crossbeam_channel::unbounded();

    let queue = ImageLoadQueue {
        last_issued: Arc::new(AtomicU64::new(0)),
        raw_sender,
        compressed_sender,
        file_sender,
    };
    let channels = LoaderChannels {
        raw,
        compressed,
        file,
        shutdown,
        recycle,
    };
    (queue, channels, shutdown_sender, recycle_sender)
}

/// 一次循环中收集到的批次，解码已经完成（或者失败）
type CollectedBatch = (u64, StreamResult<Vec<DecodedImage>>);

/// 后台加载线程
///
/// 每次循环：
/// 1. 回收渲染线程归还的 command buffer
/// 2. 在三个输入队列上阻塞等待，带超时
/// 3. 取出所有请求，压缩数据和文件在 rayon 线程池中解码
/// 4. 按 id 排序放入重排缓冲，只按 id 连续的顺序提交，保证 timeline 的 signal 值连续递增
///
/// transfer command pool 只在这个线程上使用
pub(crate) struct LoaderWorker<B: GfxBackend> {
    pub(crate) backend: Arc<B>,
    pub(crate) families: QueueFamilies,
    pub(crate) pending: Arc<PendingTables<B::Allocation>>,
    pub(crate) upload_timeline: vk::Semaphore,
    /// 最后一个提交到 transfer 队列的 batch id（包括失败批次的空提交）
    pub(crate) submitted: Arc<AtomicU64>,
    pub(crate) command_pool: vk::CommandPool,
    pub(crate) channels: LoaderChannels,
    pub(crate) decode_pool: rayon::ThreadPool,
    pub(crate) idle_timeout: Duration,

    pub(crate) free_command_buffers: Vec<vk::CommandBuffer>,
    pub(crate) next_expected: u64,
    pub(crate) reorder: BTreeMap<u64, StreamResult<Vec<DecodedImage>>>,
}

/// 每个输入 channel 是否已经断开
#[derive(Default)]
struct Disconnected {
    raw: bool,
    compressed: bool,
    file: bool,
}

impl<B: GfxBackend> LoaderWorker<B> {
    pub(crate) fn run(mut self) {
        log::info!("texture loader started");
        let mut disconnected = Disconnected::default();

        loop {
            self.recycle_command_buffers();

            if !self.wait_for_requests(&disconnected) {
                break;
            }

            let collected = self.collect_requests(&mut disconnected);
            if collected.is_empty() {
                continue;
            }
            self.enqueue_and_submit(collected);
        }

        log::info!(
            "texture loader stopped, {} batches held in the reorder buffer",
            self.reorder.len()
        );
    }

    /// 等待任意一个输入，返回 false 表示需要退出
    fn wait_for_requests(&self, disconnected: &Disconnected) -> bool {
        let mut select = Select::new();
        select.recv(&self.channels.shutdown);
        if !disconnected.raw {
            select.recv(&self.channels.raw);
        }
        if !disconnected.compressed {
            select.recv(&self.channels.compressed);
        }
        if !disconnected.file {
            select.recv(&self.channels.file);
        }
        // 超时也正常返回，用来及时回收 command buffer
        let _ = select.ready_timeout(self.idle_timeout);

        match self.channels.shutdown.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => false,
            Err(TryRecvError::Empty) => true,
        }
    }

    fn recycle_command_buffers(&mut self) {
        self.free_command_buffers.extend(self.channels.recycle.try_iter());
    }

    fn collect_requests(&mut self, disconnected: &mut Disconnected) -> Vec<CollectedBatch> {
        let _span = tracy_client::span!("LoaderWorker::collect_requests");
        let mut collected = Vec::new();

        loop {
            match self.channels.raw.try_recv() {
                Ok(request) => collected.push((request.id, Ok(Self::raw_to_decoded(request)))),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    disconnected.raw = true;
                    break;
                }
            }
        }
        loop {
            match self.channels.compressed.try_recv() {
                Ok(request) => {
                    let decoded = self.decode_compressed(&request);
                    collected.push((request.id, decoded));
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    disconnected.compressed = true;
                    break;
                }
            }
        }
        loop {
            match self.channels.file.try_recv() {
                Ok(request) => {
                    let decoded = self.decode_files(&request);
                    collected.push((request.id, decoded));
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    disconnected.file = true;
                    break;
                }
            }
        }

        collected
    }

    fn raw_to_decoded(request: RawImageRequest) -> Vec<DecodedImage> {
        request
            .images
            .into_iter()
            .zip(request.formats)
            .map(|(image, format)| DecodedImage {
                extent: image.extent,
                format,
                pixels: image.pixels,
            })
            .collect()
    }

    fn decode_compressed(&self, request: &CompressedImageRequest) -> StreamResult<Vec<DecodedImage>> {
        let _span = tracy_client::span!("LoaderWorker::decode_compressed");
        self.decode_pool.install(|| {
            request
                .bytes
                .par_iter()
                .zip(request.formats.par_iter())
                .enumerate()
                .map(|(index, (bytes, format))| {
                    image::load_from_memory(bytes)
                        .map(|image| to_decoded(image, *format))
                        .map_err(|source| StreamError::Decode { index, source })
                })
                .collect()
        })
    }

    fn decode_files(&self, request: &ImageFileRequest) -> StreamResult<Vec<DecodedImage>> {
        let _span = tracy_client::span!("LoaderWorker::decode_files");
        self.decode_pool.install(|| {
            request
                .paths
                .par_iter()
                .zip(request.formats.par_iter())
                .enumerate()
                .map(|(index, (path, format))| {
                    log::info!("loading texture: {:?}", path);
                    image::open(path)
                        .map(|image| to_decoded(image, *format))
                        .map_err(|source| StreamError::Decode { index, source })
                })
                .collect()
        })
    }

    fn enqueue_and_submit(&mut self, mut collected: Vec<CollectedBatch>) {
        collected.sort_by_key(|(id, _)| *id);
        for (id, images) in collected {
            if id < self.next_expected {
                log::error!("batch {} was already submitted, dropping the duplicate", id);
                continue;
            }
            self.reorder.insert(id, images);
        }

        while let Some(images) = self.reorder.remove(&self.next_expected) {
            let id = self.next_expected;
            self.submit_batch(id, images);
            self.submitted.store(id, Ordering::Release);
            self.next_expected += 1;
        }
    }

    fn submit_batch(&mut self, id: u64, images: StreamResult<Vec<DecodedImage>>) {
        let _span = tracy_client::span!("LoaderWorker::submit_batch");

        let result = images.and_then(|images| self.upload(id, &images));
        if let Err(e) = result {
            log::error!("texture batch {} failed: {}", id, e);
            self.pending.batches.lock().insert(
                id,
                PendingBatch {
                    staging_buffer: None,
                    command_buffer: None,
                    failed: true,
                },
            );
            self.signal_only(id);
        }
    }

    fn upload(&mut self, id: u64, images: &[DecodedImage]) -> StreamResult<()> {
        if images.is_empty() {
            self.pending.batches.lock().insert(
                id,
                PendingBatch {
                    staging_buffer: None,
                    command_buffer: None,
                    failed: false,
                },
            );
            self.signal_only(id);
            return Ok(());
        }

        let command_buffer = match self.free_command_buffers.pop() {
            Some(command_buffer) => command_buffer,
            None => self.backend.allocate_command_buffer(self.command_pool, "texture-upload")?,
        };

        let (staging_buffer, pending_images) =
            match transfer::record_upload(self.backend.as_ref(), command_buffer, id, images, self.families) {
                Ok(recorded) => recorded,
                Err(e) => {
                    self.free_command_buffers.push(command_buffer);
                    return Err(e);
                }
            };

        {
            let mut batches = self.pending.batches.lock();
            let mut pending_images_table = self.pending.images.lock();
            batches.insert(
                id,
                PendingBatch {
                    staging_buffer: Some(staging_buffer),
                    command_buffer: Some(command_buffer),
                    failed: false,
                },
            );
            pending_images_table.extend(pending_images);
        }

        let submit = GfxSubmitInfo::new(&[command_buffer]).signal(
            self.upload_timeline,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            Some(id),
        );
        if let Err(e) = self.backend.submit(GfxQueueType::Transfer, std::slice::from_ref(&submit)) {
            self.take_back(id);
            return Err(e.into());
        }
        Ok(())
    }

    /// 提交失败时撤回已经放入 pending 表的记录
    fn take_back(&mut self, id: u64) {
        let mut batches = self.pending.batches.lock();
        let mut images = self.pending.images.lock();
        if let Some(batch) = batches.remove(&id) {
            if let Some(staging_buffer) = batch.staging_buffer {
                self.backend.destroy_buffer(staging_buffer);
            }
            if let Some(command_buffer) = batch.command_buffer {
                self.free_command_buffers.push(command_buffer);
            }
        }
        let (taken, kept): (Vec<_>, Vec<_>) = images.drain(..).partition(|image| image.batch_id == id);
        images.extend(kept);
        taken.into_iter().for_each(|image| self.backend.destroy_image(image.image));
    }

    /// 不带命令的提交，只推进 timeline
    fn signal_only(&self, id: u64) {
        let submit =
            GfxSubmitInfo::empty().signal(self.upload_timeline, vk::PipelineStageFlags2::ALL_COMMANDS, Some(id));
        if let Err(e) = self.backend.submit(GfxQueueType::Transfer, std::slice::from_ref(&submit)) {
            log::error!("failed to signal upload timeline with {}: {}", id, e);
        }
    }
}

fn to_decoded(image: image::DynamicImage, format: vk::Format) -> DecodedImage {
    let image = image.into_rgba8();
    let (width, height) = image.dimensions();
    DecodedImage {
        extent: vk::Extent2D { width, height },
        format,
        pixels: image.into_raw(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_validation() {
        let formats = vec![vk::Format::R8G8B8A8_UNORM];

        let err = validate_raw_images(&[], &formats).unwrap_err();
        assert!(matches!(err, StreamError::CountMismatch { images: 0, formats: 1 }));

        let err = validate_raw_images(&[RawImage::new(0, 4, vec![])], &formats).unwrap_err();
        assert!(matches!(err, StreamError::EmptyImage { index: 0 }));

        let err = validate_raw_images(&[RawImage::new(2, 2, vec![0; 15])], &formats).unwrap_err();
        assert!(matches!(
            err,
            StreamError::SizeMismatch {
                index: 0,
                expected: 16,
                actual: 15
            }
        ));

        let err = validate_raw_images(&[RawImage::new(1, 1, vec![0; 4])], &[vk::Format::BC1_RGB_UNORM_BLOCK])
            .unwrap_err();
        assert!(matches!(err, StreamError::UnsupportedFormat { index: 0, .. }));

        validate_raw_images(&[RawImage::new(2, 1, vec![0; 8])], &formats).unwrap();
    }

    #[test]
    fn test_decode_formats_must_be_rgba8() {
        validate_decode_formats(2, &[vk::Format::R8G8B8A8_UNORM, vk::Format::R8G8B8A8_SRGB]).unwrap();
        let err = validate_decode_formats(2, &[vk::Format::R8G8B8A8_UNORM, vk::Format::R16G16B16A16_SFLOAT])
            .unwrap_err();
        assert!(matches!(err, StreamError::UnsupportedFormat { index: 1, .. }));
    }

    #[test]
    fn test_invalid_request_does_not_consume_id() {
        let (queue, _channels, _shutdown, _recycle) = load_channels();

        assert!(queue.load_raw_images(vec![RawImage::new(1, 1, vec![0; 3])], vec![vk::Format::R8G8B8A8_UNORM]).is_err());
        assert_eq!(queue.last_issued(), 0);

        let id = queue.load_raw_images(vec![RawImage::new(1, 1, vec![0; 4])], vec![vk::Format::R8G8B8A8_UNORM]).unwrap();
        assert_eq!(id, ImageBatchId(1));
        let id = queue.load_compressed_images(vec![], vec![]).unwrap();
        assert_eq!(id, ImageBatchId(2));
        assert_eq!(queue.last_issued(), 2);
    }

    #[test]
    fn test_ids_are_shared_across_clones() {
        let (queue, _channels, _shutdown, _recycle) = load_channels();
        let other = queue.clone();

        let handles = (0..4)
            .map(|_| {
                let queue = other.clone();
                std::thread::spawn(move || (0..25).map(|_| queue.reserve_batch_id().value()).collect::<Vec<_>>())
            })
            .collect::<Vec<_>>();
        let mut ids = handles.into_iter().flat_map(|handle| handle.join().unwrap()).collect::<Vec<_>>();
        ids.sort();
        assert_eq!(ids, (1..=100).collect::<Vec<_>>());
        assert_eq!(queue.last_issued(), 100);
    }

    #[test]
    fn test_send_after_loader_stopped() {
        let (queue, channels, _shutdown, _recycle) = load_channels();
        drop(channels);
        let err = queue.load_image_files(vec![PathBuf::from("a.png")], vec![vk::Format::R8G8B8A8_SRGB]).unwrap_err();
        assert!(matches!(err, StreamError::LoaderStopped));
    }
}
