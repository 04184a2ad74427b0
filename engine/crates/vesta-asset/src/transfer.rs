//! 上传命令的录制
//!
//! transfer 队列（后台线程）:
//! 1. 所有 mip: UNDEFINED -> TRANSFER_DST
//! 2. staging buffer -> mip 0
//! 3. release: mip 0 以 TRANSFER_SRC 交给 graphics family；其余 mip 保持 TRANSFER_DST 一起交出去
//!
//! graphics 队列（渲染线程的 tick）:
//! 1. acquire，与 release 一一对应
//! 2. mip 链：blit k -> k+1，随后 k -> SHADER_READ
//! 3. 最后一层 -> SHADER_READ

use ash::vk;
use itertools::Itertools;
use vesta_gfx::backend::{GfxBackend, GfxQueueType};
use vesta_gfx::commands::barrier::GfxImageBarrier;
use vesta_gfx::commands::submit_info::GfxSubmitInfo;
use vesta_gfx::resources::buffer::{GfxBuffer, GfxBufferDesc};
use vesta_gfx::resources::image::{GfxImage, GfxImageDesc};
use vesta_gfx::utilities::format::{mip_extent, mip_level_count};
use vesta_render_interface::gfx_resource_manager::GfxResourceManager;
use vesta_render_interface::handles::GfxTextureHandle;
use vesta_render_interface::pipeline_settings::DefaultRendererSettings;

use crate::error::StreamResult;
use crate::loader::DecodedImage;

/// 已提交到 transfer 队列的批次，GPU 完成之后由 tick 回收
pub(crate) struct PendingBatch<A> {
    pub(crate) staging_buffer: Option<GfxBuffer<A>>,
    pub(crate) command_buffer: Option<vk::CommandBuffer>,
    /// 失败的批次只是一次空提交，用来保持 timeline 连续
    pub(crate) failed: bool,
}

/// 已经上传、等待被 tick 放入 texture 表的 image
pub(crate) struct PendingImage<A> {
    pub(crate) batch_id: u64,
    pub(crate) image: GfxImage<A>,
}

/// graphics 和 transfer 的 queue family
#[derive(Copy, Clone, Debug)]
pub(crate) struct QueueFamilies {
    pub(crate) graphics: u32,
    pub(crate) transfer: u32,
}

impl QueueFamilies {
    pub(crate) fn of<B: GfxBackend>(backend: &B) -> Self {
        Self {
            graphics: backend.queue_family_index(GfxQueueType::Graphics),
            transfer: backend.queue_family_index(GfxQueueType::Transfer),
        }
    }

    #[inline]
    fn need_ownership_transfer(&self) -> bool {
        self.graphics != self.transfer
    }
}

fn copy_region(offset: vk::DeviceSize, extent: vk::Extent2D) -> vk::BufferImageCopy2<'static> {
    vk::BufferImageCopy2::default()
        .buffer_offset(offset)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
        .image_extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
}

fn destroy_partial_upload<B: GfxBackend>(
    backend: &B,
    staging_buffer: GfxBuffer<B::Allocation>,
    images: Vec<GfxImage<B::Allocation>>,
) {
    backend.destroy_buffer(staging_buffer);
    images.into_iter().for_each(|image| backend.destroy_image(image));
}

/// 创建 staging buffer 和目标 image，并在 transfer 队列的 command buffer 中录制上传命令
///
/// 失败时已经创建的对象都会被销毁
pub(crate) fn record_upload<B: GfxBackend>(
    backend: &B,
    command_buffer: vk::CommandBuffer,
    batch_id: u64,
    images: &[DecodedImage],
    families: QueueFamilies,
) -> StreamResult<(GfxBuffer<B::Allocation>, Vec<PendingImage<B::Allocation>>)> {
    let _span = tracy_client::span!("record_upload");

    // 所有 image 的 base level 放在同一个 staging buffer 中
    let offsets = images
        .iter()
        .scan(0 as vk::DeviceSize, |offset, image| {
            let current = *offset;
            *offset += image.pixels.len() as vk::DeviceSize;
            Some(current)
        })
        .collect_vec();
    let total_size: vk::DeviceSize = images.iter().map(|image| image.pixels.len() as vk::DeviceSize).sum();

    let mut staging_buffer =
        backend.create_buffer(&GfxBufferDesc::staging(total_size, format!("texture-batch-{batch_id}-staging")))?;
    let filled = images
        .iter()
        .zip(offsets.iter())
        .try_for_each(|(image, offset)| staging_buffer.write_bytes(*offset, &image.pixels))
        .and_then(|_| backend.flush_buffer(&staging_buffer, 0, total_size));
    if let Err(e) = filled {
        backend.destroy_buffer(staging_buffer);
        return Err(e.into());
    }

    let mut gpu_images = Vec::with_capacity(images.len());
    for (idx, image) in images.iter().enumerate() {
        let mip_levels = mip_level_count(image.extent.width, image.extent.height);
        let desc = GfxImageDesc::sampled_texture(
            image.extent,
            image.format,
            mip_levels,
            format!("texture-batch-{batch_id}-{idx}"),
        );
        match backend.create_image(&desc) {
            Ok(gpu_image) => gpu_images.push(gpu_image),
            Err(e) => {
                destroy_partial_upload(backend, staging_buffer, gpu_images);
                return Err(e.into());
            }
        }
    }

    if let Err(e) = backend.begin_command_buffer(command_buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT) {
        destroy_partial_upload(backend, staging_buffer, gpu_images);
        return Err(e.into());
    }

    // 1. 所有 mip -> TRANSFER_DST
    let to_transfer_dst = gpu_images
        .iter()
        .map(|image| {
            GfxImageBarrier::new()
                .image(image.handle())
                .mip_range(0, image.mip_levels())
                .src_mask(vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE)
                .dst_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)
                .layout_transfer(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        })
        .collect_vec();
    backend.cmd_image_barriers(command_buffer, &to_transfer_dst);

    // 2. staging buffer -> mip 0
    for (gpu_image, offset) in gpu_images.iter().zip(offsets.iter()) {
        backend.cmd_copy_buffer_to_image(
            command_buffer,
            staging_buffer.handle(),
            gpu_image.handle(),
            std::slice::from_ref(&copy_region(*offset, gpu_image.extent())),
        );
    }

    // 3. release
    let release_barriers = gpu_images.iter().flat_map(|image| release_barriers(image, families)).collect_vec();
    backend.cmd_image_barriers(command_buffer, &release_barriers);

    if let Err(e) = backend.end_command_buffer(command_buffer) {
        destroy_partial_upload(backend, staging_buffer, gpu_images);
        return Err(e.into());
    }

    let pending_images = gpu_images.into_iter().map(|image| PendingImage { batch_id, image }).collect_vec();
    Ok((staging_buffer, pending_images))
}

/// 两段 mip 各自的 (old_layout, new_layout)：mip 0 以及 mip 1..
fn ownership_layouts() -> [(vk::ImageLayout, vk::ImageLayout); 2] {
    [
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
    ]
}

fn release_barriers<A>(image: &GfxImage<A>, families: QueueFamilies) -> Vec<GfxImageBarrier> {
    let [base_layouts, rest_layouts] = ownership_layouts();
    // 同一个 family 时没有 acquire，release 需要让 graphics 队列上的 transfer 操作可以看到写入
    let dst_mask = if families.need_ownership_transfer() {
        (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE)
    } else {
        (
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ | vk::AccessFlags2::TRANSFER_WRITE,
        )
    };

    let mut barriers = vec![
        GfxImageBarrier::new()
            .image(image.handle())
            .mip_range(0, 1)
            .src_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)
            .dst_mask(dst_mask.0, dst_mask.1)
            .layout_transfer(base_layouts.0, base_layouts.1)
            .queue_family_transfer(families.transfer, families.graphics),
    ];
    if image.mip_levels() > 1 {
        barriers.push(
            GfxImageBarrier::new()
                .image(image.handle())
                .mip_range(1, image.mip_levels() - 1)
                .src_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::NONE)
                .dst_mask(dst_mask.0, dst_mask.1)
                .layout_transfer(rest_layouts.0, rest_layouts.1)
                .queue_family_transfer(families.transfer, families.graphics),
        );
    }
    barriers
}

fn acquire_barriers<A>(image: &GfxImage<A>, families: QueueFamilies) -> Vec<GfxImageBarrier> {
    let [base_layouts, rest_layouts] = ownership_layouts();
    let transfer_ownership = families.need_ownership_transfer();
    // 同一个 family 时布局已经在 release 中转换过了
    let layouts = |(old, new): (vk::ImageLayout, vk::ImageLayout)| if transfer_ownership { (old, new) } else { (new, new) };

    let mut barriers = Vec::with_capacity(2);
    let (old, new) = layouts(base_layouts);
    barriers.push(
        GfxImageBarrier::new()
            .image(image.handle())
            .mip_range(0, 1)
            .src_mask(vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE)
            .dst_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_READ)
            .layout_transfer(old, new)
            .queue_family_transfer(families.transfer, families.graphics),
    );
    if image.mip_levels() > 1 {
        let (old, new) = layouts(rest_layouts);
        barriers.push(
            GfxImageBarrier::new()
                .image(image.handle())
                .mip_range(1, image.mip_levels() - 1)
                .src_mask(vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE)
                .dst_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)
                .layout_transfer(old, new)
                .queue_family_transfer(families.transfer, families.graphics),
        );
    }
    barriers
}

/// 在 graphics 队列的 command buffer 中录制 acquire 以及 mip 链的生成
pub(crate) fn record_acquire_and_mips<B: GfxBackend>(
    backend: &B,
    command_buffer: vk::CommandBuffer,
    image: &GfxImage<B::Allocation>,
    families: QueueFamilies,
) {
    let _span = tracy_client::span!("record_acquire_and_mips");

    backend.cmd_image_barriers(command_buffer, &acquire_barriers(image, families));

    let shader_read = (
        vk::PipelineStageFlags2::FRAGMENT_SHADER | vk::PipelineStageFlags2::COMPUTE_SHADER,
        vk::AccessFlags2::SHADER_SAMPLED_READ,
    );
    let mip_levels = image.mip_levels();
    for level in 0..mip_levels.saturating_sub(1) {
        let src_extent = mip_extent(image.extent(), level);
        let dst_extent = mip_extent(image.extent(), level + 1);
        let blit = vk::ImageBlit2::default()
            .src_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: level,
                base_array_layer: 0,
                layer_count: 1,
            })
            .src_offsets([
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: src_extent.width as i32,
                    y: src_extent.height as i32,
                    z: 1,
                },
            ])
            .dst_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: level + 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .dst_offsets([
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: dst_extent.width as i32,
                    y: dst_extent.height as i32,
                    z: 1,
                },
            ]);
        backend.cmd_blit_image(command_buffer, image.handle(), std::slice::from_ref(&blit), vk::Filter::LINEAR);

        let mut barriers = vec![
            GfxImageBarrier::new()
                .image(image.handle())
                .mip_range(level, 1)
                .src_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_READ)
                .dst_mask(shader_read.0, shader_read.1)
                .layout_transfer(vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        ];
        // 下一次 blit 的 src，最后一层留给结尾的 barrier
        if level + 2 < mip_levels {
            barriers.push(
                GfxImageBarrier::new()
                    .image(image.handle())
                    .mip_range(level + 1, 1)
                    .src_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)
                    .dst_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_READ)
                    .layout_transfer(vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
            );
        }
        backend.cmd_image_barriers(command_buffer, &barriers);
    }

    // 最后一层 -> SHADER_READ；只有一层时它在 acquire 之后处于 TRANSFER_SRC
    let last_level = mip_levels - 1;
    let (last_layout, last_src_access) = if mip_levels == 1 {
        (vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::AccessFlags2::TRANSFER_READ)
    } else {
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::AccessFlags2::TRANSFER_WRITE)
    };
    let final_barrier = GfxImageBarrier::new()
        .image(image.handle())
        .mip_range(last_level, 1)
        .src_mask(vk::PipelineStageFlags2::TRANSFER, last_src_access)
        .dst_mask(shader_read.0, shader_read.1)
        .layout_transfer(last_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    backend.cmd_image_barriers(command_buffer, std::slice::from_ref(&final_barrier));
}

/// 在 graphics 队列上同步上传 1x1 的占位纹理
///
/// 只在初始化时调用一次，会等待 device idle
pub(crate) fn upload_fallback_texture<B: GfxBackend>(
    backend: &B,
    resources: &mut GfxResourceManager<B>,
) -> StreamResult<GfxTextureHandle> {
    let _span = tracy_client::span!("upload_fallback_texture");

    let extent = vk::Extent2D { width: 1, height: 1 };
    let texel = DefaultRendererSettings::FALLBACK_TEXEL;
    let handle = resources.create_texture(&GfxImageDesc::sampled_texture(
        extent,
        DefaultRendererSettings::TEXTURE_FORMAT,
        1,
        "fallback-texture",
    ))?;
    let Some(image) = resources.get_texture(handle).map(|texture| texture.handle()) else {
        return Err(vesta_gfx::error::GfxError::Vulkan(vk::Result::ERROR_UNKNOWN).into());
    };

    let mut staging_buffer = backend.create_buffer(&GfxBufferDesc::staging(texel.len() as u64, "fallback-staging"))?;
    let command_pool = match backend.create_command_pool(GfxQueueType::Graphics, "fallback-upload") {
        Ok(pool) => pool,
        Err(e) => {
            backend.destroy_buffer(staging_buffer);
            return Err(e.into());
        }
    };

    let result = (|| -> StreamResult<()> {
        staging_buffer.write_bytes(0, &texel)?;
        backend.flush_buffer(&staging_buffer, 0, texel.len() as u64)?;

        let command_buffer = backend.allocate_command_buffer(command_pool, "fallback-upload")?;
        backend.begin_command_buffer(command_buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        backend.cmd_image_barriers(
            command_buffer,
            &[GfxImageBarrier::new()
                .image(image)
                .src_mask(vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE)
                .dst_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)
                .layout_transfer(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)],
        );
        backend.cmd_copy_buffer_to_image(
            command_buffer,
            staging_buffer.handle(),
            image,
            std::slice::from_ref(&copy_region(0, extent)),
        );
        backend.cmd_image_barriers(
            command_buffer,
            &[GfxImageBarrier::new()
                .image(image)
                .src_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)
                .dst_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER, vk::AccessFlags2::SHADER_SAMPLED_READ)
                .layout_transfer(vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)],
        );
        backend.end_command_buffer(command_buffer)?;

        backend.submit(GfxQueueType::Graphics, &[GfxSubmitInfo::new(&[command_buffer])])?;
        backend.wait_idle()?;
        Ok(())
    })();

    backend.destroy_command_pool(command_pool);
    backend.destroy_buffer(staging_buffer);
    result.map(|_| handle)
}
