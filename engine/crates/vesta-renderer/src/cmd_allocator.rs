use std::sync::Arc;

use ash::vk;
use itertools::Itertools;
use vesta_gfx::backend::{GfxBackend, GfxQueueType};
use vesta_gfx::error::GfxResult;
use vesta_render_interface::frame_counter::FrameCounter;
use vesta_render_interface::pipeline_settings::FrameLabel;

/// 为每个 frame in flight 分配一个 graphics command pool
///
/// 某一帧的 command buffer 在这一帧再次开始时统一释放，
/// 调用者需要保证此时 GPU 已经执行完了这一帧（由 FramePacer 保证）
pub struct CmdAllocator<B: GfxBackend> {
    backend: Arc<B>,
    graphics_command_pools: Vec<vk::CommandPool>,

    /// 每个 command pool 已经分配出去的 command buffer，用于集中 free
    allocated_command_buffers: Vec<Vec<vk::CommandBuffer>>,
    destroyed: bool,
}

// init & destroy
impl<B: GfxBackend> CmdAllocator<B> {
    pub fn new(backend: Arc<B>) -> GfxResult<Self> {
        let mut graphics_command_pools = Vec::with_capacity(FrameCounter::fif_count());
        for frame_label in FrameCounter::frame_labels() {
            match backend.create_command_pool(GfxQueueType::Graphics, &format!("graphics-command-pool-{frame_label}")) {
                Ok(pool) => graphics_command_pools.push(pool),
                Err(e) => {
                    graphics_command_pools.into_iter().for_each(|pool| backend.destroy_command_pool(pool));
                    return Err(e);
                }
            }
        }

        Ok(Self {
            backend,
            graphics_command_pools,
            allocated_command_buffers: vec![Vec::new(); FrameCounter::fif_count()],
            destroyed: false,
        })
    }

    pub fn destroy(mut self) {
        self.destroy_mut();
    }

    fn destroy_mut(&mut self) {
        if self.destroyed {
            return;
        }
        // command buffer 随 pool 一起释放
        for pool in self.graphics_command_pools.drain(..) {
            self.backend.destroy_command_pool(pool);
        }
        self.allocated_command_buffers.iter_mut().for_each(|cmds| cmds.clear());
        self.destroyed = true;
    }
}
impl<B: GfxBackend> Drop for CmdAllocator<B> {
    fn drop(&mut self) {
        if !self.destroyed {
            log::info!("Dropping CmdAllocator and destroying command pools.");
            self.destroy_mut();
        }
    }
}

// tools
impl<B: GfxBackend> CmdAllocator<B> {
    /// 分配 command buffer，在 frame_label 这一帧使用
    pub fn alloc_command_buffer(&mut self, frame_label: FrameLabel, debug_name: &str) -> GfxResult<vk::CommandBuffer> {
        let name = format!("[{}]{}", frame_label, debug_name);
        let cmd = self.backend.allocate_command_buffer(self.graphics_command_pools[*frame_label], &name)?;
        self.allocated_command_buffers[*frame_label].push(cmd);
        Ok(cmd)
    }

    /// 释放这一帧的 command buffer，并重置 pool
    pub fn reset_frame_commands(&mut self, frame_label: FrameLabel) -> GfxResult<()> {
        let gc_cmds = std::mem::take(&mut self.allocated_command_buffers[*frame_label]);
        let pool = self.graphics_command_pools[*frame_label];
        if !gc_cmds.is_empty() {
            self.backend.free_command_buffers(pool, &gc_cmds);
        }
        self.backend.reset_command_pool(pool)
    }

    pub fn allocated_count(&self, frame_label: FrameLabel) -> usize {
        self.allocated_command_buffers[*frame_label].len()
    }

    pub fn pools(&self) -> Vec<vk::CommandPool> {
        self.graphics_command_pools.iter().copied().collect_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesta_gfx::headless::{HeadlessBackend, HeadlessObjectKind};

    #[test]
    fn test_frame_commands_are_freed_per_label() {
        let backend = Arc::new(HeadlessBackend::new());
        let mut allocator = CmdAllocator::new(backend.clone()).unwrap();
        assert_eq!(allocator.pools().len(), FrameCounter::FIF_COUNT);

        allocator.alloc_command_buffer(FrameLabel::A, "a0").unwrap();
        allocator.alloc_command_buffer(FrameLabel::A, "a1").unwrap();
        allocator.alloc_command_buffer(FrameLabel::B, "b0").unwrap();
        assert_eq!(backend.live_object_count(HeadlessObjectKind::CommandBuffer), 3);

        allocator.reset_frame_commands(FrameLabel::A).unwrap();
        assert_eq!(allocator.allocated_count(FrameLabel::A), 0);
        assert_eq!(allocator.allocated_count(FrameLabel::B), 1);
        assert_eq!(backend.live_object_count(HeadlessObjectKind::CommandBuffer), 1);

        allocator.destroy();
        assert_eq!(backend.live_object_count(HeadlessObjectKind::CommandPool), 0);
        assert!(backend.validation_errors().is_empty());
    }
}
