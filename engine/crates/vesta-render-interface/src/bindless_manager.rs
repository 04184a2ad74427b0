use std::sync::Arc;

use ash::vk;
use vesta_gfx::backend::{GfxBackend, GfxBindlessWrite};
use vesta_gfx::error::GfxResult;
use vesta_gfx::resources::sampler::GfxSamplerDesc;

use crate::gfx_resource_manager::GfxResourceManager;
use crate::handles::GfxTextureHandle;

/// Bindless 纹理数组的管理器
///
/// 纹理在 texture 表中的 slot index 就是它在数组中的下标，着色器通过 `textures[index]` 访问。
/// 写入先在 CPU 端收集，每帧 [`Self::flush`] 一次合并为一次 descriptor 更新。
///
/// 纹理被释放之后对应的元素不会被清除（PARTIALLY_BOUND），slot 被复用时会被新的写入覆盖。
pub struct BindlessManager<B: GfxBackend> {
    backend: Arc<B>,
    default_sampler: vk::Sampler,
    pending_writes: Vec<GfxBindlessWrite>,
    capacity: u32,
    destroyed: bool,
}

// new & init
impl<B: GfxBackend> BindlessManager<B> {
    pub fn new(backend: Arc<B>) -> GfxResult<Self> {
        let default_sampler = backend.create_sampler(&GfxSamplerDesc::default())?;
        let capacity = backend.bindless_texture_capacity();
        Ok(Self {
            backend,
            default_sampler,
            pending_writes: Vec::new(),
            capacity,
            destroyed: false,
        })
    }
}

// destroy
impl<B: GfxBackend> BindlessManager<B> {
    pub fn destroy(mut self) {
        self.destroy_mut();
    }

    fn destroy_mut(&mut self) {
        if self.destroyed {
            return;
        }
        self.pending_writes.clear();
        self.backend.destroy_sampler(self.default_sampler);
        self.destroyed = true;
    }
}
impl<B: GfxBackend> Drop for BindlessManager<B> {
    fn drop(&mut self) {
        log::info!("Dropping BindlessManager");
        self.destroy_mut();
    }
}

// update
impl<B: GfxBackend> BindlessManager<B> {
    /// 记录一次写入，在下一次 `flush` 时生效；返回纹理在数组中的下标
    ///
    /// 句柄无效或者下标超出数组长度时返回 None
    pub fn register_texture(
        &mut self,
        resource_manager: &GfxResourceManager<B>,
        handle: GfxTextureHandle,
    ) -> Option<u32> {
        let texture = resource_manager.get_texture(handle)?;
        let slot = handle.index();
        if slot >= self.capacity {
            log::error!("texture slot {} exceeds bindless capacity {}", slot, self.capacity);
            return None;
        }

        self.pending_writes.push(GfxBindlessWrite {
            slot,
            view: texture.view(),
            sampler: self.default_sampler,
        });
        Some(slot)
    }

    /// # Phase: Before Render
    ///
    /// 将收集到的写入一次性提交，返回写入的数量
    pub fn flush(&mut self) -> usize {
        let _span = tracy_client::span!("BindlessManager::flush");
        if self.pending_writes.is_empty() {
            return 0;
        }

        let writes = std::mem::take(&mut self.pending_writes);
        self.backend.write_bindless_textures(&writes);
        writes.len()
    }
}

// getters
impl<B: GfxBackend> BindlessManager<B> {
    #[inline]
    pub fn default_sampler(&self) -> vk::Sampler {
        self.default_sampler
    }
    #[inline]
    pub fn pending_write_count(&self) -> usize {
        self.pending_writes.len()
    }
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline_settings::TableCapacities;
    use vesta_gfx::headless::{HeadlessBackend, HeadlessObjectKind};
    use vesta_gfx::resources::image::GfxImageDesc;

    #[test]
    fn test_writes_are_batched_into_one_update() {
        let backend = Arc::new(HeadlessBackend::new().with_bindless_capacity(8));
        let mut resources = GfxResourceManager::new(backend.clone(), &TableCapacities::default()).unwrap();
        let mut bindless = BindlessManager::new(backend.clone()).unwrap();

        let desc = GfxImageDesc::sampled_texture(
            vk::Extent2D { width: 2, height: 2 },
            vk::Format::R8G8B8A8_UNORM,
            1,
            "tex",
        );
        let a = resources.create_texture(&desc).unwrap();
        let b = resources.create_texture(&desc).unwrap();

        assert_eq!(bindless.register_texture(&resources, a), Some(0));
        assert_eq!(bindless.register_texture(&resources, b), Some(1));
        assert_eq!(bindless.flush(), 2);
        assert_eq!(bindless.flush(), 0);

        let updates = backend.bindless_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].iter().map(|write| write.slot).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(updates[0][1].view, resources.get_texture(b).unwrap().view());

        bindless.destroy();
        resources.drain_all();
        assert_eq!(backend.live_object_count(HeadlessObjectKind::Sampler), 0);
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_slot_beyond_capacity_is_rejected() {
        let backend = Arc::new(HeadlessBackend::new().with_bindless_capacity(1));
        let mut resources = GfxResourceManager::new(backend.clone(), &TableCapacities::default()).unwrap();
        let mut bindless = BindlessManager::new(backend.clone()).unwrap();

        let desc = GfxImageDesc::sampled_texture(
            vk::Extent2D { width: 1, height: 1 },
            vk::Format::R8G8B8A8_UNORM,
            1,
            "tex",
        );
        resources.create_texture(&desc).unwrap();
        let second = resources.create_texture(&desc).unwrap();

        assert_eq!(bindless.register_texture(&resources, second), None);
        assert_eq!(bindless.register_texture(&resources, GfxTextureHandle::null()), None);
        assert_eq!(bindless.pending_write_count(), 0);

        bindless.destroy();
        resources.drain_all();
    }
}
