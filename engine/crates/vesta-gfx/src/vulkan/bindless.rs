use ash::vk;
use itertools::Itertools;

use crate::backend::GfxBindlessWrite;
use crate::error::GfxResult;

/// Bindless 纹理数组
///
/// - Binding 0: COMBINED_IMAGE_SAMPLER 数组，长度等于纹理表的容量
/// - UPDATE_AFTER_BIND + PARTIALLY_BOUND：没有写入的元素只要着色器不访问就是合法的
/// - 着色器通过纹理在资源表中的 slot 访问：`textures[slot]`
pub(crate) struct GfxBindlessTable {
    pub(crate) layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    pub(crate) set: vk::DescriptorSet,
    pub(crate) capacity: u32,
}

impl GfxBindlessTable {
    pub(crate) const TEXTURE_BINDING: u32 = 0;

    pub(crate) fn new(device: &ash::Device, capacity: u32) -> GfxResult<Self> {
        let binding = vk::DescriptorSetLayoutBinding::default()
            .binding(Self::TEXTURE_BINDING)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(capacity)
            .stage_flags(vk::ShaderStageFlags::ALL);
        let binding_flags =
            [vk::DescriptorBindingFlags::UPDATE_AFTER_BIND | vk::DescriptorBindingFlags::PARTIALLY_BOUND];
        let mut binding_flags_ci = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let layout_ci = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(std::slice::from_ref(&binding))
            .push_next(&mut binding_flags_ci);
        let layout = unsafe { device.create_descriptor_set_layout(&layout_ci, None)? };

        let pool_size = vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(capacity);
        let pool_ci = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(std::slice::from_ref(&pool_size));
        let pool = match unsafe { device.create_descriptor_pool(&pool_ci, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(layout, None) };
                return Err(e.into());
            }
        };

        let alloc_info =
            vk::DescriptorSetAllocateInfo::default().descriptor_pool(pool).set_layouts(std::slice::from_ref(&layout));
        let set = match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(e) => {
                unsafe {
                    device.destroy_descriptor_pool(pool, None);
                    device.destroy_descriptor_set_layout(layout, None);
                }
                return Err(e.into());
            }
        };

        log::info!("bindless texture table created, capacity: {}", capacity);
        Ok(Self {
            layout,
            pool,
            set,
            capacity,
        })
    }

    /// 所有写入合并为一次 vkUpdateDescriptorSets
    pub(crate) fn write_textures(&self, device: &ash::Device, writes: &[GfxBindlessWrite]) {
        if writes.is_empty() {
            return;
        }

        let image_infos = writes
            .iter()
            .map(|write| {
                vk::DescriptorImageInfo::default()
                    .sampler(write.sampler)
                    .image_view(write.view)
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            })
            .collect_vec();
        let descriptor_writes = writes
            .iter()
            .zip(image_infos.iter())
            .map(|(write, image_info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(Self::TEXTURE_BINDING)
                    .dst_array_element(write.slot)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(std::slice::from_ref(image_info))
            })
            .collect_vec();

        unsafe { device.update_descriptor_sets(&descriptor_writes, &[]) };
    }

    pub(crate) fn destroy(self, device: &ash::Device) {
        unsafe {
            device.destroy_descriptor_pool(self.pool, None);
            device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}
