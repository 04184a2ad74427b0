use ash::vk;

/// 每个 texel 占用的字节数，只覆盖纹理上传会用到的非压缩格式
pub fn texel_size(format: vk::Format) -> Option<u32> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => 1,
        vk::Format::R8G8_UNORM | vk::Format::R8G8_SRGB => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_SFLOAT => 4,
        vk::Format::R16G16B16A16_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    };
    Some(size)
}

/// 完整 mip 链的层数：floor(log2(max(w, h))) + 1
#[inline]
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    let max_dim = width.max(height).max(1);
    u32::BITS - max_dim.leading_zeros()
}

/// 第 level 层 mip 的尺寸，每一维至少为 1
#[inline]
pub fn mip_extent(extent: vk::Extent2D, level: u32) -> vk::Extent2D {
    vk::Extent2D {
        width: (extent.width >> level).max(1),
        height: (extent.height >> level).max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_level_count() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(2, 2), 2);
        assert_eq!(mip_level_count(4, 4), 3);
        assert_eq!(mip_level_count(3, 1), 2);
        assert_eq!(mip_level_count(1024, 16), 11);
        assert_eq!(mip_level_count(1000, 1000), 10);
        assert_eq!(mip_level_count(0, 0), 1);
    }

    #[test]
    fn test_mip_extent_clamps_to_one() {
        let extent = vk::Extent2D { width: 8, height: 2 };
        assert_eq!(mip_extent(extent, 1), vk::Extent2D { width: 4, height: 1 });
        assert_eq!(mip_extent(extent, 3), vk::Extent2D { width: 1, height: 1 });
    }

    #[test]
    fn test_texel_size() {
        assert_eq!(texel_size(vk::Format::R8G8B8A8_SRGB), Some(4));
        assert_eq!(texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(texel_size(vk::Format::BC7_UNORM_BLOCK), None);
    }
}
