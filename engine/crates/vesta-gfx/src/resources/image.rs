use ash::vk;

/// 创建 2D image 的参数
#[derive(Clone, Debug)]
pub struct GfxImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub name: String,
}

impl GfxImageDesc {
    /// 采样用的纹理，可以作为 copy / blit 的源和目标
    pub fn sampled_texture(extent: vk::Extent2D, format: vk::Format, mip_levels: u32, name: impl Into<String>) -> Self {
        Self {
            extent,
            format,
            mip_levels,
            usage: vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::COLOR,
            name: name.into(),
        }
    }

    pub fn color_attachment(extent: vk::Extent2D, format: vk::Format, name: impl Into<String>) -> Self {
        Self {
            extent,
            format,
            mip_levels: 1,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::COLOR,
            name: name.into(),
        }
    }

    pub fn depth_attachment(extent: vk::Extent2D, format: vk::Format, name: impl Into<String>) -> Self {
        Self {
            extent,
            format,
            mip_levels: 1,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect: vk::ImageAspectFlags::DEPTH,
            name: name.into(),
        }
    }
}

/// GPU image，附带一个覆盖所有 mip 的默认 view
pub struct GfxImage<A> {
    handle: vk::Image,
    view: vk::ImageView,
    allocation: A,
    extent: vk::Extent2D,
    format: vk::Format,
    mip_levels: u32,
    aspect: vk::ImageAspectFlags,
    debug_name: String,
}

// new & destroy
impl<A> GfxImage<A> {
    /// 由后端调用
    pub fn from_raw_parts(handle: vk::Image, view: vk::ImageView, allocation: A, desc: &GfxImageDesc) -> Self {
        Self {
            handle,
            view,
            allocation,
            extent: desc.extent,
            format: desc.format,
            mip_levels: desc.mip_levels,
            aspect: desc.aspect,
            debug_name: desc.name.clone(),
        }
    }

    /// 拆出原始 handle 和内存，供后端销毁
    pub fn into_raw_parts(self) -> (vk::Image, vk::ImageView, A) {
        (self.handle, self.view, self.allocation)
    }
}

// getters
impl<A> GfxImage<A> {
    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.handle
    }
    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }
    #[inline]
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }
    #[inline]
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }
    #[inline]
    pub fn allocation(&self) -> &A {
        &self.allocation
    }
    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }
}
