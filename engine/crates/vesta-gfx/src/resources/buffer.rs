use std::ptr::NonNull;

use ash::vk;

use crate::error::{GfxError, GfxResult};

/// 创建 buffer 的参数
#[derive(Clone, Debug)]
pub struct GfxBufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    /// 是否需要 host 可见并保持映射（staging / readback）
    pub host_visible: bool,
    pub name: String,
}

impl GfxBufferDesc {
    pub fn new(size: vk::DeviceSize, usage: vk::BufferUsageFlags, name: impl Into<String>) -> Self {
        Self {
            size,
            usage,
            host_visible: false,
            name: name.into(),
        }
    }

    /// 用于上传数据的 staging buffer
    pub fn staging(size: vk::DeviceSize, name: impl Into<String>) -> Self {
        Self {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            host_visible: true,
            name: name.into(),
        }
    }

    /// builder
    #[inline]
    pub fn host_visible(mut self, host_visible: bool) -> Self {
        self.host_visible = host_visible;
        self
    }
}

/// GPU buffer 以及它的内存
///
/// `A` 是后端的内存分配记录。buffer 由创建它的资源表持有，
/// 销毁必须交还给后端的 `destroy_buffer`。
pub struct GfxBuffer<A> {
    handle: vk::Buffer,
    allocation: A,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    mapped_ptr: Option<NonNull<u8>>,
    device_address: Option<vk::DeviceAddress>,
    debug_name: String,
}

// SAFETY: mapped_ptr 指向 allocation 持有的映射内存，生命周期与 GfxBuffer 一致；
// 写入需要 &mut self，读取需要 &self，与普通的 Vec<u8> 一致。
unsafe impl<A: Send> Send for GfxBuffer<A> {}
unsafe impl<A: Sync> Sync for GfxBuffer<A> {}

// new & destroy
impl<A> GfxBuffer<A> {
    /// 由后端调用
    ///
    /// # Safety
    /// `mapped_ptr` 为 Some 时，必须指向至少 `size` 字节、在 allocation 存活期间一直有效的映射内存。
    pub unsafe fn from_raw_parts(
        handle: vk::Buffer,
        allocation: A,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        mapped_ptr: Option<NonNull<u8>>,
        device_address: Option<vk::DeviceAddress>,
        debug_name: impl Into<String>,
    ) -> Self {
        Self {
            handle,
            allocation,
            size,
            usage,
            mapped_ptr,
            device_address,
            debug_name: debug_name.into(),
        }
    }

    /// 拆出原始 handle 和内存，供后端销毁
    pub fn into_raw_parts(self) -> (vk::Buffer, A, Option<NonNull<u8>>) {
        (self.handle, self.allocation, self.mapped_ptr)
    }
}

// getters
impl<A> GfxBuffer<A> {
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }
    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
    #[inline]
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }
    #[inline]
    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        self.device_address
    }
    #[inline]
    pub fn is_host_visible(&self) -> bool {
        self.mapped_ptr.is_some()
    }
    #[inline]
    pub fn allocation(&self) -> &A {
        &self.allocation
    }
    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// 映射内存的只读视图
    pub fn mapped_bytes(&self) -> Option<&[u8]> {
        self.mapped_ptr
            // SAFETY: 见 from_raw_parts 的约定
            .map(|ptr| unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.size as usize) })
    }
}

// tools
impl<A> GfxBuffer<A> {
    /// 写入映射内存，写完需要调用后端的 `flush_buffer`
    pub fn write_bytes(&mut self, offset: vk::DeviceSize, data: &[u8]) -> GfxResult<()> {
        let Some(ptr) = self.mapped_ptr else {
            return Err(GfxError::NotHostVisible {
                name: self.debug_name.clone(),
            });
        };
        let len = data.len() as vk::DeviceSize;
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(GfxError::OutOfBounds {
                offset,
                len,
                size: self.size,
            });
        }

        // SAFETY: 上面检查了范围；映射内存至少 size 字节
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr().add(offset as usize), data.len());
        }
        Ok(())
    }
}
