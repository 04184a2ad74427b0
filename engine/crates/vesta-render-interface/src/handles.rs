use crate::arena::Handle;

// 资源类型的标记，只用于区分不同资源表的句柄
pub enum BufferTag {}
pub enum TextureTag {}
pub enum PipelineTag {}
pub enum FramebufferTag {}
pub enum SemaphoreTag {}

pub type GfxBufferHandle = Handle<BufferTag>;
/// texture 的 slot index 同时也是它在 bindless 纹理数组中的下标
pub type GfxTextureHandle = Handle<TextureTag>;
pub type GfxPipelineHandle = Handle<PipelineTag>;
pub type GfxFramebufferHandle = Handle<FramebufferTag>;
pub type GfxSemaphoreHandle = Handle<SemaphoreTag>;
