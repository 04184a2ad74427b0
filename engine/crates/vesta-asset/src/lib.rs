//! 纹理的异步流式加载
//!
//! - [`loader::ImageLoadQueue`]：任意线程都可以提交加载请求，立即返回 batch id
//! - 后台线程负责解码、创建 staging buffer、在 transfer 队列上录制并提交上传命令
//! - [`texture_streamer::TextureStreamer::tick_image_uploads`]：渲染线程每帧调用，
//!   将 GPU 已经完成上传的纹理转移到 graphics 队列、生成 mip，并放入 texture 表

pub mod error;
pub mod handle;
pub mod loader;
pub mod texture_streamer;
mod transfer;
