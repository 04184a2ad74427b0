//! 渲染器
//!
//! 把资源表、bindless、纹理流式加载以及帧同步组合在一起，对外提供每帧的调用顺序：
//!
//! ```ignore
//! let cmd = renderer.begin_frame()?;   // 等待 GPU、回收资源、处理上传完成的纹理
//! // 录制命令...
//! renderer.end_frame()?;               // 提交命令、推进帧计数
//! ```

pub mod cmd_allocator;
pub mod error;
pub mod frame_pacer;
pub mod renderer;
