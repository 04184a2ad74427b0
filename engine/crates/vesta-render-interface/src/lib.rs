//! GPU 资源的生命周期
//!
//! - [`arena::Arena`]：固定容量的分代句柄存储
//! - [`gfx_resource_manager::GfxResourceManager`]：buffer / texture / pipeline / framebuffer / semaphore 五张资源表
//! - [`deletion_queue::DeletionQueue`]：按帧延迟的销毁队列，保证不会释放 GPU 仍在读取的资源

pub mod arena;
pub mod bindless_manager;
pub mod deletion_queue;
pub mod error;
pub mod frame_counter;
pub mod gfx_resource_manager;
pub mod handles;
pub mod pipeline_settings;
