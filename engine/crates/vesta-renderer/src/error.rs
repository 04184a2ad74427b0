use thiserror::Error;
use vesta_asset::error::StreamError;
use vesta_gfx::error::GfxError;
use vesta_render_interface::error::ResourceError;

#[derive(Debug, Error)]
pub enum RendererError {
    #[error(transparent)]
    Gfx(#[from] GfxError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("begin_frame called while frame {frame_id} is still recording")]
    FrameInProgress { frame_id: u64 },

    #[error("end_frame called without begin_frame")]
    FrameNotStarted,

    /// texture 表的 slot 就是 bindless 数组的下标
    #[error("texture table capacity {textures} exceeds bindless array capacity {bindless}")]
    BindlessCapacityTooSmall { textures: usize, bindless: u32 },
}

pub type RendererResult<T> = Result<T, RendererError>;
