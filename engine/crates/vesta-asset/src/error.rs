use ash::vk;
use thiserror::Error;
use vesta_gfx::error::GfxError;
use vesta_render_interface::error::ResourceError;

/// 纹理流式加载的错误
///
/// 提交阶段的错误直接返回给调用者；后台线程上的错误只会让对应的批次失败
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("{images} images but {formats} formats")]
    CountMismatch { images: usize, formats: usize },

    #[error("image {index} has an empty extent")]
    EmptyImage { index: usize },

    #[error("image {index}: format {format:?} is not supported for streaming")]
    UnsupportedFormat { index: usize, format: vk::Format },

    #[error("image {index}: expected {expected} bytes of pixels, got {actual}")]
    SizeMismatch { index: usize, expected: usize, actual: usize },

    #[error("image {index}: failed to decode")]
    Decode {
        index: usize,
        #[source]
        source: image::ImageError,
    },

    #[error("texture loader has been stopped")]
    LoaderStopped,

    #[error("failed to build decode thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("failed to spawn texture loader thread")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Gfx(#[from] GfxError),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

pub type StreamResult<T> = Result<T, StreamError>;
