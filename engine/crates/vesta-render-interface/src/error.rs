use thiserror::Error;
use vesta_gfx::error::GfxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArenaError {
    /// arena 不会增长，满了之后插入只会失败
    #[error("arena is full (capacity {capacity})")]
    Exhausted { capacity: usize },

    /// 句柄只有 31 位 index
    #[error("arena capacity {requested} exceeds the maximum {max}")]
    CapacityTooLarge { requested: usize, max: usize },
}

/// 资源表操作的错误，只影响当前的调用
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("{table} table: {source}")]
    Arena {
        table: &'static str,
        #[source]
        source: ArenaError,
    },

    #[error(transparent)]
    Gfx(#[from] GfxError),
}

impl ResourceError {
    pub(crate) fn exhausted(table: &'static str, capacity: usize) -> Self {
        Self::Arena {
            table,
            source: ArenaError::Exhausted { capacity },
        }
    }
}

pub type ResourceResult<T> = Result<T, ResourceError>;
