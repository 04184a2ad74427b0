use std::fmt::{Display, Formatter};

use vesta_render_interface::handles::GfxTextureHandle;

/// 一次提交的纹理批次
///
/// 在提交时分配，从 1 开始严格递增，同时也是 upload timeline semaphore 上对应的 signal 值
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageBatchId(pub u64);

impl ImageBatchId {
    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Display for ImageBatchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "batch#{}", self.0)
    }
}

/// 批次的加载状态
///
/// 状态流转: Queued -> Uploading -> Ready / Failed -> Retired
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BatchStatus {
    /// 已分配 id，后台线程尚未处理（解码中，或者在等待更早的批次）
    Queued,
    /// 已提交到 transfer 队列，或者 GPU 已完成但还没有被 tick 放入 texture 表
    Uploading,
    /// 所有纹理都已经在 texture 表中，可以通过 bindless 访问
    Ready,
    /// 解码或者上传失败，该批次不会产生任何纹理
    Failed,
    /// 结果已经通过 `retire_batch` 取走，不再记录
    Retired,
    /// 从未分配过的 id
    Unknown,
}

/// retire 一个批次时取走的结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    /// 纹理按提交顺序排列，之后由调用者负责销毁
    Ready(Vec<GfxTextureHandle>),
    Failed,
}
