use crate::arena::Handle;
use crate::frame_counter::FrameCounter;

/// 一条待销毁的记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionRecord<K> {
    pub handle: Handle<K>,
    /// 还需要经过多少帧才能释放
    pub remaining_frames: u32,
}

/// 按帧延迟的销毁队列
///
/// 记录入队时倒数 `FrameCounter::FIF_COUNT` 帧，每帧 `tick` 一次，
/// 归零时 GPU 已经不可能再使用该资源，由资源表真正释放。
/// 在此之前句柄仍然有效。
pub struct DeletionQueue<K> {
    records: Vec<DeletionRecord<K>>,
    countdown: u32,
}

impl<K> Default for DeletionQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> DeletionQueue<K> {
    pub fn new() -> Self {
        Self::with_countdown(FrameCounter::FIF_COUNT as u32)
    }

    fn with_countdown(countdown: u32) -> Self {
        Self {
            records: Vec::new(),
            countdown,
        }
    }

    /// 同一个句柄只会入队一次，重复入队返回 false
    pub fn push(&mut self, handle: Handle<K>) -> bool {
        if self.contains(handle) {
            return false;
        }
        self.records.push(DeletionRecord {
            handle,
            remaining_frames: self.countdown,
        });
        true
    }

    #[inline]
    pub fn contains(&self, handle: Handle<K>) -> bool {
        self.records.iter().any(|record| record.handle == handle)
    }

    /// 所有记录倒数一帧，返回归零的句柄
    pub fn tick(&mut self) -> Vec<Handle<K>> {
        let mut expired = Vec::new();
        self.records.retain_mut(|record| {
            record.remaining_frames = record.remaining_frames.saturating_sub(1);
            if record.remaining_frames == 0 {
                expired.push(record.handle);
                false
            } else {
                true
            }
        });
        expired
    }

    /// 不再等待，立即取出所有记录
    pub fn drain(&mut self) -> Vec<Handle<K>> {
        self.records.drain(..).map(|record| record.handle).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_expires_after_fif_ticks() {
        let mut queue = DeletionQueue::<()>::new();
        let handle = Handle::from_raw((1 << 31) | 7);
        assert!(queue.push(handle));

        for _ in 0..FrameCounter::FIF_COUNT - 1 {
            assert!(queue.tick().is_empty());
            assert!(queue.contains(handle));
        }
        assert_eq!(queue.tick(), vec![handle]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_push_is_ignored() {
        let mut queue = DeletionQueue::<()>::new();
        let handle = Handle::from_raw((1 << 31) | 1);
        assert!(queue.push(handle));
        assert!(!queue.push(handle));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_records_expire_in_push_order() {
        let mut queue = DeletionQueue::<()>::with_countdown(2);
        let a = Handle::from_raw((1 << 31) | 1);
        let b = Handle::from_raw((1 << 31) | 2);
        queue.push(a);
        queue.tick();
        queue.push(b);

        assert_eq!(queue.tick(), vec![a]);
        assert_eq!(queue.tick(), vec![b]);
    }

    #[test]
    fn test_drain_ignores_countdown() {
        let mut queue = DeletionQueue::<()>::new();
        let a = Handle::from_raw((1 << 31) | 1);
        queue.push(a);
        assert_eq!(queue.drain(), vec![a]);
        assert!(queue.tick().is_empty());
    }
}
