use crate::pipeline_settings::FrameLabel;

pub struct FrameCounter {
    /// 当前的帧序号，一直累加
    frame_id: u64,
}
// new & init
impl FrameCounter {
    pub fn new(init_frame_id: u64) -> Self {
        Self {
            frame_id: init_frame_id,
        }
    }
}
impl Default for FrameCounter {
    fn default() -> Self {
        Self::new(0)
    }
}
// update
impl FrameCounter {
    #[inline]
    pub fn next_frame(&mut self) {
        self.frame_id = self.frame_id.wrapping_add(1);
    }
}
// getters
impl FrameCounter {
    /// frames in flight 的数量
    ///
    /// CPU 最多领先 GPU 这么多帧，延迟销毁也等待这么多帧。两者必须是同一个值。
    pub const FIF_COUNT: usize = 3;

    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }
    #[inline]
    pub const fn fif_count() -> usize {
        Self::FIF_COUNT
    }
    #[inline]
    pub const fn frame_labels() -> [FrameLabel; Self::FIF_COUNT] {
        [FrameLabel::A, FrameLabel::B, FrameLabel::C]
    }
    #[inline]
    pub fn frame_label(&self) -> FrameLabel {
        FrameLabel::from_usize((self.frame_id % Self::FIF_COUNT as u64) as usize)
    }
    #[inline]
    pub fn frame_name(&self) -> String {
        format!("[F{}{}]", self.frame_id, self.frame_label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_label_cycles() {
        let mut counter = FrameCounter::default();
        let mut labels = Vec::new();
        for _ in 0..4 {
            labels.push(*counter.frame_label());
            counter.next_frame();
        }
        assert_eq!(labels, vec![0, 1, 2, 0]);
        assert_eq!(counter.frame_id(), 4);
        assert_eq!(counter.frame_name(), "[F4B]");
    }
}
