use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::error::ArenaError;

/// 分代句柄
///
/// 64 位的布局：
/// - bits 0..31：slot index
/// - bit 31：live 标记，由 arena 产生的句柄总是带有这一位
/// - bits 32..63：generation
///
/// slot 被移除之后 generation 会加一，之前的句柄永久失效。
/// `K` 只用于区分资源类型，不要求实现任何 trait。
pub struct Handle<K> {
    raw: u64,
    _marker: PhantomData<fn() -> K>,
}

impl<K> Handle<K> {
    const INDEX_MASK: u64 = 0x7FFF_FFFF;
    const LIVE_BIT: u64 = 1 << 31;
    const GENERATION_SHIFT: u32 = 32;

    #[inline]
    fn new(index: u32, generation: u32) -> Self {
        Self::from_raw(((generation as u64) << Self::GENERATION_SHIFT) | Self::LIVE_BIT | (index as u64 & Self::INDEX_MASK))
    }

    /// 从 64 位值还原句柄，例如从 shader 或外部系统中传回的值
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// 不对应任何 slot 的句柄
    #[inline]
    pub const fn null() -> Self {
        Self::from_raw(0)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.raw & Self::LIVE_BIT == 0
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.raw
    }

    #[inline]
    pub fn index(&self) -> u32 {
        (self.raw & Self::INDEX_MASK) as u32
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        (self.raw >> Self::GENERATION_SHIFT) as u32
    }
}

impl<K> Default for Handle<K> {
    fn default() -> Self {
        Self::null()
    }
}

// 手动实现，避免对 K 产生约束
impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<K> Copy for Handle<K> {}
impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl<K> Eq for Handle<K> {}
impl<K> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}
impl<K> Debug for Handle<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "Handle(null)")
        } else {
            write!(f, "Handle({}v{})", self.index(), self.generation())
        }
    }
}

/// 固定容量的分代存储
///
/// 所有的内存在创建时一次性分配，之后不会增长。
/// - 空闲 slot 用栈管理，初始时最小的 index 最先被使用
/// - high water mark 是最大的 live index + 1，遍历只扫描到这里
pub struct Arena<T, K = T> {
    slots: Box<[Option<T>]>,
    generations: Box<[u32]>,
    free_indices: Vec<u32>,
    high_water_mark: usize,
    len: usize,
    _marker: PhantomData<fn() -> K>,
}

// new & init
impl<T, K> Arena<T, K> {
    /// 句柄中只有 31 位用于存放 index
    pub const MAX_CAPACITY: usize = Handle::<K>::INDEX_MASK as usize;

    pub fn new(capacity: usize) -> Result<Self, ArenaError> {
        if capacity > Self::MAX_CAPACITY {
            return Err(ArenaError::CapacityTooLarge {
                requested: capacity,
                max: Self::MAX_CAPACITY,
            });
        }

        Ok(Self {
            slots: (0..capacity).map(|_| None).collect(),
            generations: vec![0; capacity].into_boxed_slice(),
            // 倒序入栈，pop 时先得到 0
            free_indices: (0..capacity as u32).rev().collect(),
            high_water_mark: 0,
            len: 0,
            _marker: PhantomData,
        })
    }
}

// 增删查
impl<T, K> Arena<T, K> {
    pub fn insert(&mut self, value: T) -> Result<Handle<K>, ArenaError> {
        let Some(index) = self.free_indices.pop() else {
            return Err(ArenaError::Exhausted {
                capacity: self.capacity(),
            });
        };

        let slot = index as usize;
        self.slots[slot] = Some(value);
        self.len += 1;
        self.high_water_mark = self.high_water_mark.max(slot + 1);

        Ok(Handle::new(index, self.generations[slot]))
    }

    #[inline]
    pub fn contains(&self, handle: Handle<K>) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: Handle<K>) -> Option<&T> {
        let slot = self.resolve(handle)?;
        self.slots[slot].as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle<K>) -> Option<&mut T> {
        let slot = self.resolve(handle)?;
        self.slots[slot].as_mut()
    }

    /// 句柄失效时返回 None，arena 不变
    pub fn remove(&mut self, handle: Handle<K>) -> Option<T> {
        let slot = self.resolve(handle)?;
        self.remove_at(slot)
    }

    /// 按 index 移除，不检查 generation
    pub fn remove_at(&mut self, index: usize) -> Option<T> {
        let value = self.slots.get_mut(index)?.take()?;

        self.generations[index] = self.generations[index].wrapping_add(1);
        self.free_indices.push(index as u32);
        self.len -= 1;

        // 收缩 high water mark，跳过末尾连续的空 slot
        if index + 1 == self.high_water_mark {
            while self.high_water_mark > 0 && self.slots[self.high_water_mark - 1].is_none() {
                self.high_water_mark -= 1;
            }
        }

        Some(value)
    }

    /// 移除所有元素，按 slot 顺序返回
    pub fn drain(&mut self) -> Vec<(Handle<K>, T)> {
        let mut drained = Vec::with_capacity(self.len);
        // 从高到低移除，high water mark 每次只需要收缩一步
        for index in (0..self.high_water_mark).rev() {
            let Some(handle) = self.handle_at(index) else {
                continue;
            };
            if let Some(value) = self.remove_at(index) {
                drained.push((handle, value));
            }
        }
        drained.reverse();
        drained
    }

    /// 句柄有效时返回对应的 slot index
    fn resolve(&self, handle: Handle<K>) -> Option<usize> {
        if handle.is_null() {
            return None;
        }
        let slot = handle.index() as usize;
        let generation = *self.generations.get(slot)?;
        (generation == handle.generation() && self.slots[slot].is_some()).then_some(slot)
    }
}

// 遍历
impl<T, K> Arena<T, K> {
    /// 按 slot 顺序遍历所有 live 元素
    pub fn iter(&self) -> impl Iterator<Item = (Handle<K>, &T)> + '_ {
        self.slots[..self.high_water_mark]
            .iter()
            .zip(self.generations.iter())
            .enumerate()
            .filter_map(|(index, (slot, generation))| {
                slot.as_ref().map(|value| (Handle::new(index as u32, *generation), value))
            })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<K>, &mut T)> + '_ {
        self.slots[..self.high_water_mark]
            .iter_mut()
            .zip(self.generations.iter())
            .enumerate()
            .filter_map(|(index, (slot, generation))| {
                slot.as_mut().map(|value| (Handle::new(index as u32, *generation), value))
            })
    }

    pub fn handles(&self) -> impl Iterator<Item = Handle<K>> + '_ {
        self.iter().map(|(handle, _)| handle)
    }

    /// 该 slot 当前 live 元素的句柄
    pub fn handle_at(&self, index: usize) -> Option<Handle<K>> {
        self.slots.get(index)?.as_ref()?;
        Some(Handle::new(index as u32, self.generations[index]))
    }
}

// getters
impl<T, K> Arena<T, K> {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
    #[inline]
    pub fn is_full(&self) -> bool {
        self.free_indices.is_empty()
    }
    #[inline]
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    #[test]
    fn test_handle_bit_layout() {
        let handle = Handle::<u32>::new(5, 3);
        assert_eq!(handle.raw(), (3 << 32) | (1 << 31) | 5);
        assert_eq!(handle.index(), 5);
        assert_eq!(handle.generation(), 3);
        assert!(!handle.is_null());
        assert!(Handle::<u32>::null().is_null());
        assert_eq!(Handle::<u32>::from_raw(handle.raw()), handle);
    }

    #[test]
    fn test_insert_get_round_trip() {
        let mut arena = Arena::<&str>::new(4).unwrap();
        let a = arena.insert("a").unwrap();
        let b = arena.insert("b").unwrap();

        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(arena.len(), 2);

        *arena.get_mut(b).unwrap() = "bb";
        assert_eq!(arena.get(b), Some(&"bb"));
    }

    #[test]
    fn test_stale_handle_is_rejected() {
        let mut arena = Arena::<u32>::new(2).unwrap();
        let old = arena.insert(1).unwrap();
        assert_eq!(arena.remove(old), Some(1));

        // 同一个 slot 被复用，但 generation 不同
        let new = arena.insert(2).unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());

        assert_eq!(arena.get(old), None);
        assert!(arena.get_mut(old).is_none());
        assert_eq!(arena.remove(old), None);
        assert_eq!(arena.get(new), Some(&2));
        assert!(!arena.contains(old));
    }

    #[test]
    fn test_null_handle_never_resolves() {
        let mut arena = Arena::<u32>::new(2).unwrap();
        arena.insert(7).unwrap();
        assert_eq!(arena.get(Handle::null()), None);
    }

    #[test]
    fn test_exhausted_arena_returns_error() {
        let mut arena = Arena::<u32>::new(2).unwrap();
        arena.insert(1).unwrap();
        arena.insert(2).unwrap();
        assert!(arena.is_full());

        assert_eq!(arena.insert(3), Err(ArenaError::Exhausted { capacity: 2 }));
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.iter().map(|(_, v)| *v).collect_vec(), vec![1, 2]);
    }

    #[test]
    fn test_high_water_mark_compacts_over_dead_tail() {
        let mut arena = Arena::<u32>::new(8).unwrap();
        let handles = (0..5).map(|i| arena.insert(i).unwrap()).collect_vec();
        assert_eq!(arena.high_water_mark(), 5);

        // 移除中间的元素，high water mark 不变
        arena.remove(handles[2]).unwrap();
        arena.remove(handles[3]).unwrap();
        assert_eq!(arena.high_water_mark(), 5);

        // 移除最后一个，跳过 3 和 2 一直收缩到 2
        arena.remove(handles[4]).unwrap();
        assert_eq!(arena.high_water_mark(), 2);

        arena.remove(handles[0]).unwrap();
        assert_eq!(arena.high_water_mark(), 2);
        arena.remove(handles[1]).unwrap();
        assert_eq!(arena.high_water_mark(), 0);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_iteration_visits_live_elements_in_slot_order() {
        let mut arena = Arena::<char>::new(6).unwrap();
        let handles = ['a', 'b', 'c', 'd', 'e'].into_iter().map(|c| arena.insert(c).unwrap()).collect_vec();
        arena.remove(handles[1]).unwrap();
        arena.remove(handles[3]).unwrap();

        assert_eq!(arena.iter().map(|(_, c)| *c).collect_vec(), vec!['a', 'c', 'e']);
        assert_eq!(arena.handles().collect_vec(), vec![handles[0], handles[2], handles[4]]);

        // 可以重复遍历
        assert_eq!(arena.iter().count(), 3);

        for (_, c) in arena.iter_mut() {
            *c = c.to_ascii_uppercase();
        }
        assert_eq!(arena.iter().map(|(_, c)| *c).collect_vec(), vec!['A', 'C', 'E']);
    }

    #[test]
    fn test_lowest_index_is_used_first() {
        let mut arena = Arena::<u32>::new(4).unwrap();
        let indices = (0..4).map(|i| arena.insert(i).unwrap().index()).collect_vec();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_remove_at_and_handle_at() {
        let mut arena = Arena::<u32>::new(4).unwrap();
        let a = arena.insert(10).unwrap();
        assert_eq!(arena.handle_at(0), Some(a));
        assert_eq!(arena.handle_at(1), None);
        assert_eq!(arena.handle_at(100), None);

        assert_eq!(arena.remove_at(0), Some(10));
        assert_eq!(arena.remove_at(0), None);
        assert_eq!(arena.get(a), None);
    }

    #[test]
    fn test_drain_returns_everything_in_slot_order() {
        let mut arena = Arena::<u32>::new(4).unwrap();
        let a = arena.insert(1).unwrap();
        let b = arena.insert(2).unwrap();
        let c = arena.insert(3).unwrap();
        arena.remove(b).unwrap();

        let drained = arena.drain();
        assert_eq!(drained, vec![(a, 1), (c, 3)]);
        assert!(arena.is_empty());
        assert_eq!(arena.high_water_mark(), 0);

        // drain 之后所有的 slot 都可以再次使用，仍然从 0 开始
        assert_eq!(arena.insert(4).unwrap().index(), 0);
        assert_eq!(arena.get(a), None);
    }

    #[test]
    fn test_capacity_beyond_index_bits_is_rejected() {
        let max = Arena::<u32>::MAX_CAPACITY;
        assert!(Arena::<u32>::new(max + 1).is_err_and(|e| e == ArenaError::CapacityTooLarge { requested: max + 1, max }));
        assert_eq!(Arena::<u32>::new(0).unwrap().capacity(), 0);
    }

    /// 随机的插入和删除序列，与 BTreeMap 的结果对比
    #[test]
    fn test_random_operations_match_ordered_map() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut arena = Arena::<u64>::new(16).unwrap();
        let mut model = BTreeMap::<u32, (Handle<u64>, u64)>::new();
        let mut stale = Vec::new();

        for step in 0..4000u64 {
            if rng.gen_bool(0.55) && !arena.is_full() {
                let handle = arena.insert(step).unwrap();
                assert!(!model.contains_key(&handle.index()));
                model.insert(handle.index(), (handle, step));
            } else if !model.is_empty() {
                let nth = rng.gen_range(0..model.len());
                let index = *model.keys().nth(nth).unwrap();
                let (handle, value) = model.remove(&index).unwrap();
                assert_eq!(arena.remove(handle), Some(value));
                stale.push(handle);
            } else {
                assert!(arena.is_empty());
            }

            let expected_hwm = model.keys().next_back().map_or(0, |index| *index as usize + 1);
            assert_eq!(arena.high_water_mark(), expected_hwm, "step {step}");
            assert_eq!(arena.len(), model.len());
            assert_eq!(
                arena.iter().map(|(handle, value)| (handle, *value)).collect_vec(),
                model.values().copied().collect_vec(),
                "step {step}"
            );
            if !stale.is_empty() {
                let old = stale[rng.gen_range(0..stale.len())];
                assert_eq!(arena.get(old), None);
            }
        }
    }

    #[test]
    fn test_generation_wraps() {
        let mut arena = Arena::<u32>::new(1).unwrap();
        arena.generations[0] = u32::MAX;
        let handle = arena.insert(1).unwrap();
        assert_eq!(handle.generation(), u32::MAX);
        arena.remove(handle).unwrap();

        let handle = arena.insert(2).unwrap();
        assert_eq!(handle.generation(), 0);
        assert_eq!(arena.get(handle), Some(&2));
    }
}
