use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// 空闲链表的结尾
const LIST_END: u32 = u32::MAX;

/// 带代数的资源句柄
///
/// generation 为 0 表示空句柄。句柄只有在 generation 与 slot 中记录的 generation 相同时才有效，
/// slot 被销毁再复用之后，旧句柄无法再访问到新的对象。
pub struct GfxHandle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> GfxHandle<T> {
    #[inline]
    pub const fn empty() -> Self {
        Self {
            index: 0,
            generation: 0,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.generation == 0
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<T> Default for GfxHandle<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Clone for GfxHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for GfxHandle<T> {}

impl<T> PartialEq for GfxHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for GfxHandle<T> {}

impl<T> Hash for GfxHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> Debug for GfxHandle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "Handle(empty)")
        } else {
            write!(f, "Handle({}#{})", self.index, self.generation)
        }
    }
}

struct PoolEntry<T> {
    obj: Option<T>,
    generation: u32,
    next_free: u32,
}

/// 使用空闲链表复用 slot 的对象池
///
/// 池子独占其中的对象，外部只持有 [`GfxHandle`]。generation 达到 `u32::MAX` 的 slot 被销毁后不再复用。
pub struct GfxPool<T> {
    entries: Vec<PoolEntry<T>>,
    free_head: u32,
    free_count: u32,
    retired_count: u32,
}

impl<T> Default for GfxPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

// new & init
impl<T> GfxPool<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: LIST_END,
            free_count: 0,
            retired_count: 0,
        }
    }
}

// create & destroy
impl<T> GfxPool<T> {
    pub fn create(&mut self, obj: T) -> GfxHandle<T> {
        if self.free_head != LIST_END {
            let index = self.free_head;
            let entry = &mut self.entries[index as usize];
            self.free_head = entry.next_free;
            self.free_count -= 1;

            entry.next_free = LIST_END;
            entry.obj = Some(obj);
            return GfxHandle::new(index, entry.generation);
        }

        let index = self.entries.len() as u32;
        debug_assert!(index != LIST_END, "pool slot index overflow");
        self.entries.push(PoolEntry {
            obj: Some(obj),
            generation: 1,
            next_free: LIST_END,
        });
        GfxHandle::new(index, 1)
    }

    /// 从池中移除对象，并将其所有权交还给调用者
    ///
    /// 空句柄是 no-op；过期句柄说明发生了重复销毁，在 debug 下会断言失败，release 下返回 None。
    pub fn destroy(&mut self, handle: GfxHandle<T>) -> Option<T> {
        if handle.is_empty() {
            return None;
        }

        let Some(entry) = self.entries.get_mut(handle.index as usize) else {
            debug_assert!(false, "destroying {handle:?} which was never allocated by this pool");
            return None;
        };
        if entry.generation != handle.generation || entry.obj.is_none() {
            debug_assert!(
                false,
                "double destroy or stale handle: {handle:?}, slot generation is {}",
                entry.generation
            );
            return None;
        }

        let obj = entry.obj.take();
        if entry.generation == u32::MAX {
            // generation 用尽，复用会让很久以前的句柄重新生效
            self.retired_count += 1;
            return obj;
        }
        entry.generation += 1;
        entry.next_free = self.free_head;
        self.free_head = handle.index;
        self.free_count += 1;

        obj
    }

    /// 移除所有存活的对象，用于销毁整个池子
    pub fn drain(&mut self) -> impl Iterator<Item = (GfxHandle<T>, T)> + '_ {
        self.free_head = LIST_END;
        self.free_count = 0;
        self.retired_count = 0;
        let entries = std::mem::take(&mut self.entries);
        entries.into_iter().enumerate().filter_map(|(index, entry)| {
            let generation = entry.generation;
            entry.obj.map(|obj| (GfxHandle::new(index as u32, generation), obj))
        })
    }
}

// getters
impl<T> GfxPool<T> {
    /// 空句柄、过期句柄都返回 None
    #[inline]
    pub fn get(&self, handle: GfxHandle<T>) -> Option<&T> {
        if handle.is_empty() {
            return None;
        }
        self.entries
            .get(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.obj.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, handle: GfxHandle<T>) -> Option<&mut T> {
        if handle.is_empty() {
            return None;
        }
        self.entries
            .get_mut(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.obj.as_mut())
    }

    /// 线性查找，只用于调试或者很少走到的路径
    pub fn find_object(&self, mut pred: impl FnMut(&T) -> bool) -> Option<GfxHandle<T>> {
        self.iter().find(|(_, obj)| pred(obj)).map(|(handle, _)| handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (GfxHandle<T>, &T)> {
        self.entries.iter().enumerate().filter_map(|(index, entry)| {
            entry.obj.as_ref().map(|obj| (GfxHandle::new(index as u32, entry.generation), obj))
        })
    }

    /// 存活的对象数量
    #[inline]
    pub fn len(&self) -> u32 {
        self.entries.len() as u32 - self.free_count - self.retired_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 分配过的 slot 总数
    #[inline]
    pub fn slot_count(&self) -> u32 {
        self.entries.len() as u32
    }

    /// generation 用尽、不再复用的 slot 数量
    #[inline]
    pub fn retired_count(&self) -> u32 {
        self.retired_count
    }

    /// 沿着空闲链表计数，和 `free_count` 相互校验
    pub fn free_list_len(&self) -> u32 {
        let mut count = 0;
        let mut cur = self.free_head;
        while cur != LIST_END {
            count += 1;
            cur = self.entries[cur as usize].next_free;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn test_create_get_destroy() {
        let mut pool = GfxPool::new();
        let a = pool.create("a");
        let b = pool.create("b");

        assert_eq!(pool.get(a), Some(&"a"));
        assert_eq!(pool.get(b), Some(&"b"));
        assert_eq!(a.generation(), 1);
        assert_eq!(pool.len(), 2);

        assert_eq!(pool.destroy(a), Some("a"));
        assert_eq!(pool.get(a), None);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.free_list_len(), 1);
    }

    #[test]
    fn test_reuse_bumps_generation() {
        let mut pool = GfxPool::new();
        let old = pool.create(1);
        pool.destroy(old);

        let new = pool.create(2);
        assert_eq!(new.index(), old.index());
        assert!(new.generation() > old.generation());
        assert_eq!(pool.get(old), None);
        assert_eq!(pool.get(new), Some(&2));
        assert_ne!(old, new);
    }

    #[test]
    fn test_empty_handle() {
        let mut pool: GfxPool<u32> = GfxPool::new();
        let empty = GfxHandle::<u32>::empty();
        assert!(empty.is_empty());
        assert_eq!(pool.get(empty), None);
        assert_eq!(pool.destroy(empty), None);

        // 第一个对象的 index 也是 0，但 generation 从 1 开始，不会和空句柄混淆
        let h = pool.create(7);
        assert_eq!(h.index(), 0);
        assert_eq!(pool.get(empty), None);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double destroy")]
    fn test_double_destroy_asserts() {
        let mut pool = GfxPool::new();
        let h = pool.create(1u32);
        pool.destroy(h);
        pool.destroy(h);
    }

    #[test]
    fn test_find_object() {
        let mut pool = GfxPool::new();
        let _a = pool.create(10);
        let b = pool.create(20);
        let c = pool.create(30);
        pool.destroy(c);

        assert_eq!(pool.find_object(|v| *v == 20), Some(b));
        assert_eq!(pool.find_object(|v| *v == 30), None);
        assert_eq!(pool.iter().count(), 2);
    }

    #[test]
    fn test_saturated_generation_retires_slot() {
        let mut pool = GfxPool::new();
        let first = pool.create(1);
        pool.entries[first.index() as usize].generation = u32::MAX - 1;
        pool.destroy(GfxHandle::new(first.index(), u32::MAX - 1));

        // 最后一个可用的 generation
        let last = pool.create(2);
        assert_eq!(last.index(), first.index());
        assert_eq!(last.generation(), u32::MAX);

        assert_eq!(pool.destroy(last), Some(2));
        assert_eq!(pool.retired_count(), 1);
        assert_eq!(pool.free_list_len(), 0);
        assert_eq!(pool.len(), 0);

        let next = pool.create(3);
        assert_ne!(next.index(), first.index());
        assert_eq!(pool.get(last), None);
        assert_eq!(pool.get(first), None);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.len() + pool.free_list_len() + pool.retired_count(), pool.slot_count());
    }

    #[test]
    fn test_drain() {
        let mut pool = GfxPool::new();
        let a = pool.create(1);
        let b = pool.create(2);
        pool.destroy(a);

        let drained: Vec<_> = pool.drain().collect();
        assert_eq!(drained, vec![(b, 2)]);
        assert_eq!(pool.slot_count(), 0);
        assert_eq!(pool.free_list_len(), 0);
    }

    #[test]
    fn test_random_sequence_keeps_invariants() {
        let mut rng = StdRng::seed_from_u64(0x7275_7669);
        let mut pool = GfxPool::new();
        let mut live: Vec<(GfxHandle<u64>, u64)> = Vec::new();
        let mut dead: Vec<GfxHandle<u64>> = Vec::new();

        for step in 0..4000u64 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let handle = pool.create(step);
                assert_eq!(pool.get(handle), Some(&step));
                live.push((handle, step));
            } else {
                let (handle, value) = live.swap_remove(rng.gen_range(0..live.len()));
                assert_eq!(pool.destroy(handle), Some(value));
                dead.push(handle);
            }

            assert_eq!(pool.len() + pool.free_list_len() + pool.retired_count(), pool.slot_count());
            assert_eq!(pool.len() as usize, live.len());
        }

        for (handle, value) in &live {
            assert_eq!(pool.get(*handle), Some(value));
        }
        for handle in &dead {
            assert_eq!(pool.get(*handle), None);
        }
    }
}
