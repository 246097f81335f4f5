//! Generation-checked slab storage. Elements live at stable indices for the
//! lifetime of the session; handles given to the host are weak references
//! that go stale on removal instead of dangling.

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name {
            pub(crate) idx: u32,
            pub(crate) generation: u32,
        }
    };
}

define_id!(
    /// Handle to one publisher element.
    PubId
);
define_id!(
    /// Handle to one subscriber element.
    SubId
);
define_id!(
    /// Handle to one MD listener.
    ListenerId
);

pub(crate) struct Slab<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
}

struct Entry<T> {
    generation: u32,
    val: Option<T>,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self { entries: Vec::new(), free: Vec::new() }
    }
}

impl<T> Slab<T> {
    pub fn insert(&mut self, val: T) -> (u32, u32) {
        if let Some(idx) = self.free.pop() {
            let entry = &mut self.entries[idx as usize];
            entry.val = Some(val);
            (idx, entry.generation)
        } else {
            self.entries.push(Entry { generation: 0, val: Some(val) });
            (self.entries.len() as u32 - 1, 0)
        }
    }

    pub fn get(&self, idx: u32, generation: u32) -> Option<&T> {
        self.entries
            .get(idx as usize)
            .filter(|e| e.generation == generation)
            .and_then(|e| e.val.as_ref())
    }

    pub fn get_mut(&mut self, idx: u32, generation: u32) -> Option<&mut T> {
        self.entries
            .get_mut(idx as usize)
            .filter(|e| e.generation == generation)
            .and_then(|e| e.val.as_mut())
    }

    pub fn remove(&mut self, idx: u32, generation: u32) -> Option<T> {
        let entry = self.entries.get_mut(idx as usize)?;
        if entry.generation != generation || entry.val.is_none() {
            return None;
        }
        entry.generation += 1;
        self.free.push(idx);
        entry.val.take()
    }

    /// Iterate live elements in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.entries.iter().enumerate().filter_map(|(i, e)| e.val.as_ref().map(|v| (i as u32, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(i, e)| e.val.as_mut().map(|v| (i as u32, v)))
    }

    pub fn drain_all(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        for (idx, entry) in self.entries.iter_mut().enumerate() {
            if let Some(val) = entry.val.take() {
                entry.generation += 1;
                self.free.push(idx as u32);
                out.push(val);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_misses_after_remove() {
        let mut slab = Slab::default();
        let (idx, generation) = slab.insert("a");
        assert_eq!(slab.get(idx, generation), Some(&"a"));

        slab.remove(idx, generation);
        assert_eq!(slab.get(idx, generation), None);

        // The slot is reused with a bumped generation; the old handle stays
        // stale.
        let (idx2, gen2) = slab.insert("b");
        assert_eq!(idx2, idx);
        assert_ne!(gen2, generation);
        assert_eq!(slab.get(idx, generation), None);
        assert_eq!(slab.get(idx2, gen2), Some(&"b"));
    }

    #[test]
    fn iteration_is_slot_ordered() {
        let mut slab = Slab::default();
        let a = slab.insert(10);
        let _b = slab.insert(20);
        let _c = slab.insert(30);
        slab.remove(a.0, a.1);
        let seen: Vec<i32> = slab.iter().map(|(_, v)| *v).collect();
        assert_eq!(seen, vec![20, 30]);
    }
}
