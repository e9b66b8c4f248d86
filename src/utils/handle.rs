use std::hash::Hash;
use std::marker::PhantomData;

/// A stable, generation-checked index into a [`Pool`].
///
/// GPU resources are referenced by handle rather than by pointer so that
/// ownership stays with the pool and stale references are detectable: a
/// released slot bumps its generation, invalidating every outstanding handle.
#[derive(Debug)]
pub struct Handle<T> {
    pub slot: u16,
    pub generation: u16,
    phantom: PhantomData<T>,
}

impl<T> Handle<T> {
    pub fn from_raw(slot: u16, generation: u16) -> Self {
        Self {
            slot,
            generation,
            phantom: PhantomData,
        }
    }

    pub fn valid(&self) -> bool {
        *self != Self::default()
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self {
            slot: u16::MAX,
            generation: u16::MAX,
            phantom: PhantomData,
        }
    }
}

/// Generational slot arena backing every device-owned resource type.
pub struct Pool<T> {
    items: Vec<Option<T>>,
    empty: Vec<usize>,
    generation: Vec<u16>,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new(256)
    }
}

impl<T> Pool<T> {
    pub fn new(initial_size: usize) -> Self {
        let mut p = Pool {
            items: Vec::with_capacity(initial_size),
            empty: (0..initial_size).rev().collect(),
            generation: vec![0; initial_size],
        };
        p.items.resize_with(initial_size, || None);
        p
    }

    pub fn insert(&mut self, item: T) -> Option<Handle<T>> {
        let slot = match self.empty.pop() {
            Some(slot) => slot,
            None => {
                // Grow rather than fail; slot indices must stay within u16.
                let slot = self.items.len();
                if slot >= u16::MAX as usize {
                    return None;
                }
                self.items.push(None);
                self.generation.push(0);
                slot
            }
        };

        self.items[slot] = Some(item);
        Some(Handle {
            slot: slot as u16,
            generation: self.generation[slot],
            phantom: PhantomData,
        })
    }

    /// Releases a slot and returns its contents. The generation bump makes
    /// every outstanding handle to this slot dangle harmlessly.
    pub fn release(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = handle.slot as usize;
        if slot >= self.items.len() || self.generation[slot] != handle.generation {
            return None;
        }
        let item = self.items[slot].take()?;
        self.generation[slot] = self.generation[slot].wrapping_add(1);
        self.empty.push(slot);
        Some(item)
    }

    pub fn get_ref(&self, handle: Handle<T>) -> Option<&T> {
        let slot = handle.slot as usize;
        if slot < self.items.len() && self.generation[slot] == handle.generation {
            self.items[slot].as_ref()
        } else {
            None
        }
    }

    pub fn get_mut_ref(&mut self, handle: Handle<T>) -> Option<&mut T> {
        let slot = handle.slot as usize;
        if slot < self.items.len() && self.generation[slot] == handle.generation {
            self.items[slot].as_mut()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.items.iter().filter(|i| i.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.items.iter().all(|i| i.is_none())
    }

    pub fn drain_occupied(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        for (slot, item) in self.items.iter_mut().enumerate() {
            if let Some(v) = item.take() {
                self.generation[slot] = self.generation[slot].wrapping_add(1);
                self.empty.push(slot);
                out.push(v);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup() {
        let mut pool: Pool<u32> = Pool::new(4);
        let a = pool.insert(7).unwrap();
        let b = pool.insert(9).unwrap();
        assert_eq!(pool.get_ref(a), Some(&7));
        assert_eq!(pool.get_ref(b), Some(&9));
        assert_ne!(a, b);
    }

    #[test]
    fn release_bumps_generation() {
        let mut pool: Pool<u32> = Pool::new(2);
        let a = pool.insert(1).unwrap();
        assert_eq!(pool.release(a), Some(1));
        assert!(pool.get_ref(a).is_none());

        // The slot is reused, but the stale handle stays dead.
        let b = pool.insert(2).unwrap();
        assert!(pool.get_ref(a).is_none());
        assert_eq!(pool.get_ref(b), Some(&2));
    }

    #[test]
    fn grows_past_initial_size() {
        let mut pool: Pool<usize> = Pool::new(2);
        let handles: Vec<_> = (0..64).map(|i| pool.insert(i).unwrap()).collect();
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(pool.get_ref(*h), Some(&i));
        }
        assert_eq!(pool.len(), 64);
    }
}
