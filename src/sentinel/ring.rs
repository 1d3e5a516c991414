/// Fixed-capacity buffer that overwrites its oldest entry.
#[derive(Debug, Clone)]
pub struct RingBuffer<T, const N: usize> {
    slots: [Option<T>; N],
    next: usize,
    len: usize,
}

impl<T, const N: usize> RingBuffer<T, N> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            next: 0,
            len: 0,
        }
    }

    /// Store `item` in the next slot. Returns true when this write filled
    /// the last slot, i.e. a full lap of `N` writes has completed.
    pub fn push(&mut self, item: T) -> bool {
        self.slots[self.next] = Some(item);
        self.next = (self.next + 1) % N;
        self.len = (self.len + 1).min(N);
        self.next == 0
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let (head, tail) = if self.len < N {
            (&self.slots[..self.len], &self.slots[..0])
        } else {
            (&self.slots[self.next..], &self.slots[..self.next])
        };
        head.iter().chain(tail.iter()).filter_map(Option::as_ref)
    }

    pub fn last(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.slots[(self.next + N - 1) % N].as_ref()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_and_wrap() {
        let mut ring: RingBuffer<u32, 3> = RingBuffer::new();
        assert!(ring.is_empty());
        assert_eq!(ring.last(), None);

        assert!(!ring.push(1));
        assert!(!ring.push(2));
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![1, 2]);

        assert!(ring.push(3));
        assert_eq!(ring.len(), 3);

        assert!(!ring.push(4));
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(ring.last(), Some(&4));
        assert_eq!(ring.len(), ring.capacity());
    }

    #[test]
    fn test_lap_reported_every_n_writes() {
        let mut ring: RingBuffer<u32, 30> = RingBuffer::new();
        let laps = (0..95).filter(|i| ring.push(*i)).count();
        assert_eq!(laps, 3);
        assert_eq!(ring.len(), 30);
        assert_eq!(ring.iter().next(), Some(&65));
    }
}
