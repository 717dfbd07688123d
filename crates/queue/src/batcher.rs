//! Size-bounded chunk accumulator.
//!
//! Collects items into numbered chunks and hands a chunk back the moment it
//! reaches `max_size`. Chunk indexes start at 1 and only ever increase, so
//! a flushed chunk's index is never reused within one batcher.

/// Accumulates items into chunks of at most `max_size`.
#[derive(Debug)]
pub struct ChunkBatcher<T> {
    buffer: Vec<T>,
    max_size: usize,
    index: usize,
}

/// A flushed chunk and its index.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk<T> {
    pub index: usize,
    pub items: Vec<T>,
}

impl<T> ChunkBatcher<T> {
    /// `max_size` is clamped to at least 1.
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            buffer: Vec::new(),
            max_size,
            index: 1,
        }
    }

    /// Add one item. Returns the chunk if this push filled it.
    pub fn push(&mut self, item: T) -> Option<Chunk<T>> {
        self.buffer.push(item);
        if self.buffer.len() >= self.max_size {
            Some(self.flush())
        } else {
            None
        }
    }

    /// Flush the open chunk regardless of size, returning `None` when empty.
    pub fn finish(&mut self) -> Option<Chunk<T>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.flush())
        }
    }

    fn flush(&mut self) -> Chunk<T> {
        let chunk = Chunk {
            index: self.index,
            items: std::mem::take(&mut self.buffer),
        };
        self.index += 1;
        chunk
    }

    /// Index the open chunk will carry when flushed.
    pub fn current_index(&self) -> usize {
        self.index
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_on_size() {
        let mut batcher = ChunkBatcher::new(3);
        assert!(batcher.push(1).is_none());
        assert!(batcher.push(2).is_none());
        let chunk = batcher.push(3).unwrap();
        assert_eq!(chunk.index, 1);
        assert_eq!(chunk.items, vec![1, 2, 3]);
        assert!(batcher.is_empty());
        assert_eq!(batcher.current_index(), 2);
    }

    #[test]
    fn test_finish_partial_chunk() {
        let mut batcher = ChunkBatcher::new(10);
        batcher.push("a");
        let chunk = batcher.finish().unwrap();
        assert_eq!(chunk.items, vec!["a"]);
        assert!(batcher.finish().is_none());
    }

    #[test]
    fn test_indexes_increase() {
        let mut batcher = ChunkBatcher::new(1);
        let idx: Vec<_> = (0..4).filter_map(|i| batcher.push(i)).map(|c| c.index).collect();
        assert_eq!(idx, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_zero_limit_clamped() {
        let mut batcher = ChunkBatcher::new(0);
        assert!(batcher.push(()).is_some());
    }
}
