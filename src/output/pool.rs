//! Recycling of output blocks between producers and a dispatch thread

use super::queue::Queue;

/// A fixed set of blocks cycling between a `free` and a `filled` queue
///
/// Producers take a block from `free`, fill it and append it to `filled`.
/// The consumer writes it out and returns it to `free`. A `None` on the
/// `filled` queue marks the end of the stream.
pub struct Pool<T> {
    /// Blocks ready to be filled
    pub free: Queue<Box<T>>,
    /// Blocks waiting to be written out
    pub filled: Queue<Option<Box<T>>>,
}

impl<T> Pool<T> {
    /// Create a pool holding `blocks`, all initially free
    pub fn new(name: &str, blocks: impl IntoIterator<Item = T>) -> Self {
        let free = Queue::new(format!("{}.free", name));
        for block in blocks {
            free.append_untimed(Box::new(block));
        }

        Self {
            free,
            filled: Queue::new(format!("{}.filled", name)),
        }
    }

    /// Create a pool of `count` blocks made by `make`
    pub fn with_blocks(name: &str, count: usize, mut make: impl FnMut() -> T) -> Self {
        Self::new(name, (0..count).map(|_| make()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_cycle() {
        let pool = Pool::with_blocks("test", 3, Vec::<u8>::new);
        assert_eq!(pool.free.len(), 3);

        let mut block = pool.free.remove();
        block.push(7);
        pool.filled.append(Some(block));
        pool.filled.append(None);

        let block = pool.filled.remove().unwrap();
        assert_eq!(*block, vec![7]);
        pool.free.append(block);

        assert!(pool.filled.remove().is_none());
        assert_eq!(pool.free.len(), 3);
    }
}
