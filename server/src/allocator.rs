//! Client identity allocation for concurrent token requests.

use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out strictly increasing client ids, starting at 1.
///
/// Zero is never returned, so it can stand for "no client" on the wire.
/// `next` is a single atomic increment and is safe to call from any number
/// of request handlers at once.
#[derive(Debug, Default)]
pub struct ClientIdAllocator {
    last: AtomicU64,
}

impl ClientIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Number of ids handed out so far
    pub fn issued(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_start_at_one() {
        let allocator = ClientIdAllocator::new();
        assert_eq!(allocator.issued(), 0);
        assert_eq!(allocator.next(), 1);
        assert_eq!(allocator.next(), 2);
        assert_eq!(allocator.issued(), 2);
    }

    #[test]
    fn test_allocators_are_independent() {
        let a = ClientIdAllocator::new();
        let b = ClientIdAllocator::new();

        a.next();
        a.next();

        assert_eq!(b.next(), 1);
        assert_eq!(a.next(), 3);
    }

    #[test]
    fn test_concurrent_ids_are_distinct_and_contiguous() {
        let allocator = Arc::new(ClientIdAllocator::new());
        let threads = 8;
        let per_thread = 1000;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || {
                    let mut ids = Vec::with_capacity(per_thread);
                    let mut last = 0;
                    for _ in 0..per_thread {
                        let id = allocator.next();
                        // Each caller observes its own ids increasing
                        assert!(id > last);
                        last = id;
                        ids.push(id);
                    }
                    ids
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();

        let unique: HashSet<u64> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());

        all.sort_unstable();
        let expected: Vec<u64> = (1..=(threads * per_thread) as u64).collect();
        assert_eq!(all, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ids_from_concurrent_tasks() {
        let allocator = Arc::new(ClientIdAllocator::new());

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                tokio::spawn(async move { allocator.next() })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.sort_unstable();

        assert_eq!(ids, (1..=100).collect::<Vec<u64>>());
    }
}
