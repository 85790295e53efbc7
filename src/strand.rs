use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::tag::ResolvedTag;

/// Identifies a logical ordering domain, typically "all completions
/// belonging to one RPC endpoint".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StrandId(pub(crate) u64);

impl std::fmt::Display for StrandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "strand#{}", self.0)
    }
}

/// Serialization domain for completed tags.
///
/// At most one thread invokes handlers drawn from a strand's queue at any
/// instant, realized with a compare-and-swap on the draining flag rather
/// than a dedicated thread per domain. Tags drain in FIFO arrival order.
pub struct Strand {
    id: StrandId,
    queue: Mutex<VecDeque<ResolvedTag>>,
    running: AtomicBool,
}

impl Strand {
    pub(crate) fn create(id: StrandId) -> Arc<Self> {
        Arc::new(Self {
            id,
            queue: Mutex::default(),
            running: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn id(&self) -> StrandId {
        self.id
    }

    /// Appends a completed tag to the pending queue. Safe from any thread.
    pub(crate) fn enqueue(&self, tag: ResolvedTag) {
        self.queue.lock().unwrap().push_back(tag);
    }

    /// Attempts to drain the queue, invoking every queued handler in arrival
    /// order and releasing each tag back to its pool after invocation.
    ///
    /// Returns the number of handlers run, or 0 immediately if another drain
    /// holds the running flag; the caller must re-trigger later. The flag is
    /// cleared under the queue lock once the queue is observed empty, so an
    /// enqueue can never land between the emptiness check and the release of
    /// the flag.
    pub fn try_run(&self) -> usize {
        if self
            .running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return 0;
        }

        let mut ran = 0;
        loop {
            let next = {
                let mut queue = self.queue.lock().unwrap();
                match queue.pop_front() {
                    Some(tag) => tag,
                    None => {
                        self.running.store(false, Ordering::Release);
                        break;
                    }
                }
            };
            next.run();
            ran += 1;
        }
        ran
    }

    pub fn has_work(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }
}

impl std::fmt::Debug for Strand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strand")
            .field("id", &self.id)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{TagPool, TagRecord};
    use std::sync::atomic::AtomicU32;

    fn enqueue_handler<F>(pool: &Arc<TagPool>, strand: &Arc<Strand>, handler: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let id = pool.allocate(TagRecord {
            handler: Box::new(handler),
            strand: Some(strand.clone()),
            watchdog: false,
        });
        strand.enqueue(pool.resolve(id, true));
    }

    #[test]
    fn test_fifo_order() {
        let pool = TagPool::create(8);
        let strand = Strand::create(StrandId(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        for value in 0..4 {
            let order = order.clone();
            enqueue_handler(&pool, &strand, move |_| {
                order.lock().unwrap().push(value);
            });
        }

        assert_eq!(strand.try_run(), 4);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(pool.allocations(), 0);
    }

    #[test]
    fn test_exactly_once_across_concurrent_drains() {
        let pool = TagPool::create(256);
        let strand = Strand::create(StrandId(2));
        let ran = Arc::new(AtomicU32::new(0));
        let active = Arc::new(AtomicBool::new(false));

        for _ in 0..200 {
            let ran = ran.clone();
            let active = active.clone();
            enqueue_handler(&pool, &strand, move |_| {
                assert!(
                    !active.swap(true, Ordering::SeqCst),
                    "two handlers from one strand ran concurrently"
                );
                std::thread::yield_now();
                active.store(false, Ordering::SeqCst);
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        let total: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let strand = &strand;
                    scope.spawn(move || {
                        let mut count = 0;
                        while strand.has_work() {
                            count += strand.try_run();
                        }
                        count
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });

        assert_eq!(total, 200);
        assert_eq!(ran.load(Ordering::SeqCst), 200);
        assert_eq!(pool.allocations(), 0);
    }

    #[test]
    fn test_enqueue_during_drain_is_observed() {
        let pool = TagPool::create(8);
        let strand = Strand::create(StrandId(3));
        let ran = Arc::new(AtomicU32::new(0));

        {
            let inner_pool = pool.clone();
            let inner_strand = strand.clone();
            let ran_outer = ran.clone();
            let ran_inner = ran.clone();
            enqueue_handler(&pool, &strand, move |_| {
                ran_outer.fetch_add(1, Ordering::SeqCst);
                let id = inner_pool.allocate(TagRecord {
                    handler: Box::new(move |_| {
                        ran_inner.fetch_add(1, Ordering::SeqCst);
                    }),
                    strand: Some(inner_strand.clone()),
                    watchdog: false,
                });
                inner_strand.enqueue(inner_pool.resolve(id, true));
            });
        }

        // The tag enqueued by the running handler is drained by the same call.
        assert_eq!(strand.try_run(), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }
}
