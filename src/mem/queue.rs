use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use crate::{CompletionSource, Polled, TagId};

struct QueueInner {
    ready: VecDeque<(TagId, bool)>,
    stopping: bool,
}

/// Process-local completion queue.
///
/// Completions post from any thread and drain through
/// [`CompletionSource::poll`]. After shutdown, everything already posted is
/// still delivered before [`Polled::Shutdown`] is reported, which is what
/// lets the reactor's final drain resolve every in-flight tag.
pub struct MemCompletionQueue {
    inner: Mutex<QueueInner>,
    ready_cv: Condvar,
}

impl MemCompletionQueue {
    pub fn create() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                ready: VecDeque::new(),
                stopping: false,
            }),
            ready_cv: Condvar::new(),
        })
    }

    pub(crate) fn post_with(&self, tag: TagId, ok: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.ready.push_back((tag, ok));
        self.ready_cv.notify_all();
    }
}

impl CompletionSource for MemCompletionQueue {
    fn poll(&self, wait: Option<Duration>) -> Polled {
        let mut inner = self.inner.lock().unwrap();
        match wait {
            Some(wait) if wait.is_zero() => {}
            Some(wait) => {
                let deadline = Instant::now() + wait;
                while !inner.stopping && inner.ready.is_empty() {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _) = self
                        .ready_cv
                        .wait_timeout(inner, deadline - now)
                        .unwrap();
                    inner = guard;
                }
            }
            None => {
                while !inner.stopping && inner.ready.is_empty() {
                    inner = self.ready_cv.wait(inner).unwrap();
                }
            }
        }

        if let Some((tag, ok)) = inner.ready.pop_front() {
            Polled::Completion { tag, ok }
        } else if inner.stopping {
            Polled::Shutdown
        } else {
            Polled::Timeout
        }
    }

    fn post(&self, tag: TagId) {
        self.post_with(tag, true);
    }

    fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stopping = true;
        self.ready_cv.notify_all();
    }
}

impl std::fmt::Debug for MemCompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("MemCompletionQueue")
            .field("ready", &inner.ready.len())
            .field("stopping", &inner.stopping)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TagId;

    #[test]
    fn test_poll_semantics() {
        let queue = MemCompletionQueue::create();
        assert_eq!(queue.poll(Some(Duration::ZERO)), Polled::Timeout);
        assert_eq!(
            queue.poll(Some(Duration::from_millis(5))),
            Polled::Timeout
        );

        let tag = TagId::new(7, 0);
        queue.post(tag);
        assert_eq!(
            queue.poll(Some(Duration::ZERO)),
            Polled::Completion { tag, ok: true }
        );
        assert_eq!(queue.poll(Some(Duration::ZERO)), Polled::Timeout);
    }

    #[test]
    fn test_shutdown_drains_before_reporting() {
        let queue = MemCompletionQueue::create();
        let tag = TagId::new(1, 0);
        queue.post_with(tag, false);
        queue.shutdown();

        assert_eq!(
            queue.poll(None),
            Polled::Completion { tag, ok: false }
        );
        assert_eq!(queue.poll(None), Polled::Shutdown);
        assert_eq!(queue.poll(Some(Duration::ZERO)), Polled::Shutdown);
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let queue = MemCompletionQueue::create();
        let tag = TagId::new(3, 0);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(10));
                queue.post(tag);
            });
            assert_eq!(
                queue.poll(Some(Duration::from_secs(5))),
                Polled::Completion { tag, ok: true }
            );
        });
    }
}
