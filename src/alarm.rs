use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::{Reactor, Strand};

/// Cross-thread, exactly-once-armed deferred trigger.
///
/// The transport's one-shot trigger forbids re-arming before the previous
/// arm has fired. `Alarm` makes that protocol safe to drive from arbitrary
/// threads: a compare-and-swap on the armed flag guarantees at most one
/// outstanding arm, and concurrent triggers coalesce into it. The fired
/// handler must call [`reset`](Self::reset) before further triggers succeed.
///
/// Callers must not assume delivery timing beyond "eventually, via the
/// reactor's drain loop".
pub struct Alarm {
    reactor: Arc<Reactor>,
    armed: AtomicBool,
}

impl Alarm {
    #[must_use]
    pub fn new(reactor: Arc<Reactor>) -> Self {
        Self {
            reactor,
            armed: AtomicBool::new(false),
        }
    }

    /// Arms the trigger if it is not already armed, creating a tag for
    /// `handler` (on `strand` if provided) and posting it for immediate
    /// delivery. Returns false if an arm was already outstanding; the call
    /// is then a safe no-op and `handler` is dropped.
    pub fn trigger<F>(&self, strand: Option<&Arc<Strand>>, handler: F) -> bool
    where
        F: FnOnce(bool) + Send + 'static,
    {
        if self
            .armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let tag = self.reactor.create_tag(strand, handler);
        self.reactor.arm(tag);
        true
    }

    /// Clears the armed flag. Called by the fired handler once it is safe to
    /// accept the next trigger.
    pub fn reset(&self) {
        self.armed.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Alarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Alarm")
            .field("armed", &self.is_armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ReactorConfig, mem::MemCompletionQueue};
    use std::{
        sync::atomic::AtomicU32,
        time::Duration,
    };

    #[test]
    fn test_trigger_coalesces() {
        let queue = MemCompletionQueue::create();
        let reactor = Reactor::create(queue, &ReactorConfig::default());
        let alarm = Arc::new(Alarm::new(reactor.clone()));
        let fired = Arc::new(AtomicU32::new(0));

        {
            let fired = fired.clone();
            assert!(alarm.trigger(None, move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }
        {
            let fired = fired.clone();
            assert!(!alarm.trigger(None, move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }

        assert_eq!(reactor.run_for(Duration::ZERO), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        alarm.reset();
        {
            let fired = fired.clone();
            assert!(alarm.trigger(None, move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(reactor.run_for(Duration::ZERO), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_triggers_issue_one_arm() {
        let queue = MemCompletionQueue::create();
        let reactor = Reactor::create(queue, &ReactorConfig::default());
        let alarm = Arc::new(Alarm::new(reactor.clone()));
        let fired = Arc::new(AtomicU32::new(0));

        let armed: u32 = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let alarm = alarm.clone();
                    let fired = fired.clone();
                    scope.spawn(move || {
                        u32::from(alarm.trigger(None, move |_| {
                            fired.fetch_add(1, Ordering::SeqCst);
                        }))
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });

        assert_eq!(armed, 1);
        assert_eq!(reactor.run_for(Duration::ZERO), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(reactor.outstanding_tags(), 0);
    }
}
