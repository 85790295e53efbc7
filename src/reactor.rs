use std::{
    collections::{HashSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use foldhash::fast::RandomState;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

use crate::{
    CompletionSource, Polled, Strand, StrandId, TagId, TagPool,
    tag::{ResolvedTag, TagRecord},
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ReactorConfig {
    /// Fixed tag pool size; allocation beyond it is fatal.
    #[serde_inline_default(1024)]
    pub tag_capacity: usize,
    /// Completions processed between strand table sweeps.
    #[serde_inline_default(256)]
    pub sweep_interval: u64,
    /// Drain slice length used by blocking endpoint shutdowns.
    #[serde_inline_default(1)]
    pub shutdown_poll_ms: u64,
    /// Upper bound on shutdown drain slices before giving up.
    #[serde_inline_default(10_000)]
    pub shutdown_max_polls: u64,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

/// Completion-queue driven execution context.
///
/// Owns the transport's completion source, the tag pool, the strand table
/// and the un-keyed completion backlog. One logical thread drives
/// [`run_for`](Self::run_for) or [`run`](Self::run); tag creation, strand
/// creation and alarm triggering are safe from any producer thread
/// concurrently with an active drain.
pub struct Reactor {
    source: Arc<dyn CompletionSource>,
    pool: Arc<TagPool>,
    strands: DashMap<StrandId, Arc<Strand>, RandomState>,
    backlog: Mutex<VecDeque<ResolvedTag>>,
    pending: Mutex<HashSet<StrandId, RandomState>>,
    stopping: AtomicBool,
    processed: AtomicU64,
    strand_seq: AtomicU64,
    config: ReactorConfig,
}

impl Reactor {
    pub fn create(source: Arc<dyn CompletionSource>, config: &ReactorConfig) -> Arc<Self> {
        Arc::new(Self {
            source,
            pool: TagPool::create(config.tag_capacity),
            strands: DashMap::default(),
            backlog: Mutex::default(),
            pending: Mutex::default(),
            stopping: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            strand_seq: AtomicU64::new(1),
            config: config.clone(),
        })
    }

    /// Drains ready notifications for up to `duration`, then runs every
    /// resolved handler. Returns the number of handlers run.
    ///
    /// Each round performs one bounded wait for the first notification and
    /// then a zero-wait poll loop for the rest of the ready batch, so a
    /// steadily completing transport cannot starve handler execution.
    pub fn run_for(&self, duration: Duration) -> usize {
        let deadline = Instant::now() + duration;
        let mut processed = 0;
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            match self.source.poll(Some(wait)) {
                Polled::Completion { tag, ok } => {
                    self.route(self.pool.resolve(tag, ok));
                    self.drain_ready();
                }
                Polled::Timeout => {}
                Polled::Shutdown => return processed + self.flush(),
            }
            processed += self.flush();
            if Instant::now() >= deadline {
                return processed;
            }
        }
    }

    /// Like [`run_for`](Self::run_for), but blocks until the completion
    /// source reports shutdown.
    pub fn run(&self) -> usize {
        let mut processed = 0;
        loop {
            match self.source.poll(None) {
                Polled::Completion { tag, ok } => {
                    self.route(self.pool.resolve(tag, ok));
                    self.drain_ready();
                    processed += self.flush();
                }
                Polled::Timeout => {}
                Polled::Shutdown => return processed + self.flush(),
            }
        }
    }

    /// Allocates a tag for `handler`, queued on `strand` when provided.
    /// Safe from any thread.
    pub fn create_tag<F>(&self, strand: Option<&Arc<Strand>>, handler: F) -> TagId
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.pool.allocate(TagRecord {
            handler: Box::new(handler),
            strand: strand.cloned(),
            watchdog: false,
        })
    }

    /// Variant of [`create_tag`](Self::create_tag) for teardown watchdog
    /// registrations. Tracked separately because the transport is known to
    /// drop such tags during its own shutdown; leftovers show up in the
    /// shutdown diagnostics instead of leaking silently.
    pub fn create_teardown_tag<F>(&self, strand: Option<&Arc<Strand>>, handler: F) -> TagId
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.pool.allocate(TagRecord {
            handler: Box::new(handler),
            strand: strand.cloned(),
            watchdog: true,
        })
    }

    /// Allocates a fresh strand and registers it in the table. Ownership is
    /// shared between the caller and the table; once the caller (and any
    /// in-flight tags) let go, a periodic sweep reclaims the entry.
    pub fn create_strand(&self) -> Arc<Strand> {
        let id = StrandId(self.strand_seq.fetch_add(1, Ordering::Relaxed));
        let strand = Strand::create(id);
        self.strands.insert(id, strand.clone());
        strand
    }

    /// Shuts down the completion source and drains everything still in
    /// flight, so no tag ever resolves after this returns. Idempotent.
    pub fn shutdown(&self) {
        if self
            .stopping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.source.shutdown();
        self.run();

        let leftover = self.pool.allocations();
        if leftover > 0 {
            tracing::warn!(
                "reactor shut down with {leftover} completion tags outstanding \
                 ({} teardown watchdogs); the transport leaked tags during teardown",
                self.pool.watchdog_allocations()
            );
        }
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn outstanding_tags(&self) -> usize {
        self.pool.allocations()
    }

    pub fn strand_count(&self) -> usize {
        self.strands.len()
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    pub(crate) fn arm(&self, tag: TagId) {
        self.source.post(tag);
    }

    /// Zero-wait poll loop draining the currently ready batch.
    fn drain_ready(&self) {
        loop {
            match self.source.poll(Some(Duration::ZERO)) {
                Polled::Completion { tag, ok } => self.route(self.pool.resolve(tag, ok)),
                Polled::Timeout | Polled::Shutdown => return,
            }
        }
    }

    fn route(&self, tag: ResolvedTag) {
        match tag.strand().cloned() {
            Some(strand) => {
                let id = strand.id();
                strand.enqueue(tag);
                self.pending.lock().unwrap().insert(id);
            }
            None => self.backlog.lock().unwrap().push_back(tag),
        }
    }

    /// Runs the un-keyed backlog in arrival order, then every strand with
    /// pending work. Returns the number of handlers run.
    fn flush(&self) -> usize {
        let mut count = 0;
        loop {
            let next = self.backlog.lock().unwrap().pop_front();
            let Some(tag) = next else { break };
            tag.run();
            count += 1;
        }

        let ready: Vec<StrandId> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };
        for id in ready {
            let Some(strand) = self.strands.get(&id).map(|entry| entry.value().clone()) else {
                continue;
            };
            count += strand.try_run();
            if strand.has_work() {
                self.pending.lock().unwrap().insert(id);
            }
        }

        if count > 0 {
            self.account(count as u64);
        }
        count
    }

    fn account(&self, count: u64) {
        let interval = self.config.sweep_interval;
        if interval == 0 {
            return;
        }
        let total = self.processed.fetch_add(count, Ordering::Relaxed) + count;
        if total / interval != (total - count) / interval {
            self.sweep();
        }
    }

    /// Removes strand table entries with no holders beyond the table itself.
    fn sweep(&self) {
        self.strands
            .retain(|_, strand| Arc::strong_count(strand) > 1 || strand.has_work());
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("pool", &self.pool)
            .field("strands", &self.strands.len())
            .field("stopping", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemCompletionQueue;
    use std::sync::atomic::AtomicU32;

    fn reactor_with_queue(config: &ReactorConfig) -> (Arc<MemCompletionQueue>, Arc<Reactor>) {
        let queue = MemCompletionQueue::create();
        (queue.clone(), Reactor::create(queue, config))
    }

    #[test]
    fn test_backlog_runs_in_arrival_order() {
        let (queue, reactor) = reactor_with_queue(&ReactorConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        for value in 0..3 {
            let order = order.clone();
            let tag = reactor.create_tag(None, move |_| {
                order.lock().unwrap().push(value);
            });
            queue.post(tag);
        }

        assert_eq!(reactor.run_for(Duration::ZERO), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(reactor.outstanding_tags(), 0);
    }

    #[test]
    fn test_strand_routing_serializes() {
        let (queue, reactor) = reactor_with_queue(&ReactorConfig::default());
        let strand = reactor.create_strand();
        let order = Arc::new(Mutex::new(Vec::new()));

        for value in 0..4 {
            let order = order.clone();
            let tag = reactor.create_tag(Some(&strand), move |_| {
                order.lock().unwrap().push(value);
            });
            queue.post(tag);
        }

        assert_eq!(reactor.run_for(Duration::ZERO), 4);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_failure_flag_reaches_handler() {
        let (queue, reactor) = reactor_with_queue(&ReactorConfig::default());
        let seen = Arc::new(Mutex::new(None));
        {
            let seen = seen.clone();
            let tag = reactor.create_tag(None, move |ok| {
                *seen.lock().unwrap() = Some(ok);
            });
            queue.post_with(tag, false);
        }
        assert_eq!(reactor.run_for(Duration::ZERO), 1);
        assert_eq!(*seen.lock().unwrap(), Some(false));
    }

    #[test]
    fn test_shutdown_drains_in_flight() {
        let (queue, reactor) = reactor_with_queue(&ReactorConfig::default());
        let ran = Arc::new(AtomicU32::new(0));
        {
            let ran = ran.clone();
            let tag = reactor.create_tag(None, move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
            });
            queue.post(tag);
        }

        reactor.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(reactor.outstanding_tags(), 0);

        // Second shutdown is a no-op.
        reactor.shutdown();
    }

    #[test]
    fn test_shutdown_reports_leaked_tags() {
        let (queue, reactor) = reactor_with_queue(&ReactorConfig::default());
        let _never_posted = reactor.create_tag(None, |_| {});
        let posted = reactor.create_tag(None, |_| {});
        queue.post(posted);

        reactor.shutdown();
        assert_eq!(reactor.outstanding_tags(), 1);
    }

    #[test]
    fn test_sweep_reclaims_dropped_strands() {
        let config = ReactorConfig {
            sweep_interval: 1,
            ..ReactorConfig::default()
        };
        let (queue, reactor) = reactor_with_queue(&config);

        let keep = reactor.create_strand();
        drop(reactor.create_strand());
        assert_eq!(reactor.strand_count(), 2);

        let tag = reactor.create_tag(Some(&keep), |_| {});
        queue.post(tag);
        assert_eq!(reactor.run_for(Duration::ZERO), 1);

        assert_eq!(reactor.strand_count(), 1);
        assert_eq!(keep.id(), StrandId(1));
    }

    #[test]
    fn test_default_config() {
        let config = ReactorConfig::default();
        assert_eq!(config.tag_capacity, 1024);
        assert_eq!(config.sweep_interval, 256);

        let parsed: ReactorConfig =
            serde_json::from_str(r#"{"tag_capacity": 8}"#).unwrap();
        assert_eq!(parsed.tag_capacity, 8);
        assert_eq!(parsed.sweep_interval, 256);
    }
}
