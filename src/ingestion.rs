use std::{
    collections::VecDeque,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::{
    cache::{Begin, CacheKey, IncrementCache},
    error::ProcessingFailure,
    increment::ModelIncrement,
    model::TopicModel,
    processor::{ProcessOptions, Processor},
    store::{BatchHandle, DiskGeneration},
};

/// One batch scheduled against one target model.
///
/// Carries the pwt snapshot taken at submission time, so a later remap of
/// the name never changes what an in-flight computation reads.
pub struct WorkItem {
    pub handle: BatchHandle,
    pub model: String,
    pub pwt: Arc<TopicModel>,
    pub options: Arc<ProcessOptions>,
}

type IncrementCallback = Box<dyn Fn(&ModelIncrement) + Send + Sync>;

struct Shared {
    generation: DiskGeneration,
    cache: Arc<IncrementCache>,
    processor: Arc<dyn Processor>,
    queue: Mutex<VecDeque<WorkItem>>,
    queue_cv: Condvar,
    /// Submitted items not yet published: queued plus in flight.
    busy: Mutex<usize>,
    idle_cv: Condvar,
    stopping: AtomicBool,
    callback: RwLock<Option<IncrementCallback>>,
}

/// The computation substrate of a run: a dedicated thread drains submitted
/// work and dispatches it onto a bounded worker pool; results land in the
/// increment cache.
///
/// Each run owns its own instance; there is no ambient global state. The
/// pool worker loads the batch from disk, invokes the processor against
/// the snapshot the item carries, fires the registered callback and
/// publishes the outcome. `wait_idle` is the barrier the iteration
/// controller stands on between pipeline stages.
pub struct IngestionLoop {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl IngestionLoop {
    pub fn new(
        generation: DiskGeneration,
        cache: Arc<IncrementCache>,
        processor: Arc<dyn Processor>,
        workers: NonZeroUsize,
    ) -> Self {
        let shared = Arc::new(Shared {
            generation,
            cache,
            processor,
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            busy: Mutex::new(0),
            idle_cv: Condvar::new(),
            stopping: AtomicBool::new(false),
            callback: RwLock::new(None),
        });

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.get())
            .thread_name(|i| format!("artm-worker-{i}"))
            .build()
            .expect("failed to spawn worker pool");

        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("artm-ingestion".into())
                .spawn(move || drain(shared, pool))
                .expect("failed to spawn ingestion thread")
        };

        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Registers the listener invoked once per successful increment, from
    /// worker threads, before the increment becomes visible in the cache.
    pub fn on_increment(&self, callback: impl Fn(&ModelIncrement) + Send + Sync + 'static) {
        *self.shared.callback.write() = Some(Box::new(callback));
    }

    /// Enqueues a work item. Returns false when the loop is shutting down
    /// and the item was not accepted.
    pub fn submit(&self, item: WorkItem) -> bool {
        // The stop check and the push stay under one queue lock, so a
        // submission can never slip past the shutdown sweep.
        let mut queue = self.shared.queue.lock();
        if self.shared.stopping.load(Ordering::Acquire) {
            return false;
        }
        *self.shared.busy.lock() += 1;
        queue.push_back(item);
        self.shared.queue_cv.notify_one();
        true
    }

    /// Blocks until every item submitted so far has been published,
    /// returning false on timeout.
    ///
    /// Once this returns true, each submitted batch has a ready cache
    /// entry; items submitted afterwards are not covered.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut busy = self.shared.busy.lock();
        while *busy > 0 {
            if self.shared.idle_cv.wait_until(&mut busy, deadline).timed_out() {
                return *busy == 0;
            }
        }
        true
    }

    /// Asks the loop to stop. Queued items are abandoned; in-flight work
    /// completes and is published normally.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.queue_cv.notify_all();
    }
}

impl Drop for IngestionLoop {
    fn drop(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            // SAFETY: the drain thread never panics past its own scope.
            thread.join().expect("ingestion thread panicked");
        }
    }
}

fn drain(shared: Arc<Shared>, pool: rayon::ThreadPool) {
    loop {
        let item = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.stopping.load(Ordering::Acquire) {
                    break None;
                }
                if let Some(item) = queue.pop_front() {
                    break Some(item);
                }
                shared.queue_cv.wait(&mut queue);
            }
        };
        let Some(item) = item else { break };

        let key: CacheKey = (item.handle.id, item.model.clone());
        match shared.cache.try_begin(&key) {
            Begin::AlreadyInFlight => {
                debug!("batch {} already in flight for {}", key.0, key.1);
                finish_one(&shared);
                continue;
            }
            Begin::Started => {}
        }

        let worker_shared = Arc::clone(&shared);
        pool.spawn(move || {
            let outcome = worker_shared
                .generation
                .load(&item.handle)
                .map_err(|e| ProcessingFailure::new(item.handle.id, e.to_string()))
                .and_then(|batch| {
                    worker_shared
                        .processor
                        .process(&batch, &item.pwt, &item.options)
                });

            match &outcome {
                Ok(increment) => {
                    if let Some(callback) = worker_shared.callback.read().as_ref() {
                        callback(increment);
                    }
                }
                Err(failure) => {
                    warn!(batch_id = failure.batch_id.to_string().as_str(); "processing failed: {failure}")
                }
            }

            // SAFETY: try_begin returned Started for this key, so the
            // pending entry exists until we publish it.
            worker_shared.cache.publish(&key, outcome).unwrap();
            finish_one(&worker_shared);
        });
    }

    // Abandoned submissions still count as settled, otherwise a caller
    // blocked in wait_idle would never wake up.
    let abandoned = {
        let mut queue = shared.queue.lock();
        let n = queue.len();
        queue.clear();
        n
    };
    if abandoned > 0 {
        debug!("abandoning {abandoned} queued items on shutdown");
        let mut busy = shared.busy.lock();
        *busy -= abandoned;
        if *busy == 0 {
            shared.idle_cv.notify_all();
        }
    }

    // Dropping the pool waits for in-flight work to publish.
    drop(pool);
}

fn finish_one(shared: &Shared) {
    let mut busy = shared.busy.lock();
    *busy -= 1;
    if *busy == 0 {
        shared.idle_cv.notify_all();
    }
}
