//! Host rendition of device streams and events.
//!
//! Each stream is a FIFO worker thread: submitted closures run in order,
//! asynchronously from the submitting thread, which is exactly the contract
//! the process group builds its event discipline on. Events capture a
//! position in one stream's timeline; another stream waiting on an event
//! parks its worker until that position is reached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};

use crate::store::lock;
use crate::types::DeviceIndex;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Cheap handle to one host stream. Clones alias the same queue.
#[derive(Clone)]
pub struct HostStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    id: u64,
    device: DeviceIndex,
    tx: mpsc::Sender<Job>,
    submitted: AtomicU64,
    progress: Arc<Progress>,
}

struct Progress {
    done: Mutex<u64>,
    cv: Condvar,
}

impl HostStream {
    pub(crate) fn spawn(id: u64, device: DeviceIndex) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let progress = Arc::new(Progress {
            done: Mutex::new(0),
            cv: Condvar::new(),
        });
        let worker_progress = Arc::clone(&progress);
        std::thread::Builder::new()
            .name(format!("host-stream-{device}-{id}"))
            .spawn(move || {
                for job in rx.iter() {
                    job();
                    let mut done = lock(&worker_progress.done);
                    *done += 1;
                    worker_progress.cv.notify_all();
                }
            })
            .expect("spawning a stream worker thread");
        Self {
            inner: Arc::new(StreamInner {
                id,
                device,
                tx,
                submitted: AtomicU64::new(0),
                progress,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn device(&self) -> DeviceIndex {
        self.inner.device
    }

    /// Enqueue a closure. Submission never blocks; execution is in FIFO
    /// order on the worker.
    pub(crate) fn submit(&self, job: impl FnOnce() + Send + 'static) {
        self.inner.submitted.fetch_add(1, Ordering::SeqCst);
        // A send failure means the worker is gone; the matching synchronize
        // would hang, so surface it loudly.
        self.inner
            .tx
            .send(Box::new(job))
            .expect("stream worker terminated");
    }

    /// Block the host until every job submitted so far has run.
    pub(crate) fn synchronize(&self) {
        let target = self.inner.submitted.load(Ordering::SeqCst);
        let mut done = lock(&self.inner.progress.done);
        while *done < target {
            let (guard, _timeout) = self
                .inner
                .progress
                .cv
                .wait_timeout(done, std::time::Duration::from_millis(50))
                .unwrap_or_else(|e| e.into_inner());
            done = guard;
        }
    }
}

/// Cheap handle to a host event. Clones alias the same event.
#[derive(Clone)]
pub struct HostEvent {
    inner: Arc<EventInner>,
}

struct EventInner {
    device: DeviceIndex,
    state: Mutex<EventState>,
    cv: Condvar,
}

#[derive(Default)]
struct EventState {
    /// Generation of the most recent `record`.
    last_record: u64,
    /// Highest generation whose captured work has completed.
    last_complete: u64,
}

impl HostEvent {
    pub(crate) fn new(device: DeviceIndex) -> Self {
        Self {
            inner: Arc::new(EventInner {
                device,
                state: Mutex::new(EventState::default()),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn device(&self) -> DeviceIndex {
        self.inner.device
    }

    /// Capture `stream`'s current position. Re-recording moves the capture
    /// point forward.
    pub(crate) fn record(&self, stream: &HostStream) {
        let generation = {
            let mut state = lock(&self.inner.state);
            state.last_record += 1;
            state.last_record
        };
        let event = Arc::clone(&self.inner);
        stream.submit(move || {
            let mut state = lock(&event.state);
            if generation > state.last_complete {
                state.last_complete = generation;
            }
            event.cv.notify_all();
        });
    }

    /// Whether the captured work has completed. Never-recorded events
    /// report ready, matching driver semantics.
    pub(crate) fn query(&self) -> bool {
        let state = lock(&self.inner.state);
        state.last_complete >= state.last_record
    }

    /// Park `stream` until the work captured at the current record point
    /// completes. A never-recorded event is a no-op.
    pub(crate) fn block_stream(&self, stream: &HostStream) {
        let target = lock(&self.inner.state).last_record;
        if target == 0 {
            return;
        }
        let event = Arc::clone(&self.inner);
        stream.submit(move || {
            let mut state = lock(&event.state);
            while state.last_complete < target {
                let (guard, _timeout) = event
                    .cv
                    .wait_timeout(state, std::time::Duration::from_millis(50))
                    .unwrap_or_else(|e| e.into_inner());
                state = guard;
            }
        });
    }
}
