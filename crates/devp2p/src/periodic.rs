//! A cooperative periodic scheduler.
//!
//! Jobs are keyed by their [`Job::id`] and fire on the event channel every
//! `interval`, earliest first. The timer task sleeps until the next
//! deadline, so adding and removing jobs while it runs is cheap and safe.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch, Notify},
    time::Instant,
};
use tracing::trace;

use crate::error::DispatcherError;

/// Something the dispatcher can schedule; identity is the id string.
pub trait Job: Send + Sync + 'static {
    /// Unique identity of the job.
    fn id(&self) -> &str;
}

struct Tracked {
    job: Arc<dyn Job>,
    interval: Duration,
    version: u64,
}

#[derive(PartialEq, Eq)]
struct HeapEntry {
    at: Instant,
    version: u64,
    id: String,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.version).cmp(&(other.at, other.version))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct State {
    tracked: HashMap<String, Tracked>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    next_version: u64,
}

impl State {
    /// Deadline of the earliest entry that still belongs to a tracked job.
    /// Stale heap entries (removed or re-added jobs) are discarded here.
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            match self.tracked.get(&entry.id) {
                Some(tracked) if tracked.version == entry.version => return Some(entry.at),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Pops the due entry, reschedules it and returns the job to deliver.
    fn fire(&mut self) -> Option<Arc<dyn Job>> {
        let Reverse(entry) = self.heap.pop()?;
        let tracked = self.tracked.get(&entry.id)?;
        if tracked.version != entry.version {
            return None
        }
        self.heap.push(Reverse(HeapEntry {
            at: Instant::now() + tracked.interval,
            version: tracked.version,
            id: entry.id,
        }));
        Some(tracked.job.clone())
    }
}

struct Inner {
    state: Mutex<State>,
    /// Wakes the timer task after heap mutations.
    notify: Notify,
    enabled: watch::Sender<bool>,
    events_tx: mpsc::Sender<Arc<dyn Job>>,
}

/// Handle to the periodic scheduler. Clones share one timer task.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("tracked", &self.tracked()).finish()
    }
}

impl Dispatcher {
    /// Creates the dispatcher and its event stream, and spawns the timer
    /// task on the current runtime. The dispatcher starts disabled.
    ///
    /// The timer task exits once the event receiver is dropped.
    pub fn new() -> (Self, mpsc::Receiver<Arc<dyn Job>>) {
        let (events_tx, events_rx) = mpsc::channel(1);
        let (enabled, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            enabled,
            events_tx,
        });
        tokio::spawn(run(inner.clone()));
        (Self { inner }, events_rx)
    }

    /// Schedules a job to fire every `interval`.
    pub fn add(&self, job: Arc<dyn Job>, interval: Duration) -> Result<(), DispatcherError> {
        let id = job.id().to_string();
        {
            let mut state = self.inner.state.lock().expect("dispatcher lock poisoned");
            if state.tracked.contains_key(&id) {
                return Err(DispatcherError::AlreadyTracked)
            }
            state.next_version += 1;
            let version = state.next_version;
            state.heap.push(Reverse(HeapEntry {
                at: Instant::now() + interval,
                version,
                id: id.clone(),
            }));
            state.tracked.insert(id.clone(), Tracked { job, interval, version });
        }
        trace!(target: "devp2p::periodic", %id, ?interval, "job added");
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Stops firing the job with the given id.
    pub fn remove(&self, id: &str) -> Result<(), DispatcherError> {
        let removed = self
            .inner
            .state
            .lock()
            .expect("dispatcher lock poisoned")
            .tracked
            .remove(id)
            .is_some();
        if !removed {
            return Err(DispatcherError::NotFound)
        }
        trace!(target: "devp2p::periodic", %id, "job removed");
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Whether a job with the given id is scheduled.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.state.lock().expect("dispatcher lock poisoned").tracked.contains_key(id)
    }

    /// Ids of all scheduled jobs.
    pub fn tracked(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .expect("dispatcher lock poisoned")
            .tracked
            .keys()
            .cloned()
            .collect()
    }

    /// Enables or disables delivery. While disabled nothing fires; overdue
    /// jobs fire once re-enabled.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.send_replace(enabled);
    }
}

async fn run(inner: Arc<Inner>) {
    let mut enabled = inner.enabled.subscribe();
    loop {
        if !*enabled.borrow_and_update() {
            if enabled.changed().await.is_err() {
                return
            }
            continue
        }

        let deadline = inner.state.lock().expect("dispatcher lock poisoned").next_deadline();
        match deadline {
            None => {
                tokio::select! {
                    _ = inner.notify.notified() => {}
                    res = enabled.changed() => if res.is_err() { return },
                }
            }
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {
                        let fired =
                            inner.state.lock().expect("dispatcher lock poisoned").fire();
                        if let Some(job) = fired {
                            // delivery is synchronous with the consumer, as
                            // the rest of the schedule can wait
                            if inner.events_tx.send(job).await.is_err() {
                                return
                            }
                        }
                    }
                    _ = inner.notify.notified() => {}
                    res = enabled.changed() => if res.is_err() { return },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct DummyJob {
        id: String,
    }

    fn job(id: &str) -> Arc<dyn Job> {
        Arc::new(DummyJob { id: id.to_string() })
    }

    impl Job for DummyJob {
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn dispatcher() -> (Dispatcher, mpsc::Receiver<Arc<dyn Job>>) {
        let (d, events) = Dispatcher::new();
        d.set_enabled(true);
        (d, events)
    }

    async fn wait_for_event(events: &mut mpsc::Receiver<Arc<dyn Job>>, id: &str) {
        let got = events.recv().await.expect("dispatcher gone");
        assert_eq!(got.id(), id);
    }

    #[tokio::test]
    async fn add_job() {
        let (d, _events) = dispatcher();
        d.add(job("a"), Duration::from_secs(1)).unwrap();
        assert_eq!(d.tracked().len(), 1);
        assert!(d.contains("a"));

        assert_eq!(d.add(job("a"), Duration::from_secs(1)), Err(DispatcherError::AlreadyTracked));
    }

    #[tokio::test]
    async fn remove_job() {
        let (d, _events) = dispatcher();
        d.add(job("a"), Duration::from_secs(1)).unwrap();
        d.remove("a").unwrap();
        assert!(d.tracked().is_empty());

        assert_eq!(d.remove("a"), Err(DispatcherError::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn fires_periodically_until_disabled() {
        let (d, mut events) = dispatcher();
        d.add(job("a"), Duration::from_millis(100)).unwrap();

        wait_for_event(&mut events, "a").await;
        wait_for_event(&mut events, "a").await;

        d.set_enabled(false);
        tokio::select! {
            evnt = events.recv() => panic!("unexpected event {:?}", evnt.map(|e| e.id().to_string())),
            _ = tokio::time::sleep(Duration::from_millis(150)) => {}
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interleaves_multiple_jobs_by_deadline() {
        let (d, mut events) = dispatcher();
        d.add(job("a"), Duration::from_millis(100)).unwrap();
        d.add(job("b"), Duration::from_millis(210)).unwrap();

        for expected in ["a", "a", "b", "a", "a", "b"] {
            wait_for_event(&mut events, expected).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn removed_jobs_do_not_fire_from_stale_heap_entries() {
        let (d, mut events) = dispatcher();
        d.add(job("a"), Duration::from_millis(50)).unwrap();
        d.remove("a").unwrap();
        d.add(job("b"), Duration::from_millis(100)).unwrap();

        wait_for_event(&mut events, "b").await;
    }
}
