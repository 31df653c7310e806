//! In-order host command queues.
//!
//! Each queue owns a worker thread that drains commands in FIFO order. A
//! command first waits on its dependency events, then runs, then completes
//! its own event, so dependencies may span queues.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use flux_rs::error::{BackendError, BackendResult};
use smallvec::SmallVec;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

struct EventState {
    id: u64,
    done: Mutex<bool>,
    cond: Condvar,
}

/// Completion flag of one queued command.
#[derive(Clone)]
pub struct HostEvent {
    state: Arc<EventState>,
}

impl std::fmt::Debug for HostEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEvent")
            .field("id", &self.state.id)
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl HostEvent {
    fn new() -> Self {
        Self {
            state: Arc::new(EventState {
                id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
                done: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn is_complete(&self) -> bool {
        *self.state.done.lock().expect("host event poisoned")
    }

    pub fn wait(&self) {
        let mut done = self.state.done.lock().expect("host event poisoned");
        while !*done {
            done = self.state.cond.wait(done).expect("host event poisoned");
        }
    }

    fn complete(&self) {
        *self.state.done.lock().expect("host event poisoned") = true;
        self.state.cond.notify_all();
    }
}

/// One traced command: what it waited on and when it ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub label: String,
    pub event: u64,
    pub waited_on: Vec<u64>,
    pub started: u64,
    pub finished: u64,
}

/// Start/finish sequence numbers shared by every queue of a backend.
#[derive(Default)]
pub struct LaunchTrace {
    clock: AtomicU64,
    records: Mutex<Vec<TraceRecord>>,
}

impl LaunchTrace {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        let mut records = self.records.lock().expect("launch trace poisoned").clone();
        records.sort_by_key(|record| record.started);
        records
    }

    pub fn find(&self, label: &str) -> Option<TraceRecord> {
        self.records().into_iter().find(|record| record.label == label)
    }

    pub fn clear(&self) {
        self.records.lock().expect("launch trace poisoned").clear();
    }

    fn push(&self, record: TraceRecord) {
        self.records.lock().expect("launch trace poisoned").push(record);
    }
}

pub type HostJob = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run {
        label: String,
        job: HostJob,
        wait_for: SmallVec<[HostEvent; 4]>,
        event: HostEvent,
        traced: bool,
    },
    Shutdown,
}

pub struct HostQueue {
    sender: Mutex<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl HostQueue {
    pub fn new(trace: Option<Arc<LaunchTrace>>) -> BackendResult<Self> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let worker = thread::Builder::new()
            .name("flux-rs-host-queue".to_string())
            .spawn(move || {
                while let Ok(command) = receiver.recv() {
                    let Command::Run {
                        label,
                        job,
                        wait_for,
                        event,
                        traced,
                    } = command
                    else {
                        break;
                    };
                    for dep in &wait_for {
                        dep.wait();
                    }
                    let started = trace.as_ref().map(|t| t.tick());
                    job();
                    if let (true, Some(trace), Some(started)) = (traced, trace.as_ref(), started) {
                        trace.push(TraceRecord {
                            label,
                            event: event.id(),
                            waited_on: wait_for.iter().map(HostEvent::id).collect(),
                            started,
                            finished: trace.tick(),
                        });
                    }
                    event.complete();
                }
            })
            .map_err(|err| BackendError::execution(format!("failed to spawn host queue: {err}")))?;
        Ok(Self {
            sender: Mutex::new(sender),
            worker: Some(worker),
        })
    }

    fn send(&self, command: Command) -> BackendResult<()> {
        self.sender
            .lock()
            .expect("host queue sender poisoned")
            .send(command)
            .map_err(|_| BackendError::execution("host queue worker has exited"))
    }

    /// Enqueues `job` behind `wait_for` and returns its completion event.
    pub fn submit(
        &self,
        label: impl Into<String>,
        wait_for: &[HostEvent],
        job: HostJob,
    ) -> BackendResult<HostEvent> {
        let event = HostEvent::new();
        self.send(Command::Run {
            label: label.into(),
            job,
            wait_for: wait_for.iter().cloned().collect(),
            event: event.clone(),
            traced: true,
        })?;
        Ok(event)
    }

    /// Blocks until every command submitted so far has run.
    pub fn finish(&self) -> BackendResult<()> {
        let event = HostEvent::new();
        self.send(Command::Run {
            label: String::new(),
            job: Box::new(|| {}),
            wait_for: SmallVec::new(),
            event: event.clone(),
            traced: false,
        })?;
        event.wait();
        Ok(())
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        if let Ok(sender) = self.sender.lock() {
            let _ = sender.send(Command::Shutdown);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
