// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A scheduler that caps how many units of work run at the same time.
//!
//! The assembly runner posts one unit of work per test collection. With a limit of `n`, exactly
//! `n` dedicated worker threads pull work from a FIFO queue, so no more than `n` collections are
//! ever in flight regardless of what else is running in the process.

use crate::{
    aggregator::panic_message,
    errors::{SchedulerShutdownError, SpawnError},
};
use crossbeam_channel::{Receiver, SendError, Sender};
use std::{
    fmt,
    num::NonZeroUsize,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
};
use tracing::Span;

/// How many units of work a [`MaxConcurrencyScheduler`] runs at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConcurrencyLimit {
    /// Run at most this many units of work at once, on this many dedicated threads.
    Limited(NonZeroUsize),

    /// Run every unit of work on its own thread as soon as it is posted.
    Unlimited,
}

impl ConcurrencyLimit {
    /// The maximum number of units of work in flight, or `None` if unlimited.
    pub fn max(self) -> Option<usize> {
        match self {
            Self::Limited(n) => Some(n.get()),
            Self::Unlimited => None,
        }
    }
}

impl fmt::Display for ConcurrencyLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{n}"),
            Self::Unlimited => write!(f, "unlimited"),
        }
    }
}

type Work = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work, along with the span that was current when it was posted.
struct WorkItem {
    span: Span,
    work: Work,
}

impl WorkItem {
    fn new(work: Work) -> Self {
        Self {
            span: Span::current(),
            work,
        }
    }

    fn run(self) {
        let WorkItem { span, work } = self;
        let _guard = span.enter();
        // Work posted by the runners never panics, since user code is run through an
        // aggregator. Catch panics anyway so that a worker thread stays alive.
        if let Err(payload) = catch_unwind(AssertUnwindSafe(work)) {
            tracing::error!(
                "scheduled work panicked: {}",
                panic_message(payload.as_ref())
            );
        }
    }
}

enum Dispatch {
    Pool(Sender<WorkItem>),
    PerItem(Vec<JoinHandle<()>>),
}

struct SchedulerShared {
    // None once shut down.
    dispatch: Mutex<Option<Dispatch>>,
}

impl SchedulerShared {
    fn post(&self, work: Work) {
        let item = WorkItem::new(work);
        let inline = {
            let mut dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
            match dispatch.as_mut() {
                Some(Dispatch::Pool(sender)) => match sender.send(item) {
                    Ok(()) => None,
                    // All workers are gone, which only happens if they were joined.
                    Err(SendError(item)) => Some(item),
                },
                Some(Dispatch::PerItem(handles)) => spawn_per_item(handles, item),
                None => Some(item),
            }
        };

        if let Some(item) = inline {
            tracing::debug!("scheduler is shut down, running work inline");
            item.run();
        }
    }
}

fn spawn_per_item(handles: &mut Vec<JoinHandle<()>>, item: WorkItem) -> Option<WorkItem> {
    let slot = Arc::new(Mutex::new(Some(item)));
    let thread_slot = slot.clone();
    let name = format!("trellis-work-{}", handles.len());
    let res = thread::Builder::new().name(name.clone()).spawn(move || {
        let item = thread_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(item) = item {
            item.run();
        }
    });

    match res {
        Ok(handle) => {
            handles.push(handle);
            None
        }
        Err(err) => {
            tracing::warn!("failed to spawn thread `{name}`, running work inline: {err}");
            slot.lock().unwrap_or_else(PoisonError::into_inner).take()
        }
    }
}

/// A fixed-size pool of worker threads with a FIFO work queue.
///
/// Work posted after [`shutdown`](Self::shutdown) runs inline on the posting thread, so that
/// completions are never lost. Dropping a scheduler that was not shut down shuts it down.
pub struct MaxConcurrencyScheduler {
    limit: ConcurrencyLimit,
    shared: Arc<SchedulerShared>,
    workers: Vec<JoinHandle<()>>,
}

impl MaxConcurrencyScheduler {
    /// Creates a scheduler, spawning its worker threads.
    pub fn new(limit: ConcurrencyLimit) -> Result<Self, SpawnError> {
        let (dispatch, workers) = match limit {
            ConcurrencyLimit::Limited(n) => {
                let (sender, receiver) = crossbeam_channel::unbounded();
                let mut workers = Vec::with_capacity(n.get());
                for idx in 0..n.get() {
                    match spawn_worker(idx, receiver.clone()) {
                        Ok(handle) => workers.push(handle),
                        Err(err) => {
                            // Disconnect the channel so already-spawned workers exit.
                            drop(sender);
                            join_all(workers);
                            return Err(err);
                        }
                    }
                }
                (Dispatch::Pool(sender), workers)
            }
            ConcurrencyLimit::Unlimited => (Dispatch::PerItem(Vec::new()), Vec::new()),
        };

        tracing::debug!(%limit, "scheduler started");
        Ok(Self {
            limit,
            shared: Arc::new(SchedulerShared {
                dispatch: Mutex::new(Some(dispatch)),
            }),
            workers,
        })
    }

    /// The concurrency limit of this scheduler.
    pub fn limit(&self) -> ConcurrencyLimit {
        self.limit
    }

    /// Returns a handle that can post work from other threads.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Posts a unit of work. Never blocks.
    pub fn post(&self, work: impl FnOnce() + Send + 'static) {
        self.shared.post(Box::new(work));
    }

    /// Signals shutdown, lets the workers drain the queue, and joins them.
    ///
    /// Calling this more than once is a lifecycle bug in the caller and returns an error.
    pub fn shutdown(&mut self) -> Result<(), SchedulerShutdownError> {
        let dispatch = self
            .shared
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SchedulerShutdownError::AlreadyShutDown)?;

        match dispatch {
            // Dropping the sender disconnects the channel: workers exit once it is empty.
            Dispatch::Pool(sender) => drop(sender),
            Dispatch::PerItem(handles) => join_all(handles),
        }
        join_all(std::mem::take(&mut self.workers));

        tracing::debug!(limit = %self.limit, "scheduler shut down");
        Ok(())
    }

    fn is_shut_down(&self) -> bool {
        self.shared
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl fmt::Debug for MaxConcurrencyScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaxConcurrencyScheduler")
            .field("limit", &self.limit)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl Drop for MaxConcurrencyScheduler {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            _ = self.shutdown();
        }
    }
}

/// A cloneable handle used to post work to a [`MaxConcurrencyScheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<SchedulerShared>,
}

impl SchedulerHandle {
    /// Posts a unit of work. Never blocks.
    pub fn post(&self, work: impl FnOnce() + Send + 'static) {
        self.shared.post(Box::new(work));
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle").finish_non_exhaustive()
    }
}

fn spawn_worker(idx: usize, receiver: Receiver<WorkItem>) -> Result<JoinHandle<()>, SpawnError> {
    let name = format!("trellis-worker-{idx}");
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            // Blocks until work is available; ends once the channel is disconnected and empty.
            for item in receiver.iter() {
                item.run();
            }
        })
        .map_err(|err| SpawnError::new(name, err))
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            tracing::error!("scheduler thread panicked");
        }
    }
}
