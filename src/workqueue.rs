// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A minimal single-worker deferred-work queue.
//!
//! The interrupt path queues closures here instead of doing anything that may
//! block; the worker drains them in FIFO order. [`WorkQueue::destroy`] runs
//! everything still queued before returning, which is what controller teardown
//! relies on for quiescence.

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

type Work = Box<dyn FnOnce() + Send>;

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

struct State {
    queue: VecDeque<Work>,
    shutting_down: bool,
}

pub(crate) struct WorkQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl WorkQueue {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                shutting_down: false,
            }),
            cv: Condvar::new(),
        });
        let worker = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn({
                let shared = shared.clone();
                move || worker_loop(&shared)
            })?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Queues `work` for the worker thread. Work queued after shutdown began
    /// is dropped.
    pub fn queue<F: FnOnce() + Send + 'static>(&self, work: F) {
        let mut state = self.shared.state.lock();
        if state.shutting_down {
            return;
        }
        state.queue.push_back(Box::new(work));
        drop(state);
        self.shared.cv.notify_one();
    }

    /// Drains all queued work and joins the worker.
    pub fn destroy(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shared.state.lock().shutting_down = true;
        self.shared.cv.notify_one();
        // The worker finishes whatever is queued before exiting.
        let _ = worker.join();
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let work = {
            let mut state = shared.state.lock();
            loop {
                if let Some(work) = state.queue.pop_front() {
                    break work;
                }
                if state.shutting_down {
                    return;
                }
                shared.cv.wait(&mut state);
            }
        };
        work();
    }
}
