// Copyright © 2020 the courier developers
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of this software
// and associated documentation files (the "Software"), to deal in the Software without
// restriction, including without limitation the rights to use, copy, modify, merge, publish,
// distribute, sublicense, and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all copies or
// substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING
// BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM,
// DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! The two-thread lifecycle shared by clients and servers.
//!
//! Each connection runs a receiver thread (blocking on the socket with a short timeout) and a
//! transmitter thread (flushing on a fixed cadence). Termination is cooperative: anyone may
//! raise the flag, both workers observe it at their next loop boundary, and the last one out
//! runs the termination callback.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use crate::net::NetError;

/// Flag shared between the worker threads and whoever wants to stop them.
pub struct WorkerShared {
    terminate: AtomicBool,
}

impl WorkerShared {
    pub fn new() -> Arc<WorkerShared> {
        Arc::new(WorkerShared {
            terminate: AtomicBool::new(false),
        })
    }

    pub fn should_terminate(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// Raises the termination flag. Never blocks, so it is safe to call from a worker thread
    /// or from inside a handler callback.
    pub fn request_termination(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }
}

/// Owns the receiver and transmitter threads of one connection.
pub struct NetWorker {
    shared: Arc<WorkerShared>,
    receiver: Option<JoinHandle<()>>,
    transmitter: Option<JoinHandle<()>>,
}

impl NetWorker {
    /// Spawns the two worker threads.
    ///
    /// `run_receiver` and `run_transmitter` are the full loop bodies; they are expected to poll
    /// `WorkerShared::should_terminate` and return when it is raised. `on_terminated` runs
    /// exactly once, on whichever thread exits last.
    pub fn start<R, T, F>(
        name: &str,
        shared: Arc<WorkerShared>,
        run_receiver: R,
        run_transmitter: T,
        on_terminated: F,
    ) -> Result<NetWorker, NetError>
    where
        R: FnOnce() + Send + 'static,
        T: FnOnce() + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let alive = Arc::new(AtomicUsize::new(2));
        let on_terminated = Arc::new(Mutex::new(Some(Box::new(on_terminated) as Box<dyn FnOnce() + Send>)));

        let make_exit = |alive: Arc<AtomicUsize>,
                         on_terminated: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>| {
            move || {
                if alive.fetch_sub(1, Ordering::SeqCst) == 1 {
                    if let Some(callback) = on_terminated.lock().unwrap().take() {
                        callback();
                    }
                }
            }
        };

        let recv_exit = make_exit(Arc::clone(&alive), Arc::clone(&on_terminated));
        let trans_exit = make_exit(alive, on_terminated);

        let receiver = thread::Builder::new()
            .name(format!("{}-recv", name))
            .spawn(move || {
                run_receiver();
                recv_exit();
            })?;

        let transmitter = thread::Builder::new()
            .name(format!("{}-send", name))
            .spawn(move || {
                run_transmitter();
                trans_exit();
            })?;

        Ok(NetWorker {
            shared,
            receiver: Some(receiver),
            transmitter: Some(transmitter),
        })
    }

    pub fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    /// Raises the termination flag without waiting for the workers.
    pub fn terminate(&self) {
        self.shared.request_termination();
    }

    /// Raises the termination flag and joins both workers.
    ///
    /// Joining a worker from itself would deadlock, so a handle belonging to the calling
    /// thread is left to finish on its own.
    pub fn terminate_and_join(&mut self) {
        self.shared.request_termination();

        let current = thread::current().id();
        for handle in vec![self.receiver.take(), self.transmitter.take()] {
            if let Some(handle) = handle {
                if handle.thread().id() == current {
                    continue;
                }
                if handle.join().is_err() {
                    error!("worker thread panicked");
                }
            }
        }
    }
}

impl Drop for NetWorker {
    fn drop(&mut self) {
        self.terminate_and_join();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_workers_run_and_terminate() {
        let shared = WorkerShared::new();
        let recv_laps = Arc::new(AtomicU32::new(0));
        let trans_laps = Arc::new(AtomicU32::new(0));
        let terminated = Arc::new(AtomicU32::new(0));

        let mut worker = {
            let shared_r = Arc::clone(&shared);
            let shared_t = Arc::clone(&shared);
            let recv_laps = Arc::clone(&recv_laps);
            let trans_laps = Arc::clone(&trans_laps);
            let terminated = Arc::clone(&terminated);

            NetWorker::start(
                "test",
                Arc::clone(&shared),
                move || {
                    while !shared_r.should_terminate() {
                        recv_laps.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(1));
                    }
                },
                move || {
                    while !shared_t.should_terminate() {
                        trans_laps.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(1));
                    }
                },
                move || {
                    terminated.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap()
        };

        thread::sleep(Duration::from_millis(20));
        worker.terminate_and_join();

        assert!(recv_laps.load(Ordering::SeqCst) > 0);
        assert!(trans_laps.load(Ordering::SeqCst) > 0);
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_termination_requested_from_worker() {
        let shared = WorkerShared::new();
        let terminated = Arc::new(AtomicU32::new(0));

        let mut worker = {
            let shared_r = Arc::clone(&shared);
            let shared_t = Arc::clone(&shared);
            let terminated = Arc::clone(&terminated);

            NetWorker::start(
                "test",
                Arc::clone(&shared),
                move || {
                    // a worker may decide to shut the connection down itself
                    shared_r.request_termination();
                },
                move || {
                    while !shared_t.should_terminate() {
                        thread::sleep(Duration::from_millis(1));
                    }
                },
                move || {
                    terminated.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap()
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
        worker.terminate_and_join();
    }
}
