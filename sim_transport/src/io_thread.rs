//! A thread that runs posted tasks in order.

use crossbeam::channel::{self, Sender};
use log::trace;
use std::io;
use std::thread::{self, JoinHandle, ThreadId};

type Task = Box<dyn FnOnce() + Send>;

/// Single-threaded task runner standing in for a channel's I/O thread.
///
/// Tasks run in the order they were posted. Dropping the handle stops the
/// thread once queued tasks have run.
pub struct IoThread {
    tasks: Option<Sender<Task>>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl IoThread {
    pub fn spawn(name: &str) -> io::Result<Self> {
        let (tasks, queue) = channel::unbounded::<Task>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for task in queue {
                    task();
                }
                trace!("I/O thread {:?} stopped", thread::current().name());
            })?;
        let thread_id = handle.thread().id();

        Ok(Self {
            tasks: Some(tasks),
            handle: Some(handle),
            thread_id,
        })
    }

    /// Queues `task`. Returns `false` if the thread has stopped.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.tasks
            .as_ref()
            .is_some_and(|tasks| tasks.send(Box::new(task)).is_ok())
    }

    /// Blocks until every task posted before this call has run.
    pub fn flush(&self) {
        if thread::current().id() == self.thread_id {
            return;
        }
        let (done, wait) = channel::bounded(1);
        if self.post(move || {
            let _ = done.send(());
        }) {
            let _ = wait.recv();
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.tasks.take();
        if let Some(handle) = self.handle.take() {
            // The last owner may be a task running on this very thread.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_tasks_run_in_order_on_io_thread() {
        let io = IoThread::spawn("test-io").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for index in 0..5 {
            let seen = Arc::clone(&seen);
            assert!(io.post(move || seen.lock().push((index, thread::current().id()))));
        }
        io.flush();

        let seen = seen.lock();
        assert_eq!(seen.iter().map(|(index, _)| *index).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert!(seen.iter().all(|(_, thread)| *thread == io.thread_id()));
        assert_ne!(io.thread_id(), thread::current().id());
    }

    #[test]
    fn test_drop_runs_queued_tasks() {
        let seen = Arc::new(Mutex::new(0));
        {
            let io = IoThread::spawn("test-io").unwrap();
            for _ in 0..3 {
                let seen = Arc::clone(&seen);
                io.post(move || *seen.lock() += 1);
            }
        }
        assert_eq!(*seen.lock(), 3);
    }
}
