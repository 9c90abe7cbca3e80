use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::thread::JoinHandle;

use tessera_error::TesseraResult;

/// A fixed set of named OS threads, each running the same work function on its own input.
pub struct WorkerPool {
    name: String,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns one thread per input, named `{name}-{index}`.
    ///
    /// Inputs are handed over before any thread starts, so per-worker registration (such as a
    /// slot writer) is complete by the time the first worker can finish.
    pub fn spawn<T, F>(name: &str, inputs: Vec<T>, work: F) -> TesseraResult<Self>
    where
        T: Send + 'static,
        F: Fn(usize, T) + Send + Sync + 'static,
    {
        let work = Arc::new(work);
        let threads = inputs
            .into_iter()
            .enumerate()
            .map(|(idx, input)| {
                let work = work.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{idx}"))
                    .spawn(move || work(idx, input))
                    .map_err(Into::into)
            })
            .collect::<TesseraResult<Vec<_>>>()?;
        log::debug!("spawned {} {name} workers", threads.len());

        Ok(Self {
            name: name.to_string(),
            threads,
        })
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Whether every worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.threads.iter().all(JoinHandle::is_finished)
    }

    /// Blocks until every worker thread has exited.
    pub fn join(self) {
        for (idx, thread) in self.threads.into_iter().enumerate() {
            if let Err(payload) = thread.join() {
                log::warn!(
                    "{}-{idx} exited by panic: {}",
                    self.name,
                    panic_message(payload.as_ref())
                );
            }
        }
        log::debug!("joined {} workers", self.name);
    }
}

impl Debug for WorkerPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("threads", &self.threads.len())
            .finish()
    }
}

/// Extracts the message of a caught panic.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
