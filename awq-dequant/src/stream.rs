use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    thread::{self, JoinHandle},
};

use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    oneshot,
};
use tracing::{debug, warn};

use crate::{utils::log::once_log_warn, AwqError, Result};

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

enum Message {
    Run(Job),
    Sync(oneshot::Sender<Result<()>>),
}

/// An in-order execution queue backed by one worker thread.
///
/// Work is run in submission order. The first failure since the last `synchronize` is kept and
/// returned by the next `synchronize`; later work still runs. Dropping the stream drains the
/// queue before returning.
pub struct Stream {
    sender: Option<UnboundedSender<Message>>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("open", &self.sender.is_some())
            .finish()
    }
}

fn run_worker(mut rx: UnboundedReceiver<Message>) {
    let mut pending: Option<AwqError> = None;
    while let Some(msg) = rx.blocking_recv() {
        match msg {
            Message::Run(job) => {
                let res = match catch_unwind(AssertUnwindSafe(job)) {
                    Ok(res) => res,
                    Err(_) => Err(AwqError::Device("stream work panicked".to_string())),
                };
                if let Err(e) = res {
                    warn!("Stream work failed: {e}");
                    pending.get_or_insert(e);
                }
            }
            Message::Sync(done) => {
                // The waiter may have given up; nothing to report to.
                let _ = done.send(pending.take().map_or(Ok(()), Err));
            }
        }
    }
    if let Some(e) = pending {
        once_log_warn(format!("Stream dropped with an unreported failure: {e}"));
    }
}

impl Stream {
    pub fn new() -> Result<Self> {
        let (tx, rx) = unbounded_channel();
        let worker = thread::Builder::new()
            .name("awq-stream".to_string())
            .spawn(move || run_worker(rx))
            .map_err(|e| AwqError::Device(format!("failed to start stream worker: {e}")))?;
        debug!("Created stream");
        Ok(Self {
            sender: Some(tx),
            worker: Some(worker),
        })
    }

    fn send(&self, msg: Message) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| AwqError::Device("stream is closed".to_string()))?
            .send(msg)
            .map_err(|_| AwqError::Device("stream worker has exited".to_string()))
    }

    /// Queue `work` behind everything already submitted.
    pub fn enqueue<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.send(Message::Run(Box::new(work)))
    }

    /// Block until all queued work has run, returning the first failure among it.
    pub fn synchronize(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Message::Sync(tx))?;
        rx.blocking_recv()
            .map_err(|_| AwqError::Device("stream worker has exited".to_string()))?
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop once the queue is empty.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Stream worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use super::Stream;
    use crate::AwqError;

    #[test]
    fn test_runs_in_order() {
        let stream = Stream::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..32 {
            let log = log.clone();
            stream
                .enqueue(move || {
                    log.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_first_error_is_reported_once() {
        let stream = Stream::new().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        stream
            .enqueue(|| Err(AwqError::InvalidShape("first".to_string())))
            .unwrap();
        stream
            .enqueue(|| Err(AwqError::InvalidDtype("second".to_string())))
            .unwrap();
        let r = ran.clone();
        stream
            .enqueue(move || {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(
            stream.synchronize().unwrap_err(),
            AwqError::InvalidShape("first".to_string())
        );
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        stream.synchronize().unwrap();
    }

    #[test]
    fn test_panic_becomes_device_error() {
        let stream = Stream::new().unwrap();
        stream.enqueue(|| panic!("boom")).unwrap();
        assert!(matches!(stream.synchronize(), Err(AwqError::Device(_))));
        stream.enqueue(|| Ok(())).unwrap();
        stream.synchronize().unwrap();
    }

    #[test]
    fn test_drop_drains_queue() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let stream = Stream::new().unwrap();
            for _ in 0..8 {
                let ran = ran.clone();
                stream
                    .enqueue(move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap();
            }
        }
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }
}
