//! Bounded request queue
//!
//! The model state has a single owner and no internal locking, so concurrent
//! callers go through a queue served by one worker thread that owns the
//! [`Animator`]. Requests beyond the queue capacity are refused immediately.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use crate::generate::{Animator, GenerateError, GenerationRequest, GenerationResult};

/// Pending requests accepted before `submit` starts refusing
pub const DEFAULT_CAPACITY: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Request queue is full")]
    Full,

    #[error("Request queue worker has stopped")]
    Closed,

    #[error(transparent)]
    Generate(#[from] GenerateError),
}

struct Job {
    request: GenerationRequest,
    base_model: String,
    motion_module: String,
    reply: mpsc::Sender<Result<GenerationResult, GenerateError>>,
}

/// Handle to a submitted request
#[derive(Debug)]
pub struct Ticket {
    reply: Receiver<Result<GenerationResult, GenerateError>>,
}

impl Ticket {
    /// Block until the worker has served the request
    pub fn wait(self) -> Result<GenerationResult, QueueError> {
        match self.reply.recv() {
            Ok(result) => Ok(result?),
            Err(_) => Err(QueueError::Closed),
        }
    }
}

pub struct RequestQueue {
    sender: Option<SyncSender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl RequestQueue {
    /// Move `animator` onto a worker thread serving up to `capacity` pending requests
    pub fn spawn(animator: Animator, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::sync_channel::<Job>(capacity);
        let worker = std::thread::spawn(move || serve(animator, receiver));
        info!(capacity, "Request queue started");
        Self {
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    /// Enqueue a request without blocking
    pub fn submit(
        &self,
        request: GenerationRequest,
        base_model: impl Into<String>,
        motion_module: impl Into<String>,
    ) -> Result<Ticket, QueueError> {
        let sender = self.sender.as_ref().ok_or(QueueError::Closed)?;
        let (reply, receiver) = mpsc::channel();
        let job = Job {
            request,
            base_model: base_model.into(),
            motion_module: motion_module.into(),
            reply,
        };
        match sender.try_send(job) {
            Ok(()) => Ok(Ticket { reply: receiver }),
            Err(TrySendError::Full(_)) => {
                warn!("Request refused, queue full");
                Err(QueueError::Full)
            }
            Err(TrySendError::Disconnected(_)) => Err(QueueError::Closed),
        }
    }

    /// Stop accepting requests and wait for the pending ones to finish
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Request queue worker panicked");
            }
        }
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(mut animator: Animator, receiver: Receiver<Job>) {
    for job in receiver {
        debug!(base_model = %job.base_model, motion_module = %job.motion_module, "Serving request");
        let result = animator.generate(&job.request, &job.base_model, &job.motion_module);
        if let Err(e) = &result {
            warn!("Request failed: {}", e);
        }
        // The caller may have dropped its ticket
        let _ = job.reply.send(result);
    }
    debug!("Request queue drained");
}
