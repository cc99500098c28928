//! Bounded FIFO of create-requests from the reflector to the worker.
//!
//! The queue is the only backpressure between the client accept rate and
//! the worker: when it is full, [`CreateQueue::push`] waits. Its receiving
//! end belongs to at most one `PushCreateRequests` stream at a time.

use std::cmp::Ordering;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio_stream::Stream;
use tracing::debug;

use rproxy_proto::v1::CreateRequest;

use crate::session::{self, Session};

struct QueueReceiver {
    rx: mpsc::Receiver<CreateRequest>,
    /// A request from a newer session pulled by a stream that was ending.
    stash: Option<CreateRequest>,
}

pub struct CreateQueue {
    tx: mpsc::Sender<CreateRequest>,
    receiver: Arc<Mutex<QueueReceiver>>,
}

impl CreateQueue {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        Self {
            tx,
            receiver: Arc::new(Mutex::new(QueueReceiver { rx, stash: None })),
        }
    }

    /// Enqueue `request`, waiting for room when the queue is full.
    pub async fn push(&self, request: CreateRequest) {
        // The receiver lives inside `self`, so the channel cannot close.
        if let Err(mpsc::error::SendError(request)) = self.tx.send(request).await {
            debug!(id = request.id, epoch = request.epoch, "Create-request queue closed");
        }
    }

    /// Number of queued requests.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stream the queue to the worker of session `epoch`.
    ///
    /// The stream waits for any previous stream to let go of the receiver,
    /// skips requests queued under older sessions, and ends as soon as
    /// `epoch` is no longer the active session.
    pub fn subscribe(
        &self,
        epoch: u64,
        mut sessions: watch::Receiver<Option<Session>>,
    ) -> impl Stream<Item = CreateRequest> + Send + 'static {
        let receiver = Arc::clone(&self.receiver);
        async_stream::stream! {
            let mut guard = tokio::select! {
                guard = receiver.lock_owned() => guard,
                () = session::superseded(&mut sessions, epoch) => return,
            };

            loop {
                let next = match guard.stash.take() {
                    Some(request) => Some(request),
                    None => tokio::select! {
                        biased;
                        () = session::superseded(&mut sessions, epoch) => None,
                        request = guard.rx.recv() => request,
                    },
                };
                let Some(request) = next else { break };

                match request.epoch.cmp(&epoch) {
                    Ordering::Less => {
                        debug!(id = request.id, epoch = request.epoch, "Skipping stale create request");
                    }
                    Ordering::Equal => yield request,
                    Ordering::Greater => {
                        guard.stash = Some(request);
                        break;
                    }
                }
            }
            debug!(epoch, "Create-request stream finished");
        }
    }
}
