//! Local delivery queues attached to bridge topics

use aghast_core::Message;
use tokio::sync::mpsc;

/// Default capacity of a local queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Sending side of a local queue, used to attach it to topics
///
/// Two handles are equal when they feed the same queue.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<Message>,
}

impl QueueHandle {
    /// Push a message, waiting while the queue is full
    pub async fn send(&self, message: Message) -> Result<(), mpsc::error::SendError<Message>> {
        self.tx.send(message).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PartialEq for QueueHandle {
    fn eq(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

impl Eq for QueueHandle {}

/// A bounded queue of broker messages owned by one consumer
///
/// Several topics may feed the same queue; see
/// [`Bridge::subscribe_to_topic_using_chan`](crate::Bridge::subscribe_to_topic_using_chan).
#[derive(Debug)]
pub struct LocalQueue {
    handle: QueueHandle,
    rx: mpsc::Receiver<Message>,
}

impl LocalQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            handle: QueueHandle { tx },
            rx,
        }
    }

    /// Handle identifying this queue when attaching or detaching topics
    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Message, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
