//! Outbound message queue and its delivery worker.
//!
//! Producers append to one global FIFO and return immediately. A single
//! worker drains it: each item is sealed for its target, sent, and the reply
//! awaited. Anything but `message sent` puts the item back at the tail, so
//! delivery is at-least-once and a stuck target delays everything behind it.

use crate::network::AddressBook;
use crate::transport::{self, Command, Message, MessageCodec};
use crate::utils::{ChatError, DeliveryConfig, NetworkConfig, NetworkError, ProtocolError, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;

/// A pending outbound message
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    /// Message before sealing; encrypted per attempt for the target's current key
    pub message: Message,
    /// Address book name of the recipient
    pub target: String,
    /// Delivery attempts made so far
    pub attempts: u32,
}

/// FIFO of pending messages
#[derive(Debug, Default)]
pub struct OutboundQueue {
    items: Mutex<VecDeque<QueueItem>>,
    ready: Notify,
}

impl OutboundQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new message for `target`
    pub fn enqueue(&self, message: Message, target: impl Into<String>) {
        self.push(QueueItem {
            message,
            target: target.into(),
            attempts: 0,
        });
    }

    /// Put an item back at the tail
    pub fn requeue(&self, item: QueueItem) {
        self.push(item);
    }

    fn push(&self, item: QueueItem) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(item);
        self.ready.notify_one();
    }

    /// Take the head item, waiting while the queue is empty
    pub async fn next(&self) -> QueueItem {
        loop {
            if let Some(item) = self.try_next() {
                return item;
            }
            self.ready.notified().await;
        }
    }

    /// Take the head item if there is one
    pub fn try_next(&self) -> Option<QueueItem> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Number of pending items
    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the pending items in delivery order
    pub fn pending(&self) -> Vec<QueueItem> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Retry policy for the delivery worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Give up after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Pause after each failed attempt
    pub retry_delay: Duration,
}

impl DeliveryPolicy {
    /// Returns true once an item with `attempts` tries must not be retried
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::from(&DeliveryConfig::default())
    }
}

impl From<&DeliveryConfig> for DeliveryPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

/// Delivery outcome hooks for the user interface
pub trait DeliveryObserver: Send + Sync {
    /// A delivery attempt for `item` failed
    fn notify_send_failure(&self, item: &QueueItem, error: &ChatError);

    /// `item` was acknowledged
    fn notify_delivered(&self, _item: &QueueItem) {}
}

/// The single consumer draining an [`OutboundQueue`]
pub struct DeliveryWorker {
    queue: Arc<OutboundQueue>,
    book: Arc<RwLock<AddressBook>>,
    codec: MessageCodec,
    network: NetworkConfig,
    policy: DeliveryPolicy,
    observer: Arc<dyn DeliveryObserver>,
}

impl DeliveryWorker {
    /// Worker resolving targets through `book` and sealing with `codec`
    pub fn new(
        queue: Arc<OutboundQueue>,
        book: Arc<RwLock<AddressBook>>,
        codec: MessageCodec,
        network: NetworkConfig,
        policy: DeliveryPolicy,
        observer: Arc<dyn DeliveryObserver>,
    ) -> Self {
        Self {
            queue,
            book,
            codec,
            network,
            policy,
            observer,
        }
    }

    /// Drain the queue until `cancel` fires
    ///
    /// An item in flight when cancellation arrives goes back to the queue.
    pub async fn run(self, cancel: CancellationToken) {
        log::info!("Delivery worker started");

        loop {
            let mut item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = self.queue.next() => item,
            };
            item.attempts += 1;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                outcome = self.deliver(&item) => Some(outcome),
            };
            let Some(outcome) = outcome else {
                item.attempts -= 1;
                self.queue.requeue(item);
                break;
            };

            match outcome {
                Ok(()) => {
                    log::debug!("Delivered message to {} after {} attempt(s)", item.target, item.attempts);
                    self.observer.notify_delivered(&item);
                }
                Err(e) => {
                    log::warn!("Failed to send to {} (attempt {}): {}", item.target, item.attempts, e);
                    if self.policy.exhausted(item.attempts) {
                        log::error!(
                            "Dropping message to {} after {} attempts",
                            item.target,
                            item.attempts
                        );
                        self.observer.notify_send_failure(&item, &e);
                    } else {
                        let failed = item.clone();
                        self.queue.requeue(item);
                        self.observer.notify_send_failure(&failed, &e);

                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.policy.retry_delay) => {}
                        }
                    }
                }
            }
        }

        log::info!("Delivery worker stopped with {} pending", self.queue.len());
    }

    /// One delivery attempt
    pub async fn deliver(&self, item: &QueueItem) -> Result<()> {
        let record = self
            .book
            .read()
            .await
            .get(&item.target)
            .cloned()
            .ok_or_else(|| NetworkError::UnknownPeer {
                name: item.target.clone(),
            })?;

        let envelope = self.codec.seal(&item.message, &record.public_key())?;
        let reply = transport::request_once(&record.socket_address(), &envelope, &self.network).await?;

        match reply.command {
            Command::MessageSent => Ok(()),
            other => Err(ProtocolError::UnexpectedReply {
                expected: Command::MessageSent.to_string(),
                actual: other.to_string(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TextbookRsa;
    use crate::network::AddressRecord;
    use crate::transport::ChatMessage;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counting {
        failures: AtomicU32,
        delivered: AtomicU32,
    }

    impl DeliveryObserver for Counting {
        fn notify_send_failure(&self, _item: &QueueItem, _error: &ChatError) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }

        fn notify_delivered(&self, _item: &QueueItem) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn chat(text: &str) -> Message {
        Message::Chat(ChatMessage::new(text))
    }

    fn worker(
        queue: &Arc<OutboundQueue>,
        book: AddressBook,
        policy: DeliveryPolicy,
        observer: &Arc<Counting>,
    ) -> DeliveryWorker {
        DeliveryWorker::new(
            Arc::clone(queue),
            Arc::new(RwLock::new(book)),
            MessageCodec::new("alice", None, Arc::new(TextbookRsa)),
            NetworkConfig::default(),
            policy,
            Arc::clone(observer) as Arc<dyn DeliveryObserver>,
        )
    }

    async fn wait_for(counter: &AtomicU32, at_least: u32) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while counter.load(Ordering::SeqCst) < at_least {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("counter never reached target");
    }

    #[test]
    fn test_fifo_order() {
        let queue = OutboundQueue::new();
        queue.enqueue(chat("one"), "bob");
        queue.enqueue(chat("two"), "carol");
        queue.enqueue(chat("three"), "bob");

        let targets: Vec<_> = queue.pending().into_iter().map(|i| i.target).collect();
        assert_eq!(targets, ["bob", "carol", "bob"]);
        assert_eq!(queue.try_next().unwrap().target, "bob");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_next_waits_for_enqueue() {
        let queue = OutboundQueue::new();
        let mut next = tokio_test::task::spawn(queue.next());
        tokio_test::assert_pending!(next.poll());

        queue.enqueue(chat("late"), "bob");
        assert!(next.is_woken());
        let item = tokio_test::assert_ready!(next.poll());
        assert_eq!(item.target, "bob");
        drop(next);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_policy() {
        let forever = DeliveryPolicy::default();
        assert!(!forever.exhausted(u32::MAX));

        let capped = DeliveryPolicy {
            max_attempts: Some(3),
            retry_delay: Duration::ZERO,
        };
        assert!(!capped.exhausted(2));
        assert!(capped.exhausted(3));
    }

    #[tokio::test]
    async fn test_failing_target_stays_queued() {
        let queue = Arc::new(OutboundQueue::new());
        let observer = Arc::new(Counting::default());
        let policy = DeliveryPolicy {
            max_attempts: None,
            retry_delay: Duration::from_millis(5),
        };
        // "bob" is not in the book, so every attempt fails
        let worker = worker(&queue, AddressBook::in_memory(), policy, &observer);
        queue.enqueue(chat("hello"), "bob");

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        wait_for(&observer.failures, 5).await;
        cancel.cancel();
        handle.await.unwrap();

        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target, "bob");
        assert!(pending[0].attempts >= 5);
        assert_eq!(observer.delivered.load(Ordering::SeqCst), 0);
        assert!(observer.failures.load(Ordering::SeqCst) >= pending[0].attempts - 1);
    }

    #[tokio::test]
    async fn test_capped_retries_drop_item() {
        let queue = Arc::new(OutboundQueue::new());
        let observer = Arc::new(Counting::default());
        let policy = DeliveryPolicy {
            max_attempts: Some(2),
            retry_delay: Duration::from_millis(5),
        };
        let worker = worker(&queue, AddressBook::in_memory(), policy, &observer);
        queue.enqueue(chat("hello"), "bob");

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        wait_for(&observer.failures, 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(queue.is_empty());
        assert_eq!(observer.failures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_acknowledged_delivery() {
        use futures::{SinkExt, StreamExt};
        use tokio_util::codec::{Framed, LinesCodec};

        let listener = transport::bind("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LinesCodec::new());
            let line = framed.next().await.unwrap().unwrap();
            let reply = Message::MessageSent.into_plain_envelope("bob").unwrap();
            framed.send(reply.to_line().unwrap()).await.unwrap();
            line
        });

        let mut book = AddressBook::in_memory();
        book.replace(AddressRecord::plaintext("bob", "127.0.0.1", port));
        let queue = Arc::new(OutboundQueue::new());
        let observer = Arc::new(Counting::default());
        let worker = worker(&queue, book, DeliveryPolicy::default(), &observer);
        queue.enqueue(chat("hello bob"), "bob");

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        wait_for(&observer.delivered, 1).await;
        cancel.cancel();
        handle.await.unwrap();

        // Plaintext sentinel: content is the plain JSON body
        let line = peer.await.unwrap();
        let envelope = transport::Envelope::from_line(&line).unwrap();
        assert_eq!(envelope.command, Command::Message);
        assert_eq!(envelope.content["text"], "hello bob");
        assert!(queue.is_empty());
        assert_eq!(observer.failures.load(Ordering::SeqCst), 0);
    }
}
