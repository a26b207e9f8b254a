//! Client id → live delivery queue registry.
//!
//! Every registry mutation goes through one coordinating task, so callers
//! never share a lock with each other. Delivery never waits on a subscriber:
//! a subscriber whose queue is full is evicted and its queue closed.

use crate::errors::{ExportError, ExportResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Commands handled by the hub's coordinating task.
#[derive(Debug)]
enum HubCommand {
    Register {
        client_id: String,
        subscriber_id: u64,
        sender: mpsc::Sender<String>,
    },
    Unregister {
        client_id: String,
        subscriber_id: u64,
    },
    Notify {
        client_id: String,
        message: String,
    },
    Stats {
        response: oneshot::Sender<HubStats>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Snapshot of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub subscribers: usize,
    pub delivered: u64,
    pub dropped_unknown: u64,
    pub evicted: u64,
}

struct Registered {
    subscriber_id: u64,
    sender: mpsc::Sender<String>,
}

pub struct NotificationHub {
    commands: mpsc::UnboundedSender<HubCommand>,
    queue_capacity: usize,
    next_subscriber_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationHub {
    /// Start the hub. Each subscriber gets a queue of `queue_capacity` messages.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(queue_capacity: usize) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(Self::coordinate(receiver));
        Self {
            commands,
            queue_capacity: queue_capacity.max(1),
            next_subscriber_id: AtomicU64::new(1),
            task: Mutex::new(Some(task)),
        }
    }

    /// Register `client_id` and return its delivery queue. A previous
    /// subscription under the same id is replaced and closed.
    pub fn subscribe(&self, client_id: impl Into<String>) -> ExportResult<Subscription> {
        let client_id = client_id.into();
        let subscriber_id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        self.commands
            .send(HubCommand::Register {
                client_id: client_id.clone(),
                subscriber_id,
                sender,
            })
            .map_err(|_| ExportError::QueueClosed)?;
        Ok(Subscription {
            client_id,
            subscriber_id,
            receiver,
            commands: self.commands.clone(),
        })
    }

    /// Queue `message` for `client_id`. Never waits; unknown clients are ignored.
    pub fn notify(&self, client_id: &str, message: impl Into<String>) {
        let command = HubCommand::Notify {
            client_id: client_id.to_string(),
            message: message.into(),
        };
        if self.commands.send(command).is_err() {
            log::debug!("Notification for {} dropped: hub is shut down", client_id);
        }
    }

    pub async fn stats(&self) -> ExportResult<HubStats> {
        let (response, rx) = oneshot::channel();
        self.commands
            .send(HubCommand::Stats { response })
            .map_err(|_| ExportError::QueueClosed)?;
        rx.await.map_err(|_| ExportError::QueueClosed)
    }

    /// Close every subscriber queue and stop the coordinating task.
    pub async fn shutdown(&self) {
        let (response, rx) = oneshot::channel();
        if self.commands.send(HubCommand::Shutdown { response }).is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Notification hub task ended abnormally: {}", e);
            }
        }
    }

    async fn coordinate(mut commands: mpsc::UnboundedReceiver<HubCommand>) {
        let mut registry: HashMap<String, Registered> = HashMap::new();
        let mut stats = HubStats::default();

        while let Some(command) = commands.recv().await {
            match command {
                HubCommand::Register {
                    client_id,
                    subscriber_id,
                    sender,
                } => {
                    log::debug!("Subscriber {} registered for {}", subscriber_id, client_id);
                    if let Some(old) = registry.insert(client_id.clone(), Registered { subscriber_id, sender }) {
                        log::info!(
                            "Subscriber {} for {} replaced by {}",
                            old.subscriber_id,
                            client_id,
                            subscriber_id
                        );
                    }
                }
                HubCommand::Unregister {
                    client_id,
                    subscriber_id,
                } => {
                    let current = registry.get(&client_id).map(|r| r.subscriber_id);
                    if current == Some(subscriber_id) {
                        registry.remove(&client_id);
                        log::debug!("Subscriber {} for {} unregistered", subscriber_id, client_id);
                    }
                }
                HubCommand::Notify { client_id, message } => {
                    let Some(registered) = registry.get(&client_id) else {
                        stats.dropped_unknown += 1;
                        continue;
                    };
                    match registered.sender.try_send(message) {
                        Ok(()) => stats.delivered += 1,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            log::warn!("Evicting slow subscriber for {}: queue full", client_id);
                            registry.remove(&client_id);
                            stats.evicted += 1;
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            registry.remove(&client_id);
                        }
                    }
                }
                HubCommand::Stats { response } => {
                    let _ = response.send(HubStats {
                        subscribers: registry.len(),
                        ..stats.clone()
                    });
                }
                HubCommand::Shutdown { response } => {
                    log::info!("Notification hub shutting down with {} subscribers", registry.len());
                    registry.clear();
                    let _ = response.send(());
                    break;
                }
            }
        }
    }
}

impl Drop for NotificationHub {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

/// One registered subscriber's end of the hub. Dropping it unregisters.
pub struct Subscription {
    client_id: String,
    subscriber_id: u64,
    receiver: mpsc::Receiver<String>,
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl Subscription {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Next message, or `None` once the hub closed this queue and it is drained.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }

    /// Unregister and drop the queue.
    pub fn close(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.commands.send(HubCommand::Unregister {
            client_id: self.client_id.clone(),
            subscriber_id: self.subscriber_id,
        });
    }
}
