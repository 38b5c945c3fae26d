//! BUS — an in-process topic pub/sub, owned exclusively by a single
//! dispatcher task so no subscriber-side locking is ever needed.

use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// Reserved topics alongside the per-tag journal topics.
pub const TOPIC_BL: &str = "bl";
pub const TOPIC_WL: &str = "wl";
pub const TOPIC_TEST: &str = "test";

/// The closed set of payloads a message on the bus can carry. Replaces the
/// dynamically-typed payload the source used with an exhaustively-matched
/// variant.
#[derive(Debug, Clone)]
pub enum Payload {
    JournalMessage(String),
    BanAction {
        toml: String,
        /// The rule file's informational `action` tag (§3); logged alongside
        /// the ban but not part of the persisted decision row.
        action: String,
        ip: String,
        msg: Option<String>,
        check_rbl: bool,
        rbl: Option<String>,
    },
    TestTerminator,
}

#[derive(Debug, Clone)]
pub struct Msg {
    pub topic: String,
    pub data: Payload,
}

enum Ingress {
    Publish(Msg),
    Subscribe {
        topic: String,
        tx: mpsc::Sender<Msg>,
    },
    Unsubscribe {
        topic: String,
        tx: mpsc::Sender<Msg>,
    },
}

/// Handle to the running bus. Cloning is cheap; every clone shares the same
/// dispatcher task via its ingress channel.
#[derive(Clone)]
pub struct Bus {
    ingress: mpsc::Sender<Ingress>,
    /// Announces every (un)subscribe on `sub_<topic>`/`unsub_<topic>` so
    /// diagnostics code can observe bus membership changes.
    diag: broadcast::Sender<String>,
    slow_consumer_drop: bool,
}

const INGRESS_CAP: usize = 4096;
const SUBSCRIBER_CAP: usize = 256;
const SLOW_CONSUMER_RETRY: std::time::Duration = std::time::Duration::from_secs(1);

impl Bus {
    /// Spawns the dispatcher task and returns a handle to it. The task runs
    /// until every clone of the returned handle (and its ingress channel) is
    /// dropped, or `shutdown` fires.
    pub fn spawn(slow_consumer_drop: bool, mut shutdown: broadcast::Receiver<()>) -> Bus {
        let (tx, mut rx) = mpsc::channel::<Ingress>(INGRESS_CAP);
        let (diag_tx, _) = broadcast::channel(64);
        let diag_tx_task = diag_tx.clone();

        tokio::spawn(async move {
            let mut subscribers: HashMap<String, Vec<mpsc::Sender<Msg>>> = HashMap::new();
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        subscribers.clear();
                        return;
                    }
                    item = rx.recv() => {
                        let Some(item) = item else { return };
                        match item {
                            Ingress::Subscribe { topic, tx } => {
                                subscribers.entry(topic.clone()).or_default().push(tx);
                                let _ = diag_tx_task.send(format!("sub_{topic}"));
                            }
                            Ingress::Unsubscribe { topic, tx } => {
                                if let Some(v) = subscribers.get_mut(&topic) {
                                    v.retain(|s| !s.same_channel(&tx));
                                }
                                let _ = diag_tx_task.send(format!("unsub_{topic}"));
                            }
                            Ingress::Publish(msg) => {
                                let Some(subs) = subscribers.get_mut(&msg.topic) else { continue };
                                let mut dead = Vec::new();
                                for (idx, sub) in subs.iter().enumerate() {
                                    if deliver(sub, &msg, slow_consumer_drop).await.is_err() {
                                        dead.push(idx);
                                    }
                                }
                                for idx in dead.into_iter().rev() {
                                    subs.remove(idx);
                                }
                            }
                        }
                    }
                }
            }
        });

        Bus {
            ingress: tx,
            diag: diag_tx,
            slow_consumer_drop,
        }
    }

    pub fn publish(&self, topic: impl Into<String>, data: Payload) {
        let msg = Msg {
            topic: topic.into(),
            data,
        };
        let _ = self.ingress.try_send(Ingress::Publish(msg));
    }

    /// Subscribe a freshly-created queue to `topic`, returning its receiver.
    pub async fn subscribe(&self, topic: impl Into<String>) -> mpsc::Receiver<Msg> {
        self.subscribe_handle(topic).await.1
    }

    /// Like [`Bus::subscribe`], but also returns the sender half registered
    /// with the dispatcher so the caller can later call [`Bus::unsubscribe`]
    /// against the exact same entry.
    pub async fn subscribe_handle(
        &self,
        topic: impl Into<String>,
    ) -> (mpsc::Sender<Msg>, mpsc::Receiver<Msg>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAP);
        let _ = self
            .ingress
            .send(Ingress::Subscribe {
                topic: topic.into(),
                tx: tx.clone(),
            })
            .await;
        (tx, rx)
    }

    pub async fn unsubscribe(&self, topic: impl Into<String>, tx: mpsc::Sender<Msg>) {
        let _ = self
            .ingress
            .send(Ingress::Unsubscribe {
                topic: topic.into(),
                tx,
            })
            .await;
    }

    pub fn diagnostics(&self) -> broadcast::Receiver<String> {
        self.diag.subscribe()
    }

    pub fn slow_consumer_drop(&self) -> bool {
        self.slow_consumer_drop
    }
}

async fn deliver(
    sub: &mpsc::Sender<Msg>,
    msg: &Msg,
    slow_consumer_drop: bool,
) -> Result<(), ()> {
    if !slow_consumer_drop {
        return sub.send(msg.clone()).await.map_err(|_| ());
    }
    match sub.try_send(msg.clone()) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Closed(_)) => Err(()),
        Err(mpsc::error::TrySendError::Full(m)) => {
            tokio::time::sleep(SLOW_CONSUMER_RETRY).await;
            match sub.try_send(m) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(topic = %msg.topic, "slow consumer, unsubscribing");
                    Err(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_delivery_per_topic() {
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let bus = Bus::spawn(false, shutdown_rx);
        let mut rx = bus.subscribe("sshd").await;
        bus.publish("sshd", Payload::JournalMessage("one".into()));
        bus.publish("sshd", Payload::JournalMessage("two".into()));
        tokio::task::yield_now().await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first.data, Payload::JournalMessage(s) if s == "one"));
        assert!(matches!(second.data, Payload::JournalMessage(s) if s == "two"));
    }

    #[tokio::test]
    async fn unrelated_topic_not_delivered() {
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let bus = Bus::spawn(false, shutdown_rx);
        let mut rx = bus.subscribe("sshd").await;
        bus.publish("postfix", Payload::JournalMessage("nope".into()));
        let res = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
        assert!(res.is_err(), "message leaked across topics");
    }

    #[tokio::test]
    async fn shutdown_clears_dispatcher() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let bus = Bus::spawn(false, shutdown_rx);
        let mut rx = bus.subscribe("sshd").await;
        shutdown_tx.send(()).unwrap();
        tokio::task::yield_now().await;
        bus.publish("sshd", Payload::JournalMessage("lost".into()));
        let res = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
        assert!(
            matches!(res, Ok(None)),
            "dispatcher should have dropped subscribers on shutdown"
        );
    }
}
