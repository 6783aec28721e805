// Copyright 2025-2026 the Foreman Project
// Licensed under the MIT License

//! Messages that describe the progress of an evaluation.
//!
//! These are the engine's UI update hints: embedding tools subscribe to a
//! session's message stream to render progress, while the default bus simply
//! forwards everything to `tracing`. Rule bodies post through their context;
//! the engine posts lifecycle events itself.

use futures::Future;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A trait for types that can distribute messages.
pub trait MessageBus: Clone + Send {
    fn post(&mut self, msg: Message) -> impl Future<Output = ()> + Send;

    fn error<T1: ToString, T2: ToString>(
        &mut self,
        subject: Option<T1>,
        message: T2,
    ) -> impl Future<Output = ()> + Send {
        let alert = AlertMessage::new(subject, message);
        self.post(Message::Error(alert))
    }

    fn warning<T1: ToString, T2: ToString>(
        &mut self,
        subject: Option<T1>,
        message: T2,
    ) -> impl Future<Output = ()> + Send {
        let alert = AlertMessage::new(subject, message);
        self.post(Message::Warning(alert))
    }
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    /// A session has begun evaluating its root requests.
    SessionStarted(SessionStartedMessage),

    /// A session has finished. Maybe successfully, maybe not.
    SessionComplete(SessionCompleteMessage),

    /// A node has started running its rule body. The label is the rule name
    /// until the body overrides it with something more specific.
    NodeStarted(NodeMessage),

    /// A rule body updated the label or progress lines attached to its node.
    NodeProgress(NodeProgressMessage),

    /// A node finished; `from_cache` distinguishes memo hits from fresh runs.
    NodeCompleted(NodeCompletedMessage),

    /// A subprocess is being launched. The string value is the command in
    /// shell-like syntax; it is only informational, so we don't try to convey
    /// its arguments in full correctness.
    CommandLaunched(String),

    /// A notable event has been encountered during evaluation.
    Note(AlertMessage),

    /// A warning has been encountered during evaluation.
    Warning(AlertMessage),

    /// An error has been encountered during evaluation.
    Error(AlertMessage),
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub struct SessionStartedMessage {
    pub session: u64,
    pub roots: usize,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub struct SessionCompleteMessage {
    pub session: u64,
    pub success: bool,
    /// How long the evaluation took, in seconds.
    pub elapsed: f32,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub struct NodeMessage {
    pub label: String,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub struct NodeProgressMessage {
    pub label: String,
    pub lines: Vec<String>,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub struct NodeCompletedMessage {
    pub label: String,
    pub success: bool,
    pub from_cache: bool,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub struct AlertMessage {
    /// What the message is about, if anything specific: a rule name, a path,
    /// a target address.
    pub subject: Option<String>,

    /// The essential message.
    pub message: String,

    /// Additional contextual information, advice, etc.
    pub context: Vec<String>,
}

impl AlertMessage {
    pub fn new<T1: ToString, T2: ToString>(subject: Option<T1>, message: T2) -> Self {
        AlertMessage {
            subject: subject.map(|t| t.to_string()),
            message: message.to_string(),
            context: Default::default(),
        }
    }

    pub fn with_context(mut self, lines: impl IntoIterator<Item = String>) -> Self {
        self.context.extend(lines);
        self
    }
}

/// A bus that reports through `tracing`, fitting for CLI usage.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingMessageBus;

impl MessageBus for TracingMessageBus {
    async fn post(&mut self, msg: Message) {
        match msg {
            Message::SessionStarted(d) => {
                debug!(session = d.session, roots = d.roots, "session started");
            }

            Message::SessionComplete(d) => {
                info!(
                    session = d.session,
                    success = d.success,
                    "session finished in {:.1} seconds",
                    d.elapsed
                );
            }

            Message::NodeStarted(d) => debug!(label = %d.label, "node started"),

            Message::NodeProgress(d) => {
                for line in &d.lines {
                    debug!(label = %d.label, "{line}");
                }
            }

            Message::NodeCompleted(d) => {
                debug!(
                    label = %d.label,
                    success = d.success,
                    from_cache = d.from_cache,
                    "node completed"
                );
            }

            Message::CommandLaunched(d) => info!("running `{d}`"),

            Message::Note(d) => {
                info!(subject = d.subject.as_deref(), "{}", d.message);
                for c in &d.context {
                    info!("  {c}");
                }
            }

            Message::Warning(d) => {
                warn!(subject = d.subject.as_deref(), "{}", d.message);
                for c in &d.context {
                    warn!("  {c}");
                }
            }

            Message::Error(d) => {
                error!(subject = d.subject.as_deref(), "{}", d.message);
                for c in &d.context {
                    error!("  {c}");
                }
            }
        }
    }
}

/// The sending half of a session's message stream. Cheap to clone; posting
/// never blocks evaluation, and messages posted after the receiver is gone
/// are dropped silently.
#[derive(Clone, Debug)]
pub struct BusSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl BusSender {
    pub fn post(&self, msg: Message) {
        let _ = self.tx.send(msg);
    }
}

pub struct BusReceiver {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl BusReceiver {
    /// Forward every message to a [`MessageBus`] until the senders hang up.
    pub async fn drain<B: MessageBus>(mut self, mut bus: B) {
        while let Some(msg) = self.rx.recv().await {
            bus.post(msg).await;
        }
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

pub fn bus_channel() -> (BusSender, BusReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (BusSender { tx }, BusReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_carries_messages_in_order() {
        let (tx, mut rx) = bus_channel();
        tx.post(Message::CommandLaunched("/bin/echo hi".into()));
        tx.post(Message::Note(AlertMessage::new(Some("n"), "done")));
        drop(tx);

        assert!(matches!(rx.recv().await, Some(Message::CommandLaunched(_))));
        assert!(matches!(rx.recv().await, Some(Message::Note(_))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn posting_without_receiver_is_harmless() {
        let (tx, rx) = bus_channel();
        drop(rx);
        tx.post(Message::CommandLaunched("true".into()));
    }
}
