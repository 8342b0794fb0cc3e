//! Fire-and-forget notification events.
//!
//! Custody changes enqueue an event; a background task drains the queue and
//! hands each event to the operator's notification channel. Actual mail
//! delivery is an external collaborator, so the drain task renders the
//! message and logs it against the configured recipients. Failures here
//! never affect the triggering request.

use tokio::sync::mpsc;

use crate::config::EmailConfig;

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    KeyCreated { uuid: String, hostname: String },
    KeyErased { uuid: String },
}

impl Event {
    fn render(&self) -> String {
        match self {
            Event::KeyCreated { uuid, hostname } => {
                format!("a new key for disk {} was created on behalf of {}", uuid, hostname)
            }
            Event::KeyErased { uuid } => {
                format!("the key for disk {} was erased together with its record", uuid)
            }
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Event>,
}

impl Notifier {
    /// Spawns the drain task. Must run inside a tokio runtime.
    pub fn spawn(email: EmailConfig) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if email.recipients.is_empty() {
                    log::debug!("notification (no recipients configured): {}", event.render());
                } else {
                    log::info!(
                        "notification to {}: {}",
                        email.recipients.join(", "),
                        event.render()
                    );
                }
            }
        });
        Self { tx }
    }

    /// Enqueues an event; a full or closed queue is logged and forgotten.
    pub fn publish(&self, event: Event) {
        if let Err(err) = self.tx.send(event) {
            log::warn!("dropping notification: {}", err);
        }
    }
}
