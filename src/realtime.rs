//! Push-channel receiver that turns inbound messages into [`ChangeEvent`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::messages::{process_message, ChangeEvent};

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub auth_key: String,
    pub user_id: String,
    pub subscribe_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub action: String,
    pub uuid: String,
    pub channel: String,
    pub occupancy: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub category: String,
    pub error: bool,
    pub affected_channels: Vec<String>,
}

pub type ListenerId = u64;

/// Callbacks a transport invokes for each inbound event
pub trait TransportListener: Send + Sync {
    fn on_message(&self, message: Value);
    fn on_presence(&self, event: PresenceEvent);
    fn on_status(&self, event: StatusEvent);
}

/// Low-level publish/subscribe connection
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<()>;
    async fn subscribe(&self, channels: &[String]) -> Result<()>;
    fn add_listener(&self, listener: Arc<dyn TransportListener>) -> ListenerId;
    fn remove_listener(&self, id: ListenerId);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverState {
    Uninitialized,
    Connecting,
    Connected,
    Subscribed(Vec<String>),
    Disposed,
}

struct Shared {
    events: broadcast::Sender<ChangeEvent>,
    state: Mutex<ReceiverState>,
    disposed: AtomicBool,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ReceiverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, message: Value) {
        if self.disposed.load(Ordering::SeqCst) {
            trace!("Dropping live update after dispose");
            return;
        }

        for event in process_message(message) {
            debug!(kind = event.kind().as_str(), count = event.len(), "Live update");
            if self.events.send(event).is_err() {
                trace!("No change-event subscribers");
            }
        }
    }
}

/// The single listener registered with the transport
struct Sink {
    shared: Arc<Shared>,
}

impl TransportListener for Sink {
    fn on_message(&self, message: Value) {
        self.shared.dispatch(message);
    }

    fn on_presence(&self, event: PresenceEvent) {
        debug!(
            uuid = %event.uuid,
            action = %event.action,
            channel = %event.channel,
            occupancy = event.occupancy,
            "Presence"
        );
    }

    fn on_status(&self, event: StatusEvent) {
        if event.error {
            warn!(category = %event.category, channels = ?event.affected_channels, "Transport status error");
        } else {
            debug!(category = %event.category, "Transport status");
        }
    }
}

/// Removes the receiver's listener when disposed or dropped
#[must_use = "dropping the handle unregisters the listener"]
pub struct ListenerHandle {
    transport: Arc<dyn PubSubTransport>,
    shared: Arc<Shared>,
    id: ListenerId,
    released: AtomicBool,
}

impl ListenerHandle {
    /// Stop delivering events. Safe to call more than once.
    pub fn dispose(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        self.transport.remove_listener(self.id);
        self.shared.disposed.store(true, Ordering::SeqCst);
        *self.shared.state() = ReceiverState::Disposed;
        info!("Live update receiver disposed");
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Channel names for a user's session
pub fn channels_for(user_id: &str, team_id: &str, repo_id: &str) -> Vec<String> {
    vec![
        format!("user-{}", user_id),
        format!("team-{}", team_id),
        format!("repo-{}", repo_id),
    ]
}

pub struct LiveUpdateReceiver {
    transport: Arc<dyn PubSubTransport>,
    shared: Arc<Shared>,
}

impl LiveUpdateReceiver {
    pub fn new(transport: Arc<dyn PubSubTransport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            transport,
            shared: Arc::new(Shared {
                events,
                state: Mutex::new(ReceiverState::Uninitialized),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.shared.state().clone()
    }

    /// Stream of typed change events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChangeEvent> {
        self.shared.events.subscribe()
    }

    /// Connect and register the listener
    pub async fn initialize(&self, credentials: &Credentials) -> Result<ListenerHandle> {
        {
            let mut state = self.shared.state();
            if *state != ReceiverState::Uninitialized {
                return Err(Error::InvalidState(format!(
                    "cannot initialize while {:?}",
                    *state
                )));
            }
            *state = ReceiverState::Connecting;
        }

        if let Err(e) = self.transport.connect(credentials).await {
            *self.shared.state() = ReceiverState::Uninitialized;
            return Err(e);
        }

        let id = self.transport.add_listener(Arc::new(Sink {
            shared: self.shared.clone(),
        }));
        *self.shared.state() = ReceiverState::Connected;

        info!(user_id = %credentials.user_id, "Live update receiver connected");

        Ok(ListenerHandle {
            transport: self.transport.clone(),
            shared: self.shared.clone(),
            id,
            released: AtomicBool::new(false),
        })
    }

    /// Join the user, team and repository channels
    pub async fn subscribe(&self, user_id: &str, team_id: &str, repo_id: &str) -> Result<Vec<String>> {
        match &*self.shared.state() {
            ReceiverState::Connected | ReceiverState::Subscribed(_) => {}
            other => {
                return Err(Error::InvalidState(format!(
                    "cannot subscribe while {:?}",
                    other
                )))
            }
        }

        let channels = channels_for(user_id, team_id, repo_id);
        self.transport.subscribe(&channels).await?;

        info!(?channels, "Subscribed to live update channels");
        *self.shared.state() = ReceiverState::Subscribed(channels.clone());

        Ok(channels)
    }

    /// Feed a payload directly, as the transport listener would
    pub fn process_message(&self, message: Value) {
        self.shared.dispatch(message);
    }
}
