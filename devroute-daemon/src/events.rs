use std::sync::Arc;

use devroute_protocol::ServerRegistration;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Registry changes made through the control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(ServerRegistration),
    Unregistered {
        id: String,
        /// `None` when the id was not registered.
        server: Option<ServerRegistration>,
    },
}

/// Fan-out of registry events to any number of subscribers.
#[derive(Clone, Default)]
pub struct EventsHub {
    subs: Arc<Mutex<Vec<mpsc::UnboundedSender<RegistryEvent>>>>,
}

impl EventsHub {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.lock().push(tx);
        rx
    }

    pub fn broadcast(&self, event: RegistryEvent) {
        let mut subs = self.subs.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
