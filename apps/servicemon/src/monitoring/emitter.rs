use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::warn;

use super::types::Event;

/// Receives state changes detected by jobs.
///
/// Emission is fire-and-forget: delivery and persistence belong to the
/// implementation, and a job never waits on or fails because of it.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: Event);
}

/// Forwards events onto an unbounded channel
#[derive(Clone)]
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelEmitter {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    /// Emitter plus the receiving end for an event sink
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl EventEmitter for ChannelEmitter {
    fn emit(&self, event: Event) {
        if let Err(e) = self.tx.send(event) {
            warn!(job = %e.0.job, "Event sink is gone, dropping {} event", e.0.state);
        }
    }
}

/// Keeps every event in memory, in emission order
#[derive(Default)]
pub struct MemoryEmitter {
    events: Mutex<Vec<Event>>,
}

impl MemoryEmitter {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }
}

impl EventEmitter for MemoryEmitter {
    fn emit(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
