use crate::domain::events::EngineEvent;
use crate::domain::ports::EventSink;
use tokio::sync::mpsc;
use tracing::debug;

/// Forwards events over an unbounded channel to whatever dispatcher owns the
/// receiving end. Events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: EngineEvent) {
        if let Err(err) = self.tx.send(event) {
            debug!(event = ?err.0, "Event receiver closed, dropping event");
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn publish(&self, _event: EngineEvent) {}
}
