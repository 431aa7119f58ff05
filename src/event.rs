//! Typed events emitted by sessions/transfers toward the UI layer, replacing
//! signal/slot fan-out with a single sink trait sessions are constructed with.

use crate::ids::{SessionId, TransferId};

#[derive(Clone, Debug)]
pub enum Event {
	SessionStageChanged { session: SessionId, stage: String },
	SessionFinished { session: SessionId, reason: String },
	WalletAddressChanged { session: SessionId, address: String },
	TransferStageChanged { transfer: TransferId, stage: String },
	TransferFinished { transfer: TransferId, outcome: String },
	Warning { message: String },
}

/// Capability handle threaded through session/transfer constructors instead of a
/// global signal bus. A no-op/log-only sink is sufficient for headless operation.
pub trait EventSink: Send + Sync {
	fn emit(&self, event: Event);
}

pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
	fn emit(&self, event: Event) {
		log::info!("event: {:?}", event);
	}
}

#[cfg(test)]
pub mod test_util {
	use super::*;
	use std::sync::Mutex;

	#[derive(Default)]
	pub struct RecordingEventSink {
		pub events: Mutex<Vec<Event>>,
	}

	impl EventSink for RecordingEventSink {
		fn emit(&self, event: Event) {
			self.events.lock().unwrap().push(event);
		}
	}
}
