//! Connection manager: the event vocabulary, the blocking event loop, and
//! the client and server state machines it drives.

mod client;
mod event;
mod server;

pub use self::client::{ClientMachine, ClientState};
pub use self::event::{CmEvent, CmEventKind, ConnParam};
pub use self::server::{ServerConnState, ServerMachine};

use crate::error::{ProviderResultExt, Result};
use crate::provider::Cm;

/// Whether the event loop goes on after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Pull events from `channel` one at a time and hand them to `dispatch`
/// until it returns [`Flow::Stop`] or fails.
///
/// Each event is copied out and acknowledged before dispatching, so the
/// provider's record is returned even if dispatching blocks or fails.
pub fn event_loop<P: Cm>(
    provider: &P,
    channel: &P::EventChannel,
    mut dispatch: impl FnMut(CmEvent<P::Id>) -> Result<Flow>,
) -> Result<()> {
    loop {
        let record = provider.get_cm_event(channel).during("rdma_get_cm_event")?;
        let event = provider.event_payload(&record);
        provider.ack_cm_event(record).during("rdma_ack_cm_event")?;

        log::debug!("got CM event {:?} (status {})", event.kind, event.status);
        if dispatch(event)? == Flow::Stop {
            return Ok(());
        }
    }
}
