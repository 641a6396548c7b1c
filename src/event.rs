use crate::address::Address;
use crate::config::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Read,
    Write,
    Erase,
    /// NAND command phase of a read, what the device actually executes.
    ReadCommand,
}

/// One unit of simulated I/O. Addresses default to the `None` sentinel until
/// a component fills them in; `replace_address` names the page this write
/// supersedes, if any.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub logical_address: Option<Addr>,
    pub physical_address: Address,
    pub replace_address: Address,
    pub start_time: Time,
    pub duration: Time,
    pub is_garbage_collection_op: bool,
}

impl Event {
    pub fn new(kind: EventKind, logical_address: Option<Addr>, start_time: Time) -> Self {
        Event {
            kind,
            logical_address,
            physical_address: Address::none(),
            replace_address: Address::none(),
            start_time,
            duration: 0.0,
            is_garbage_collection_op: false,
        }
    }

    pub fn completion_time(&self) -> Time {
        self.start_time + self.duration
    }
}

/// Seam to the event scheduler. The core never owns a queue; it submits work
/// through whatever handle the driver wires in.
pub trait IoScheduler {
    /// Adopt one event, placed by its `start_time`.
    fn schedule_independent_event(&mut self, event: Event);

    /// Adopt an ordered chain; each event is gated on its predecessor's
    /// completion.
    fn schedule_dependent_events(&mut self, chain: Vec<Event>);
}
