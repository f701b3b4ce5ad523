use crate::errors::*;
use crate::handler::SessionId;
use indexmap::IndexSet;
use snafu::OptionExt;
use std::collections::hash_map::{Entry, HashMap};

/// Allocation table mapping wire channel numbers to sessions.
///
/// Channel numbers are per connection generation; `clear` resets the table
/// between generations so replayed sessions get fresh numbers. Freed numbers
/// are reused only after the sequential space up to `channel_max` runs out.
pub(crate) struct SessionSlots {
    slots: HashMap<u16, SessionId>,
    freed_channels: IndexSet<u16>,
    next_channel: u32,
    channel_max: u16,
}

impl SessionSlots {
    pub(crate) fn new() -> SessionSlots {
        SessionSlots {
            slots: HashMap::new(),
            freed_channels: IndexSet::new(),
            next_channel: 0,
            channel_max: u16::max_value(),
        }
    }

    pub(crate) fn set_channel_max(&mut self, channel_max: u16) {
        assert!(
            self.slots.is_empty() && self.freed_channels.is_empty(),
            "channel_max should not be set after channels have been allocated"
        );
        self.channel_max = channel_max;
    }

    pub(crate) fn lookup(&self, channel: u16) -> Option<SessionId> {
        self.slots.get(&channel).copied()
    }

    pub(crate) fn allocate(&mut self, session: SessionId) -> Result<u16> {
        while self.next_channel <= u32::from(self.channel_max) {
            let channel = self.next_channel as u16;
            self.next_channel += 1;
            match self.slots.entry(channel) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(entry) => {
                    entry.insert(session);
                    return Ok(channel);
                }
            }
        }

        // sequential space exhausted; fall back to previously freed numbers
        let channel = self.freed_channels.pop().context(ExhaustedChannelsSnafu)?;
        match self.slots.entry(channel) {
            Entry::Occupied(_) => unreachable!("freed channel cannot be occupied"),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(channel)
            }
        }
    }

    pub(crate) fn release(&mut self, channel: u16) -> Option<SessionId> {
        let session = self.slots.remove(&channel)?;
        self.freed_channels.insert(channel);
        Some(session)
    }

    /// Drop all allocations. Used when a connection generation dies.
    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.freed_channels.clear();
        self.next_channel = 0;
        self.channel_max = u16::max_value();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: u32) -> SessionId {
        SessionId::for_tests(id)
    }

    fn with_channel_max(channel_max: u16) -> SessionSlots {
        let mut slots = SessionSlots::new();
        slots.set_channel_max(channel_max);
        slots
    }

    #[test]
    #[should_panic]
    fn set_channel_max_after_allocate_panics() {
        let mut slots = SessionSlots::new();
        if slots.allocate(session(0)).is_err() {
            return;
        }
        slots.set_channel_max(4);
    }

    #[test]
    fn allocates_sequentially_from_zero() {
        let mut slots = with_channel_max(4);
        assert_eq!(slots.allocate(session(10)).unwrap(), 0);
        assert_eq!(slots.allocate(session(11)).unwrap(), 1);
        assert_eq!(slots.lookup(0), Some(session(10)));
        assert_eq!(slots.lookup(1), Some(session(11)));
    }

    #[test]
    fn reuses_freed_channels_after_exhaustion() {
        let mut slots = with_channel_max(2);
        for i in 0..=2 {
            slots.allocate(session(i)).unwrap();
        }
        assert_eq!(slots.release(1), Some(session(1)));
        assert_eq!(slots.lookup(1), None);
        assert_eq!(slots.allocate(session(9)).unwrap(), 1);
        assert_eq!(slots.lookup(1), Some(session(9)));
    }

    #[test]
    fn exhausted_channels_fail() {
        let mut slots = with_channel_max(1);
        slots.allocate(session(0)).unwrap();
        slots.allocate(session(1)).unwrap();
        match slots.allocate(session(2)).unwrap_err() {
            Error::ExhaustedChannels => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn clear_resets_numbering() {
        let mut slots = with_channel_max(4);
        slots.allocate(session(0)).unwrap();
        slots.allocate(session(1)).unwrap();
        slots.clear();
        assert_eq!(slots.lookup(0), None);
        assert_eq!(slots.allocate(session(2)).unwrap(), 0);
    }
}
