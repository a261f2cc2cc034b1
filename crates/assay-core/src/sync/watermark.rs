//! Watermark rules shared by pulls and pushes

use crate::timestamp::Timestamp;

/// Whether an incoming write to a shared field beats the stored value.
///
/// Ties keep the stored value.
pub fn incoming_wins(incoming: Timestamp, stored: Timestamp) -> bool {
    incoming > stored
}

/// The `modified` to stamp on a row whose stored values just changed.
///
/// Never moves backwards: an incoming stamp that is not newer than the
/// stored one advances the row by one millisecond instead.
pub const fn next_modified(stored: Timestamp, incoming: Timestamp) -> Timestamp {
    if incoming.as_millis() > stored.as_millis() {
        incoming
    } else {
        stored.successor()
    }
}

/// Running maximum of the `modified` values handed back in a pull.
///
/// Starts at the cursor, so an empty pull echoes the cursor back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    value: Timestamp,
}

impl Watermark {
    pub const fn new(since: Timestamp) -> Self {
        Self { value: since }
    }

    pub fn observe(&mut self, modified: Timestamp) {
        self.value = self.value.max(modified);
    }

    pub const fn value(self) -> Timestamp {
        self.value
    }
}
