//! Outbound requests and the handles awaiting their replies.

use std::time::Duration;

use crate::common::{Contact, Message};

use super::reply_buffer::{ReadError, ReplyReader};

/// A message and the contact it is sent to.
#[derive(Debug, Clone)]
pub struct Request {
    pub contact: Contact,
    pub body: Message,
}

/// Handle to the reply of one [Request].
///
/// Reading it does not consume the handle; a read that timed out can be
/// retried and still claims the reply if it arrives later.
#[derive(Debug, Clone)]
pub struct Response {
    contact: Contact,
    reader: ReplyReader,
}

impl Response {
    pub(crate) fn new(contact: Contact, reader: ReplyReader) -> Self {
        Self { contact, reader }
    }

    // === Getters ===

    /// The contact this response is expected from.
    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    // === Public Methods ===

    /// Block until the reply arrives. `None` waits until the reply buffer closes.
    pub fn read(&self, timeout: Option<Duration>) -> Result<Message, ReadError> {
        self.reader.read(timeout)
    }

    /// Give up on this reply, waking any thread blocked in [Response::read].
    pub fn cancel(&self) {
        self.reader.cancel()
    }
}
