//! Issue outbound requests through a running [super::KadMux].

use flume::Sender;
use tracing::trace;

use crate::common::{Contact, CorrelationKey, Id, Message, MessageType};

use super::lookup::Rpc;
use super::mux::Event;
use super::reply_buffer::{ReadError, ReplyBuffer};
use super::response::{Request, Response};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Mux is not running")]
    MuxStopped,

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error("Unexpected response type: {0}")]
    UnexpectedResponse(MessageType),

    #[error("Failed to spawn a request thread")]
    ThreadSpawn,
}

/// Cheap to clone handle sending requests on behalf of the local node.
#[derive(Debug, Clone)]
pub struct Client {
    id: Id,
    outbound: Sender<Event>,
    replies: ReplyBuffer,
}

impl Client {
    pub(crate) fn new(id: Id, outbound: Sender<Event>, replies: ReplyBuffer) -> Self {
        Self {
            id,
            outbound,
            replies,
        }
    }

    /// Returns the local node's [Id] used as the sender of every request.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Queue a request and return the handle awaiting its reply.
    ///
    /// The reply is correlated by the contact's id and the request's random id.
    pub fn send(&self, contact: Contact, body: Message) -> Result<Response, RpcError> {
        let key = CorrelationKey::new(contact.id, body.random_id);
        let reader = self.replies.reader(key);

        trace!(context = "client", ?contact, key = %body.multiplex_key(), "Queueing request");

        self.outbound
            .send(Event::Outbound(Request { contact, body }))
            .map_err(|_| RpcError::MuxStopped)?;

        Ok(Response::new(contact, reader))
    }
}

impl Rpc for Client {
    fn find_node(&self, contact: &Contact, target: Id) -> Result<Response, RpcError> {
        self.send(*contact, Message::find_node_request(self.id, target))
    }
}
