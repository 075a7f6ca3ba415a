//! Request handlers

use std::sync::Arc;

use tracing::{debug, trace};

use crate::common::{Message, MessageBody, MessageType, MAX_BUCKET_SIZE_K};
use crate::dht::Dht;

use super::mux::KadMux;
use super::response::Request;
use super::socket::FrameWriter;

/// Register every request handler this node serves.
pub fn register(mux: &mut KadMux, dht: Arc<Dht>) {
    mux.handle_func(
        MessageType::FindNodeReq,
        move |writer: &FrameWriter, request: Request| handle_find_node(&dht, writer, request),
    );
}

/// Remember the requester and reply with the closest contacts to the target
/// we know of, leaving the requester out.
pub fn handle_find_node(dht: &Dht, writer: &FrameWriter, request: Request) {
    let target = match request.body.body {
        MessageBody::FindNodeRequest { target } => target,
        _ => {
            debug!(
                context = "server",
                key = %request.body.multiplex_key(),
                "Not a find_node request"
            );
            return;
        }
    };

    let requester = request.contact;

    if let Err(error) = dht.insert(requester) {
        trace!(context = "server", ?requester, ?error, "Requester not added");
    }

    let contacts = dht
        .find_node(&target)
        .into_iter()
        .filter(|contact| contact.id != requester.id)
        .take(MAX_BUCKET_SIZE_K)
        .collect();

    let response = Message::find_node_response(*dht.id(), &request.body, contacts);

    if let Err(error) = writer.write_message(&response) {
        debug!(context = "server", ?error, ?requester, "Failed to reply to find_node");
    }
}
