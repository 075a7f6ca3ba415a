//! Single reader of the socket.

use std::io;

use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, trace};

use crate::rpc::reply_buffer::ReplyWriter;
use crate::rpc::socket::{KadConn, RecvError};

use super::{Event, Exit};

/// Read frames until stopped, routing responses to the reply buffer and
/// requests to the dispatch loop.
///
/// Malformed datagrams are dropped; any other socket error ends the loop and
/// is reported through `exit`.
pub(super) fn run(
    mut conn: KadConn,
    replies: ReplyWriter,
    events: Sender<Event>,
    stop: Receiver<Sender<()>>,
    exit: Sender<Exit>,
) {
    loop {
        match stop.try_recv() {
            Ok(ack) => {
                let _ = ack.send(());
                break;
            }
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        match conn.next() {
            Ok((message, from)) => {
                if message.is_response() {
                    if let Err(error) = replies.write(message) {
                        debug!(context = "mux", ?error, ?from, "Dropping response");
                    }
                } else if events
                    .send(Event::Inbound {
                        request: message,
                        from,
                    })
                    .is_err()
                {
                    debug!(context = "mux", "Dispatch loop is gone");
                    break;
                }
            }
            Err(error) if error.is_timeout() => {}
            Err(RecvError::Protocol { from, error }) => {
                debug!(context = "socket_error", ?from, %error, "Dropped invalid datagram");
            }
            Err(RecvError::IO(error)) if is_transient(&error) => {
                trace!(context = "socket_error", ?error, "Transient recv error");
            }
            Err(RecvError::IO(error)) => {
                debug!(context = "socket_error", ?error, "Receiver failed");
                let _ = exit.send(Exit::Failed(error));
                break;
            }
        }
    }
}

/// Errors caused by a single remote, such as ICMP port unreachable.
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
    )
}
