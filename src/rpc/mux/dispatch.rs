//! Routes inbound requests to handlers on the worker pool, and writes
//! outbound client requests.

use std::net::SocketAddr;
use std::num::NonZeroUsize;

use flume::Receiver;
use lru::LruCache;
use tracing::{debug, trace};

use crate::common::{Contact, Message};
use crate::rpc::response::Request;
use crate::rpc::socket::{FrameWriter, WriterFactory};

use super::{Event, Handlers, Submitter};

pub(super) struct Dispatch {
    handlers: Handlers,
    factory: WriterFactory,
    writers: LruCache<SocketAddr, FrameWriter>,
    pool: Submitter,
}

impl Dispatch {
    pub fn new(
        handlers: Handlers,
        factory: WriterFactory,
        pool: Submitter,
        writer_cache_size: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(writer_cache_size).unwrap_or(NonZeroUsize::MIN);

        Self {
            handlers,
            factory,
            writers: LruCache::new(capacity),
            pool,
        }
    }

    pub fn run(mut self, events: Receiver<Event>) {
        while let Ok(event) = events.recv() {
            match event {
                Event::Inbound { request, from } => self.inbound(request, from),
                Event::Outbound(request) => self.outbound(request),
                Event::Stop(ack) => {
                    let _ = ack.send(());
                    break;
                }
            }
        }
    }

    // === Private Methods ===

    fn inbound(&mut self, request: Message, from: SocketAddr) {
        let key = request.multiplex_key();

        let handler = match self.handlers.get(&key) {
            Some(handler) => handler.clone(),
            None => {
                debug!(context = "mux", %key, ?from, "HandlerNotFound, dropping request");
                return;
            }
        };

        let writer = self.writer(from);
        let request = Request {
            contact: Contact::new(request.sender_id, from),
            body: request,
        };

        let submitted = self.pool.submit(Box::new(move || {
            handler.handle(&writer, request);
        }));

        if !submitted {
            debug!(context = "mux", %key, ?from, "Worker pool is gone, dropping request");
        } else {
            trace!(context = "mux", %key, queued = self.pool.queued(), "Request queued");
        }
    }

    fn outbound(&mut self, request: Request) {
        let address = request.contact.address();

        if let Err(error) = self.writer(address).write_message(&request.body) {
            debug!(context = "socket_error", ?error, ?address, "Failed to send request");
        }
    }

    fn writer(&mut self, address: SocketAddr) -> FrameWriter {
        let factory = &self.factory;

        self.writers
            .get_or_insert(address, || factory.writer(address))
            .clone()
    }
}
