//! Kadnet RPC engine

mod client;
mod closest_nodes;
pub mod config;
mod lookup;
pub mod mux;
mod reply_buffer;
mod response;
pub mod server;
mod socket;

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::common::{Contact, Id, StatusEntry};
use crate::dht::Dht;
use crate::{Error, Result};

pub use client::{Client, RpcError};
pub use closest_nodes::{ClosestNodes, PendingNode};
pub use config::Config;
pub use lookup::{node_lookup, LookupResult, NodeLookup, Rpc};
pub use mux::{Handler, KadMux, MuxHandle, MuxState};
pub use reply_buffer::{ReadError, ReplyBuffer, ReplyReader, ReplyWriter};
pub use response::{Request, Response};
pub use socket::{FrameWriter, KadConn, RecvError, WriterFactory};

/// A running kadnet node: socket, reply buffer, dispatcher and routing table.
#[derive(Debug)]
pub struct RpcManager {
    id: Id,
    config: Config,
    local_addr: SocketAddr,
    dht: Arc<Dht>,
    replies: ReplyBuffer,
    client: Client,
    mux: MuxHandle,
    thread: Option<JoinHandle<std::result::Result<(), std::io::Error>>>,
}

impl RpcManager {
    /// Bind the socket, open the reply buffer and serve requests on a
    /// background thread.
    pub fn start(config: Config) -> Result<Self> {
        let id = config.id.unwrap_or_else(Id::random);

        let conn = KadConn::bind(&config)?;
        let local_addr = conn.local_addr();

        let dht = Arc::new(Dht::new(id));

        let replies = ReplyBuffer::new(config.reply_ttl);
        replies.open();

        let mut mux = KadMux::new(id, replies.clone())
            .with_workers(config.workers)
            .with_writer_cache_size(config.writer_cache_size);

        server::register(&mut mux, dht.clone());

        let client = mux.client();
        let handle = mux.handle();

        let thread = thread::Builder::new()
            .name("kadnet-mux".to_string())
            .spawn(move || mux.start(conn));

        let thread = match thread {
            Ok(thread) => thread,
            Err(error) => {
                replies.close();
                return Err(error.into());
            }
        };

        info!(context = "rpc", %id, ?local_addr, "Kadnet node started");

        Ok(Self {
            id,
            config,
            local_addr,
            dht,
            replies,
            client,
            mux: handle,
            thread: Some(thread),
        })
    }

    // === Getters ===

    /// Returns the local node's [Id] as a hex string.
    pub fn id(&self) -> String {
        self.id.to_string()
    }

    pub fn node_id(&self) -> &Id {
        &self.id
    }

    /// Returns the address the node is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns this node as a contact others can bootstrap from.
    ///
    /// An unspecified bind address is reported as localhost.
    pub fn contact(&self) -> Contact {
        let mut address = self.local_addr;

        if address.ip().is_unspecified() {
            address.set_ip(match address.ip() {
                IpAddr::V4(_) => IpAddr::from([127, 0, 0, 1]),
                IpAddr::V6(_) => IpAddr::from([0, 0, 0, 0, 0, 0, 0, 1]),
            });
        }

        Contact::new(self.id, address)
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn dht(&self) -> &Arc<Dht> {
        &self.dht
    }

    pub fn state(&self) -> MuxState {
        self.mux.state()
    }

    /// Snapshot of the routing table as `(bucket index, contact)` entries.
    pub fn status(&self) -> Vec<StatusEntry> {
        self.dht.status()
    }

    // === Public Methods ===

    /// Insert the gateway node, then look up our own id to populate the routing table.
    ///
    /// Only fails if the gateway can't be parsed or inserted; an incomplete
    /// lookup is not an error.
    pub fn bootstrap(&self, port: u16, ip: &str, id_hex: &str) -> Result<()> {
        let ip = IpAddr::from_str(ip).map_err(|_| Error::InvalidIp(ip.to_string()))?;
        let id = Id::from_str(id_hex)?;

        let gateway = Contact::new(id, SocketAddr::new(ip, port));

        self.dht.insert(gateway)?;

        let found = self.find_node(self.id);

        if self.dht.size() > 1 {
            info!(
                context = "rpc",
                table_size = self.dht.size(),
                found = found.len(),
                "Populated the routing table"
            );
        } else {
            warn!(context = "rpc", ?gateway, "Bootstrap found no nodes besides the gateway");
        }

        Ok(())
    }

    /// Iterative lookup for the closest contacts to `target`, seeded from the
    /// routing table.
    ///
    /// Every contact that answered is added to the routing table.
    pub fn find_node(&self, target: Id) -> Vec<Contact> {
        let seeds = self.dht.alpha_contacts(&target, self.config.alpha);

        let result = NodeLookup::new(Arc::new(self.client.clone()), target, seeds)
            .exclude(self.id)
            .with_alpha(self.config.alpha)
            .with_request_timeout(self.config.request_timeout)
            .with_late_reply_timeout(self.config.late_reply_timeout)
            .run();

        for contact in result.responders {
            if let Err(error) = self.dht.insert(contact) {
                debug!(context = "rpc", ?contact, ?error, "Responder not added to the routing table");
            }
        }

        result.closest
    }

    /// Stop the dispatcher, then close the reply buffer.
    ///
    /// Returns the socket error that stopped the node, if any. Calling it
    /// again does nothing.
    pub fn shutdown(&mut self) -> Result<()> {
        let thread = match self.thread.take() {
            Some(thread) => thread,
            None => return Ok(()),
        };

        self.mux.shutdown();

        let result = match thread.join() {
            Ok(result) => result.map_err(Error::from),
            Err(_) => {
                debug!(context = "rpc", "Mux thread panicked");
                Ok(())
            }
        };

        self.replies.close();

        info!(context = "rpc", id = %self.id, "Kadnet node stopped");

        result
    }
}

impl Drop for RpcManager {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            debug!(context = "rpc", ?error, "Error shutting down on drop");
        }
    }
}
