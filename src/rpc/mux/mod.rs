//! Request dispatcher sharing one framed connection between inbound requests,
//! inbound responses and outbound client requests.
//!
//! ```text
//!            ┌──────────┐  responses   ┌─────────────┐
//! socket ──▶ │ receiver │ ───────────▶ │ ReplyBuffer │
//!            └──────────┘              └─────────────┘
//!                 │ requests
//!                 ▼
//!            ┌──────────┐  jobs   ┌─────────────┐
//! Client ──▶ │ dispatch │ ──────▶ │ WorkerPool  │ ──▶ handlers
//!            └──────────┘         └─────────────┘
//! ```

mod dispatch;
mod pool;
mod receiver;

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use flume::{Receiver, Sender};
use tracing::{debug, info};

use crate::common::{Id, Message, MessageType};

use super::client::Client;
use super::config::{DEFAULT_WORKERS, DEFAULT_WRITER_CACHE_SIZE};
use super::reply_buffer::ReplyBuffer;
use super::response::Request;
use super::socket::{FrameWriter, KadConn};

pub use pool::{Job, Submitter, WorkerPool};

/// Handles one inbound request, replying through the writer if needed.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, writer: &FrameWriter, request: Request);
}

impl<F> Handler for F
where
    F: Fn(&FrameWriter, Request) + Send + Sync + 'static,
{
    fn handle(&self, writer: &FrameWriter, request: Request) {
        self(writer, request)
    }
}

pub(crate) type Handlers = HashMap<MessageType, Arc<dyn Handler>>;

/// Everything the dispatch loop consumes.
#[derive(Debug)]
pub enum Event {
    Inbound { request: Message, from: SocketAddr },
    Outbound(Request),
    Stop(Sender<()>),
}

/// Lifecycle of a [KadMux].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MuxState {
    Idle = 0,
    Running = 1,
    /// Shutdown in progress.
    Draining = 2,
    Stopped = 3,
}

impl MuxState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => MuxState::Idle,
            1 => MuxState::Running,
            2 => MuxState::Draining,
            _ => MuxState::Stopped,
        }
    }
}

/// Why [KadMux::start] returned.
#[derive(Debug)]
enum Exit {
    Shutdown,
    Failed(io::Error),
}

struct Shared {
    state: AtomicU8,
    stop_receiver: Sender<Sender<()>>,
    events: Sender<Event>,
    exit: Sender<Exit>,
}

pub struct KadMux {
    id: Id,
    handlers: Handlers,
    replies: ReplyBuffer,
    workers: usize,
    writer_cache_size: usize,

    shared: Arc<Shared>,
    events: Receiver<Event>,
    stop_receiver: Receiver<Sender<()>>,
    exit: Receiver<Exit>,
}

impl KadMux {
    /// Create an idle mux sending requests as `id` and feeding responses into `replies`.
    pub fn new(id: Id, replies: ReplyBuffer) -> Self {
        let (events_tx, events) = flume::unbounded();
        let (stop_tx, stop_receiver) = flume::bounded(1);
        let (exit_tx, exit) = flume::unbounded();

        Self {
            id,
            handlers: HashMap::new(),
            replies,
            workers: DEFAULT_WORKERS,
            writer_cache_size: DEFAULT_WRITER_CACHE_SIZE,
            shared: Arc::new(Shared {
                state: AtomicU8::new(MuxState::Idle as u8),
                stop_receiver: stop_tx,
                events: events_tx,
                exit: exit_tx,
            }),
            events,
            stop_receiver,
            exit,
        }
    }

    // === Options ===

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_writer_cache_size(mut self, size: usize) -> Self {
        self.writer_cache_size = size;
        self
    }

    /// Register the handler for inbound requests of `key`, replacing any previous one.
    pub fn handle_func<H: Handler>(&mut self, key: MessageType, handler: H) {
        self.handlers.insert(key, Arc::new(handler));
    }

    // === Getters ===

    /// A client sending requests through this mux once it is running.
    pub fn client(&self) -> Client {
        Client::new(self.id, self.shared.events.clone(), self.replies.clone())
    }

    pub fn handle(&self) -> MuxHandle {
        MuxHandle {
            shared: self.shared.clone(),
        }
    }

    // === Public Methods ===

    /// Serve `conn` until [MuxHandle::shutdown] is called.
    ///
    /// Returns the socket error that stopped the receiver, if any.
    pub fn start(self, conn: KadConn) -> Result<(), io::Error> {
        let handle = self.handle();

        if self
            .shared
            .state
            .compare_exchange(
                MuxState::Idle as u8,
                MuxState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!(context = "mux", state = ?handle.state(), "Mux already started or stopped");
            return Ok(());
        }

        let local_addr = conn.local_addr();
        let writers = conn.writer_factory();

        let mut pool = WorkerPool::new(self.workers);

        info!(context = "mux", ?local_addr, workers = pool.size(), "Mux running");

        let receiver = {
            let replies = self.replies.writer();
            let events = self.shared.events.clone();
            let stop = self.stop_receiver;
            let exit = self.shared.exit.clone();

            thread::Builder::new()
                .name("kadnet-receiver".to_string())
                .spawn(move || receiver::run(conn, replies, events, stop, exit))?
        };

        let dispatch = {
            let dispatch = dispatch::Dispatch::new(
                self.handlers,
                writers,
                pool.submitter(),
                self.writer_cache_size,
            );
            let events = self.events;

            thread::Builder::new()
                .name("kadnet-dispatch".to_string())
                .spawn(move || dispatch.run(events))?
        };

        let result = match self.exit.recv() {
            Ok(Exit::Failed(error)) => {
                debug!(context = "mux", ?error, "Receiver failed, shutting down");
                handle.shutdown();
                Err(error)
            }
            Ok(Exit::Shutdown) | Err(_) => Ok(()),
        };

        if receiver.join().is_err() {
            debug!(context = "mux", "Receiver thread panicked");
        }
        if dispatch.join().is_err() {
            debug!(context = "mux", "Dispatch thread panicked");
        }

        pool.stop();

        self.shared
            .state
            .store(MuxState::Stopped as u8, Ordering::Release);

        info!(context = "mux", ?local_addr, "Mux stopped");

        result
    }
}

impl Debug for KadMux {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("KadMux")
            .field("id", &self.id)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("workers", &self.workers)
            .finish()
    }
}

/// Controls a [KadMux] from other threads.
#[derive(Clone)]
pub struct MuxHandle {
    shared: Arc<Shared>,
}

impl MuxHandle {
    pub fn state(&self) -> MuxState {
        MuxState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Two-phase shutdown: stop the receiver and dispatch loops, wait for both
    /// to acknowledge, then let [KadMux::start] stop the worker pool and return.
    ///
    /// Does nothing unless the mux is running; an idle mux is marked stopped.
    pub fn shutdown(&self) {
        let state = &self.shared.state;

        if let Err(current) = state.compare_exchange(
            MuxState::Running as u8,
            MuxState::Draining as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            if current == MuxState::Idle as u8 {
                let _ = state.compare_exchange(
                    MuxState::Idle as u8,
                    MuxState::Stopped as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
            return;
        }

        let (receiver_ack, receiver_acked) = flume::bounded(1);
        let (dispatch_ack, dispatch_acked) = flume::bounded(1);

        // A loop that already exited dropped its channel, so the ack disconnects.
        if self.shared.stop_receiver.send(receiver_ack).is_ok() {
            let _ = receiver_acked.recv();
        }
        if self.shared.events.send(Event::Stop(dispatch_ack)).is_ok() {
            let _ = dispatch_acked.recv();
        }

        debug!(context = "mux", "Receiver and dispatch loops stopped");

        let _ = self.shared.exit.send(Exit::Shutdown);
    }
}

impl Debug for MuxHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxHandle")
            .field("state", &self.state())
            .finish()
    }
}
