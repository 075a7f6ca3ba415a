//! UDP socket layer reading and writing whole kadnet frames.

use std::convert::TryFrom;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

use crate::common::{DecodeError, Message, MessageType, MAX_FRAME_SIZE};

use super::config::{Config, DEFAULT_PORT};

/// How long [KadConn::next] blocks on an empty socket before returning a timeout,
/// so the caller gets a chance to check for shutdown.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// A UdpSocket wrapper that reads type-tagged frames.
#[derive(Debug)]
pub struct KadConn {
    socket: Arc<UdpSocket>,
    write_lock: Arc<Mutex<()>>,
    local_addr: SocketAddr,
    buf: Box<[u8]>,
}

impl KadConn {
    /// Bind according to [Config::address] and [Config::port].
    pub fn bind(config: &Config) -> Result<Self, io::Error> {
        let socket = if let Some(port) = config.port {
            UdpSocket::bind(SocketAddr::new(config.address, port))?
        } else {
            match UdpSocket::bind(SocketAddr::new(config.address, DEFAULT_PORT)) {
                Ok(socket) => Ok(socket),
                Err(_) => UdpSocket::bind(SocketAddr::new(config.address, 0)),
            }?
        };

        Self::from_socket(socket)
    }

    pub fn from_socket(socket: UdpSocket) -> Result<Self, io::Error> {
        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket: Arc::new(socket),
            write_lock: Arc::new(Mutex::new(())),
            local_addr,
            // One spare byte to notice oversized datagrams.
            buf: vec![0; MAX_FRAME_SIZE + 1].into_boxed_slice(),
        })
    }

    // === Getters ===

    /// Returns the address the socket is bound to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    // === Public Methods ===

    /// Returns a factory of writers sharing this connection's socket and write lock.
    pub fn writer_factory(&self) -> WriterFactory {
        WriterFactory {
            socket: self.socket.clone(),
            write_lock: self.write_lock.clone(),
        }
    }

    /// Receives a single frame.
    ///
    /// The multiplex key is peeked first to find the frame size. Every datagram
    /// is consumed, including the ones that fail to decode.
    pub fn next(&mut self) -> Result<(Message, SocketAddr), RecvError> {
        let mut key = [0_u8; 1];

        let (peeked, from) = self.socket.peek_from(&mut key)?;

        if peeked == 0 {
            self.discard();
            return Err(RecvError::Protocol {
                from,
                error: DecodeError::Empty,
            });
        }

        let size = match MessageType::try_from(key[0]) {
            Ok(key) => key.frame_size(),
            Err(error) => {
                self.discard();
                return Err(RecvError::Protocol { from, error });
            }
        };

        let (amt, from) = self.socket.recv_from(&mut self.buf[..size.max() + 1])?;
        let bytes = &self.buf[..amt];

        match Message::from_bytes(bytes) {
            Ok(message) => {
                trace!(
                    context = "socket_message_receiving",
                    ?message,
                    ?from,
                    "Received message"
                );

                Ok((message, from))
            }
            Err(error) => Err(RecvError::Protocol { from, error }),
        }
    }

    /// Drops the datagram at the head of the socket queue.
    fn discard(&self) {
        let mut buf = [0_u8; 1];

        if let Err(error) = self.socket.recv_from(&mut buf) {
            debug!(context = "socket_error", ?error, "Failed to discard datagram");
        }
    }
}

/// Creates a [FrameWriter] per destination.
///
/// Stateless beyond the socket and the lock it shares with every writer.
#[derive(Debug, Clone)]
pub struct WriterFactory {
    socket: Arc<UdpSocket>,
    write_lock: Arc<Mutex<()>>,
}

impl WriterFactory {
    pub fn writer(&self, address: SocketAddr) -> FrameWriter {
        FrameWriter {
            address,
            socket: self.socket.clone(),
            write_lock: self.write_lock.clone(),
        }
    }
}

/// Writes frames to a single remote address.
#[derive(Debug, Clone)]
pub struct FrameWriter {
    address: SocketAddr,
    socket: Arc<UdpSocket>,
    write_lock: Arc<Mutex<()>>,
}

impl FrameWriter {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Writes all of `bytes`, looping over partial sends while holding the
    /// connection's write lock.
    pub fn write(&self, bytes: &[u8]) -> Result<usize, io::Error> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut written = 0;

        while written < bytes.len() {
            match self.socket.send_to(&bytes[written..], self.address)? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => written += n,
            }
        }

        Ok(written)
    }

    pub fn write_message(&self, message: &Message) -> Result<usize, io::Error> {
        let written = self.write(&message.to_bytes())?;

        trace!(
            context = "socket_message_sending",
            ?message,
            to = ?self.address,
            "Sent message"
        );

        Ok(written)
    }
}

#[derive(thiserror::Error, Debug)]
/// Failure to receive one frame.
pub enum RecvError {
    /// The datagram was consumed and dropped.
    #[error("Invalid frame from {from}: {error}")]
    Protocol {
        from: SocketAddr,
        error: DecodeError,
    },

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] io::Error),
}

impl RecvError {
    /// True if the socket had nothing to read within [READ_TIMEOUT].
    pub fn is_timeout(&self) -> bool {
        match self {
            RecvError::IO(error) => matches!(
                error.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}
