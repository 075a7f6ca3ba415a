//! Rendezvous between inbound responses and the callers awaiting them.
//!
//! A single actor thread owns both the pending readers and the replies that
//! arrived before anyone asked for them; every handle talks to it over channels.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};

use crate::common::{CorrelationKey, Message};

/// Upper bound between two passes over expired replies.
const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

type ReplySender = Sender<Result<Message, ReadError>>;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    #[error("Timed out waiting for a reply")]
    Timeout,

    #[error("Reply buffer is closed")]
    ClosedBuffer,

    #[error("Reply read was cancelled")]
    Cancelled,
}

/// Handle to one reply buffer; clones share the same actor.
#[derive(Debug, Clone)]
pub struct ReplyBuffer {
    inner: Arc<RwLock<Option<Running>>>,
    ttl: Duration,
}

#[derive(Debug)]
struct Running {
    sender: Sender<Command>,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
enum Command {
    Write(Message),
    Read {
        key: CorrelationKey,
        reply: ReplySender,
    },
    /// Drop one timed out reader, acked once the actor either removed it or
    /// already handed it a reply.
    Abandon {
        key: CorrelationKey,
        reply: ReplySender,
        ack: Sender<()>,
    },
    Cancel(CorrelationKey),
    Close(Sender<()>),
}

impl ReplyBuffer {
    /// Create a closed buffer; replies nobody claimed for `ttl` are dropped.
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
            ttl,
        }
    }

    // === Public Methods ===

    /// Spawn the actor. Does nothing if the buffer is already open.
    pub fn open(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if inner.is_some() {
            return;
        }

        let (sender, receiver) = flume::unbounded();
        let ttl = self.ttl;

        let handle = thread::Builder::new()
            .name("kadnet-replies".to_string())
            .spawn(move || Actor::new(ttl).run(receiver));

        match handle {
            Ok(handle) => *inner = Some(Running { sender, handle }),
            Err(error) => debug!(context = "reply_buffer", ?error, "Failed to spawn actor"),
        }
    }

    /// Wake every pending reader with [ReadError::ClosedBuffer] and stop the actor.
    ///
    /// Returns once the actor is gone. Closing a closed buffer does nothing.
    pub fn close(&self) {
        let running = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(Running { sender, handle }) = running {
            let (ack, acked) = flume::bounded(1);

            if sender.send(Command::Close(ack)).is_ok() {
                let _ = acked.recv();
            }

            if handle.join().is_err() {
                debug!(context = "reply_buffer", "Actor thread panicked");
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn writer(&self) -> ReplyWriter {
        ReplyWriter {
            buffer: self.clone(),
        }
    }

    pub fn reader(&self, key: CorrelationKey) -> ReplyReader {
        ReplyReader {
            buffer: self.clone(),
            key,
        }
    }

    // === Private Methods ===

    fn send(&self, command: Command) -> Result<(), ReadError> {
        let sender = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|running| running.sender.clone())
            .ok_or(ReadError::ClosedBuffer)?;

        sender.send(command).map_err(|_| ReadError::ClosedBuffer)
    }
}

/// Feeds inbound responses into a [ReplyBuffer].
#[derive(Debug, Clone)]
pub struct ReplyWriter {
    buffer: ReplyBuffer,
}

impl ReplyWriter {
    pub fn write(&self, message: Message) -> Result<(), ReadError> {
        self.buffer.send(Command::Write(message))
    }
}

/// Awaits the reply matching one [CorrelationKey].
#[derive(Debug, Clone)]
pub struct ReplyReader {
    buffer: ReplyBuffer,
    key: CorrelationKey,
}

impl ReplyReader {
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Block until the matching reply arrives, the `timeout` elapses, or the
    /// buffer is closed. `None` waits indefinitely.
    ///
    /// Each call registers a new wait, so a reply consumed by one call is never
    /// seen by another. A reply racing the timeout is either returned or left
    /// in the buffer for the next read.
    pub fn read(&self, timeout: Option<Duration>) -> Result<Message, ReadError> {
        let (reply, receiver) = flume::bounded(1);

        self.buffer.send(Command::Read {
            key: self.key,
            reply: reply.clone(),
        })?;

        match timeout {
            Some(timeout) => match receiver.recv_timeout(timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => self.abandon(reply, &receiver),
                Err(RecvTimeoutError::Disconnected) => Err(ReadError::ClosedBuffer),
            },
            None => {
                drop(reply);
                receiver.recv().unwrap_or(Err(ReadError::ClosedBuffer))
            }
        }
    }

    fn abandon(
        &self,
        reply: ReplySender,
        receiver: &Receiver<Result<Message, ReadError>>,
    ) -> Result<Message, ReadError> {
        let (ack, acked) = flume::bounded(1);

        if self
            .buffer
            .send(Command::Abandon {
                key: self.key,
                reply,
                ack,
            })
            .is_ok()
        {
            let _ = acked.recv();
        }

        // The actor is done with this wait, anything it sent is already here.
        receiver.try_recv().unwrap_or(Err(ReadError::Timeout))
    }

    /// Wake every reader blocked on this key with [ReadError::Cancelled] and
    /// drop any unclaimed reply for it.
    pub fn cancel(&self) {
        let _ = self.buffer.send(Command::Cancel(self.key));
    }
}

struct Actor {
    ttl: Duration,
    pending: HashMap<CorrelationKey, VecDeque<ReplySender>>,
    buffer: HashMap<CorrelationKey, (Message, Instant)>,
    last_prune: Instant,
}

impl Actor {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: HashMap::new(),
            buffer: HashMap::new(),
            last_prune: Instant::now(),
        }
    }

    fn run(mut self, receiver: Receiver<Command>) {
        let interval = self.ttl.min(PRUNE_INTERVAL);

        loop {
            match receiver.recv_timeout(interval) {
                Ok(Command::Write(message)) => self.write(message),
                Ok(Command::Read { key, reply }) => self.read(key, reply),
                Ok(Command::Abandon { key, reply, ack }) => {
                    self.abandon(key, &reply);
                    let _ = ack.send(());
                }
                Ok(Command::Cancel(key)) => self.cancel(key),
                Ok(Command::Close(ack)) => {
                    self.close();
                    let _ = ack.send(());
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.close();
                    break;
                }
            }

            if self.last_prune.elapsed() >= interval {
                self.prune();
            }
        }
    }

    fn write(&mut self, mut message: Message) {
        let key = match message.correlation_key() {
            Some(key) => key,
            None => {
                debug!(context = "reply_buffer", ?message, "Ignoring non response message");
                return;
            }
        };

        if let Some(readers) = self.pending.get_mut(&key) {
            // Readers that timed out hung up already, skip them.
            while let Some(reader) = readers.pop_front() {
                match reader.send(Ok(message)) {
                    Ok(()) => {
                        if readers.is_empty() {
                            self.pending.remove(&key);
                        }
                        return;
                    }
                    Err(flume::SendError(Ok(returned))) => message = returned,
                    Err(_) => return,
                }
            }

            self.pending.remove(&key);
        }

        trace!(context = "reply_buffer", %key, "Buffering unclaimed reply");
        self.buffer.insert(key, (message, Instant::now()));
    }

    fn read(&mut self, key: CorrelationKey, reply: ReplySender) {
        if let Some((message, _)) = self.buffer.remove(&key) {
            let _ = reply.send(Ok(message));
            return;
        }

        self.pending.entry(key).or_default().push_back(reply);
    }

    fn abandon(&mut self, key: CorrelationKey, reply: &ReplySender) {
        if let Some(readers) = self.pending.get_mut(&key) {
            readers.retain(|reader| !reader.same_channel(reply));

            if readers.is_empty() {
                self.pending.remove(&key);
            }
        }
    }

    fn cancel(&mut self, key: CorrelationKey) {
        if let Some(readers) = self.pending.remove(&key) {
            for reader in readers {
                let _ = reader.send(Err(ReadError::Cancelled));
            }
        }

        self.buffer.remove(&key);
    }

    fn close(&mut self) {
        for (_, readers) in self.pending.drain() {
            for reader in readers {
                let _ = reader.send(Err(ReadError::ClosedBuffer));
            }
        }

        self.buffer.clear();
    }

    fn prune(&mut self) {
        let ttl = self.ttl;
        let before = self.buffer.len();

        self.buffer.retain(|_, (_, received_at)| received_at.elapsed() < ttl);
        self.pending.retain(|_, readers| {
            readers.retain(|reader| !reader.is_disconnected());
            !readers.is_empty()
        });

        let pruned = before - self.buffer.len();
        if pruned > 0 {
            debug!(context = "reply_buffer", pruned, "Dropped expired replies");
        }

        self.last_prune = Instant::now();
    }
}

#[cfg(test)]
mod test {
    use crate::common::{Contact, Id};

    use super::*;

    fn response_to(request: &Message, responder: Id) -> Message {
        Message::find_node_response(responder, request, vec![Contact::random()])
    }

    fn key(message: &Message) -> CorrelationKey {
        message.correlation_key().unwrap()
    }

    #[test]
    fn write_then_read() {
        let buffer = ReplyBuffer::new(Duration::from_secs(30));
        buffer.open();

        let request = Message::find_node_request(Id::random(), Id::random());
        let response = response_to(&request, Id::random());

        buffer.writer().write(response.clone()).unwrap();

        let read = buffer.reader(key(&response)).read(None).unwrap();
        assert_eq!(read, response);

        buffer.close();
    }

    #[test]
    fn read_then_write() {
        let buffer = ReplyBuffer::new(Duration::from_secs(30));
        buffer.open();

        let request = Message::find_node_request(Id::random(), Id::random());
        let response = response_to(&request, Id::random());

        let reader = buffer.reader(key(&response));
        let handle = thread::spawn(move || reader.read(Some(Duration::from_secs(2))));

        thread::sleep(Duration::from_millis(50));
        buffer.writer().write(response.clone()).unwrap();

        assert_eq!(handle.join().unwrap(), Ok(response));

        buffer.close();
    }

    #[test]
    fn one_reply_one_reader() {
        let buffer = ReplyBuffer::new(Duration::from_secs(30));
        buffer.open();

        let request = Message::find_node_request(Id::random(), Id::random());
        let first = response_to(&request, Id::random());
        let mut second = first.clone();
        second.random_id = Id::random();

        let (results, received) = flume::unbounded();

        for _ in 0..2 {
            let reader = buffer.reader(key(&first));
            let results = results.clone();
            thread::spawn(move || results.send(reader.read(None)));
        }

        thread::sleep(Duration::from_millis(50));
        buffer.writer().write(first.clone()).unwrap();

        assert_eq!(received.recv().unwrap(), Ok(first));
        assert!(received.recv_timeout(Duration::from_millis(100)).is_err());

        buffer.writer().write(second.clone()).unwrap();

        assert_eq!(received.recv().unwrap(), Ok(second));

        buffer.close();
    }

    #[test]
    fn timeout_keeps_buffer_usable() {
        let buffer = ReplyBuffer::new(Duration::from_secs(30));
        buffer.open();

        let request = Message::find_node_request(Id::random(), Id::random());
        let response = response_to(&request, Id::random());
        let reader = buffer.reader(key(&response));

        let timeout = Duration::from_millis(100);
        let start = Instant::now();

        assert_eq!(reader.read(Some(timeout)), Err(ReadError::Timeout));

        let elapsed = start.elapsed();
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(100));

        // A late reply is still claimed by the next read.
        buffer.writer().write(response.clone()).unwrap();
        assert_eq!(reader.read(Some(timeout)), Ok(response));

        buffer.close();
    }

    #[test]
    fn reply_racing_a_timeout_is_kept() {
        let buffer = ReplyBuffer::new(Duration::from_secs(30));
        buffer.open();

        let mut lost = 0;

        for i in 0..500_u64 {
            let request = Message::find_node_request(Id::random(), Id::random());
            let response = response_to(&request, Id::random());
            let reader = buffer.reader(key(&response));

            let writer = buffer.writer();
            let late = response.clone();
            let handle = thread::spawn(move || {
                thread::sleep(Duration::from_micros(900 + (i % 200)));
                writer.write(late).unwrap();
            });

            let first = reader.read(Some(Duration::from_millis(1)));
            handle.join().unwrap();

            let read = match first {
                Ok(message) => Ok(message),
                Err(_) => reader.read(Some(Duration::from_millis(200))),
            };

            if read != Ok(response) {
                lost += 1;
            }
        }

        assert_eq!(lost, 0, "replies lost after a timed out read");

        buffer.close();
    }

    #[test]
    fn close_wakes_all_readers() {
        let buffer = ReplyBuffer::new(Duration::from_secs(30));
        buffer.open();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let request = Message::find_node_request(Id::random(), Id::random());
                let reader = buffer.reader(key(&response_to(&request, Id::random())));

                thread::spawn(move || reader.read(None))
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        buffer.close();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Err(ReadError::ClosedBuffer));
        }

        // Idempotent.
        buffer.close();
        assert!(!buffer.is_open());
    }

    #[test]
    fn closed_buffer() {
        let buffer = ReplyBuffer::new(Duration::from_secs(30));

        let request = Message::find_node_request(Id::random(), Id::random());
        let response = response_to(&request, Id::random());

        assert_eq!(
            buffer.writer().write(response.clone()),
            Err(ReadError::ClosedBuffer)
        );
        assert_eq!(
            buffer.reader(key(&response)).read(None),
            Err(ReadError::ClosedBuffer)
        );

        buffer.open();
        buffer.writer().write(response.clone()).unwrap();
        assert_eq!(buffer.reader(key(&response)).read(None), Ok(response));
        buffer.close();
    }

    #[test]
    fn cancel() {
        let buffer = ReplyBuffer::new(Duration::from_secs(30));
        buffer.open();

        let request = Message::find_node_request(Id::random(), Id::random());
        let response = response_to(&request, Id::random());

        let reader = buffer.reader(key(&response));
        let blocked = reader.clone();
        let handle = thread::spawn(move || blocked.read(None));

        thread::sleep(Duration::from_millis(50));
        reader.cancel();

        assert_eq!(handle.join().unwrap(), Err(ReadError::Cancelled));

        buffer.close();
    }

    #[test]
    fn expired_replies_are_dropped() {
        let buffer = ReplyBuffer::new(Duration::from_millis(50));
        buffer.open();

        let request = Message::find_node_request(Id::random(), Id::random());
        let response = response_to(&request, Id::random());

        buffer.writer().write(response.clone()).unwrap();
        thread::sleep(Duration::from_millis(200));

        assert_eq!(
            buffer
                .reader(key(&response))
                .read(Some(Duration::from_millis(50))),
            Err(ReadError::Timeout)
        );

        buffer.close();
    }
}
