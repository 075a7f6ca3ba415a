//! Iterative FIND_NODE lookup.
//!
//! Each round sends up to `alpha` requests to the closest unqueried candidates.
//! A candidate that misses the request timeout becomes a loser: it keeps being
//! awaited in the background and its late reply is merged like any other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flume::Sender;
use tracing::{debug, trace};

use crate::common::{Contact, Id, Message, MessageBody, MAX_BUCKET_SIZE_K};

use super::client::RpcError;
use super::config::{DEFAULT_ALPHA, DEFAULT_LATE_REPLY_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
use super::reply_buffer::ReadError;
use super::response::Response;
use super::closest_nodes::ClosestNodes;

/// How often a loser checks whether its lookup is over.
const LOSER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Anything able to send a FIND_NODE request and hand back a [Response].
pub trait Rpc: Send + Sync {
    fn find_node(&self, contact: &Contact, target: Id) -> Result<Response, RpcError>;
}

/// Outcome of a finished lookup.
#[derive(Debug, Clone, Default)]
pub struct LookupResult {
    /// Up to K candidates in ascending distance to the target, answered or not.
    pub closest: Vec<Contact>,
    /// Every candidate that replied, on time or late.
    pub responders: Vec<Contact>,
}

/// Run a lookup with the default parameters and return up to K closest contacts.
pub fn node_lookup<R: Rpc + ?Sized + 'static>(
    rpc: Arc<R>,
    target: Id,
    seeds: Vec<Contact>,
) -> Vec<Contact> {
    NodeLookup::new(rpc, target, seeds).run().closest
}

#[derive(Debug)]
enum Outcome {
    Answered {
        contact: Contact,
        contacts: Vec<Contact>,
    },
    /// No usable reply; the candidate stays unanswered.
    Failed { contact: Contact, error: RpcError },
    /// Missed the request timeout, handed off to the loser path.
    TimedOut { contact: Contact, response: Response },
    Late {
        contact: Contact,
        contacts: Vec<Contact>,
    },
    /// A loser that never answered.
    Gone { contact: Contact },
}

pub struct NodeLookup<R: ?Sized> {
    rpc: Arc<R>,
    target: Id,
    seeds: Vec<Contact>,
    exclude: Option<Id>,
    alpha: usize,
    k: usize,
    request_timeout: Duration,
    late_reply_timeout: Duration,
}

impl<R: Rpc + ?Sized + 'static> NodeLookup<R> {
    pub fn new(rpc: Arc<R>, target: Id, seeds: Vec<Contact>) -> Self {
        Self {
            rpc,
            target,
            seeds,
            exclude: None,
            alpha: DEFAULT_ALPHA,
            k: MAX_BUCKET_SIZE_K,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            late_reply_timeout: DEFAULT_LATE_REPLY_TIMEOUT,
        }
    }

    // === Options ===

    /// Never add or query this id, usually the local node's own.
    pub fn exclude(mut self, id: Id) -> Self {
        self.exclude = Some(id);
        self
    }

    pub fn with_alpha(mut self, alpha: usize) -> Self {
        self.alpha = alpha.max(1);
        self
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_late_reply_timeout(mut self, timeout: Duration) -> Self {
        self.late_reply_timeout = timeout;
        self
    }

    // === Public Methods ===

    /// Query candidates until none is left unqueried and no loser is pending,
    /// or until losers stayed silent for the late reply timeout.
    ///
    /// Never fails, a lookup where nobody answers returns its seeds.
    pub fn run(self) -> LookupResult {
        let mut candidates = ClosestNodes::new(self.target);

        for seed in &self.seeds {
            if Some(seed.id) != self.exclude {
                candidates.add(*seed);
            }
        }

        debug!(
            context = "lookup",
            target = %self.target,
            seeds = candidates.len(),
            "Starting node lookup"
        );

        let (sender, receiver) = flume::unbounded::<Outcome>();
        let done = Arc::new(AtomicBool::new(false));

        let mut losers: HashMap<Id, Response> = HashMap::new();
        let mut late_deadline: Option<Instant> = None;
        let mut rounds = 0;

        loop {
            let round = candidates.next_unqueried(self.alpha);

            if round.is_empty() {
                if losers.is_empty() {
                    break;
                }

                let deadline =
                    *late_deadline.get_or_insert_with(|| Instant::now() + self.late_reply_timeout);

                match receiver.recv_deadline(deadline) {
                    Ok(outcome) => self.handle(outcome, &mut candidates, &mut losers),
                    Err(_) => {
                        debug!(
                            context = "lookup",
                            target = %self.target,
                            losers = losers.len(),
                            "Gave up on late replies"
                        );
                        break;
                    }
                }

                continue;
            }

            late_deadline = None;
            rounds += 1;

            trace!(context = "lookup", target = %self.target, round = rounds, size = round.len());

            for contact in &round {
                self.spawn_request(*contact, sender.clone(), done.clone());
            }

            // Wait for every member to answer, fail, or hand off to the loser path,
            // merging late replies from earlier rounds as they come.
            let mut remaining = round.len();

            while remaining > 0 {
                match receiver.recv() {
                    Ok(outcome) => {
                        if matches!(
                            outcome,
                            Outcome::Answered { .. }
                                | Outcome::Failed { .. }
                                | Outcome::TimedOut { .. }
                        ) {
                            remaining -= 1;
                        }

                        self.handle(outcome, &mut candidates, &mut losers);
                    }
                    // We hold a sender, unreachable.
                    Err(_) => break,
                }
            }
        }

        done.store(true, Ordering::Release);

        for response in losers.values() {
            response.cancel();
        }

        let result = LookupResult {
            closest: candidates.closest(self.k),
            responders: candidates.answered(),
        };

        debug!(
            context = "lookup",
            target = %self.target,
            rounds,
            candidates = candidates.len(),
            responders = result.responders.len(),
            "Node lookup done"
        );

        result
    }

    // === Private Methods ===

    fn spawn_request(&self, contact: Contact, sender: Sender<Outcome>, done: Arc<AtomicBool>) {
        let rpc = self.rpc.clone();
        let target = self.target;
        let timeout = self.request_timeout;
        let failed = sender.clone();

        let spawned = thread::Builder::new()
            .name("kadnet-lookup".to_string())
            .spawn(move || request(&*rpc, contact, target, timeout, sender, &done));

        if let Err(error) = spawned {
            debug!(context = "lookup", ?contact, ?error, "Failed to spawn request thread");

            let _ = failed.send(Outcome::Failed {
                contact,
                error: RpcError::ThreadSpawn,
            });
        }
    }

    fn handle(
        &self,
        outcome: Outcome,
        candidates: &mut ClosestNodes,
        losers: &mut HashMap<Id, Response>,
    ) {
        match outcome {
            Outcome::Answered { contact, contacts } => {
                self.merge(contact, contacts, candidates);
            }
            Outcome::Late { contact, contacts } => {
                losers.remove(&contact.id);
                trace!(context = "lookup", ?contact, "Late reply");
                self.merge(contact, contacts, candidates);
            }
            Outcome::TimedOut { contact, response } => {
                trace!(context = "lookup", ?contact, "Request timed out");
                losers.insert(contact.id, response);
            }
            Outcome::Failed { contact, error } => {
                debug!(context = "lookup", ?contact, ?error, "Request failed");
            }
            Outcome::Gone { contact } => {
                losers.remove(&contact.id);
            }
        }
    }

    fn merge(&self, from: Contact, contacts: Vec<Contact>, candidates: &mut ClosestNodes) {
        candidates.mark_answered(&from.id);

        for contact in contacts {
            if Some(contact.id) != self.exclude {
                candidates.add(contact);
            }
        }
    }
}

/// Send one FIND_NODE and report how it went, following it on the loser path
/// if it times out.
fn request<R: Rpc + ?Sized>(
    rpc: &R,
    contact: Contact,
    target: Id,
    timeout: Duration,
    sender: Sender<Outcome>,
    done: &AtomicBool,
) {
    let response = match rpc.find_node(&contact, target) {
        Ok(response) => response,
        Err(error) => {
            let _ = sender.send(Outcome::Failed { contact, error });
            return;
        }
    };

    let outcome = match response.read(Some(timeout)) {
        Ok(message) => match contacts_of(message) {
            Ok(contacts) => Outcome::Answered { contact, contacts },
            Err(error) => Outcome::Failed { contact, error },
        },
        Err(ReadError::Timeout) => Outcome::TimedOut {
            contact,
            response: response.clone(),
        },
        Err(error) => Outcome::Failed {
            contact,
            error: error.into(),
        },
    };

    let timed_out = matches!(outcome, Outcome::TimedOut { .. });

    if sender.send(outcome).is_err() || !timed_out {
        return;
    }

    let _ = sender.send(await_loser(contact, &response, done));
}

/// Wait without a deadline for a loser, until it answers or the lookup ends.
fn await_loser(contact: Contact, response: &Response, done: &AtomicBool) -> Outcome {
    loop {
        match response.read(Some(LOSER_POLL_INTERVAL)) {
            Ok(message) => {
                return match contacts_of(message) {
                    Ok(contacts) => Outcome::Late { contact, contacts },
                    Err(_) => Outcome::Gone { contact },
                }
            }
            Err(ReadError::Timeout) if !done.load(Ordering::Acquire) => continue,
            Err(_) => return Outcome::Gone { contact },
        }
    }
}

fn contacts_of(message: Message) -> Result<Vec<Contact>, RpcError> {
    let key = message.multiplex_key();

    match message.body {
        MessageBody::FindNodeResponse { contacts, .. } => Ok(contacts),
        _ => Err(RpcError::UnexpectedResponse(key)),
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use crate::common::CorrelationKey;
    use crate::rpc::ReplyBuffer;

    use super::*;

    /// Answers find_node requests through a real [ReplyBuffer] after a delay.
    struct FakeRpc {
        id: Id,
        replies: ReplyBuffer,
        peers: HashMap<Id, (Duration, Vec<Contact>)>,
        unreachable: HashSet<Id>,
        requested: Mutex<Vec<Id>>,
        threads: Mutex<Vec<Option<String>>>,
    }

    impl FakeRpc {
        fn new() -> Self {
            let replies = ReplyBuffer::new(Duration::from_secs(30));
            replies.open();

            Self {
                id: Id::random(),
                replies,
                peers: HashMap::new(),
                unreachable: HashSet::new(),
                requested: Mutex::new(vec![]),
                threads: Mutex::new(vec![]),
            }
        }

        fn peer(&mut self, contact: Contact, delay: Duration, contacts: Vec<Contact>) {
            self.peers.insert(contact.id, (delay, contacts));
        }
    }

    impl Rpc for FakeRpc {
        fn find_node(&self, contact: &Contact, target: Id) -> Result<Response, RpcError> {
            self.requested.lock().unwrap().push(contact.id);
            self.threads
                .lock()
                .unwrap()
                .push(thread::current().name().map(String::from));

            if self.unreachable.contains(&contact.id) {
                return Err(RpcError::MuxStopped);
            }

            let request = Message::find_node_request(self.id, target);
            let key = CorrelationKey::new(contact.id, request.random_id);

            if let Some((delay, contacts)) = self.peers.get(&contact.id).cloned() {
                let writer = self.replies.writer();
                let responder = contact.id;

                thread::spawn(move || {
                    thread::sleep(delay);
                    let response = Message::find_node_response(responder, &request, contacts);
                    let _ = writer.write(response);
                });
            }

            Ok(Response::new(*contact, self.replies.reader(key)))
        }
    }

    fn sorted(mut contacts: Vec<Contact>, target: &Id) -> Vec<Contact> {
        contacts.sort_by_key(|c| c.id.xor(target));
        contacts
    }

    #[test]
    fn converges() {
        let target = Id::random();
        let mut rpc = FakeRpc::new();

        let seeds: Vec<Contact> = (0..3).map(|_| Contact::random()).collect();
        let discovered: Vec<Contact> = (0..3).map(|_| Contact::random()).collect();

        for (seed, new) in seeds.iter().zip(&discovered) {
            // Each seed also returns itself, which must not be queried twice.
            rpc.peer(*seed, Duration::from_millis(10), vec![*new, *seed]);
            rpc.peer(*new, Duration::from_millis(10), vec![]);
        }

        let rpc = Arc::new(rpc);
        let result = NodeLookup::new(rpc.clone(), target, seeds.clone()).run();

        let mut all = seeds.clone();
        all.extend(discovered);

        assert_eq!(result.closest, sorted(all.clone(), &target));
        assert_eq!(result.responders.len(), 6);
        assert_eq!(rpc.requested.lock().unwrap().len(), 6);
    }

    #[test]
    fn late_replies_are_incorporated() {
        let target = Id::random();
        let mut rpc = FakeRpc::new();

        let seeds: Vec<Contact> = (0..3).map(|_| Contact::random()).collect();
        let discovered: Vec<Contact> = (0..3).map(|_| Contact::random()).collect();

        for (seed, new) in seeds.iter().zip(&discovered) {
            rpc.peer(*seed, Duration::from_millis(300), vec![*new]);
            rpc.peer(*new, Duration::from_millis(10), vec![]);
        }

        let start = Instant::now();

        let result = NodeLookup::new(Arc::new(rpc), target, seeds.clone())
            .with_request_timeout(Duration::from_millis(100))
            .with_late_reply_timeout(Duration::from_secs(2))
            .run();

        let mut all = seeds;
        all.extend(discovered);

        assert_eq!(result.closest, sorted(all, &target));
        assert_eq!(result.responders.len(), 6);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn unresponsive_seeds() {
        let target = Id::random();
        let rpc = FakeRpc::new();

        let seeds: Vec<Contact> = (0..4).map(|_| Contact::random()).collect();

        let start = Instant::now();

        let result = NodeLookup::new(Arc::new(rpc), target, seeds.clone())
            .with_request_timeout(Duration::from_millis(50))
            .with_late_reply_timeout(Duration::from_millis(200))
            .run();

        assert_eq!(result.closest, sorted(seeds, &target));
        assert!(result.responders.is_empty());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn send_errors() {
        let target = Id::random();
        let mut rpc = FakeRpc::new();

        let reachable = Contact::random();
        let unreachable = Contact::random();

        rpc.peer(reachable, Duration::from_millis(10), vec![]);
        rpc.unreachable.insert(unreachable.id);

        let result = NodeLookup::new(Arc::new(rpc), target, vec![reachable, unreachable]).run();

        assert_eq!(result.responders, vec![reachable]);
        assert_eq!(result.closest.len(), 2);
    }

    #[test]
    fn excludes_own_id() {
        let target = Id::random();
        let mut rpc = FakeRpc::new();

        let own = Contact::random();
        let seed = Contact::random();
        rpc.peer(seed, Duration::from_millis(10), vec![own]);

        let rpc = Arc::new(rpc);
        let closest = NodeLookup::new(rpc.clone(), target, vec![seed, own])
            .exclude(own.id)
            .run()
            .closest;

        assert_eq!(closest, vec![seed]);
        assert_eq!(*rpc.requested.lock().unwrap(), vec![seed.id]);
    }

    #[test]
    fn returns_at_most_k() {
        let target = Id::random();
        let mut rpc = FakeRpc::new();

        let seed = Contact::random();
        let many: Vec<Contact> = (0..30).map(|_| Contact::random()).collect();

        for contact in &many {
            rpc.peer(*contact, Duration::from_millis(5), vec![]);
        }
        rpc.peer(seed, Duration::from_millis(5), many);

        let closest = node_lookup(Arc::new(rpc), target, vec![seed]);

        assert_eq!(closest.len(), MAX_BUCKET_SIZE_K);
    }

    #[test]
    fn requests_run_on_named_threads() {
        let target = Id::random();
        let mut rpc = FakeRpc::new();

        let seeds: Vec<Contact> = (0..3).map(|_| Contact::random()).collect();
        for seed in &seeds {
            rpc.peer(*seed, Duration::from_millis(5), vec![]);
        }

        let rpc = Arc::new(rpc);
        NodeLookup::new(rpc.clone(), target, seeds).run();

        let threads = rpc.threads.lock().unwrap();
        assert_eq!(threads.len(), 3);
        assert!(threads
            .iter()
            .all(|name| name.as_deref() == Some("kadnet-lookup")));
    }

    #[test]
    fn spawn_failure_leaves_candidate_unanswered() {
        let target = Id::random();
        let contact = Contact::random();

        let lookup = NodeLookup::new(Arc::new(FakeRpc::new()), target, vec![]);

        let mut candidates = ClosestNodes::new(target);
        candidates.add(contact);
        candidates.next_unqueried(1);

        let mut losers = HashMap::new();
        lookup.handle(
            Outcome::Failed {
                contact,
                error: RpcError::ThreadSpawn,
            },
            &mut candidates,
            &mut losers,
        );

        assert!(candidates.answered().is_empty());
        assert!(losers.is_empty());
        assert!(!candidates.has_unqueried());
    }
}
