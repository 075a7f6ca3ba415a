//! Simplified Kademlia routing table

use std::collections::BTreeMap;
use std::slice::Iter;

use crate::common::{Contact, Id, MAX_DISTANCE};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

#[derive(Debug, Clone)]
/// Simplified Kademlia routing table
pub struct RoutingTable {
    id: Id,
    buckets: BTreeMap<u8, KBucket>,
}

/// One routing table entry as reported by [RoutingTable::status].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// Index of the highest bit differing from the local id, `0..160`.
    pub bucket_index: u8,
    pub contact: Contact,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InsertError {
    #[error("Refusing to add own id to the routing table")]
    OwnId,

    /// The bucket is at capacity; `head` is its least recently seen contact.
    #[error("Bucket {bucket_index} is at capacity")]
    BucketFull { bucket_index: u8, head: Contact },
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        let buckets = BTreeMap::new();

        RoutingTable { id, buckets }
    }

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    // === Public Methods ===

    /// Attempts to add a contact to this routing table.
    ///
    /// Adding a known contact moves it to the tail of its bucket.
    pub fn add(&mut self, contact: Contact) -> Result<(), InsertError> {
        let distance = self.id.distance(contact.id());

        if distance == 0 {
            return Err(InsertError::OwnId);
        }

        let bucket_index = distance - 1;

        self.buckets
            .entry(bucket_index)
            .or_default()
            .add(contact)
            .map_err(|head| InsertError::BucketFull { bucket_index, head })
    }

    /// Remove a contact from this routing table.
    pub fn remove(&mut self, id: &Id) {
        let distance = self.id.distance(id);

        if distance == 0 {
            return;
        }

        if let Some(bucket) = self.buckets.get_mut(&(distance - 1)) {
            bucket.remove(id)
        }
    }

    /// Return the [MAX_BUCKET_SIZE_K] closest contacts to the target.
    pub fn closest(&self, target: &Id) -> Vec<Contact> {
        self.closest_n(target, MAX_BUCKET_SIZE_K)
    }

    /// Return up to `count` contacts ordered by xor distance to the target.
    pub fn closest_n(&self, target: &Id, count: usize) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self.contacts().collect();

        contacts.sort_by_key(|contact| contact.id.xor(target));
        contacts.truncate(count);

        contacts
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Return the number of contacts in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.contacts.len())
    }

    /// Returns an iterator over the contacts in this routing table.
    pub fn contacts(&self) -> impl Iterator<Item = Contact> + '_ {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.iter().copied())
    }

    /// Snapshot of every contact with the index of the bucket holding it.
    pub fn status(&self) -> Vec<StatusEntry> {
        self.buckets
            .iter()
            .flat_map(|(bucket_index, bucket)| {
                bucket.iter().map(move |contact| StatusEntry {
                    bucket_index: *bucket_index,
                    contact: *contact,
                })
            })
            .collect()
    }

    pub fn contains(&self, id: &Id) -> bool {
        let distance = self.id.distance(id);

        if distance == 0 || distance > MAX_DISTANCE {
            return false;
        }

        self.buckets
            .get(&(distance - 1))
            .map(|bucket| bucket.contains(id))
            .unwrap_or(false)
    }
}

/// Kbuckets hold up to [MAX_BUCKET_SIZE_K] contacts, sorted by the least recently seen.
#[derive(Debug, Clone)]
pub struct KBucket {
    contacts: Vec<Contact>,
}

impl KBucket {
    pub fn new() -> Self {
        KBucket {
            contacts: Vec::with_capacity(MAX_BUCKET_SIZE_K),
        }
    }

    // === Public Methods ===

    /// Returns the head of the bucket as an error if it is full.
    pub fn add(&mut self, incoming: Contact) -> Result<(), Contact> {
        if let Some(index) = self.iter().position(|c| c.id() == incoming.id()) {
            // Refresh: the incoming address wins, possibly updating the port.
            self.contacts.remove(index);
            self.contacts.push(incoming);

            Ok(())
        } else if self.contacts.len() < MAX_BUCKET_SIZE_K {
            self.contacts.push(incoming);

            Ok(())
        } else {
            Err(self.contacts[0])
        }
    }

    pub fn remove(&mut self, id: &Id) {
        self.contacts.retain(|contact| contact.id() != id);
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, Contact> {
        self.contacts.iter()
    }

    fn contains(&self, id: &Id) -> bool {
        self.iter().any(|contact| contact.id() == id)
    }
}

impl Default for KBucket {
    fn default() -> Self {
        Self::new()
    }
}
