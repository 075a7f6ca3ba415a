//! Thread safe contact directory.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::common::{Contact, Id, InsertError, RoutingTable, StatusEntry};

/// The node's routing table behind a single mutex.
///
/// Every operation holds the lock for a short, I/O free critical section.
#[derive(Debug)]
pub struct Dht {
    id: Id,
    table: Mutex<RoutingTable>,
}

impl Dht {
    pub fn new(id: Id) -> Self {
        Self {
            id,
            table: Mutex::new(RoutingTable::new(id)),
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    // === Public Methods ===

    pub fn insert(&self, contact: Contact) -> Result<(), InsertError> {
        self.table().add(contact)
    }

    pub fn remove(&self, id: &Id) {
        self.table().remove(id)
    }

    /// Up to K known contacts ordered by distance to `target`.
    pub fn find_node(&self, target: &Id) -> Vec<Contact> {
        self.table().closest(target)
    }

    /// The `count` closest known contacts to `target`, to seed a lookup with.
    pub fn alpha_contacts(&self, target: &Id, count: usize) -> Vec<Contact> {
        self.table().closest_n(target, count)
    }

    pub fn status(&self) -> Vec<StatusEntry> {
        self.table().status()
    }

    pub fn size(&self) -> usize {
        self.table().size()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.table().contains(id)
    }

    // === Private Methods ===

    fn table(&self) -> MutexGuard<'_, RoutingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn concurrent_inserts() {
        let dht = Arc::new(Dht::new(Id::random()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dht = dht.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        let _ = dht.insert(Contact::random());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // Random ids mostly land in the top buckets, some of which may fill up.
        assert!(dht.size() > 20);
        assert_eq!(dht.status().len(), dht.size());
    }

    #[test]
    fn alpha_contacts() {
        let dht = Dht::new(Id::random());

        for _ in 0..10 {
            dht.insert(Contact::random()).unwrap();
        }

        let target = Id::random();
        let alpha = dht.alpha_contacts(&target, 3);

        assert_eq!(alpha.len(), 3);
        assert_eq!(alpha, dht.find_node(&target)[..3].to_vec());
    }
}
