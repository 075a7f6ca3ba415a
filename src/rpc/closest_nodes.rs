use crate::common::{Contact, Id};

/// Lookup bookkeeping for one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNode {
    pub contact: Contact,
    /// Set once a request was sent, never cleared.
    pub queried: bool,
    /// Set on an on-time or late reply.
    pub answered: bool,
}

/// Lookup candidates sorted by xor distance to the target, without duplicates.
#[derive(Debug, Clone)]
pub struct ClosestNodes {
    target: Id,
    nodes: Vec<PendingNode>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            nodes: Vec::with_capacity(64),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn nodes(&self) -> &[PendingNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn has_unqueried(&self) -> bool {
        self.nodes.iter().any(|node| !node.queried)
    }

    // === Public Methods ===

    /// Insert an unqueried candidate, returns false if its distance is already present.
    pub fn add(&mut self, contact: Contact) -> bool {
        let seek = contact.id.xor(&self.target);

        match self
            .nodes
            .binary_search_by(|probe| probe.contact.id.xor(&self.target).cmp(&seek))
        {
            Ok(_) => false,
            Err(pos) => {
                self.nodes.insert(
                    pos,
                    PendingNode {
                        contact,
                        queried: false,
                        answered: false,
                    },
                );
                true
            }
        }
    }

    /// Mark up to `count` of the closest unqueried candidates as queried and return them.
    pub fn next_unqueried(&mut self, count: usize) -> Vec<Contact> {
        self.nodes
            .iter_mut()
            .filter(|node| !node.queried)
            .take(count)
            .map(|node| {
                node.queried = true;
                node.contact
            })
            .collect()
    }

    pub fn mark_answered(&mut self, id: &Id) {
        if let Some(node) = self.nodes.iter_mut().find(|node| &node.contact.id == id) {
            node.answered = true;
        }
    }

    /// The first `count` candidates in ascending distance order.
    pub fn closest(&self, count: usize) -> Vec<Contact> {
        self.nodes
            .iter()
            .take(count)
            .map(|node| node.contact)
            .collect()
    }

    /// Every candidate that replied.
    pub fn answered(&self) -> Vec<Contact> {
        self.nodes
            .iter()
            .filter(|node| node.answered)
            .map(|node| node.contact)
            .collect()
    }
}

impl IntoIterator for ClosestNodes {
    type Item = PendingNode;
    type IntoIter = std::vec::IntoIter<PendingNode>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestNodes {
    type Item = &'a PendingNode;
    type IntoIter = std::slice::Iter<'a, PendingNode>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}
