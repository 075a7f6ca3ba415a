//! Struct and implementation of the Contact entry in the Kademlia routing table
use std::convert::TryInto;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};

use crate::common::{DecodeError, Id, ID_SIZE};

/// Size of a serialized [Contact]: id + port + ip.
pub const CONTACT_SIZE: usize = ID_SIZE + 2 + 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Contact entry in Kademlia routing table
pub struct Contact {
    pub id: Id,
    /// Kept canonical: Ipv4-mapped Ipv6 addresses are stored as Ipv4, the way
    /// they come back from the wire.
    pub ip: IpAddr,
    pub port: u16,
}

impl Contact {
    /// Creates a new Contact from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Contact {
        Contact {
            id,
            ip: address.ip().to_canonical(),
            port: address.port(),
        }
    }

    /// Creates a contact with random id at a random localhost port.
    pub fn random() -> Contact {
        Contact {
            id: Id::random(),
            ip: [127, 0, 0, 1].into(),
            port: rand::random(),
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    // === Public Methods ===

    /// Serialize into the fixed 38 bytes wire layout:
    /// `id (20) | port (2, big-endian) | ip (16)`.
    ///
    /// Ipv4 addresses are written as Ipv4-mapped Ipv6 addresses.
    pub fn to_bytes(&self) -> [u8; CONTACT_SIZE] {
        let mut out = [0_u8; CONTACT_SIZE];
        self.write_to(&mut &mut out[..]);
        out
    }

    pub(crate) fn write_to<B: BufMut>(&self, buf: &mut B) {
        let ip = match self.ip {
            IpAddr::V4(ip) => ip.to_ipv6_mapped(),
            IpAddr::V6(ip) => ip,
        };

        buf.put_slice(self.id.as_bytes());
        buf.put_u16(self.port);
        buf.put_slice(&ip.octets());
    }

    /// Parse a single 38 bytes contact record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Contact, DecodeError> {
        if bytes.len() != CONTACT_SIZE {
            return Err(DecodeError::InvalidContact(bytes.len()));
        }

        let mut buf = bytes;

        let id: [u8; ID_SIZE] = buf[..ID_SIZE]
            .try_into()
            .map_err(|_| DecodeError::InvalidContact(bytes.len()))?;
        buf.advance(ID_SIZE);

        let port = buf.get_u16();

        let octets: [u8; 16] = buf
            .try_into()
            .map_err(|_| DecodeError::InvalidContact(bytes.len()))?;
        let ip = Ipv6Addr::from(octets);

        let ip = match ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(ip),
        };

        Ok(Contact {
            id: Id(id),
            ip,
            port,
        })
    }

    /// Parse a concatenation of contact records.
    ///
    /// Fails without parsing anything if the length is not a multiple of [CONTACT_SIZE].
    pub fn list_from_bytes(bytes: &[u8]) -> Result<Vec<Contact>, DecodeError> {
        if bytes.len() % CONTACT_SIZE != 0 {
            return Err(DecodeError::MalformedContactList(bytes.len()));
        }

        bytes.chunks_exact(CONTACT_SIZE).map(Contact::from_bytes).collect()
    }
}
