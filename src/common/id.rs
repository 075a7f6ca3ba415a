//! Kademlia node Id or a lookup target
use rand::Rng;
use std::{
    convert::TryInto,
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::Error;

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
pub const MAX_DISTANCE: u8 = ID_SIZE as u8 * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, Error> {
        let bytes = bytes.as_ref();

        let inner: [u8; ID_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidIdSize(bytes.len()))?;

        Ok(Id(inner))
    }

    /// XOR metric between this Id and another.
    pub fn xor(&self, other: &Id) -> Distance {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Distance(result)
    }

    /// Simplified XOR distance between this Id and a target Id.
    ///
    /// The distance is the number of trailing non zero bits in the XOR result.
    ///
    /// Distance to self is 0
    /// Distance to the furthest Id is 160
    /// Distance to an Id with 5 leading matching bits is 155
    pub fn distance(&self, other: &Id) -> u8 {
        MAX_DISTANCE - self.xor(other).leading_zeros()
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id, Error> {
        if s.len() != ID_SIZE * 2 || !s.is_ascii() {
            return Err(Error::InvalidId(s.to_string()));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidId(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

/// The XOR of two [Id]s, ordered as a big-endian 160 bit integer.
#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
pub struct Distance(pub [u8; ID_SIZE]);

impl Distance {
    pub fn leading_zeros(&self) -> u8 {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return (i as u32 * 8 + byte.leading_zeros()) as u8;
            }
        }

        MAX_DISTANCE
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", Id(self.0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distance_to_self() {
        let id = Id::random();
        let distance = id.distance(&id);
        assert_eq!(distance, 0)
    }

    #[test]
    fn distance_to_id() {
        let id = Id::from_str("0639A1E24FBB8AB277DF033476AB0DE10FAB3BDC").unwrap();

        let target = Id::from_str("035b1aeb9737ade1a80933594f405d3f772aa08e").unwrap();

        let distance = id.distance(&target);

        assert_eq!(distance, 155)
    }

    #[test]
    fn distance_to_random_id() {
        let id = Id::random();
        let target = Id::random();

        let distance = id.distance(&target);

        assert_ne!(distance, 0)
    }

    #[test]
    fn xor_orders_by_closeness() {
        let target = Id([0; ID_SIZE]);

        let mut near = [0; ID_SIZE];
        near[ID_SIZE - 1] = 1;
        let mut far = [0; ID_SIZE];
        far[0] = 1;

        assert!(target.xor(&Id(near)) < target.xor(&Id(far)));
        assert_eq!(target.xor(&target).leading_zeros(), MAX_DISTANCE);
    }

    #[test]
    fn hex_round_trip() {
        let hex = "8f2d6ae2378dda228d3bd39c41a4b6f6f538a41a";
        let id = Id::from_str(hex).unwrap();

        assert_eq!(id.to_string(), hex);
        assert_eq!(Id::from_bytes(id.as_bytes()).unwrap(), id);
    }

    #[test]
    fn invalid_hex() {
        assert!(Id::from_str("8f2d").is_err());
        assert!(Id::from_str("zz2d6ae2378dda228d3bd39c41a4b6f6f538a41a").is_err());
        assert!(Id::from_bytes([0_u8; 19]).is_err());
    }
}
