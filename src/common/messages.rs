//! Serialize and deserialize kadnet wire messages.
//!
//! ```text
//! <- 1 byte      <- 20 bytes  <- 20 bytes        <- X bytes  <- 20 bytes
//!  MultiplexKey     SenderID     EchoedRandomID     Payload     RandomID
//! ```
//!
//! `EchoedRandomID` is only present on responses.

use std::convert::TryFrom;
use std::fmt::{self, Display, Formatter};

use bytes::{BufMut, Bytes, BytesMut};

use crate::common::{Contact, Id, CONTACT_SIZE, ID_SIZE, MAX_BUCKET_SIZE_K};

/// Size of the opaque payload carried by a store request.
pub const STORE_PAYLOAD_SIZE: usize = 38;

/// Size of a request header: multiplex key + sender id.
pub const REQUEST_HEADER_SIZE: usize = 1 + ID_SIZE;
/// Size of a response header: multiplex key + sender id + echoed random id.
pub const RESPONSE_HEADER_SIZE: usize = 1 + ID_SIZE + ID_SIZE;

pub const PING_REQ_SIZE: usize = REQUEST_HEADER_SIZE + ID_SIZE;
pub const PING_RES_SIZE: usize = RESPONSE_HEADER_SIZE + ID_SIZE;
pub const FIND_NODE_REQ_SIZE: usize = REQUEST_HEADER_SIZE + ID_SIZE + ID_SIZE;
pub const FIND_VALUE_REQ_SIZE: usize = FIND_NODE_REQ_SIZE;
pub const STORE_REQ_SIZE: usize = REQUEST_HEADER_SIZE + STORE_PAYLOAD_SIZE + ID_SIZE;
pub const STORE_RES_SIZE: usize = PING_RES_SIZE;
/// Size of a find_node response with an empty contact list.
pub const FIND_NODE_RES_MIN_SIZE: usize = RESPONSE_HEADER_SIZE + ID_SIZE;
/// Size of a find_node response carrying K contacts.
pub const FIND_NODE_RES_MAX_SIZE: usize =
    FIND_NODE_RES_MIN_SIZE + CONTACT_SIZE * MAX_BUCKET_SIZE_K;

/// Largest frame any [MessageType] can produce.
pub const MAX_FRAME_SIZE: usize = FIND_NODE_RES_MAX_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
/// The multiplex key: first byte of every frame.
pub enum MessageType {
    FindNodeReq = 20,
    FindNodeRes = 21,
    PingReq = 22,
    PingRes = 23,
    FindValueReq = 24,
    FindValueRes = 25,
    StoreReq = 26,
    StoreRes = 27,
}

/// How many bytes a frame of a given [MessageType] occupies on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSize {
    Exact(usize),
    /// `min + CONTACT_SIZE * n` for `n` in `0..=K`.
    ContactList { min: usize, max: usize },
}

impl FrameSize {
    /// Upper bound of bytes to read for this frame.
    pub fn max(&self) -> usize {
        match self {
            FrameSize::Exact(size) => *size,
            FrameSize::ContactList { max, .. } => *max,
        }
    }

    pub fn accepts(&self, len: usize) -> bool {
        match *self {
            FrameSize::Exact(size) => len == size,
            FrameSize::ContactList { min, max } => {
                len >= min && len <= max && (len - min) % CONTACT_SIZE == 0
            }
        }
    }
}

impl MessageType {
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            MessageType::FindNodeRes
                | MessageType::PingRes
                | MessageType::FindValueRes
                | MessageType::StoreRes
        )
    }

    pub fn is_request(&self) -> bool {
        !self.is_response()
    }

    pub fn frame_size(&self) -> FrameSize {
        match self {
            MessageType::FindNodeReq => FrameSize::Exact(FIND_NODE_REQ_SIZE),
            MessageType::FindValueReq => FrameSize::Exact(FIND_VALUE_REQ_SIZE),
            MessageType::PingReq => FrameSize::Exact(PING_REQ_SIZE),
            MessageType::PingRes => FrameSize::Exact(PING_RES_SIZE),
            MessageType::StoreReq => FrameSize::Exact(STORE_REQ_SIZE),
            MessageType::StoreRes => FrameSize::Exact(STORE_RES_SIZE),
            MessageType::FindNodeRes | MessageType::FindValueRes => FrameSize::ContactList {
                min: FIND_NODE_RES_MIN_SIZE,
                max: FIND_NODE_RES_MAX_SIZE,
            },
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(key: u8) -> Result<Self, Self::Error> {
        Ok(match key {
            20 => MessageType::FindNodeReq,
            21 => MessageType::FindNodeRes,
            22 => MessageType::PingReq,
            23 => MessageType::PingRes,
            24 => MessageType::FindValueReq,
            25 => MessageType::FindValueRes,
            26 => MessageType::StoreReq,
            27 => MessageType::StoreRes,
            _ => return Err(DecodeError::InvalidMessageType(key)),
        })
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::FindNodeReq => "find_node_req",
            MessageType::FindNodeRes => "find_node_res",
            MessageType::PingReq => "ping_req",
            MessageType::PingRes => "ping_res",
            MessageType::FindValueReq => "find_value_req",
            MessageType::FindValueRes => "find_value_res",
            MessageType::StoreReq => "store_req",
            MessageType::StoreRes => "store_res",
        };

        f.write_str(name)
    }
}

/// Identifies the one reply that answers a request: the responder's id and the
/// random id it echoed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub sender_id: Id,
    pub echoed_random_id: Id,
}

impl CorrelationKey {
    pub fn new(sender_id: Id, echoed_random_id: Id) -> Self {
        Self {
            sender_id,
            echoed_random_id,
        }
    }
}

impl Display for CorrelationKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.sender_id, self.echoed_random_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender_id: Id,
    /// Tags one outstanding request; echoed back by the matching response.
    pub random_id: Id,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    FindNodeRequest {
        target: Id,
    },
    FindNodeResponse {
        echoed_random_id: Id,
        contacts: Vec<Contact>,
    },
    PingRequest,
    PingResponse {
        echoed_random_id: Id,
    },
    FindValueRequest {
        key: Id,
    },
    FindValueResponse {
        echoed_random_id: Id,
        contacts: Vec<Contact>,
    },
    StoreRequest {
        payload: Bytes,
    },
    StoreResponse {
        echoed_random_id: Id,
    },
}

impl Message {
    /// A find_node request for `target` with a fresh random id.
    pub fn find_node_request(sender_id: Id, target: Id) -> Message {
        Message {
            sender_id,
            random_id: Id::random(),
            body: MessageBody::FindNodeRequest { target },
        }
    }

    /// A find_node response answering `request`.
    pub fn find_node_response(sender_id: Id, request: &Message, contacts: Vec<Contact>) -> Message {
        Message {
            sender_id,
            random_id: Id::random(),
            body: MessageBody::FindNodeResponse {
                echoed_random_id: request.random_id,
                contacts,
            },
        }
    }

    // === Getters ===

    pub fn multiplex_key(&self) -> MessageType {
        match self.body {
            MessageBody::FindNodeRequest { .. } => MessageType::FindNodeReq,
            MessageBody::FindNodeResponse { .. } => MessageType::FindNodeRes,
            MessageBody::PingRequest => MessageType::PingReq,
            MessageBody::PingResponse { .. } => MessageType::PingRes,
            MessageBody::FindValueRequest { .. } => MessageType::FindValueReq,
            MessageBody::FindValueResponse { .. } => MessageType::FindValueRes,
            MessageBody::StoreRequest { .. } => MessageType::StoreReq,
            MessageBody::StoreResponse { .. } => MessageType::StoreRes,
        }
    }

    pub fn is_response(&self) -> bool {
        self.multiplex_key().is_response()
    }

    pub fn echoed_random_id(&self) -> Option<Id> {
        match &self.body {
            MessageBody::FindNodeResponse {
                echoed_random_id, ..
            }
            | MessageBody::PingResponse { echoed_random_id }
            | MessageBody::FindValueResponse {
                echoed_random_id, ..
            }
            | MessageBody::StoreResponse { echoed_random_id } => Some(*echoed_random_id),
            _ => None,
        }
    }

    /// `SenderID ∥ EchoedRandomID` for responses, `None` for requests.
    pub fn correlation_key(&self) -> Option<CorrelationKey> {
        self.echoed_random_id()
            .map(|echoed| CorrelationKey::new(self.sender_id, echoed))
    }

    /// Contacts carried by find_node and find_value responses.
    pub fn contacts(&self) -> Option<&[Contact]> {
        match &self.body {
            MessageBody::FindNodeResponse { contacts, .. }
            | MessageBody::FindValueResponse { contacts, .. } => Some(contacts),
            _ => None,
        }
    }

    // === Public Methods ===

    pub fn to_bytes(&self) -> Bytes {
        let key = self.multiplex_key();

        let mut buf = BytesMut::with_capacity(key.frame_size().max());

        buf.put_u8(key as u8);
        buf.put_slice(self.sender_id.as_bytes());

        if let Some(echoed) = self.echoed_random_id() {
            buf.put_slice(echoed.as_bytes());
        }

        match &self.body {
            MessageBody::FindNodeRequest { target } => buf.put_slice(target.as_bytes()),
            MessageBody::FindValueRequest { key } => buf.put_slice(key.as_bytes()),
            MessageBody::FindNodeResponse { contacts, .. }
            | MessageBody::FindValueResponse { contacts, .. } => {
                for contact in contacts {
                    contact.write_to(&mut buf);
                }
            }
            MessageBody::StoreRequest { payload } => buf.put_slice(payload),
            MessageBody::PingRequest
            | MessageBody::PingResponse { .. }
            | MessageBody::StoreResponse { .. } => {}
        }

        buf.put_slice(self.random_id.as_bytes());

        buf.freeze()
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message, DecodeError> {
        let bytes = bytes.as_ref();

        let first = *bytes.first().ok_or(DecodeError::Empty)?;
        let key = MessageType::try_from(first)?;

        let size = key.frame_size();

        if !size.accepts(bytes.len()) {
            if let FrameSize::ContactList { min, max } = size {
                if bytes.len() >= min && bytes.len() <= max {
                    return Err(DecodeError::MalformedContactList(bytes.len() - min));
                }
            }

            return Err(DecodeError::InvalidMessage {
                key,
                expected: size.max(),
                actual: bytes.len(),
            });
        }

        let header = if key.is_response() {
            RESPONSE_HEADER_SIZE
        } else {
            REQUEST_HEADER_SIZE
        };
        let trailer = bytes.len() - ID_SIZE;

        let sender_id = id_at(bytes, 1);
        let random_id = id_at(bytes, trailer);
        let echoed_random_id = id_at(bytes, REQUEST_HEADER_SIZE);
        let payload = &bytes[header..trailer];

        let body = match key {
            MessageType::FindNodeReq => MessageBody::FindNodeRequest {
                target: id_at(payload, 0),
            },
            MessageType::FindValueReq => MessageBody::FindValueRequest {
                key: id_at(payload, 0),
            },
            MessageType::PingReq => MessageBody::PingRequest,
            MessageType::StoreReq => MessageBody::StoreRequest {
                payload: Bytes::copy_from_slice(payload),
            },
            MessageType::FindNodeRes => MessageBody::FindNodeResponse {
                echoed_random_id,
                contacts: Contact::list_from_bytes(payload)?,
            },
            MessageType::FindValueRes => MessageBody::FindValueResponse {
                echoed_random_id,
                contacts: Contact::list_from_bytes(payload)?,
            },
            MessageType::PingRes => MessageBody::PingResponse { echoed_random_id },
            MessageType::StoreRes => MessageBody::StoreResponse { echoed_random_id },
        };

        Ok(Message {
            sender_id,
            random_id,
            body,
        })
    }
}

/// Reads an [Id] at `offset`; callers validated the frame size beforehand.
fn id_at(bytes: &[u8], offset: usize) -> Id {
    let mut id = [0_u8; ID_SIZE];
    id.copy_from_slice(&bytes[offset..offset + ID_SIZE]);
    Id(id)
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// A frame that can't be turned into a [Message].
///
/// Always fatal to the single datagram, never to the connection.
pub enum DecodeError {
    #[error("Empty frame")]
    Empty,

    #[error("Invalid multiplex key: {0}")]
    InvalidMessageType(u8),

    #[error("Invalid {key} message: expected {expected} bytes, got {actual}")]
    InvalidMessage {
        key: MessageType,
        expected: usize,
        actual: usize,
    },

    #[error("Contact list of {0} bytes is not a multiple of {size}", size = CONTACT_SIZE)]
    MalformedContactList(usize),

    #[error("Invalid contact record of {0} bytes")]
    InvalidContact(usize),
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn id(hex: &str) -> Id {
        Id::from_str(hex).unwrap()
    }

    #[test]
    fn test_find_node_request() {
        let message = Message {
            sender_id: id("8bc8082329609092bf86dea25cf7784cd708cc5d"),
            random_id: id("dc03f8f281c7118225901c8655f788cd84e3f449"),
            body: MessageBody::FindNodeRequest {
                target: id("28f787e3b60f99fb29b14266c40b536d6037307e"),
            },
        };

        let bytes = message.to_bytes();

        assert_eq!(bytes.len(), FIND_NODE_REQ_SIZE);
        assert_eq!(bytes.len(), 61);
        assert_eq!(bytes[0], 20);
        assert_eq!(&bytes[1..21], message.sender_id.as_bytes());
        assert_eq!(&bytes[21..41], &id("28f787e3b60f99fb29b14266c40b536d6037307e").0);
        assert_eq!(&bytes[41..], message.random_id.as_bytes());

        let parsed = Message::from_bytes(&bytes).unwrap();

        assert_eq!(parsed, message);
        assert_eq!(parsed.correlation_key(), None);
    }

    #[test]
    fn test_find_node_response() {
        let request = Message::find_node_request(Id::random(), Id::random());
        let contacts = vec![Contact::random(), Contact::random()];
        let responder = Id::random();

        let message = Message::find_node_response(responder, &request, contacts.clone());
        let bytes = message.to_bytes();

        assert_eq!(bytes.len(), FIND_NODE_RES_MIN_SIZE + 2 * CONTACT_SIZE);
        assert_eq!(bytes[0], 21);
        assert_eq!(&bytes[21..41], request.random_id.as_bytes());

        let parsed = Message::from_bytes(&bytes).unwrap();

        assert_eq!(parsed, message);
        assert_eq!(parsed.contacts(), Some(&contacts[..]));
        assert_eq!(
            parsed.correlation_key(),
            Some(CorrelationKey::new(responder, request.random_id))
        );
    }

    #[test]
    fn test_empty_and_full_find_node_response() {
        let request = Message::find_node_request(Id::random(), Id::random());

        let empty = Message::find_node_response(Id::random(), &request, vec![]);
        assert_eq!(empty.to_bytes().len(), 61);
        assert_eq!(Message::from_bytes(empty.to_bytes()).unwrap(), empty);

        let contacts = (0..MAX_BUCKET_SIZE_K).map(|_| Contact::random()).collect();
        let full = Message::find_node_response(Id::random(), &request, contacts);
        assert_eq!(full.to_bytes().len(), FIND_NODE_RES_MAX_SIZE);
        assert_eq!(Message::from_bytes(full.to_bytes()).unwrap(), full);
    }

    #[test]
    fn test_other_message_types() {
        let sender_id = Id::random();
        let echoed_random_id = Id::random();

        let bodies = [
            (MessageBody::PingRequest, PING_REQ_SIZE),
            (MessageBody::PingResponse { echoed_random_id }, PING_RES_SIZE),
            (MessageBody::FindValueRequest { key: Id::random() }, 61),
            (
                MessageBody::FindValueResponse {
                    echoed_random_id,
                    contacts: vec![Contact::random()],
                },
                61 + CONTACT_SIZE,
            ),
            (
                MessageBody::StoreRequest {
                    payload: Bytes::from(vec![7; STORE_PAYLOAD_SIZE]),
                },
                79,
            ),
            (MessageBody::StoreResponse { echoed_random_id }, STORE_RES_SIZE),
        ];

        for (body, size) in bodies {
            let message = Message {
                sender_id,
                random_id: Id::random(),
                body,
            };

            let bytes = message.to_bytes();
            assert_eq!(bytes.len(), size, "{}", message.multiplex_key());
            assert_eq!(Message::from_bytes(&bytes).unwrap(), message);
        }

        assert_eq!(PING_REQ_SIZE, 41);
    }

    #[test]
    fn test_invalid_multiplex_key() {
        let mut bytes = Message::find_node_request(Id::random(), Id::random())
            .to_bytes()
            .to_vec();
        bytes[0] = 99;

        assert_eq!(
            Message::from_bytes(&bytes),
            Err(DecodeError::InvalidMessageType(99))
        );
        assert_eq!(Message::from_bytes(Vec::new()), Err(DecodeError::Empty));
    }

    #[test]
    fn test_wrong_request_size() {
        let bytes = Message::find_node_request(Id::random(), Id::random()).to_bytes();

        assert_eq!(
            Message::from_bytes(&bytes[..60]),
            Err(DecodeError::InvalidMessage {
                key: MessageType::FindNodeReq,
                expected: 61,
                actual: 60
            })
        );
    }

    #[test]
    fn test_malformed_contact_list() {
        let request = Message::find_node_request(Id::random(), Id::random());
        let response = Message::find_node_response(Id::random(), &request, vec![Contact::random()]);

        let mut bytes = response.to_bytes().to_vec();
        // Drop one byte of the contact record, keep the trailing random id intact.
        bytes.remove(RESPONSE_HEADER_SIZE);

        assert_eq!(
            Message::from_bytes(&bytes),
            Err(DecodeError::MalformedContactList(CONTACT_SIZE - 1))
        );
    }
}
