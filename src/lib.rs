#![doc = include_str!("../README.md")]

mod common;
mod dht;
mod error;
pub mod rpc;

pub use crate::common::{
    messages, Contact, CorrelationKey, DecodeError, Distance, Id, InsertError, Message,
    MessageBody, MessageType, RoutingTable, StatusEntry, CONTACT_SIZE, ID_SIZE,
    MAX_BUCKET_SIZE_K,
};
pub use bytes::Bytes;
pub use dht::Dht;
pub use error::Error;
pub use rpc::{Config, RpcManager};

/// Alias for `Result<T, kadnet::Error>`
pub type Result<T, E = Error> = core::result::Result<T, E>;
