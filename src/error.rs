//! Main Crate Error

use crate::common::{DecodeError, InsertError};
use crate::rpc::{ReadError, RecvError, RpcError};

#[derive(thiserror::Error, Debug)]
/// Kadnet crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Recv(#[from] RecvError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Insert(#[from] InsertError),

    /// Expected a 40 characters hex string.
    #[error("Invalid Id: {0:?}")]
    InvalidId(String),

    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    #[error("Invalid ip address: {0:?}")]
    InvalidIp(String),
}
