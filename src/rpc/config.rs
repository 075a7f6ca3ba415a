use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use crate::common::Id;

/// Port to try binding to when [Config::port] is not set.
pub const DEFAULT_PORT: u16 = 7777;
/// Per-candidate timeout before a lookup treats a node as a loser.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);
/// How long a lookup keeps waiting on losers once nothing else is left to query.
pub const DEFAULT_LATE_REPLY_TIMEOUT: Duration = Duration::from_secs(2);
/// Lookup concurrency per round.
pub const DEFAULT_ALPHA: usize = 3;
/// Worker pool size for inbound requests.
pub const DEFAULT_WORKERS: usize = 10;
/// Lifetime of a reply nobody claimed yet.
pub const DEFAULT_REPLY_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_WRITER_CACHE_SIZE: usize = 256;

#[derive(Debug, Clone)]
/// Rpc manager configurations
pub struct Config {
    /// Ip address to bind the UDP socket to.
    ///
    /// Defaults to `0.0.0.0`
    pub address: IpAddr,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, where [DEFAULT_PORT] is tried first, falling back
    /// to a random port picked by the OS.
    pub port: Option<u16>,
    /// Fixed node Id.
    ///
    /// Defaults to None, where a random Id is generated.
    pub id: Option<Id>,
    /// Lookup request timeout duration.
    ///
    /// The shorter this duration is, the more nodes end up on the late reply path,
    /// which delays the end of a lookup by up to [Config::late_reply_timeout].
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Defaults to [DEFAULT_LATE_REPLY_TIMEOUT]
    pub late_reply_timeout: Duration,
    /// Defaults to [DEFAULT_ALPHA]
    pub alpha: usize,
    /// Number of threads handling inbound requests.
    ///
    /// Defaults to [DEFAULT_WORKERS]
    pub workers: usize,
    /// Defaults to [DEFAULT_REPLY_TTL]
    pub reply_ttl: Duration,
    /// Maximum number of per-address writers kept by the dispatcher.
    ///
    /// Defaults to [DEFAULT_WRITER_CACHE_SIZE]
    pub writer_cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: None,
            id: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            late_reply_timeout: DEFAULT_LATE_REPLY_TIMEOUT,
            alpha: DEFAULT_ALPHA,
            workers: DEFAULT_WORKERS,
            reply_ttl: DEFAULT_REPLY_TTL,
            writer_cache_size: DEFAULT_WRITER_CACHE_SIZE,
        }
    }
}
