use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("no endpoint for network protocol {0:#06x}")]
    UnknownProtocol(u16),

    #[error("address {0} is already assigned")]
    DuplicateAddress(std::net::IpAddr),

    #[error("address {0} is not assigned or not removable")]
    BadLocalAddress(std::net::IpAddr),

    #[error("no entry for address {0}")]
    BadAddress(std::net::IpAddr),

    #[error("endpoint is in an invalid state for this operation")]
    InvalidEndpointState,

    #[error("operation not supported")]
    NotSupported,

    #[error("link-address resolution in progress")]
    WouldBlock,

    #[error("no route to {0}")]
    NoRoute(std::net::IpAddr),
}

pub type Result<T> = std::result::Result<T, Error>;
