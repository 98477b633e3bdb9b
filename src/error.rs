use std::io;
use std::net::SocketAddr;

use failure::Fail;

/// Failure modes of `Server::try_open_connection` / `Client::try_open_connection`.
#[derive(Debug, Fail)]
pub enum OpenError {
    #[fail(display = "failed to bind local UDP socket: {}", _0)]
    Bind(#[cause] io::Error),
    #[fail(display = "no server address has been set")]
    NoServerAddress,
}

impl From<io::Error> for OpenError {
    fn from(x: io::Error) -> Self {
        OpenError::Bind(x)
    }
}

/// Failure modes of any datagram send path (`send_to`, `send_to_all`, `send_to_server`, ...).
#[derive(Debug, Fail)]
pub enum SendError {
    #[fail(display = "failed to send {} byte datagram to {}: {}", len, to, source)]
    Io {
        len: usize,
        to: SocketAddr,
        #[cause]
        source: io::Error,
    },
    #[fail(display = "no server address has been set")]
    NoServerAddress,
    #[fail(display = "connection is not open")]
    NotOpen,
}
