//! Connection-oriented messaging over UDP.
//!
//! A single-listener [`server::Server`] accepts many [`client::Client`] peers over plain
//! UDP datagrams framed by [`codec::Frame`]. Both roles share an [`endpoint`] base: a bound
//! socket, a receiver worker and a ticker worker, and a small [`events`] broker for
//! observing handshake, data, and disconnect activity from another thread.
//!
//! This crate does not provide reliability, ordering, retransmission, congestion control,
//! encryption, or NAT traversal; see each module's documentation for exactly what is and
//! isn't handled.

pub mod client;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod ip;
pub mod server;
pub mod ticker;

pub use client::{Client, ClientEvent};
pub use codec::Frame;
pub use error::{OpenError, SendError};
pub use events::{drain, Delivery, Signal, SubscriptionId};
pub use ip::{FixedIpResolver, PublicIpResolver, RouteProbeResolver};
pub use server::{ClientId, ClientView, Server, ServerEvent};
