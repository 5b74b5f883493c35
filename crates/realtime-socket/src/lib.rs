//! Websocket transport for hosted Postgres realtime channels.
//!
//! [`RealtimeSocket`] implements
//! [`ChangeTransport`](realtime_change_stream::ChangeTransport) over the
//! provider's channel protocol. Every subscription of a
//! [`ChangeStreamClient`](realtime_change_stream::ChangeStreamClient) becomes
//! one channel joined with a `postgres_changes` filter, and all channels share
//! one connection.
//!
//! ```no_run
//! use realtime_change_stream::{ChangeStreamClient, ClientConfig, SubscriptionSpec};
//! use realtime_socket::{RealtimeSocket, SocketConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let socket = RealtimeSocket::spawn(SocketConfig::from_env()?)?;
//! let client = ChangeStreamClient::new(socket, ClientConfig::default());
//!
//! let _handle = client.subscribe(SubscriptionSpec::new("personas"), |change| {
//!     println!("{} {}", change.kind(), change.table());
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod socket;

pub use config::{API_KEY_ENV, PROTOCOL_VERSION, SocketConfig, URL_ENV};
pub use error::Error;
pub use socket::RealtimeSocket;

pub type Result<T> = std::result::Result<T, Error>;
