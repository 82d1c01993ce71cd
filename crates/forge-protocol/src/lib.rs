//! Wire protocol between a build master and its slave processes.
//!
//! A slave connects to the master over loopback TCP, exchanges a versioned
//! `Hello`, then asks for its command, parameters, output objects and input
//! hashes, forwards its logs, and finally registers its result.
//!
//! - [`BuildCodec`] frames messages as `[u32 len][u8 tag][bincode]`
//! - [`FramedChannel`] sends and receives frames with a send timeout
//! - [`ProcessBuilderRemote`] is the request surface the master provides
//! - [`RemoteClient`] implements it for the slave over a channel
//! - [`serve_connection`] dispatches a slave's requests on the master

pub mod channel;
pub mod client;
pub mod codec;
pub mod error;
pub mod message;
pub mod remote;
pub mod server;

pub use channel::{FramedChannel, DEFAULT_SEND_TIMEOUT};
pub use client::RemoteClient;
pub use codec::BuildCodec;
pub use error::{ForwardError, ProtocolError, ProtocolResult};
pub use message::{codes, BuildMessage, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
pub use remote::ProcessBuilderRemote;
pub use server::{accept_handshake, bind_loopback, serve_connection};
