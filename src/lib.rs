//! Async client for servers speaking the RESP wire protocol.

mod client;
mod connection;
mod executor;
mod parser;
mod pipeline;
mod protocol;
mod pubsub;
mod types;

pub use client::{connect, Client};
pub use connection::ConnectOptions;
pub use pipeline::Pipeline;
pub use protocol::{pairs_to_map, Command, Reply, ToArg};
pub use pubsub::{Event, PubSubSession};
pub use types::{Error, ResultT};
