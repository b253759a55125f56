//! RTMP ingest server
//!
//! A TCP accept loop hands each connection to a driver task that runs the
//! handshake, speaks the chunk protocol, admits the publisher through the
//! token store, and feeds parsed frames into the registry. The connection
//! is the cancellation root for its stream: when it ends, segmentation is
//! stopped and the stream marked stopped, exactly once.

pub mod connection;
pub mod listener;

pub use connection::Connection;
pub use listener::IngestServer;
