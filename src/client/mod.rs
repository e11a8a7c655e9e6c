//! Client library
//!
//! The peer-side API: a shared [`Connection`] plus producing
//! [`SourceHandle`]s and subscribing [`StreamHandle`]s.

pub mod connection;
pub mod source;
pub mod stream;

pub use connection::{Connection, StreamChunk};
pub use source::{list_sources, SourceHandle};
pub use stream::StreamHandle;
