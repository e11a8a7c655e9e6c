//! framebroker: a video frame broker
//!
//! Named *sources* push frames in; named *streams* pull re-encoded frames
//! out, one stream per subscriber. The broker encodes each source once and
//! adapts the encoded byte stream per subscriber through a reencoder:
//! a byte-exact direct copy when encodings match, a registered codec-native
//! recode when one exists for the pair, or a full decode/encode otherwise.
//!
//! ```no_run
//! use framebroker::client::{Connection, SourceHandle, StreamHandle};
//! use framebroker::server::{BrokerConfig, BrokerServer};
//!
//! # async fn example() -> framebroker::Result<()> {
//! let addr = "127.0.0.1:7721".parse().unwrap();
//! let broker = BrokerServer::new(BrokerConfig::with_addr(addr));
//! tokio::spawn(async move { broker.run().await });
//!
//! let conn = Connection::connect(addr).await?;
//! let mut cam = SourceHandle::open(&conn, "cam").await?;
//! cam.set_encoding("jpeg:q=80").await?;
//!
//! let mut view = StreamHandle::open(&conn, "cam", "raw").await?;
//! let frame = view.recv_frame().await?;
//! # let _ = frame;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod options;
pub mod reencode;
pub mod router;
pub mod server;
pub mod session;
pub mod source;
pub mod stream;

pub use error::{Error, ErrorCode, Result};
pub use frame::{Frame, FrameProperties, PixelDepth};
pub use message::Message;
pub use options::Options;
pub use server::{BrokerConfig, BrokerServer};
