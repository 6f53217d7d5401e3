//! remote-desk-stream - screen capture and framed streaming for remote desktop sessions
//!
//! This library provides:
//! - Screen capture with GPU duplication, software fallback and cursor compositing
//! - A framed duplex wire protocol over TCP or QUIC
//! - Host sessions that stream changed regions to a viewer
//! - A viewer-side renderer that paints regions onto a virtual-desktop surface
//!
//! # Examples
//!
//! ```no_run
//! use remote_desk_stream::{config::ConfigManager, logging, viewer::ViewerSession};
//! use remote_desk_stream::transport::TransportOptions;
//!
//! # async fn run() -> remote_desk_stream::Result<()> {
//! let config = ConfigManager::new()?.load_or_create_default()?;
//! logging::init_logging(config.logging.level);
//!
//! let viewer = ViewerSession::connect(
//!     "tcp://127.0.0.1:7070",
//!     TransportOptions::new(config.transport.clone()),
//! )
//! .await?;
//! viewer.wait_for_close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod viewer;

// Re-export commonly used types at crate root
pub use error::{Result, StreamError};
