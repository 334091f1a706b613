//! # StreamCam Test Utilities
//!
//! Shared test utilities for the transport and engine crates.
//!
//! This crate provides:
//! - An in-process RTMP server (`StubRtmpServer`) with scripted behavior
//!
//! ## Usage
//!
//! ```rust,ignore
//! use streamcam_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let server = StubRtmpServer::spawn(StubBehavior::Publish).await.unwrap();
//!     let uri = server.uri("live", "key");
//!     // ... publish to `uri` ...
//!     assert!(server.stats().published);
//! }
//! ```

pub mod stub_server;

pub use stub_server::*;
