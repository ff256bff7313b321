//! Typed client for the `latexocr.LatexOCR` gRPC service.
//!
//! The Python `latex_ocr_server` package exposes three unary calls over a
//! plaintext loopback channel. This crate carries the message definitions
//! and a small client around `tonic`, so the application does not need a
//! `protoc` toolchain at build time.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use latex_ocr_rpc::LatexOcrClient;
//!
//! # async fn run() -> Result<(), latex_ocr_rpc::RpcError> {
//! let mut client = LatexOcrClient::connect(50051, Duration::from_millis(200)).await?;
//! if client.is_ready().await? {
//!     let latex = client.generate_latex("/tmp/formula.png").await?;
//!     println!("{latex}");
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod messages;

pub use client::LatexOcrClient;
pub use messages::{Empty, LatexReply, LatexRequest, ServerConfig, ServerIsReadyReply};

use std::time::Duration;

use thiserror::Error;

/// Fully qualified service name, as declared in `latex_ocr.proto`.
pub const SERVICE_NAME: &str = "latexocr.LatexOCR";

/// Errors returned by [`LatexOcrClient`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RpcError {
    /// The channel could not be created or the connection attempt failed.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The server answered with a non-OK gRPC status.
    #[error("server returned {}: {}", .0.code(), .0.message())]
    Status(#[from] tonic::Status),

    /// The connection was not established before the deadline.
    #[error("server was not reachable before the deadline ({}ms)", .0.as_millis())]
    Timeout(Duration),
}
