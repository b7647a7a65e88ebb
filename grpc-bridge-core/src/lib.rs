//! Core RPC vocabulary shared by `grpc-bridge` and RPC engine implementations.
//!
//! ## Modules
//!
//! - [`status`]: status codes and [`Status`]
//! - [`metadata`]: ordered, multi-valued [`Metadata`]
//! - [`buffer`]: readable/writable buffer contracts
//! - [`deframer`]: length-prefixed framing and [`MessageDeframer`]
//! - [`codec`]: per-message compression codecs

pub mod buffer;
pub mod codec;
pub mod deframer;
pub mod metadata;
pub mod status;

pub use buffer::*;
pub use codec::*;
pub use deframer::*;
pub use metadata::*;
pub use status::*;
