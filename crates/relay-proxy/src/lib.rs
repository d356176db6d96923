//! Method-agnostic gRPC stream proxying.
//!
//! The relay accepts any gRPC method on its listener and forwards the raw
//! request and response frames to a healthy worker without parsing payloads:
//!
//! - **`codec`** — opaque-frame codec and gRPC wire framing helpers
//! - **`proxy`** — per-RPC plumbing: worker selection, pooled connection,
//!   bidirectional frame forwarding, header/trailer preservation
//! - **`server`** — the h2c listener with keepalive and graceful drain

pub mod codec;
pub mod proxy;
pub mod server;

pub use codec::{Frame, FrameDecoder, RawCodec};
pub use proxy::Proxy;
pub use server::{GrpcServer, ServerError};
