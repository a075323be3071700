//! The ImageServer TCP protocol: wire framing (§4.3), connection lifecycle
//! (§4.4), and the pipelined request/response engine (§4.5).

pub mod codec;
pub mod connection;
pub mod pipeline;

pub use codec::{Codec, Frame, FrameCodec, MethodCall, MethodResponse, ProtoError, WireMessage};
pub use connection::Connection;
pub use pipeline::{FirstFrame, Pipeliner};
