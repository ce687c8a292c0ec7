//! Shared primitives for Beach Pier: the control-connection wire protocol and
//! the `/tunnel/<account>_<port>/...` addressing scheme. Both the relay and the
//! tunnel client depend on this crate so message shapes never drift.

pub mod path;
pub mod protocol;

pub use path::{decode_tunnel_path, encode_tunnel_path, is_tunnel_path, DecodeError, TunnelTarget};
pub use protocol::{
    ClientMessage, HeaderMap, OneOrMany, PortId, PortRegisterAck, QueryMap, RequestEnvelope,
    ResponseEnvelope, ServerMessage,
};

/// Route the control connection upgrades on.
pub const CONTROL_PATH: &str = "/_pier/connect";
