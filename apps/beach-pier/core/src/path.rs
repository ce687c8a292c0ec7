//! Explicit tunnel addressing: `/tunnel/<account>_<port>/<rest>`.
//!
//! The last `_`-delimited token of the encoded segment is always the port and
//! must parse as a `u16`; everything before it is the account key. Account keys
//! may contain `_` (and may even end in digits) because encoders always append
//! `_<port>` after the full key.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;

use crate::protocol::PortId;

pub const TUNNEL_ROOT: &str = "/tunnel";
const SEPARATOR: char = '_';

const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'-')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub api_key: String,
    pub port: PortId,
    pub inner_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("path is not addressed to a tunnel")]
    NotTunnelPath,
    #[error("tunnel path is missing the account/port segment")]
    MissingSegment,
    #[error("tunnel segment has no `_<port>` suffix")]
    MissingPort,
    #[error("tunnel segment has an empty account key")]
    EmptyAccount,
    #[error("invalid tunnel port `{0}`")]
    InvalidPort(String),
    #[error("account key is not valid percent-encoded UTF-8")]
    InvalidEncoding,
}

/// True for `/tunnel` and anything under `/tunnel/`.
pub fn is_tunnel_path(path: &str) -> bool {
    path == TUNNEL_ROOT
        || path
            .strip_prefix(TUNNEL_ROOT)
            .is_some_and(|rest| rest.starts_with('/'))
}

pub fn decode_tunnel_path(path: &str) -> Result<TunnelTarget, DecodeError> {
    if !is_tunnel_path(path) {
        return Err(DecodeError::NotTunnelPath);
    }
    let rest = path[TUNNEL_ROOT.len()..].trim_start_matches('/');
    let (segment, remainder) = match rest.split_once('/') {
        Some((segment, remainder)) => (segment, Some(remainder)),
        None => (rest, None),
    };
    if segment.is_empty() {
        return Err(DecodeError::MissingSegment);
    }

    let (api_key, port) = split_account_port(segment)?;
    let inner_path = match remainder {
        Some(remainder) => format!("/{remainder}"),
        None => "/".to_string(),
    };

    Ok(TunnelTarget {
        api_key,
        port,
        inner_path,
    })
}

/// Splits `<account>_<port>` on the last separator.
pub fn split_account_port(segment: &str) -> Result<(String, PortId), DecodeError> {
    let (account, port) = segment
        .rsplit_once(SEPARATOR)
        .ok_or(DecodeError::MissingPort)?;
    let port: PortId = port
        .parse()
        .map_err(|_| DecodeError::InvalidPort(port.to_string()))?;
    let api_key = percent_decode_str(account)
        .decode_utf8()
        .map_err(|_| DecodeError::InvalidEncoding)?
        .into_owned();
    if api_key.is_empty() {
        return Err(DecodeError::EmptyAccount);
    }
    Ok((api_key, port))
}

pub fn encode_tunnel_path(api_key: &str, port: PortId, inner_path: &str) -> String {
    let inner = inner_path.trim_start_matches('/');
    format!(
        "{TUNNEL_ROOT}/{}{SEPARATOR}{port}/{inner}",
        utf8_percent_encode(api_key, SEGMENT)
    )
}
