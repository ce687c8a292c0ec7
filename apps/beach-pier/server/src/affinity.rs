//! Session-affinity cookies.
//!
//! Every tunnelled exchange is answered with cookies naming the account and
//! port so follow-up requests for relative URLs (`/app.js`, `/api/...`) reach
//! the same tunnel without the `/tunnel/` prefix. The pair is MAC'd with a
//! relay secret; cookies the relay did not issue are rejected.

use std::{collections::HashMap, sync::Arc};

use axum::http::{header, HeaderMap, HeaderValue};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use beach_pier_core::PortId;
use hmac::{Hmac, Mac};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::RouteError;

pub const API_KEY_COOKIE: &str = "BeachPier_api_key";
pub const PORT_COOKIE: &str = "BeachPier_client_port";
pub const SIGNATURE_COOKIE: &str = "BeachPier_affinity";

type HmacSha256 = Hmac<sha2::Sha256>;

const COOKIE_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Clone)]
pub struct AffinitySigner {
    secret: Arc<[u8]>,
}

impl AffinitySigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: Arc::from(secret.into()),
        }
    }

    /// Per-process secret; cookies stop verifying after a restart.
    pub fn random() -> Self {
        Self::new(rand::random::<[u8; 32]>().to_vec())
    }

    fn mac(&self, api_key: &str, port: PortId) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("invalid hmac key");
        mac.update(api_key.as_bytes());
        mac.update(b":");
        mac.update(port.to_string().as_bytes());
        mac
    }

    fn sign(&self, api_key: &str, port: PortId) -> String {
        URL_SAFE_NO_PAD.encode(self.mac(api_key, port).finalize().into_bytes())
    }

    fn verify(&self, api_key: &str, port: PortId, signature: &str) -> bool {
        match URL_SAFE_NO_PAD.decode(signature) {
            Ok(bytes) => self.mac(api_key, port).verify_slice(&bytes).is_ok(),
            Err(_) => false,
        }
    }

    /// `Set-Cookie` values binding the caller's session to this tunnel.
    pub fn issue(&self, api_key: &str, port: PortId) -> Vec<HeaderValue> {
        [
            (API_KEY_COOKIE, api_key.to_string()),
            (PORT_COOKIE, port.to_string()),
            (SIGNATURE_COOKIE, self.sign(api_key, port)),
        ]
        .into_iter()
        .filter_map(|(name, value)| {
            HeaderValue::from_str(&format!(
                "{name}={}; Path=/; HttpOnly; SameSite=Lax",
                utf8_percent_encode(&value, COOKIE_VALUE)
            ))
            .ok()
        })
        .collect()
    }

    /// `None` when the request carries no affinity cookies at all.
    pub fn resolve(&self, headers: &HeaderMap) -> Option<Result<(String, PortId), RouteError>> {
        let cookies = parse_cookies(headers);
        let api_key = cookies.get(API_KEY_COOKIE);
        let port = cookies.get(PORT_COOKIE);
        if api_key.is_none() && port.is_none() {
            return None;
        }

        let resolved = (|| {
            let api_key = api_key.filter(|key| !key.is_empty())?;
            let port: PortId = port?.parse().ok()?;
            let signature = cookies.get(SIGNATURE_COOKIE)?;
            self.verify(api_key, port, signature)
                .then(|| (api_key.clone(), port))
        })();
        Some(resolved.ok_or(RouteError::InvalidAffinity))
    }
}

fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for value in headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let Some((name, raw)) = pair.trim().split_once('=') else {
                continue;
            };
            let raw = raw.trim().trim_matches('"');
            if let Ok(decoded) = percent_decode_str(raw).decode_utf8() {
                cookies
                    .entry(name.trim().to_string())
                    .or_insert_with(|| decoded.into_owned());
            }
        }
    }
    cookies
}
