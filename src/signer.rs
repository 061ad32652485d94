//! Signed location URLs.
//!
//! `expires` is plain unix seconds; `extra` is an HMAC-SHA256 over
//! `uri || server || client_id || expires`, base64url-encoded without
//! padding. The hash family and canonicalization are a deployment contract
//! with the cache fleet's verifier and must not change unilaterally.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("could not parse sign target: {0}")]
    BadTarget(String),
}

pub struct LinkSigner {
    secret: String,
    expiration: Duration,
}

impl LinkSigner {
    pub fn new(secret: &str, expiration: Duration) -> Self {
        Self {
            secret: secret.to_string(),
            expiration,
        }
    }

    /// Produces the final `https://<server><uri>?expires=..&extra=..`
    /// location.
    pub fn sign(&self, uri: &str, server: &str, client_id: &str) -> Result<String, SignError> {
        let expires = unix_now()
            .saturating_add(self.expiration.as_secs())
            .to_string();
        let extra = self.extra(uri, server, client_id, &expires);

        let raw = if server.contains("://") {
            format!("{server}{uri}")
        } else {
            format!("https://{server}{uri}")
        };
        let mut target = Url::parse(&raw).map_err(|err| SignError::BadTarget(err.to_string()))?;
        target
            .set_scheme("https")
            .map_err(|_| SignError::BadTarget(raw.clone()))?;
        target
            .query_pairs_mut()
            .clear()
            .append_pair("expires", &expires)
            .append_pair("extra", &extra);

        Ok(target.to_string())
    }

    /// The opaque token. Equal inputs within one second sign identically.
    fn extra(&self, uri: &str, server: &str, client_id: &str, expires: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(uri.as_bytes());
        mac.update(server.as_bytes());
        mac.update(client_id.as_bytes());
        mac.update(expires.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
