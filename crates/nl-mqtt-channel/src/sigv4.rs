//! AWS Signature Version 4 presigning for the IoT WebSocket endpoint.
//!
//! The gateway authenticates the WebSocket upgrade through query
//! parameters rather than headers, so the whole signature travels in the
//! URL returned by [`presign_url`].

use std::fmt;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const IOT_SERVICE: &str = "iotdevicegateway";

const METHOD: &str = "GET";
const CANONICAL_URI: &str = "/mqtt";
const SIGNED_HEADERS: &str = "host";
const TERMINATOR: &str = "aws4_request";

/// RFC 3986 unreserved characters pass through; everything else is escaped.
const RFC3986: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Temporary AWS credentials handed out by the NaviLink login flow.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_key: String,
    /// Empty for long-term keys.
    pub session_token: String,
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_key: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_key: secret_key.into(),
            session_token: session_token.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_key", &"<redacted>")
            .field(
                "session_token",
                &if self.session_token.is_empty() { "" } else { "<redacted>" },
            )
            .finish()
    }
}

/// Where the signature is valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningParams {
    pub host: String,
    pub region: String,
    pub service: String,
}

impl SigningParams {
    pub fn iot(host: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            region: region.into(),
            service: IOT_SERVICE.to_string(),
        }
    }
}

/// Build a presigned `wss://` URL for the MQTT endpoint.
///
/// Deterministic for fixed inputs. Expiry of `credentials` is not checked
/// here; the broker rejects stale signatures at upgrade time.
pub fn presign_url(params: &SigningParams, credentials: &Credentials, now: DateTime<Utc>) -> String {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!("{date}/{}/{}/{TERMINATOR}", params.region, params.service);

    let mut query = vec![
        ("X-Amz-Algorithm", ALGORITHM.to_string()),
        (
            "X-Amz-Credential",
            format!("{}/{scope}", credentials.access_key_id),
        ),
        ("X-Amz-Date", amz_date.clone()),
        ("X-Amz-SignedHeaders", SIGNED_HEADERS.to_string()),
    ];
    if !credentials.session_token.is_empty() {
        query.push(("X-Amz-Security-Token", credentials.session_token.clone()));
    }
    let canonical_query = canonical_query_string(&query);

    let canonical_request = format!(
        "{METHOD}\n{CANONICAL_URI}\n{canonical_query}\nhost:{}\n\n{SIGNED_HEADERS}\n{}",
        params.host,
        hex::encode(Sha256::digest(b"")),
    );
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes())),
    );

    let key = signing_key(&credentials.secret_key, &date, &params.region, &params.service);
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

    format!(
        "wss://{}{CANONICAL_URI}?{canonical_query}&X-Amz-Signature={signature}",
        params.host
    )
}

fn canonical_query_string(pairs: &[(&str, String)]) -> String {
    let mut encoded: Vec<(String, String)> = pairs
        .iter()
        .map(|(k, v)| (encode(k), encode(v)))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, RFC3986).to_string()
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, TERMINATOR.as_bytes())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
