use std::sync::Arc;

use md5::{Digest, Md5};

use crate::domain::Params;
use crate::domain::ports::{Clock, SystemClock};

/// Replay window used when none is configured.
pub const DEFAULT_TTL_SECS: u64 = 5;

/// Parameter carrying the signature on signed requests and notifications.
pub const SIGN_PARAM: &str = "sign";

/// Parameter carrying the unix timestamp the signature is bound to.
pub const TIMESTAMP_PARAM: &str = "timestamp";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Signed request expired: {age}s old, window is {ttl}s")]
    ReplayExpired { age: i64, ttl: u64 },

    #[error("Signature mismatch")]
    SignatureMismatch,
}

/// Signs and verifies parameter sets with a shared secret.
///
/// The canonical form query-escapes every `k=v` pair, sorts the encoded
/// pairs, joins them with `&` and appends `&key=<secret>`. The signature is
/// the upper-case hex MD5 of that string.
#[derive(Clone)]
pub struct SignatureEngine {
    secret: String,
    ttl_secs: u64,
    clock: Arc<dyn Clock>,
}

impl SignatureEngine {
    pub fn new(secret: impl Into<String>, ttl_secs: u64) -> Self {
        Self::with_clock(secret, ttl_secs, Arc::new(SystemClock))
    }

    pub fn with_clock(secret: impl Into<String>, ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret: secret.into(),
            ttl_secs,
            clock,
        }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Current unix time according to the engine's clock.
    pub fn now_unix(&self) -> i64 {
        self.clock.now().unix_timestamp()
    }

    /// Order-independent encoding of `params`, without the secret.
    pub fn canonicalize(params: &Params) -> String {
        let mut pairs: Vec<String> = params
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |value| (key, value)))
            .map(|(key, value)| format!("{}={}", encode(key), encode(value)))
            .collect();
        pairs.sort_unstable();
        pairs.join("&")
    }

    pub fn generate(&self, params: &Params) -> String {
        let payload = format!("{}&key={}", Self::canonicalize(params), self.secret);
        hex::encode_upper(Md5::digest(payload.as_bytes()))
    }

    /// Check the replay window first, then the signature itself.
    ///
    /// Timestamps in the future are not rejected.
    pub fn verify(&self, timestamp: i64, signature: &str, params: &Params) -> Result<(), SignatureError> {
        let age = self.now_unix() - timestamp;
        if age > self.ttl_secs as i64 {
            return Err(SignatureError::ReplayExpired {
                age,
                ttl: self.ttl_secs,
            });
        }

        if self.generate(params) != signature {
            return Err(SignatureError::SignatureMismatch);
        }

        Ok(())
    }

    /// Add a `sign` parameter computed over the other parameters, replacing
    /// any existing one.
    pub fn sign_params(&self, params: &mut Params) {
        params.remove(SIGN_PARAM);
        let signature = self.generate(params);
        params.insert(SIGN_PARAM.to_string(), vec![signature]);
    }
}

/// Query escaping. Only alphanumerics and `-_.~` pass through unescaped;
/// space becomes `+`.
fn encode(raw: &str) -> String {
    // Every `%` in the output starts an escape, so `%20` only ever means space.
    urlencoding::encode(raw).replace("%20", "+")
}
