use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use base64::Engine;
use hmac::Mac;
use log::debug;

use crate::{
    core::types::Dictionary,
    peer::ChallengeHandler,
};

/// The authentication method name for WAMP-CRA.
pub const WAMP_CRA: &str = "wampcra";

const DEFAULT_ITERATIONS: u32 = 1000;
const DEFAULT_KEY_LENGTH: usize = 32;

/// Derives a salted key from a secret, as the router does for salted WAMP-CRA credentials.
///
/// The key is PBKDF2-HMAC-SHA256 over the secret, encoded as base64.
pub fn derive_key(secret: &str, salt: &str, iterations: u32, key_length: usize) -> String {
    let mut key = vec![0u8; key_length];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(secret.as_bytes(), salt.as_bytes(), iterations, &mut key);
    base64::prelude::BASE64_STANDARD.encode(key)
}

/// Signs a challenge string with the given key.
///
/// The signature is HMAC-SHA256 over the challenge, encoded as base64.
pub fn sign_challenge(key: &[u8], challenge: &str) -> Result<String> {
    let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(key)?;
    mac.update(challenge.as_bytes());
    Ok(base64::prelude::BASE64_STANDARD.encode(mac.finalize().into_bytes()))
}

/// A [`ChallengeHandler`] for WAMP-CRA.
///
/// Signs the challenge with the shared secret. If the router sends a salt, the secret is first
/// salted with the parameters the router sends.
pub struct WampCraChallengeHandler {
    secret: String,
}

impl WampCraChallengeHandler {
    pub fn new<S>(secret: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            secret: secret.into(),
        }
    }

    fn key(&self, extra: &Dictionary) -> Result<String> {
        let salt = match extra.get("salt") {
            Some(salt) => salt
                .string()
                .ok_or_else(|| Error::msg("salt must be a string"))?,
            None => return Ok(self.secret.clone()),
        };
        let iterations = match extra.get("iterations") {
            Some(iterations) => iterations
                .integer()
                .and_then(|iterations| u32::try_from(iterations).ok())
                .ok_or_else(|| Error::msg("iterations must be a 32-bit integer"))?,
            None => DEFAULT_ITERATIONS,
        };
        let key_length = match extra.get("keylen") {
            Some(key_length) => key_length
                .integer()
                .and_then(|key_length| usize::try_from(key_length).ok())
                .filter(|key_length| *key_length > 0)
                .ok_or_else(|| Error::msg("keylen must be a positive integer"))?,
            None => DEFAULT_KEY_LENGTH,
        };
        debug!("Deriving WAMP-CRA key with {iterations} iterations");
        Ok(derive_key(&self.secret, salt, iterations, key_length))
    }
}

#[async_trait]
impl ChallengeHandler for WampCraChallengeHandler {
    async fn handle_challenge(&self, auth_method: &str, extra: &Dictionary) -> Result<String> {
        if auth_method != WAMP_CRA {
            return Err(Error::msg(format!(
                "unsupported authentication method: {auth_method}"
            )));
        }
        let challenge = extra
            .get("challenge")
            .and_then(|challenge| challenge.string())
            .ok_or_else(|| Error::msg("challenge is missing"))?;
        sign_challenge(self.key(extra)?.as_bytes(), challenge)
    }
}
