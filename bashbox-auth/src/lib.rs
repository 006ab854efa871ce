//! Time-bounded per-machine bearer tokens.
//!
//! The coordinator signs `"<unix_seconds>,<machine_id>"` with an Ed25519
//! private key; the worker verifies the token against its own machine id
//! inside a short liveness window. Tokens are hex-encoded, with the 64-byte
//! signature prepended to the message it covers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

/// Hex-decoded private key length: 32-byte seed followed by the public key.
pub const PRIVATE_KEY_LEN: usize = 64;
/// Hex-decoded public key length.
pub const PUBLIC_KEY_LEN: usize = 32;

const SIGNATURE_LEN: usize = 64;

/// Tolerated negative clock drift between signer and verifier.
const TIME_SLACK_SECS: i64 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed key")]
    BadKey,
    #[error("authentication failed")]
    BadAuth,
}

/// Generates a fresh keypair, returned as `(public, private)` hex strings.
pub fn gen_keypair() -> (String, String) {
    let key = SigningKey::generate(&mut OsRng);
    (
        hex::encode(key.verifying_key().to_bytes()),
        hex::encode(key.to_keypair_bytes()),
    )
}

fn parse_key<const N: usize>(hex_key: &str) -> Result<[u8; N], AuthError> {
    let bytes = hex::decode(hex_key).map_err(|_| AuthError::BadKey)?;
    bytes.try_into().map_err(|_| AuthError::BadKey)
}

fn new_msg(ts: DateTime<Utc>, mach_id: &str) -> String {
    format!("{},{}", ts.timestamp(), mach_id)
}

fn parse_msg(msg: &str) -> Result<(i64, &str), AuthError> {
    let fields: Vec<&str> = msg.split(',').collect();
    let [ts, mach_id] = fields[..] else {
        return Err(AuthError::BadAuth);
    };
    let ts = ts.parse::<i64>().map_err(|_| AuthError::BadAuth)?;
    Ok((ts, mach_id))
}

/// Produces tokens binding a timestamp to a target machine id.
#[derive(Debug)]
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    pub fn new(hex_priv: &str) -> Result<Self, AuthError> {
        let bytes = parse_key::<PRIVATE_KEY_LEN>(hex_priv)?;
        let key = SigningKey::from_keypair_bytes(&bytes).map_err(|_| AuthError::BadKey)?;
        Ok(Self { key })
    }

    /// Signs a token for `mach_id` stamped with `now`.
    pub fn sign(&self, now: DateTime<Utc>, mach_id: &str) -> String {
        let msg = new_msg(now, mach_id);
        let sig = self.key.sign(msg.as_bytes());
        let mut sealed = Vec::with_capacity(SIGNATURE_LEN + msg.len());
        sealed.extend_from_slice(&sig.to_bytes());
        sealed.extend_from_slice(msg.as_bytes());
        hex::encode(sealed)
    }
}

/// Accepts tokens for exactly one machine id within a liveness window.
#[derive(Debug)]
pub struct Verifier {
    key: VerifyingKey,
    mach_id: String,
    liveness: Duration,
}

impl Verifier {
    pub fn new(hex_pub: &str, target_mach_id: &str, liveness: Duration) -> Result<Self, AuthError> {
        let bytes = parse_key::<PUBLIC_KEY_LEN>(hex_pub)?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|_| AuthError::BadKey)?;
        Ok(Self {
            key,
            mach_id: target_mach_id.to_string(),
            liveness,
        })
    }

    /// Checks the signature, the timestamp window, and the machine id.
    pub fn verify(&self, now: DateTime<Utc>, token: &str) -> Result<(), AuthError> {
        let sealed = hex::decode(token).map_err(|_| AuthError::BadAuth)?;
        if sealed.len() < SIGNATURE_LEN {
            return Err(AuthError::BadAuth);
        }

        let (sig_bytes, msg) = sealed.split_at(SIGNATURE_LEN);
        let sig = Signature::from_slice(sig_bytes).map_err(|_| AuthError::BadAuth)?;
        if self.key.verify(msg, &sig).is_err() {
            tracing::debug!("bad signature");
            return Err(AuthError::BadAuth);
        }

        let msg = std::str::from_utf8(msg).map_err(|_| AuthError::BadAuth)?;
        let (ts, mach_id) = parse_msg(msg)?;

        let dt = now.timestamp() - ts;
        if !(-TIME_SLACK_SECS < dt && dt < self.liveness.as_secs() as i64) {
            tracing::debug!(dt, "timestamp outside liveness window");
            return Err(AuthError::BadAuth);
        }

        if mach_id != self.mach_id {
            tracing::debug!(got = mach_id, want = %self.mach_id, "machine id mismatch");
            return Err(AuthError::BadAuth);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVENESS: Duration = Duration::from_secs(5);

    #[test]
    fn sign_verify_roundtrip() {
        let (public, private) = gen_keypair();
        let now = Utc::now();

        let signer = Signer::new(&private).unwrap();
        let verifier = Verifier::new(&public, "m1234", LIVENESS).unwrap();

        let token = signer.sign(now, "m1234");
        assert_eq!(verifier.verify(now, &token), Ok(()));

        // Still good inside the liveness window and with small clock skew.
        assert_eq!(
            verifier.verify(now + chrono::Duration::seconds(4), &token),
            Ok(())
        );
        assert_eq!(
            verifier.verify(now - chrono::Duration::seconds(1), &token),
            Ok(())
        );
    }

    #[test]
    fn rejects_expired_and_skewed() {
        let (public, private) = gen_keypair();
        let now = Utc::now();

        let signer = Signer::new(&private).unwrap();
        let verifier = Verifier::new(&public, "m1234", LIVENESS).unwrap();
        let token = signer.sign(now, "m1234");

        // Past the liveness window.
        assert_eq!(
            verifier.verify(now + chrono::Duration::seconds(6), &token),
            Err(AuthError::BadAuth)
        );
        // Clock drift beyond the slack.
        assert_eq!(
            verifier.verify(now - chrono::Duration::seconds(6), &token),
            Err(AuthError::BadAuth)
        );
    }

    #[test]
    fn rejects_wrong_machine() {
        let (public, private) = gen_keypair();
        let now = Utc::now();

        let signer = Signer::new(&private).unwrap();
        let verifier = Verifier::new(&public, "m4321", LIVENESS).unwrap();

        let token = signer.sign(now, "m1234");
        assert_eq!(verifier.verify(now, &token), Err(AuthError::BadAuth));
    }

    #[test]
    fn rejects_mutated_token() {
        let (public, private) = gen_keypair();
        let now = Utc::now();

        let signer = Signer::new(&private).unwrap();
        let verifier1234 = Verifier::new(&public, "m1234", LIVENESS).unwrap();
        let verifier4321 = Verifier::new(&public, "m4321", LIVENESS).unwrap();

        let token = signer.sign(now, "m1234");

        // Rewrite the machine id inside the sealed message.
        let sealed = hex::decode(&token).unwrap();
        let altered = String::from_utf8_lossy(&sealed).replace("m1234", "m4321");
        let altered = hex::encode(altered.as_bytes());
        assert_eq!(verifier1234.verify(now, &altered), Err(AuthError::BadAuth));
        assert_eq!(verifier4321.verify(now, &altered), Err(AuthError::BadAuth));

        // Flip one bit of the signature.
        let mut sealed = hex::decode(&token).unwrap();
        sealed[0] ^= 0x01;
        let flipped = hex::encode(sealed);
        assert_eq!(verifier1234.verify(now, &flipped), Err(AuthError::BadAuth));
    }

    #[test]
    fn rejects_messages_with_extra_fields() {
        // A machine id containing a comma makes the payload three fields,
        // which the parser must refuse even under a valid signature.
        let (public, private) = gen_keypair();
        let now = Utc::now();

        let signer = Signer::new(&private).unwrap();
        let verifier = Verifier::new(&public, "m12,34", LIVENESS).unwrap();

        let token = signer.sign(now, "m12,34");
        assert_eq!(verifier.verify(now, &token), Err(AuthError::BadAuth));
    }

    #[test]
    fn rejects_garbage() {
        let (public, _) = gen_keypair();
        let verifier = Verifier::new(&public, "m1234", LIVENESS).unwrap();
        let now = Utc::now();

        assert_eq!(verifier.verify(now, ""), Err(AuthError::BadAuth));
        assert_eq!(verifier.verify(now, "zz"), Err(AuthError::BadAuth));
        assert_eq!(
            verifier.verify(now, &hex::encode([0u8; 16])),
            Err(AuthError::BadAuth)
        );
    }

    #[test]
    fn rejects_malformed_keys() {
        assert_eq!(Signer::new("not-hex").unwrap_err(), AuthError::BadKey);
        assert_eq!(Signer::new("abcd").unwrap_err(), AuthError::BadKey);
        assert_eq!(
            Verifier::new("abcd", "m1", LIVENESS).unwrap_err(),
            AuthError::BadKey
        );
    }
}
