//! Fresh Ed25519 key pairs.

use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use sha2::{Digest, Sha256};
use warden_domain::keypair::{KeyPairAdded, KeyUsage};

use crate::seal::{KeySealer, SealError};

pub const ALGORITHM: &str = "ed25519";

/// Hex SHA-256 of a public key.
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Generates a key pair valid from `not_before` for `lifetime`, with the
/// private half sealed.
pub fn generate_key_pair(
    usage: KeyUsage,
    not_before: DateTime<Utc>,
    lifetime: chrono::Duration,
    sealer: &KeySealer,
) -> Result<KeyPairAdded, SealError> {
    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    let public_key = signing_key.verifying_key().to_bytes();
    Ok(KeyPairAdded {
        usage,
        algorithm: ALGORITHM.to_string(),
        private_key: sealer.seal(signing_key.as_bytes())?,
        public_key: hex::encode(public_key),
        fingerprint: fingerprint(&public_key),
        not_before,
        not_after: not_before + lifetime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ed25519_dalek::{Signer, Verifier};

    #[test]
    fn generated_pair_signs_and_matches_its_record() {
        let sealer = KeySealer::new(&[9u8; 32]).expect("valid key");
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let key = generate_key_pair(
            KeyUsage::SamlResponseSigning,
            start,
            chrono::Duration::days(365),
            &sealer,
        )
        .expect("generation should succeed");

        assert_eq!(key.algorithm, ALGORITHM);
        assert_eq!(key.not_after - key.not_before, chrono::Duration::days(365));
        let public = hex::decode(&key.public_key).expect("public key is hex");
        assert_eq!(key.fingerprint, fingerprint(&public));
        assert!(!key.private_key.data.contains(&key.public_key));

        let signing_key = sealer.signing_key(&key).expect("key should unseal");
        let signature = signing_key.sign(b"assertion");
        signing_key
            .verifying_key()
            .verify(b"assertion", &signature)
            .expect("signature should verify");
    }
}
