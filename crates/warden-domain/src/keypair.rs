//! Signing key pairs.
//!
//! Private keys never appear in an event in plain form; the payload carries
//! them sealed by the key-generation service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_eventstore::{
    AggregateFilter, DecodeError, EventFamily, SearchQuery, StoredEvent, WriteModel,
};
use warden_types::InstanceId;

use crate::DomainEvent;

pub const AGGREGATE_TYPE: &str = "key_pair";
pub const ADDED: &str = "key_pair.added";

/// What a key pair signs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    Signing,
    SamlCa,
    SamlMetadataSigning,
    SamlResponseSigning,
}

impl KeyUsage {
    pub const ALL: [KeyUsage; 4] = [
        KeyUsage::Signing,
        KeyUsage::SamlCa,
        KeyUsage::SamlMetadataSigning,
        KeyUsage::SamlResponseSigning,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            KeyUsage::Signing => "signing",
            KeyUsage::SamlCa => "saml_ca",
            KeyUsage::SamlMetadataSigning => "saml_metadata_signing",
            KeyUsage::SamlResponseSigning => "saml_response_signing",
        }
    }
}

impl std::fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encrypted private key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    /// AEAD used to seal the key.
    pub cipher: String,
    /// Hex of `nonce || ciphertext || tag`.
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairAdded {
    pub usage: KeyUsage,
    pub algorithm: String,
    pub private_key: SealedKey,
    /// Hex-encoded public key.
    pub public_key: String,
    /// Hex SHA-256 of the public key.
    pub fingerprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPairEvent {
    Added(KeyPairAdded),
}

impl EventFamily for KeyPairEvent {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;
    const EVENT_TYPES: &'static [&'static str] = &[ADDED];

    fn event_type(&self) -> &'static str {
        match self {
            KeyPairEvent::Added(_) => ADDED,
        }
    }

    fn payload(&self) -> serde_json::Result<Option<serde_json::Value>> {
        match self {
            KeyPairEvent::Added(p) => serde_json::to_value(p).map(Some),
        }
    }

    fn decode(event: &StoredEvent) -> Result<Self, DecodeError> {
        match event.event_type.as_str() {
            ADDED => event.unmarshal().map(KeyPairEvent::Added),
            other => Err(DecodeError::UnknownEventType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveKey {
    pub key_id: String,
    pub key: KeyPairAdded,
}

/// Key pairs of one usage that are valid at `valid_at`.
///
/// The caller fixes `valid_at` before loading so the reduction stays pure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveKeysWriteModel {
    pub instance_id: InstanceId,
    pub usage: KeyUsage,
    pub valid_at: DateTime<Utc>,
    pub keys: Vec<ActiveKey>,
}

impl ActiveKeysWriteModel {
    pub fn new(instance_id: impl Into<InstanceId>, usage: KeyUsage, valid_at: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.into(),
            usage,
            valid_at,
            keys: Vec::new(),
        }
    }

    /// The active key that stays valid the longest.
    pub fn newest(&self) -> Option<&ActiveKey> {
        self.keys.iter().max_by_key(|k| k.key.not_after)
    }
}

impl WriteModel<DomainEvent> for ActiveKeysWriteModel {
    fn query(&self) -> SearchQuery {
        SearchQuery::new(self.instance_id.clone()).filter(
            AggregateFilter::new()
                .aggregate_types([AGGREGATE_TYPE])
                .event_types([ADDED]),
        )
    }

    fn reduce(&mut self, event: &StoredEvent, decoded: &DomainEvent) {
        let DomainEvent::KeyPair(KeyPairEvent::Added(added)) = decoded else {
            return;
        };
        if added.usage == self.usage
            && added.not_before <= self.valid_at
            && added.not_after > self.valid_at
        {
            self.keys.push(ActiveKey {
                key_id: event.aggregate.id.clone(),
                key: added.clone(),
            });
        }
    }
}
