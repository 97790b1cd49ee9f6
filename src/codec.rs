//! Pluggable serialization for persisted and replicated values.
//!
//! The wire format of operations is opaque to the apply pipeline; the only
//! contract is "decode bytes into a `KVOperation`". Lock owner records and
//! backup descriptors go through the same trait so the persisted formats can
//! evolve together.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;
use crate::lock::Owner;
use crate::operation::KVOperation;
use crate::storage::snapshot::RocksBackupInfo;

/// Encoder/decoder for everything this crate persists or replicates.
pub trait Serializer: Send + Sync {
    fn encode_operation(&self, op: &KVOperation) -> Result<Vec<u8>, CodecError>;
    fn decode_operation(&self, bytes: &[u8]) -> Result<KVOperation, CodecError>;

    fn encode_owner(&self, owner: &Owner) -> Result<Vec<u8>, CodecError>;
    fn decode_owner(&self, bytes: &[u8]) -> Result<Owner, CodecError>;

    fn encode_backup_info(&self, info: &RocksBackupInfo) -> Result<Vec<u8>, CodecError>;
    fn decode_backup_info(&self, bytes: &[u8]) -> Result<RocksBackupInfo, CodecError>;
}

/// The default serializer, JSON via serde.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl JsonSerializer {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::from_err(&e))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::from_err(&e))
    }
}

impl Serializer for JsonSerializer {
    fn encode_operation(&self, op: &KVOperation) -> Result<Vec<u8>, CodecError> {
        Self::encode(op)
    }

    fn decode_operation(&self, bytes: &[u8]) -> Result<KVOperation, CodecError> {
        Self::decode(bytes)
    }

    fn encode_owner(&self, owner: &Owner) -> Result<Vec<u8>, CodecError> {
        Self::encode(owner)
    }

    fn decode_owner(&self, bytes: &[u8]) -> Result<Owner, CodecError> {
        Self::decode(bytes)
    }

    fn encode_backup_info(&self, info: &RocksBackupInfo) -> Result<Vec<u8>, CodecError> {
        Self::encode(info)
    }

    fn decode_backup_info(&self, bytes: &[u8]) -> Result<RocksBackupInfo, CodecError> {
        Self::decode(bytes)
    }
}

/// The serializer used when none is configured.
pub fn default_serializer() -> Arc<dyn Serializer> {
    Arc::new(JsonSerializer)
}
