//! Key material DTOs exchanged with the message service
//!
//! These are the wire shapes of prekey fetch and key registration. The
//! service serializes key bytes as base64 strings inside JSON bodies;
//! the session builder consumes the decoded forms.

use serde::{Deserialize, Serialize};

use crate::types::DeviceId;

/// A signed prekey as served by the key distribution endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyEntry {
    pub key_id: u32,
    #[serde(with = "serde_base64")]
    pub public_key: Vec<u8>,
    #[serde(with = "serde_base64")]
    pub signature: Vec<u8>,
}

/// A one-time prekey
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyEntry {
    pub key_id: u32,
    #[serde(with = "serde_base64")]
    pub public_key: Vec<u8>,
}

/// Key material for one device, as returned by prekey fetch.
///
/// `pre_key` is absent when the device has exhausted its one-time
/// prekeys; the session builder falls back to the signed prekey alone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKeys {
    pub device_id: DeviceId,
    pub registration_id: u32,
    pub signed_pre_key: SignedPreKeyEntry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_key: Option<PreKeyEntry>,
}

/// Prekey fetch response: the account identity key plus per-device
/// bundles
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressKeys {
    #[serde(with = "serde_base64")]
    pub identity_key: Vec<u8>,
    pub devices: Vec<DeviceKeys>,
}

/// Freshly generated key material for upload via key registration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRegistrationBundle {
    #[serde(with = "serde_base64")]
    pub identity_key: Vec<u8>,
    pub signed_pre_key: SignedPreKeyEntry,
    pub pre_keys: Vec<PreKeyEntry>,
}

/// A device registered under the account, from the devices endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub last_seen: u64,
}

/// Serde helper for base64-encoded binary fields
pub mod serde_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_keys_wire_shape() {
        let json = serde_json::json!({
            "deviceId": 3,
            "registrationId": 4711,
            "signedPreKey": {
                "keyId": 12,
                "publicKey": "BQab",
                "signature": "AAEC"
            }
        });

        let keys: DeviceKeys = serde_json::from_value(json).unwrap();
        assert_eq!(keys.device_id, 3);
        assert_eq!(keys.registration_id, 4711);
        assert_eq!(keys.signed_pre_key.key_id, 12);
        assert!(keys.pre_key.is_none());
    }

    #[test]
    fn test_address_keys_roundtrip() {
        let keys = AddressKeys {
            identity_key: vec![5, 1, 2, 3],
            devices: vec![DeviceKeys {
                device_id: 1,
                registration_id: 42,
                signed_pre_key: SignedPreKeyEntry {
                    key_id: 7,
                    public_key: vec![9, 9],
                    signature: vec![1],
                },
                pre_key: Some(PreKeyEntry {
                    key_id: 101,
                    public_key: vec![8, 8],
                }),
            }],
        };

        let json = serde_json::to_string(&keys).unwrap();
        let back: AddressKeys = serde_json::from_str(&json).unwrap();
        assert_eq!(back, keys);
    }
}
