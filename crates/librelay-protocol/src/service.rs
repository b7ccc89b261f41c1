//! Message service client
//!
//! Request/response facade to the remote message service: prekey
//! fetch, transmit, device listing, key registration, queue pulls and
//! attachment fetch. Protocol errors keep their numeric status code so
//! the outgoing pipeline can run drift reconciliation on 409/410.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tracing::debug;

use librelay_core::envelope::Envelope;
use librelay_core::keys::{AddressKeys, DeviceInfo, KeyRegistrationBundle};
use librelay_core::types::{Address, DeviceId, Timestamp};
use librelay_crypto::{CiphertextType, EncryptedMessage, PreKeyProvider};

use crate::error::{ServiceError, MISMATCHED_DEVICES, STALE_DEVICES};

/// One device's ciphertext in a send-messages call
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBundle {
    pub r#type: u8,
    pub destination_device_id: DeviceId,
    pub destination_registration_id: u32,
    /// Base64 ciphertext body
    pub content: String,
}

impl MessageBundle {
    /// Wrap a cipher output for one destination device
    pub fn new(destination_device_id: DeviceId, message: &EncryptedMessage) -> Self {
        Self {
            r#type: message.msg_type as u8,
            destination_device_id,
            destination_registration_id: message.registration_id,
            content: STANDARD.encode(&message.body),
        }
    }

    /// Whether this bundle establishes a new session
    pub fn is_pre_key_bundle(&self) -> bool {
        self.r#type == CiphertextType::PreKeyBundle as u8
    }
}

/// 409 response body: local device list disagrees with the server's
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MismatchedDevices {
    #[serde(default)]
    pub extra_devices: Vec<DeviceId>,
    #[serde(default)]
    pub missing_devices: Vec<DeviceId>,
}

/// 410 response body: devices whose sessions expired server-side
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleDevices {
    #[serde(default)]
    pub stale_devices: Vec<DeviceId>,
}

impl ServiceError {
    /// Parse a 409 body, if this is a mismatched-devices rejection
    pub fn mismatched_devices(&self) -> Option<MismatchedDevices> {
        match self {
            ServiceError::Protocol {
                code: MISMATCHED_DEVICES,
                response: Some(body),
            } => serde_json::from_value(body.clone()).ok(),
            _ => None,
        }
    }

    /// Parse a 410 body, if this is a stale-devices rejection
    pub fn stale_devices(&self) -> Option<StaleDevices> {
        match self {
            ServiceError::Protocol {
                code: STALE_DEVICES,
                response: Some(body),
            } => serde_json::from_value(body.clone()).ok(),
            _ => None,
        }
    }
}

/// A queued message from the pull API. Binary fields arrive base64
/// encoded.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub r#type: i32,
    pub source: String,
    #[serde(default)]
    pub source_device: u32,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl StoredMessage {
    /// Decode into the envelope shape the handler consumes
    pub fn into_envelope(self) -> Result<Envelope, ServiceError> {
        let decode = |field: &str, value: Option<String>| -> Result<Option<Vec<u8>>, ServiceError> {
            value
                .map(|b64| {
                    STANDARD.decode(b64).map_err(|e| {
                        ServiceError::BadResponse(format!("bad base64 in {field}: {e}"))
                    })
                })
                .transpose()
        };

        Ok(Envelope {
            r#type: self.r#type,
            source: Some(self.source),
            relay: None,
            timestamp: Some(self.timestamp),
            legacy_message: decode("message", self.message)?,
            source_device: Some(self.source_device),
            content: decode("content", self.content)?,
        })
    }
}

/// A page of queued messages
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MessageBatch {
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
    /// More pages remain after this one
    #[serde(default)]
    pub more: bool,
}

/// Request/response API of the message service
#[async_trait]
pub trait SignalService: Send + Sync {
    /// Fetch prekey bundles for an address. With a device id the server
    /// returns that single device; these calls must stay serial.
    async fn get_keys_for_addr(
        &self,
        addr: &Address,
        device_id: Option<DeviceId>,
    ) -> Result<AddressKeys, ServiceError>;

    /// Transmit per-device ciphertexts for one address
    async fn send_messages(
        &self,
        addr: &Address,
        messages: &[MessageBundle],
        timestamp: Timestamp,
    ) -> Result<(), ServiceError>;

    /// List devices registered under our account
    async fn get_devices(&self) -> Result<Vec<DeviceInfo>, ServiceError>;

    /// Generate a fresh prekey bundle for upload
    async fn generate_keys(&self) -> Result<KeyRegistrationBundle, ServiceError>;

    /// Upload a freshly generated prekey bundle
    async fn register_keys(&self, keys: &KeyRegistrationBundle) -> Result<(), ServiceError>;

    /// Pull one page of queued messages
    async fn get_messages(&self) -> Result<MessageBatch, ServiceError>;

    /// Delete a handled message from the queue
    async fn delete_message(
        &self,
        source: &Address,
        timestamp: Timestamp,
    ) -> Result<(), ServiceError>;

    /// Fetch an attachment ciphertext
    async fn get_attachment(&self, id: u64) -> Result<Vec<u8>, ServiceError>;

    /// Authenticated URL for the streaming transport
    async fn get_message_websocket_url(&self) -> Result<String, ServiceError>;
}

/// HTTP implementation of [`SignalService`]
pub struct HttpSignalService {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    key_provider: Arc<dyn PreKeyProvider>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessagesBody<'a> {
    messages: &'a [MessageBundle],
    timestamp: u64,
}

#[derive(Deserialize)]
struct DeviceListResponse {
    #[serde(default)]
    devices: Vec<DeviceInfo>,
}

#[derive(Deserialize)]
struct AttachmentLocation {
    location: String,
}

impl HttpSignalService {
    /// Create a client authenticating as `"<addr>.<deviceId>"`
    pub fn new(
        base_url: impl Into<String>,
        addr: &Address,
        device_id: DeviceId,
        password: impl Into<String>,
        timeout: std::time::Duration,
        key_provider: Arc<dyn PreKeyProvider>,
    ) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Internal(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: addr.with_device(device_id).encode(),
            password: password.into(),
            key_provider,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Issue a request and map non-success statuses to protocol errors
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ServiceError> {
        let response = request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| ServiceError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.json::<serde_json::Value>().await.ok();
        debug!(code = status.as_u16(), "service rejected request");
        Err(ServiceError::Protocol {
            code: status.as_u16(),
            response: body,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ServiceError> {
        self.execute(self.http.get(self.url(path)))
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::BadResponse(e.to_string()))
    }
}

#[async_trait]
impl SignalService for HttpSignalService {
    async fn get_keys_for_addr(
        &self,
        addr: &Address,
        device_id: Option<DeviceId>,
    ) -> Result<AddressKeys, ServiceError> {
        let path = match device_id {
            Some(device) => format!("/v2/keys/{addr}/{device}"),
            None => format!("/v2/keys/{addr}/*"),
        };
        self.get_json(&path).await
    }

    async fn send_messages(
        &self,
        addr: &Address,
        messages: &[MessageBundle],
        timestamp: Timestamp,
    ) -> Result<(), ServiceError> {
        let body = SendMessagesBody {
            messages,
            timestamp: timestamp.as_millis(),
        };
        self.execute(
            self.http
                .put(self.url(&format!("/v1/messages/{addr}")))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn get_devices(&self) -> Result<Vec<DeviceInfo>, ServiceError> {
        let response: DeviceListResponse = self.get_json("/v1/devices").await?;
        Ok(response.devices)
    }

    async fn generate_keys(&self) -> Result<KeyRegistrationBundle, ServiceError> {
        self.key_provider
            .generate_keys()
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))
    }

    async fn register_keys(&self, keys: &KeyRegistrationBundle) -> Result<(), ServiceError> {
        self.execute(self.http.put(self.url("/v2/keys")).json(keys))
            .await?;
        Ok(())
    }

    async fn get_messages(&self) -> Result<MessageBatch, ServiceError> {
        self.get_json("/v1/messages").await
    }

    async fn delete_message(
        &self,
        source: &Address,
        timestamp: Timestamp,
    ) -> Result<(), ServiceError> {
        self.execute(
            self.http
                .delete(self.url(&format!("/v1/messages/{source}/{timestamp}"))),
        )
        .await?;
        Ok(())
    }

    async fn get_attachment(&self, id: u64) -> Result<Vec<u8>, ServiceError> {
        let pointer: AttachmentLocation =
            self.get_json(&format!("/v1/attachments/{id}")).await?;

        // The ciphertext lives on a CDN; no service auth on this leg
        let response = self
            .http
            .get(&pointer.location)
            .send()
            .await
            .map_err(|e| ServiceError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ServiceError::Protocol {
                code: response.status().as_u16(),
                response: None,
            });
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| ServiceError::Network(e.to_string()))
    }

    async fn get_message_websocket_url(&self) -> Result<String, ServiceError> {
        let ws_base = self
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        Ok(format!(
            "{}/v1/websocket/?login={}&password={}",
            ws_base, self.username, self.password
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mismatched_devices_parse() {
        let err = ServiceError::Protocol {
            code: 409,
            response: Some(json!({"extraDevices": [2], "missingDevices": [3, 4]})),
        };
        let mismatch = err.mismatched_devices().unwrap();
        assert_eq!(mismatch.extra_devices, vec![2]);
        assert_eq!(mismatch.missing_devices, vec![3, 4]);

        // Wrong code never parses
        let err = ServiceError::Protocol {
            code: 410,
            response: Some(json!({"extraDevices": [2]})),
        };
        assert!(err.mismatched_devices().is_none());
    }

    #[test]
    fn test_stale_devices_parse() {
        let err = ServiceError::Protocol {
            code: 410,
            response: Some(json!({"staleDevices": [2]})),
        };
        assert_eq!(err.stale_devices().unwrap().stale_devices, vec![2]);
    }

    #[test]
    fn test_stored_message_into_envelope() {
        let stored = StoredMessage {
            r#type: 1,
            source: "alice".to_string(),
            source_device: 2,
            timestamp: 1234,
            message: None,
            content: Some(STANDARD.encode(b"ciphertext")),
        };

        let envelope = stored.into_envelope().unwrap();
        assert_eq!(envelope.source.as_deref(), Some("alice"));
        assert_eq!(envelope.source_device, Some(2));
        assert_eq!(envelope.content.as_deref(), Some(&b"ciphertext"[..]));
        assert!(envelope.legacy_message.is_none());
    }

    #[test]
    fn test_stored_message_rejects_bad_base64() {
        let stored = StoredMessage {
            r#type: 1,
            source: "alice".to_string(),
            source_device: 1,
            timestamp: 1,
            message: Some("!!not-base64!!".to_string()),
            content: None,
        };
        assert!(stored.into_envelope().is_err());
    }

    #[test]
    fn test_message_bundle_shape() {
        let bundle = MessageBundle::new(
            3,
            &EncryptedMessage {
                msg_type: CiphertextType::PreKeyBundle,
                registration_id: 42,
                body: vec![1, 2, 3],
            },
        );
        assert_eq!(bundle.r#type, 3);
        assert_eq!(bundle.destination_device_id, 3);
        assert!(bundle.is_pre_key_bundle());

        let json = serde_json::to_value(&bundle).unwrap();
        assert!(json.get("destinationDeviceId").is_some());
        assert!(json.get("destinationRegistrationId").is_some());
    }
}
