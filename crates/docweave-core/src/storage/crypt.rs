//! Transparent attachment encryption
//!
//! Attachment payloads are encrypted with AES-256-GCM before they reach the
//! sub-storage. The stored payload is `iv || ciphertext` tagged with
//! [`ENCRYPTED_CONTENT_TYPE`]; the plaintext is the original attachment as
//! a `data:` URL so its MIME type survives the round trip.
//!
//! Documents, queries and capabilities pass through untouched.

use std::collections::BTreeMap;
use std::sync::Mutex;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, warn};

use super::{SharedStorage, Storage, StorageError, StorageResult};
use crate::models::{Attachment, AttachmentInfo, Document, QueryOptions, QueryRow, RepairOptions};

/// MIME type marking an encrypted payload
pub const ENCRYPTED_CONTENT_TYPE: &str = "application/x-docweave-aes-gcm";

const IV_LEN: usize = 12;
const KEY_LEN: usize = 32;
const PBKDF2_ROUNDS: u32 = 1000;
const PBKDF2_SALT: [u8; 16] = [
    0x6f, 0x09, 0x04, 0x84, 0x06, 0x08, 0xc0, 0x9a, 0xe1, 0x8c, 0x13, 0x15, 0x42, 0xfb, 0xd1,
    0xbd,
];

/// Key material of a crypt storage
pub enum CryptKey {
    /// User passphrase, derived on first use
    Passphrase(String),
    /// Ready AES-256 key
    Raw([u8; KEY_LEN]),
}

impl CryptKey {
    /// Parse the `key` property of a crypt description
    ///
    /// Accepts a passphrase string or `{"raw": "<base64 of 32 bytes>"}`.
    pub fn from_value(value: &Value) -> StorageResult<Self> {
        match value {
            Value::String(passphrase) => Ok(CryptKey::Passphrase(passphrase.clone())),
            Value::Object(map) => {
                let encoded = map.get("raw").and_then(Value::as_str).ok_or_else(|| {
                    StorageError::BadConfiguration(
                        "crypt key object needs a 'raw' base64 string".to_string(),
                    )
                })?;
                let bytes = BASE64.decode(encoded).map_err(|e| {
                    StorageError::BadConfiguration(format!("crypt raw key is not base64: {}", e))
                })?;
                let key: [u8; KEY_LEN] = bytes.try_into().map_err(|bytes: Vec<u8>| {
                    StorageError::BadConfiguration(format!(
                        "crypt raw key must be {} bytes, got {}",
                        KEY_LEN,
                        bytes.len()
                    ))
                })?;
                Ok(CryptKey::Raw(key))
            }
            _ => Err(StorageError::BadConfiguration(
                "crypt storage needs a 'key'".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for CryptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptKey::Passphrase(_) => f.write_str("CryptKey::Passphrase(..)"),
            CryptKey::Raw(_) => f.write_str("CryptKey::Raw(..)"),
        }
    }
}

pub struct CryptStorage {
    sub: SharedStorage,
    key: Mutex<CryptKey>,
}

impl CryptStorage {
    pub fn new(sub: SharedStorage, key: CryptKey) -> Self {
        Self {
            sub,
            key: Mutex::new(key),
        }
    }

    /// Return the AES key, deriving it from the passphrase once
    fn cipher(&self) -> StorageResult<Aes256Gcm> {
        let mut key = self.key.lock().unwrap_or_else(|e| e.into_inner());
        if let CryptKey::Passphrase(passphrase) = &*key {
            let mut derived = [0u8; KEY_LEN];
            pbkdf2::pbkdf2_hmac::<Sha256>(
                passphrase.as_bytes(),
                &PBKDF2_SALT,
                PBKDF2_ROUNDS,
                &mut derived,
            );
            *key = CryptKey::Raw(derived);
            debug!("Derived attachment key from passphrase");
        }
        match &*key {
            CryptKey::Raw(raw) => Aes256Gcm::new_from_slice(raw)
                .map_err(|e| StorageError::Cipher(format!("invalid key: {}", e))),
            CryptKey::Passphrase(_) => Err(StorageError::Cipher("key not derived".to_string())),
        }
    }

    fn encrypt(&self, attachment: &Attachment) -> StorageResult<Attachment> {
        let cipher = self.cipher()?;

        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let plaintext = to_data_url(attachment);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|e| StorageError::Cipher(format!("encryption failed: {}", e)))?;

        let mut data = Vec::with_capacity(IV_LEN + ciphertext.len());
        data.extend_from_slice(&iv);
        data.extend_from_slice(&ciphertext);
        Ok(Attachment::new(ENCRYPTED_CONTENT_TYPE, data))
    }

    /// Decrypt a marked payload, or explain why it cannot be
    fn decrypt(&self, stored: &Attachment) -> Result<Attachment, String> {
        if stored.data.len() <= IV_LEN {
            return Err(format!("payload of {} bytes is too short", stored.data.len()));
        }
        let cipher = self.cipher().map_err(|e| e.to_string())?;
        let (iv, ciphertext) = stored.data.split_at(IV_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| "authentication failed".to_string())?;
        from_data_url(&plaintext).ok_or_else(|| "plaintext is not a data URL".to_string())
    }
}

fn to_data_url(attachment: &Attachment) -> String {
    format!(
        "data:{};base64,{}",
        attachment.content_type,
        BASE64.encode(&attachment.data)
    )
}

fn from_data_url(bytes: &[u8]) -> Option<Attachment> {
    let text = std::str::from_utf8(bytes).ok()?;
    let rest = text.strip_prefix("data:")?;
    let (content_type, payload) = rest.split_once(";base64,")?;
    let data = BASE64.decode(payload).ok()?;
    Some(Attachment::new(content_type, data))
}

#[async_trait]
impl Storage for CryptStorage {
    fn storage_type(&self) -> &'static str {
        "crypt"
    }

    async fn get(&self, id: &str) -> StorageResult<Document> {
        self.sub.get(id).await
    }

    async fn post(&self, doc: Document) -> StorageResult<String> {
        self.sub.post(doc).await
    }

    async fn put(&self, id: &str, doc: Document) -> StorageResult<String> {
        self.sub.put(id, doc).await
    }

    async fn remove(&self, id: &str) -> StorageResult<String> {
        self.sub.remove(id).await
    }

    async fn get_attachment(&self, id: &str, name: &str) -> StorageResult<Attachment> {
        let stored = self.sub.get_attachment(id, name).await?;
        if stored.content_type != ENCRYPTED_CONTENT_TYPE {
            return Ok(stored);
        }
        match self.decrypt(&stored) {
            Ok(plain) => Ok(plain),
            Err(reason) => {
                warn!(id = %id, name = %name, reason = %reason, "Returning undecryptable attachment as stored");
                Ok(stored)
            }
        }
    }

    async fn put_attachment(
        &self,
        id: &str,
        name: &str,
        attachment: Attachment,
    ) -> StorageResult<()> {
        let encrypted = self.encrypt(&attachment)?;
        self.sub.put_attachment(id, name, encrypted).await
    }

    async fn remove_attachment(&self, id: &str, name: &str) -> StorageResult<()> {
        self.sub.remove_attachment(id, name).await
    }

    async fn all_attachments(&self, id: &str) -> StorageResult<BTreeMap<String, AttachmentInfo>> {
        self.sub.all_attachments(id).await
    }

    async fn build_query(&self, options: &QueryOptions) -> StorageResult<Vec<QueryRow>> {
        self.sub.build_query(options).await
    }

    async fn has_capacity(&self, name: &str) -> StorageResult<bool> {
        self.sub.has_capacity(name).await
    }

    async fn repair(&self, options: &RepairOptions) -> StorageResult<()> {
        self.sub.repair(options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::sync::Arc;

    async fn setup(key: CryptKey) -> (Arc<MemoryStorage>, CryptStorage) {
        let memory = Arc::new(MemoryStorage::new());
        memory.put("doc", Document::new()).await.unwrap();
        let crypt = CryptStorage::new(memory.clone(), key);
        (memory, crypt)
    }

    #[tokio::test]
    async fn test_round_trip_with_passphrase() {
        let (memory, crypt) = setup(CryptKey::Passphrase("secret".into())).await;

        for payload in [Vec::new(), b"hello".to_vec(), (0u8..=255).collect::<Vec<_>>()] {
            crypt
                .put_attachment("doc", "file", Attachment::new("image/png", payload.clone()))
                .await
                .unwrap();

            let stored = memory.get_attachment("doc", "file").await.unwrap();
            assert_eq!(stored.content_type, ENCRYPTED_CONTENT_TYPE);
            assert_ne!(stored.data, payload);

            let back = crypt.get_attachment("doc", "file").await.unwrap();
            assert_eq!(back.data, payload);
            assert_eq!(back.content_type, "image/png");
        }
    }

    #[tokio::test]
    async fn test_fresh_iv_per_call() {
        let (memory, crypt) = setup(CryptKey::Raw([7u8; KEY_LEN])).await;
        let attachment = Attachment::new("text/plain", b"same".to_vec());

        crypt.put_attachment("doc", "a", attachment.clone()).await.unwrap();
        crypt.put_attachment("doc", "b", attachment).await.unwrap();

        let a = memory.get_attachment("doc", "a").await.unwrap();
        let b = memory.get_attachment("doc", "b").await.unwrap();
        assert_ne!(a.data[..IV_LEN], b.data[..IV_LEN]);
    }

    #[tokio::test]
    async fn test_plaintext_passes_through() {
        let (memory, crypt) = setup(CryptKey::Passphrase("secret".into())).await;
        memory
            .put_attachment("doc", "plain", Attachment::new("text/plain", b"visible".to_vec()))
            .await
            .unwrap();

        let got = crypt.get_attachment("doc", "plain").await.unwrap();
        assert_eq!(got, Attachment::new("text/plain", b"visible".to_vec()));
    }

    #[tokio::test]
    async fn test_wrong_key_returns_stored_payload() {
        let memory = Arc::new(MemoryStorage::new());
        memory.put("doc", Document::new()).await.unwrap();

        let writer = CryptStorage::new(memory.clone(), CryptKey::Passphrase("right".into()));
        let reader = CryptStorage::new(memory.clone(), CryptKey::Passphrase("wrong".into()));

        writer
            .put_attachment("doc", "file", Attachment::new("text/plain", b"secret".to_vec()))
            .await
            .unwrap();

        let stored = memory.get_attachment("doc", "file").await.unwrap();
        let got = reader.get_attachment("doc", "file").await.unwrap();
        assert_eq!(got, stored);
    }

    #[tokio::test]
    async fn test_short_payload_returns_stored_payload() {
        let (memory, crypt) = setup(CryptKey::Raw([1u8; KEY_LEN])).await;
        let bogus = Attachment::new(ENCRYPTED_CONTENT_TYPE, vec![0u8; 4]);
        memory.put_attachment("doc", "bogus", bogus.clone()).await.unwrap();

        assert_eq!(crypt.get_attachment("doc", "bogus").await.unwrap(), bogus);
    }

    #[tokio::test]
    async fn test_documents_pass_through() {
        let (memory, crypt) = setup(CryptKey::Raw([1u8; KEY_LEN])).await;
        crypt
            .put("other", json!({"title": "t"}).as_object().cloned().unwrap())
            .await
            .unwrap();
        assert_eq!(memory.get("other").await.unwrap()["title"], "t");
        assert!(crypt.has_capacity("query").await.unwrap());
        assert!(crypt.get_attachment("doc", "none").await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_key_from_value() {
        assert!(matches!(
            CryptKey::from_value(&json!("pass")).unwrap(),
            CryptKey::Passphrase(_)
        ));
        let raw = BASE64.encode([3u8; KEY_LEN]);
        assert!(matches!(
            CryptKey::from_value(&json!({"raw": raw})).unwrap(),
            CryptKey::Raw(_)
        ));
        for bad in [json!(12), json!({"raw": "AAAA"}), json!({"jwk": {}})] {
            assert_eq!(CryptKey::from_value(&bad).unwrap_err().status(), 400);
        }
    }

    #[test]
    fn test_data_url_round_trip() {
        let attachment = Attachment::new("application/json", b"{}".to_vec());
        let url = to_data_url(&attachment);
        assert!(url.starts_with("data:application/json;base64,"));
        assert_eq!(from_data_url(url.as_bytes()), Some(attachment));
        assert_eq!(from_data_url(b"not a url"), None);
    }
}
