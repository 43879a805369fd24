use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::{Map, Value};
use thiserror::Error;

use std::fmt;

use super::hasher::canonical_json;
use super::transaction::{Payload, Transaction};

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Bytes a node signs for a payload: the canonical JSON of sender and data
pub fn signing_message(sender: &str, payload: &Payload) -> Vec<u8> {
    let mut fields = Map::new();
    fields.insert("sender".to_string(), Value::String(sender.to_string()));
    fields.insert("data".to_string(), Value::Object(payload.clone()));
    canonical_json(&Value::Object(fields)).into_bytes()
}

/// A vehicle taking part in the ledger, holding its own signing keypair
#[derive(Clone)]
pub struct VehicleNode {
    node_id: String,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl fmt::Debug for VehicleNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VehicleNode")
            .field("node_id", &self.node_id)
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

impl VehicleNode {
    /// Creates a new node with a random keypair
    pub fn new(node_id: &str) -> Self {
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        Self::from_signing_key(node_id, signing_key)
    }

    /// Creates a node from an existing 32 byte secret key
    pub fn from_secret_key(node_id: &str, secret_key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes_array: [u8; 32] = secret_key_bytes.try_into().map_err(|_| {
            CryptoError::InvalidPrivateKey("Invalid private key length".to_string())
        })?;

        Ok(Self::from_signing_key(node_id, SigningKey::from_bytes(&bytes_array)))
    }

    fn from_signing_key(node_id: &str, signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        VehicleNode {
            node_id: node_id.to_string(),
            signing_key,
            verifying_key,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.as_bytes())
    }

    /// Signs a payload as sent by this node
    ///
    /// # Returns
    ///
    /// The hex encoded ed25519 signature, ready to pass to the ledger
    pub fn sign_payload(&self, payload: &Payload) -> String {
        let message = signing_message(&self.node_id, payload);
        hex::encode(self.signing_key.sign(&message).to_bytes())
    }

    /// Checks that a recorded transaction was sent and signed by this node.
    ///
    /// Returns `Ok(false)` for a well-formed signature that does not match,
    /// and an error when the signature cannot be decoded at all.
    pub fn verify_transaction(&self, transaction: &Transaction) -> Result<bool, CryptoError> {
        if transaction.sender != self.node_id {
            return Ok(false);
        }

        let message = signing_message(&transaction.sender, &transaction.payload);
        verify_signature(&message, &transaction.signature, &self.verifying_key)
    }
}

/// Verifies a hex signature against a message and public key
pub fn verify_signature(
    message: &[u8],
    signature_hex: &str,
    public_key: &VerifyingKey,
) -> Result<bool, CryptoError> {
    let bytes = hex::decode(signature_hex).map_err(|e| CryptoError::DecodingError(e.to_string()))?;
    let signature_bytes: [u8; 64] = bytes.try_into().map_err(|_| {
        CryptoError::InvalidSignature("Invalid signature length".to_string())
    })?;
    let signature = Signature::from_bytes(&signature_bytes);

    Ok(public_key.verify(message, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Payload {
        let mut payload = Payload::new();
        payload.insert("speed".to_string(), json!(80));
        payload.insert("location".to_string(), json!("40.41,-3.70"));
        payload.insert("emergency".to_string(), json!(true));
        payload
    }

    #[test]
    fn test_node_creation() {
        let node = VehicleNode::new("V1");
        assert_eq!(node.node_id(), "V1");
        assert_eq!(node.public_key_hex().len(), 64);
    }

    #[test]
    fn test_signing_and_verification() {
        let node = VehicleNode::new("V1");
        let signature = node.sign_payload(&payload());
        let transaction = Transaction::new("V1", payload(), &signature);

        assert!(node.verify_transaction(&transaction).unwrap());
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let node = VehicleNode::new("V1");
        let signature = node.sign_payload(&payload());

        let mut tampered = payload();
        tampered.insert("speed".to_string(), json!(30));
        let transaction = Transaction::new("V1", tampered, &signature);

        assert!(!node.verify_transaction(&transaction).unwrap());
    }

    #[test]
    fn test_other_sender_fails_verification() {
        let node = VehicleNode::new("V1");
        let other = VehicleNode::new("V2");
        let signature = other.sign_payload(&payload());
        let transaction = Transaction::new("V2", payload(), &signature);

        assert!(!node.verify_transaction(&transaction).unwrap());
    }

    #[test]
    fn test_garbage_signature_is_an_error() {
        let node = VehicleNode::new("V1");
        let transaction = Transaction::new("V1", payload(), "abc");

        assert!(node.verify_transaction(&transaction).is_err());
    }

    #[test]
    fn test_from_secret_key_keeps_identity() {
        let node = VehicleNode::new("V1");
        let restored =
            VehicleNode::from_secret_key("V1", &node.signing_key.to_bytes()).unwrap();

        assert_eq!(restored.public_key_hex(), node.public_key_hex());
        assert!(VehicleNode::from_secret_key("V1", &[0u8; 12]).is_err());
    }
}
