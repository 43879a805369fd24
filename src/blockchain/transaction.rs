use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

/// Schema-less transaction body (speed, location, emergency flag, ...).
/// The ledger never looks inside it.
pub type Payload = Map<String, Value>;

/// Represents a message submitted by a vehicle node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Transaction {
    /// Identifier of the submitting node
    pub sender: String,

    /// Opaque message body
    #[serde(rename = "data")]
    #[schema(value_type = Object)]
    pub payload: Payload,

    /// Hex signature supplied by the sender, stored as given
    pub signature: String,

    /// Submission time in seconds since the Unix epoch
    pub timestamp: f64,
}

/// A transaction read back from the audit log together with its row id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StoredTransaction {
    /// Auto-incrementing audit log identity
    pub id: u64,

    pub transaction: Transaction,
}

impl Transaction {
    /// Creates a new transaction stamped with the current time
    ///
    /// # Arguments
    ///
    /// * `sender` - The identifier of the sending node
    /// * `payload` - The message body
    /// * `signature` - The sender's signature over the payload
    ///
    /// # Returns
    ///
    /// A new Transaction instance
    pub fn new(sender: &str, payload: Payload, signature: &str) -> Self {
        Transaction {
            sender: sender.to_string(),
            payload,
            signature: signature.to_string(),
            timestamp: unix_timestamp(),
        }
    }

    /// Field map used for hashing; keys match the serialized names
    pub(crate) fn canonical_value(&self) -> Value {
        let mut fields = Map::new();
        fields.insert("sender".to_string(), Value::String(self.sender.clone()));
        fields.insert("data".to_string(), Value::Object(self.payload.clone()));
        fields.insert("signature".to_string(), Value::String(self.signature.clone()));
        fields.insert("timestamp".to_string(), Value::from(self.timestamp));
        Value::Object(fields)
    }
}

/// Current wall-clock time in seconds since the Unix epoch, microsecond precision
pub fn unix_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Converts a ledger timestamp back into a UTC date
pub fn timestamp_to_datetime(timestamp: f64) -> Option<DateTime<Utc>> {
    if !timestamp.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros((timestamp * 1_000_000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vehicle_payload() -> Payload {
        let mut payload = Payload::new();
        payload.insert("speed".to_string(), json!(80));
        payload.insert("location".to_string(), json!("52.52,13.40"));
        payload.insert("emergency".to_string(), json!(false));
        payload
    }

    #[test]
    fn test_new_transaction() {
        let before = unix_timestamp();
        let transaction = Transaction::new("V1", vehicle_payload(), "abc");
        let after = unix_timestamp();

        assert_eq!(transaction.sender, "V1");
        assert_eq!(transaction.signature, "abc");
        assert_eq!(transaction.payload["speed"], json!(80));
        assert!(transaction.timestamp >= before && transaction.timestamp <= after);
    }

    #[test]
    fn test_payload_serializes_as_data() {
        let transaction = Transaction::new("V1", vehicle_payload(), "abc");
        let value = serde_json::to_value(&transaction).unwrap();

        assert_eq!(value["data"]["location"], json!("52.52,13.40"));
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_json_round_trip_keeps_timestamp_exact() {
        let transaction = Transaction::new("V1", vehicle_payload(), "abc");
        let json = serde_json::to_string(&transaction).unwrap();
        let decoded: Transaction = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded, transaction);
    }

    #[test]
    fn test_timestamp_to_datetime() {
        let date = timestamp_to_datetime(1_700_000_000.5).unwrap();
        assert_eq!(date.timestamp(), 1_700_000_000);
        assert_eq!(date.timestamp_subsec_millis(), 500);
        assert!(timestamp_to_datetime(f64::NAN).is_none());
    }
}
