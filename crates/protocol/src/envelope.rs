use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single authenticated cross-boundary message.
///
/// The `signature` field is a hex-encoded HMAC-SHA256 over
/// [`signing_base`](Envelope::signing_base); an envelope is only acted upon
/// after the full validation pipeline accepts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    /// Single-use replay-prevention token, unique per message.
    pub nonce: String,
    /// Hex HMAC-SHA256 over the canonical serialization of all other fields.
    /// Empty until the envelope is signed.
    pub signature: String,
    /// The claimed sender origin, checked against the trust allow-list.
    pub origin: String,
}

/// Message kinds crossing the embed boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    HandshakeRequest,
    HandshakeResponse,
    BehavioralSignal,
    ContentExtraction,
    PageContextUpdate,
    Intervention,
    Heartbeat,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HandshakeRequest => "handshake_request",
            Self::HandshakeResponse => "handshake_response",
            Self::BehavioralSignal => "behavioral_signal",
            Self::ContentExtraction => "content_extraction",
            Self::PageContextUpdate => "page_context_update",
            Self::Intervention => "intervention",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signing view of an envelope: every field except `signature`, in fixed
/// declaration order.  `serde_json` keeps payload object keys sorted
/// (BTreeMap-backed maps), so the serialization is canonical.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SigningBase<'a> {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    payload: &'a serde_json::Value,
    timestamp: &'a DateTime<Utc>,
    session_id: &'a str,
    nonce: &'a str,
    origin: &'a str,
}

impl Envelope {
    /// Build an unsigned envelope stamped with the current time and a fresh
    /// nonce.  Call a key manager's `sign` on [`signing_base`] to fill in
    /// the signature before sending.
    pub fn new(
        kind: EnvelopeKind,
        payload: serde_json::Value,
        session_id: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
            session_id: session_id.into(),
            nonce: uuid::Uuid::new_v4().to_string(),
            signature: String::new(),
            origin: origin.into(),
        }
    }

    /// Canonical JSON the signature is computed over (signature excluded).
    pub fn signing_base(&self) -> String {
        let base = SigningBase {
            kind: self.kind,
            payload: &self.payload,
            timestamp: &self.timestamp,
            session_id: &self.session_id,
            nonce: &self.nonce,
            origin: &self.origin,
        };
        // Serialization of a field-ordered struct over JSON values cannot
        // fail; fall back to an empty base (which never verifies) rather
        // than panicking in the signing path.
        serde_json::to_string(&base).unwrap_or_default()
    }

    /// Deserialized, kind-checked payload accessor.
    pub fn typed_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&EnvelopeKind::PageContextUpdate).unwrap();
        assert_eq!(json, "\"page_context_update\"");
    }

    #[test]
    fn wire_shape_uses_camel_case_and_type_tag() {
        let env = Envelope::new(
            EnvelopeKind::Heartbeat,
            serde_json::json!({"sentAt": 1}),
            "sess-1",
            "http://localhost:3000",
        );
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "heartbeat");
        assert_eq!(v["sessionId"], "sess-1");
        assert!(v.get("nonce").is_some());
        assert!(v.get("signature").is_some());
    }

    #[test]
    fn signing_base_excludes_signature() {
        let mut env = Envelope::new(
            EnvelopeKind::BehavioralSignal,
            serde_json::json!({"k": "v"}),
            "sess-1",
            "http://localhost:3000",
        );
        let base_unsigned = env.signing_base();
        env.signature = "deadbeef".into();
        assert_eq!(env.signing_base(), base_unsigned);
        assert!(!base_unsigned.contains("deadbeef"));
    }

    #[test]
    fn signing_base_is_canonical_over_payload_key_order() {
        // serde_json's default map is BTreeMap-backed, so objects built in
        // different insertion orders serialize identically.
        let mut a = serde_json::Map::new();
        a.insert("zebra".into(), serde_json::json!(1));
        a.insert("alpha".into(), serde_json::json!(2));

        let mut b = serde_json::Map::new();
        b.insert("alpha".into(), serde_json::json!(2));
        b.insert("zebra".into(), serde_json::json!(1));

        let mut e1 = Envelope::new(
            EnvelopeKind::BehavioralSignal,
            serde_json::Value::Object(a),
            "s",
            "o",
        );
        let mut e2 = e1.clone();
        e2.payload = serde_json::Value::Object(b);
        e1.payload = e1.payload.clone();

        assert_eq!(e1.signing_base(), e2.signing_base());
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let env = Envelope::new(
            EnvelopeKind::HandshakeRequest,
            serde_json::json!({"toolVersion": "0.1.0"}),
            "sess-9",
            "https://school.instructure.com",
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, EnvelopeKind::HandshakeRequest);
        assert_eq!(back.nonce, env.nonce);
        assert_eq!(back.signing_base(), env.signing_base());
    }
}
