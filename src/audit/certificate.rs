//! Hash-stamped certificates attesting to containment-class events.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::audit::now_epoch_seconds;
use crate::utils::canonical::canonical_hash;

/// A record attesting that a containment (or analogous) event occurred,
/// carrying a snapshot of the data that triggered it.
///
/// `cert_hash` is SHA-256 over the canonical JSON rendering of every
/// other field, so any tampering with the snapshot is detectable:
///
/// ```
/// use echelon::audit::ContainmentCertificate;
/// use serde_json::json;
///
/// let cert = ContainmentCertificate::mint(
///     "containment",
///     Some(8),
///     json!({"reason": "ethical approval denied"}),
///     Some("sim-1".into()),
///     None,
/// );
/// assert!(cert.verify());
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContainmentCertificate {
    pub cert_id: Uuid,
    pub event: String,
    pub origin_layer: Option<u8>,
    pub simulation_id: Option<String>,
    pub data_snapshot: Value,
    pub persona: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub cert_hash: String,
}

impl ContainmentCertificate {
    /// Mint a certificate over a data snapshot.
    pub fn mint(
        event: impl Into<String>,
        origin_layer: Option<u8>,
        data_snapshot: Value,
        simulation_id: Option<String>,
        persona: Option<String>,
    ) -> Self {
        let mut cert = Self {
            cert_id: Uuid::new_v4(),
            event: event.into(),
            origin_layer,
            simulation_id,
            data_snapshot,
            persona,
            timestamp: now_epoch_seconds(),
            cert_hash: String::new(),
        };
        cert.cert_hash = canonical_hash(&cert.hash_payload());
        cert
    }

    fn hash_payload(&self) -> Value {
        json!({
            "cert_id": self.cert_id.to_string(),
            "event": self.event,
            "origin_layer": self.origin_layer,
            "simulation_id": self.simulation_id,
            "data_snapshot": self.data_snapshot,
            "persona": self.persona,
            "timestamp": self.timestamp,
        })
    }

    /// Recompute the hash over everything but `cert_hash` itself.
    pub fn verify(&self) -> bool {
        canonical_hash(&self.hash_payload()) == self.cert_hash
    }
}
