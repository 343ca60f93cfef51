//! Device-originated operation records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Device id prefix that marks a field technician device.
pub const FIELD_DEVICE_PREFIX: &str = "TECH-";

/// Wall-clock instant in integer milliseconds since the Unix epoch.
///
/// Timestamps are used only for conflict comparison, never for
/// operation identity (wall clocks can collide or go backward under
/// skew; identity comes from [`OperationId`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Returns the current wall-clock time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self(millis)
    }

    /// Creates a timestamp from milliseconds since the Unix epoch.
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns milliseconds since the Unix epoch.
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Returns this timestamp shifted forward by `delta`.
    pub fn saturating_add(&self, delta: Duration) -> Self {
        Self(self.0.saturating_add(delta.as_millis() as u64))
    }

    /// Returns this timestamp shifted backward by `delta`.
    pub fn saturating_sub(&self, delta: Duration) -> Self {
        Self(self.0.saturating_sub(delta.as_millis() as u64))
    }
}

/// Identifier of a client device producing operations.
///
/// Devices whose id starts with `TECH-` are field technician devices
/// and receive conservative conflict handling; any other prefix is an
/// administrative/back-office device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a device id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this is a field technician device.
    pub fn is_field_device(&self) -> bool {
        self.0.starts_with(FIELD_DEVICE_PREFIX)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Globally unique operation identifier.
///
/// Formed from the originating device id plus a per-device monotonic
/// sequence number assigned at enqueue time. Immutable for the
/// lifetime of the record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId {
    /// The originating device.
    pub device_id: DeviceId,
    /// Per-device monotonic sequence number.
    pub sequence: u64,
}

impl OperationId {
    /// Creates an operation id.
    pub fn new(device_id: DeviceId, sequence: u64) -> Self {
        Self {
            device_id,
            sequence,
        }
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.device_id, self.sequence)
    }
}

/// Type of a device-originated operation.
///
/// Identifies the remote-apply handler for the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// A new visit record.
    CreateVisit,
    /// An edit to an existing visit record.
    UpdateVisit,
    /// A new contract signing.
    CreateContract,
    /// An edit to an existing contract.
    UpdateContract,
}

impl OperationType {
    /// Returns the stable string code for this type.
    pub fn as_code(&self) -> &'static str {
        match self {
            OperationType::CreateVisit => "create_visit",
            OperationType::UpdateVisit => "update_visit",
            OperationType::CreateContract => "create_contract",
            OperationType::UpdateContract => "update_contract",
        }
    }

    /// Parses a string code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "create_visit" => Some(OperationType::CreateVisit),
            "update_visit" => Some(OperationType::UpdateVisit),
            "create_contract" => Some(OperationType::CreateContract),
            "update_contract" => Some(OperationType::UpdateContract),
            _ => None,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

/// Lifecycle status of an operation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be applied remotely.
    Pending,
    /// Currently being applied by a worker.
    InFlight,
    /// Applied remotely and acknowledged.
    Succeeded,
    /// Escalated to human reconciliation; never auto-retried.
    ManualReview,
    /// Dead-lettered: retries exhausted or permanently rejected.
    Failed,
}

impl OperationStatus {
    /// Returns true if this status is terminal.
    ///
    /// A record never leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Succeeded | OperationStatus::ManualReview | OperationStatus::Failed
        )
    }

    /// Returns true if `next` is a legal transition from this status.
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        match self {
            OperationStatus::Pending => next == OperationStatus::InFlight,
            OperationStatus::InFlight => next != OperationStatus::InFlight,
            _ => false,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InFlight => "in_flight",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::ManualReview => "manual_review",
            OperationStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Structured operation content: field name to value.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// A single recorded change originating from a device.
///
/// Records are created at the moment of a local change, enter the
/// sync queue, and are attempted by exactly one worker at a time
/// until they reach a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Unique, immutable identifier.
    pub id: OperationId,
    /// The remote-apply handler for this operation.
    pub op_type: OperationType,
    /// Operation content.
    pub payload: Payload,
    /// Wall-clock creation time, for conflict comparison only.
    pub created_at: Timestamp,
    /// Number of failed remote-apply attempts. Only increases.
    pub retry_count: u32,
    /// Current lifecycle status.
    pub status: OperationStatus,
}

impl OperationRecord {
    /// Creates a fresh Pending record.
    pub fn new(
        id: OperationId,
        op_type: OperationType,
        payload: Payload,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            op_type,
            payload,
            created_at,
            retry_count: 0,
            status: OperationStatus::Pending,
        }
    }

    /// Returns the originating device.
    pub fn device_id(&self) -> &DeviceId {
        &self.id.device_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_device_prefix() {
        assert!(DeviceId::new("TECH-7").is_field_device());
        assert!(!DeviceId::new("ADMIN-1").is_field_device());
        assert!(!DeviceId::new("tech-7").is_field_device());
        assert!(!DeviceId::new("OFFICE-TECH-1").is_field_device());
    }

    #[test]
    fn operation_id_display() {
        let id = OperationId::new(DeviceId::new("TECH-7"), 42);
        assert_eq!(id.to_string(), "TECH-7#42");
    }

    #[test]
    fn operation_type_codes() {
        for op_type in [
            OperationType::CreateVisit,
            OperationType::UpdateVisit,
            OperationType::CreateContract,
            OperationType::UpdateContract,
        ] {
            assert_eq!(OperationType::from_code(op_type.as_code()), Some(op_type));
        }
        assert_eq!(OperationType::from_code("delete_visit"), None);
    }

    #[test]
    fn status_transitions() {
        use OperationStatus::*;

        assert!(Pending.can_transition_to(InFlight));
        assert!(!Pending.can_transition_to(Succeeded));

        assert!(InFlight.can_transition_to(Pending));
        assert!(InFlight.can_transition_to(Succeeded));
        assert!(InFlight.can_transition_to(ManualReview));
        assert!(InFlight.can_transition_to(Failed));

        for terminal in [Succeeded, ManualReview, Failed] {
            assert!(terminal.is_terminal());
            for next in [Pending, InFlight, Succeeded, ManualReview, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn timestamp_arithmetic() {
        let t = Timestamp::from_millis(10_000);
        assert_eq!(
            t.saturating_add(std::time::Duration::from_secs(1)),
            Timestamp::from_millis(11_000)
        );
        assert_eq!(
            t.saturating_sub(std::time::Duration::from_secs(1)),
            Timestamp::from_millis(9_000)
        );
        assert_eq!(
            Timestamp::from_millis(100).saturating_sub(std::time::Duration::from_secs(1)),
            Timestamp::from_millis(0)
        );
    }

    #[test]
    fn fresh_record_defaults() {
        let id = OperationId::new(DeviceId::new("TECH-7"), 1);
        let record = OperationRecord::new(
            id.clone(),
            OperationType::CreateVisit,
            Payload::new(),
            Timestamp::from_millis(1),
        );

        assert_eq!(record.id, id);
        assert_eq!(record.status, OperationStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.device_id().as_str(), "TECH-7");
    }

    #[test]
    fn record_serde_roundtrip() {
        let mut payload = Payload::new();
        payload.insert("visit_id".into(), serde_json::json!("V-100"));
        payload.insert("diagnosis".into(), serde_json::json!("compressor worn"));

        let record = OperationRecord::new(
            OperationId::new(DeviceId::new("TECH-7"), 3),
            OperationType::UpdateVisit,
            payload,
            Timestamp::from_millis(1_700_000_000_000),
        );

        let json = serde_json::to_string(&record).unwrap();
        let decoded: OperationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
    }
}
