use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod decode;
mod reconcile;

pub use decode::{decode_payload, DecodeQuality, DecodedPayload};
pub use reconcile::{
    blob_from_json, blob_to_json, canonical_timestamp, normalize_temporal, reconcile,
    DefaultsPolicy, FieldClass, FieldNote, FieldNoteKind, FieldValue, ReconcileContext, Reconciled,
    SanitizedRecord, BLOB_TAG,
};

/// Loosely typed field map as produced by the payload decoder or read from auxiliary columns.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ArchiveError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("administrator {admin_id} may not archive their own elevated identity")]
    SelfOperationDenied { admin_id: RecordId },
    #[error("record {0} is already archived")]
    AlreadyArchived(RecordId),
    #[error("schema constraint violation: {0}")]
    SchemaConstraintViolation(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ArchiveError {
    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::SelfOperationDenied { .. } => "self_operation_denied",
            Self::AlreadyArchived(_) => "already_archived",
            Self::SchemaConstraintViolation(_) => "schema_constraint_violation",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Internal(_) => "internal",
        }
    }

    /// Message safe to show an end user. Raw store text never appears here; use
    /// [`ArchiveError::detail`] for the audit and diagnostic record.
    #[must_use]
    pub fn public_message(&self, operation: AuditOperation) -> String {
        match self {
            Self::NotFound(what) => format!("{what} was not found"),
            Self::SelfOperationDenied { .. } => {
                "administrators cannot archive their own elevated account".to_string()
            }
            Self::AlreadyArchived(id) => format!("record {id} is already archived"),
            Self::SchemaConstraintViolation(_) | Self::Internal(_) => {
                format!("{} failed; contact an administrator", operation.noun())
            }
            Self::StoreUnavailable(_) => {
                "the data store is temporarily unavailable; retry later".to_string()
            }
            Self::InvalidRequest(reason) => reason.clone(),
        }
    }

    /// Public message for a call that may not be an archive or restore; reads and
    /// schema calls get operation-neutral wording.
    #[must_use]
    pub fn request_message(&self, operation: Option<AuditOperation>) -> String {
        match (operation, self) {
            (Some(operation), _) => self.public_message(operation),
            (None, Self::SchemaConstraintViolation(_) | Self::Internal(_)) => {
                "request failed; contact an administrator".to_string()
            }
            (None, _) => self.public_message(AuditOperation::Restore),
        }
    }

    #[must_use]
    pub fn detail(&self) -> String {
        self.to_string()
    }

    /// Only transport and timeout failures are worth retrying; the kernel never retries itself.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

/// Identifier of a live record. Administrators are live records too, so the acting
/// administrator is addressed with the same type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ArchivalId(pub i64);

impl Display for ArchivalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct AuditId(pub i64);

impl Display for AuditId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LiveStatus {
    Active,
    Archived,
    Rejected,
    Suspended,
}

impl LiveStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Archived => "Archived",
            Self::Rejected => "Rejected",
            Self::Suspended => "Suspended",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            v if v.eq_ignore_ascii_case("active") => Some(Self::Active),
            v if v.eq_ignore_ascii_case("archived") => Some(Self::Archived),
            v if v.eq_ignore_ascii_case("rejected") => Some(Self::Rejected),
            v if v.eq_ignore_ascii_case("suspended") => Some(Self::Suspended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RestoreMode {
    UpdatedInPlace,
    Recreated,
}

impl RestoreMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UpdatedInPlace => "updated-in-place",
            Self::Recreated => "recreated",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Archive,
    Restore,
}

impl AuditOperation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Restore => "restore",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "archive" => Some(Self::Archive),
            "restore" => Some(Self::Restore),
            _ => None,
        }
    }

    #[must_use]
    pub fn noun(self) -> &'static str {
        match self {
            Self::Archive => "archival",
            Self::Restore => "restoration",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failed,
}

impl AuditOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// The administrator performing an operation, as vouched for by the session layer.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Actor {
    pub admin_id: RecordId,
    pub role: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RequestOrigin {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ArchiveRequest {
    pub original_id: RecordId,
    pub actor: Actor,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub origin: RequestOrigin,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RestoreRequest {
    pub archival_id: ArchivalId,
    pub actor: Actor,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub origin: RequestOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Integer,
    Float,
    Text,
    Temporal,
    Structured,
    Binary,
}

impl FieldKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Text => "text",
            Self::Temporal => "temporal",
            Self::Structured => "structured",
            Self::Binary => "binary",
        }
    }
}

/// One column of a live entity as reported by the store catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub declared_type: String,
    pub kind: FieldKind,
    pub max_length: Option<usize>,
    pub nullable: bool,
    pub has_default: bool,
    pub primary_key: bool,
}

impl FieldSpec {
    #[must_use]
    pub fn from_catalog(
        name: &str,
        declared_type: &str,
        not_null: bool,
        has_default: bool,
        primary_key: bool,
    ) -> Self {
        let (kind, max_length) = classify_declared_type(declared_type);
        Self {
            name: name.to_string(),
            declared_type: declared_type.to_string(),
            kind,
            max_length,
            nullable: !not_null,
            has_default,
            primary_key,
        }
    }
}

/// Runtime description of an entity's current column shape. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub entity: String,
    pub fields: Vec<FieldSpec>,
}

impl SchemaDescriptor {
    #[must_use]
    pub fn empty(entity: &str) -> Self {
        Self { entity: entity.to_string(), fields: Vec::new() }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Look up a field by exact name, then case-insensitively.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .or_else(|| self.fields.iter().find(|field| field.name.eq_ignore_ascii_case(name)))
    }

    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    #[must_use]
    pub fn primary_key(&self) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.primary_key)
    }
}

/// Map a declared SQL column type onto a primitive kind plus an optional text length limit.
///
/// Follows column-affinity precedence: `JSON` first, then integer, text, temporal, and
/// everything else numeric. Columns with no declared type are treated as text.
#[must_use]
pub fn classify_declared_type(declared: &str) -> (FieldKind, Option<usize>) {
    let upper = declared.trim().to_ascii_uppercase();
    if upper.is_empty() {
        return (FieldKind::Text, None);
    }

    let kind = if upper.contains("JSON") {
        FieldKind::Structured
    } else if upper.contains("INT") || upper.contains("BOOL") {
        FieldKind::Integer
    } else if upper.contains("CHAR")
        || upper.contains("CLOB")
        || upper.contains("TEXT")
        || upper.contains("ENUM")
    {
        FieldKind::Text
    } else if upper.contains("BLOB") || upper.contains("BINARY") {
        FieldKind::Binary
    } else if upper.contains("DATE") || upper.contains("TIME") {
        FieldKind::Temporal
    } else {
        FieldKind::Float
    };

    let max_length = if kind == FieldKind::Text { declared_length(&upper) } else { None };
    (kind, max_length)
}

fn declared_length(upper: &str) -> Option<usize> {
    let open = upper.find('(')?;
    let close = upper[open..].find(')')? + open;
    let inner = &upper[open + 1..close];
    let first = inner.split(',').next()?.trim();
    first.parse::<usize>().ok().filter(|length| *length > 0)
}

/// A historical snapshot of a live record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchivedRecord {
    pub archival_id: ArchivalId,
    pub original_id: RecordId,
    /// Columns captured verbatim alongside the payload at archival time.
    pub auxiliary: FieldMap,
    pub payload: Option<String>,
    pub archived_by: Option<RecordId>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub archived_at: Option<OffsetDateTime>,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub restore_count: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_restored_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RestoreWarning {
    /// Payload decoding fell back below a strict parse. Non-fatal.
    DecodeDegraded { quality: DecodeQuality },
    /// A placeholder credential was generated; the identity must reset it before use.
    CredentialResetRequired { field: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveOutcome {
    pub archival_id: ArchivalId,
    pub original_id: RecordId,
    #[serde(with = "time::serde::rfc3339")]
    pub archived_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub archival_id: ArchivalId,
    pub original_id: RecordId,
    pub resulting_id: RecordId,
    pub mode: RestoreMode,
    pub credential_reset_required: bool,
    pub decode_quality: DecodeQuality,
    pub restore_count: i64,
    #[serde(default)]
    pub warnings: Vec<RestoreWarning>,
    #[serde(default)]
    pub notes: Vec<FieldNote>,
}

/// Immutable before/after/outcome record of one archive or restore attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub operation: AuditOperation,
    pub archival_id: Option<ArchivalId>,
    /// Unknown when a restore names an archival record that does not exist.
    pub original_id: Option<RecordId>,
    pub resulting_id: Option<RecordId>,
    pub admin_id: RecordId,
    pub reason: Option<String>,
    pub outcome: AuditOutcome,
    pub before_state: Option<serde_json::Value>,
    pub after_state: Option<serde_json::Value>,
    pub error_detail: Option<String>,
    pub decode_quality: Option<DecodeQuality>,
    pub origin: RequestOrigin,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl AuditEntry {
    #[must_use]
    pub fn new(
        operation: AuditOperation,
        original_id: Option<RecordId>,
        actor: &Actor,
        reason: Option<String>,
        origin: RequestOrigin,
    ) -> Self {
        Self {
            operation,
            archival_id: None,
            original_id,
            resulting_id: None,
            admin_id: actor.admin_id,
            reason,
            outcome: AuditOutcome::Success,
            before_state: None,
            after_state: None,
            error_detail: None,
            decode_quality: None,
            origin,
            recorded_at: OffsetDateTime::now_utc(),
        }
    }

    /// Turn this entry into the failure record for `err`. The resulting identifier is
    /// cleared since the mutation it referred to was rolled back.
    #[must_use]
    pub fn failed(mut self, err: &ArchiveError) -> Self {
        self.outcome = AuditOutcome::Failed;
        self.resulting_id = None;
        self.after_state = None;
        self.error_detail = Some(err.detail());
        self.recorded_at = OffsetDateTime::now_utc();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredAuditEntry {
    pub audit_id: AuditId,
    #[serde(flatten)]
    pub entry: AuditEntry,
}
