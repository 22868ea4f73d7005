use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::{FieldKind, FieldMap, FieldSpec, SchemaDescriptor};

/// Key of the single-entry object that carries binary column content through JSON as
/// lowercase hex, e.g. `{"$blob": "0aff"}`.
pub const BLOB_TAG: &str = "$blob";

#[must_use]
pub fn blob_to_json(bytes: &[u8]) -> Value {
    let mut object = serde_json::Map::new();
    object.insert(BLOB_TAG.to_string(), Value::String(hex::encode(bytes)));
    Value::Object(object)
}

/// Bytes of a tagged blob value; `None` for anything else, including bad hex.
#[must_use]
pub fn blob_from_json(value: &Value) -> Option<Vec<u8>> {
    let object = value.as_object().filter(|object| object.len() == 1)?;
    let encoded = object.get(BLOB_TAG)?.as_str()?;
    hex::decode(encoded).ok()
}

/// A type- and length-safe value ready to bind into a write.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Serialize for FieldValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl FieldValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Integer(value) => Value::from(*value),
            Self::Real(value) => serde_json::Number::from_f64(*value).map_or(Value::Null, Value::Number),
            Self::Text(value) => Value::String(value.clone()),
            Self::Blob(bytes) => blob_to_json(bytes),
        }
    }
}

pub type SanitizedRecord = BTreeMap<String, FieldValue>;

/// How a column is treated when a default has to be invented for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldClass {
    Name,
    Email,
    Credential,
    Role,
    Status,
    Plain,
}

/// Defaults applied to non-nullable fields that are missing or unrecoverable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsPolicy {
    pub placeholder_name: String,
    pub placeholder_email_domain: String,
    pub least_privileged_role: String,
    /// When non-empty, decoded roles outside this set are downgraded.
    pub valid_roles: Vec<String>,
    pub default_status: String,
    pub name_fields: Vec<String>,
    pub email_fields: Vec<String>,
    pub credential_fields: Vec<String>,
    pub role_fields: Vec<String>,
    pub status_fields: Vec<String>,
    /// Per-column defaults that take precedence over the class rules.
    pub overrides: BTreeMap<String, Value>,
}

impl Default for DefaultsPolicy {
    fn default() -> Self {
        Self {
            placeholder_name: "Restored User".to_string(),
            placeholder_email_domain: "restored.invalid".to_string(),
            least_privileged_role: "Member".to_string(),
            valid_roles: vec!["Admin".to_string(), "Trainer".to_string(), "Member".to_string()],
            default_status: "Active".to_string(),
            name_fields: ["name", "full_name", "first_name", "last_name", "username", "display_name"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            email_fields: vec!["email".to_string()],
            credential_fields: vec!["password".to_string(), "password_hash".to_string()],
            role_fields: vec!["role".to_string()],
            status_fields: vec!["status".to_string()],
            overrides: BTreeMap::new(),
        }
    }
}

impl DefaultsPolicy {
    #[must_use]
    pub fn classify(&self, field: &str) -> FieldClass {
        let matches = |names: &[String]| names.iter().any(|name| name.eq_ignore_ascii_case(field));
        if matches(&self.credential_fields) {
            FieldClass::Credential
        } else if matches(&self.email_fields) || field.to_ascii_lowercase().contains("email") {
            FieldClass::Email
        } else if matches(&self.name_fields) {
            FieldClass::Name
        } else if matches(&self.role_fields) {
            FieldClass::Role
        } else if matches(&self.status_fields) {
            FieldClass::Status
        } else {
            FieldClass::Plain
        }
    }

    fn is_valid_role(&self, role: &str) -> bool {
        self.valid_roles.is_empty()
            || self.valid_roles.iter().any(|valid| valid.eq_ignore_ascii_case(role))
    }
}

/// Per-call inputs that would otherwise make reconciliation depend on a clock or RNG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileContext {
    pub now: OffsetDateTime,
    /// Appended to placeholder emails so two restored identities never collide.
    pub placeholder_suffix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FieldNoteKind {
    FromAuxiliary,
    Defaulted,
    Truncated { from: usize, to: usize },
    CoercedToNull,
    StructuredReset,
    RoleDowngraded { from: String },
    CredentialMissing,
    DroppedUnknownField,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldNote {
    pub field: String,
    #[serde(flatten)]
    pub kind: FieldNoteKind,
}

impl FieldNote {
    fn new(field: &str, kind: FieldNoteKind) -> Self {
        Self { field: field.to_string(), kind }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub record: SanitizedRecord,
    pub notes: Vec<FieldNote>,
}

/// Map a decoded payload onto the current live schema.
///
/// Primary-key columns are skipped; the caller supplies the identity. Payload values win
/// over auxiliary columns, and a value that coerces to null falls through to the next
/// source. Non-nullable fields that end up null receive a policy default, except
/// credential fields, which are left out so the writer can issue a placeholder.
///
/// With an empty schema nothing can be coerced: the merged payload and auxiliary values
/// pass through as-is, with policy overrides filling absent keys.
#[must_use]
pub fn reconcile(
    fields: &FieldMap,
    schema: &SchemaDescriptor,
    auxiliary: &FieldMap,
    policy: &DefaultsPolicy,
    context: &ReconcileContext,
) -> Reconciled {
    if schema.is_empty() {
        return passthrough(fields, auxiliary, policy);
    }

    let mut record = SanitizedRecord::new();
    let mut notes = Vec::new();

    for spec in schema.fields.iter().filter(|spec| !spec.primary_key) {
        let class = policy.classify(&spec.name);
        let mut value = FieldValue::Null;

        for (from_auxiliary, source) in [(false, fields), (true, auxiliary)] {
            let Some(raw) = lookup(source, &spec.name) else {
                continue;
            };
            if raw.is_null() {
                continue;
            }
            let coerced = coerce(raw, spec, &mut notes);
            if coerced.is_null() {
                notes.push(FieldNote::new(&spec.name, FieldNoteKind::CoercedToNull));
                continue;
            }
            if from_auxiliary {
                notes.push(FieldNote::new(&spec.name, FieldNoteKind::FromAuxiliary));
            }
            value = coerced;
            break;
        }

        if class == FieldClass::Role && spec.kind == FieldKind::Text {
            if let Some(role) = value.as_text().filter(|role| !policy.is_valid_role(role)) {
                notes.push(FieldNote::new(
                    &spec.name,
                    FieldNoteKind::RoleDowngraded { from: role.to_string() },
                ));
                value = FieldValue::Text(policy.least_privileged_role.clone());
            }
        }

        if value.is_null() && !spec.nullable {
            let Some(default) = default_for(spec, class, policy, context) else {
                notes.push(FieldNote::new(&spec.name, FieldNoteKind::CredentialMissing));
                continue;
            };
            notes.push(FieldNote::new(&spec.name, FieldNoteKind::Defaulted));
            value = default;
        }

        record.insert(spec.name.clone(), truncate(value, spec, &mut notes));
    }

    for key in fields.keys().filter(|key| !schema.has_field(key)) {
        notes.push(FieldNote::new(key, FieldNoteKind::DroppedUnknownField));
    }

    Reconciled { record, notes }
}

fn passthrough(fields: &FieldMap, auxiliary: &FieldMap, policy: &DefaultsPolicy) -> Reconciled {
    let mut record = SanitizedRecord::new();
    let mut notes = Vec::new();

    for (key, value) in fields {
        record.insert(key.clone(), plain_value(value));
    }
    for (key, value) in auxiliary {
        if !record.contains_key(key) {
            notes.push(FieldNote::new(key, FieldNoteKind::FromAuxiliary));
            record.insert(key.clone(), plain_value(value));
        }
    }
    for (key, value) in &policy.overrides {
        if !record.contains_key(key) {
            notes.push(FieldNote::new(key, FieldNoteKind::Defaulted));
            record.insert(key.clone(), plain_value(value));
        }
    }

    Reconciled { record, notes }
}

fn lookup<'a>(map: &'a FieldMap, name: &str) -> Option<&'a Value> {
    map.get(name).or_else(|| {
        map.iter().find(|(key, _)| key.eq_ignore_ascii_case(name)).map(|(_, value)| value)
    })
}

fn plain_value(value: &Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Null,
        Value::Bool(flag) => FieldValue::Integer(i64::from(*flag)),
        Value::Number(number) => number
            .as_i64()
            .map(FieldValue::Integer)
            .or_else(|| number.as_f64().map(FieldValue::Real))
            .unwrap_or(FieldValue::Null),
        Value::String(text) => FieldValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => {
            blob_from_json(value).map_or_else(|| FieldValue::Text(value.to_string()), FieldValue::Blob)
        }
    }
}

fn coerce(raw: &Value, spec: &FieldSpec, notes: &mut Vec<FieldNote>) -> FieldValue {
    match spec.kind {
        FieldKind::Integer => coerce_integer(raw).map_or(FieldValue::Null, FieldValue::Integer),
        FieldKind::Float => coerce_float(raw).map_or(FieldValue::Null, FieldValue::Real),
        FieldKind::Text => coerce_text(raw).map_or(FieldValue::Null, FieldValue::Text),
        FieldKind::Temporal => coerce_temporal(raw).map_or(FieldValue::Null, FieldValue::Text),
        FieldKind::Binary => coerce_binary(raw).map_or(FieldValue::Null, FieldValue::Blob),
        FieldKind::Structured => {
            let (text, reset) = coerce_structured(raw);
            if reset {
                notes.push(FieldNote::new(&spec.name, FieldNoteKind::StructuredReset));
            }
            text.map_or(FieldValue::Null, FieldValue::Text)
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn float_to_integer(value: f64) -> Option<i64> {
    let truncated = value.trunc();
    #[allow(clippy::cast_precision_loss)]
    let in_range = truncated >= i64::MIN as f64 && truncated < i64::MAX as f64;
    (value.is_finite() && in_range).then_some(truncated as i64)
}

fn coerce_integer(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(number) => number.as_i64().or_else(|| number.as_f64().and_then(float_to_integer)),
        Value::Bool(flag) => Some(i64::from(*flag)),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().and_then(float_to_integer))
        }
        _ => None,
    }
}

fn coerce_float(raw: &Value) -> Option<f64> {
    let value = match raw {
        Value::Number(number) => number.as_f64(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    value.is_finite().then_some(value)
}

fn coerce_text(raw: &Value) -> Option<String> {
    match raw {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Array(_) | Value::Object(_) => Some(blob_from_json(raw).map_or_else(
            || raw.to_string(),
            |bytes| String::from_utf8_lossy(&bytes).into_owned(),
        )),
    }
}

/// Plain strings are taken as their UTF-8 bytes.
fn coerce_binary(raw: &Value) -> Option<Vec<u8>> {
    match raw {
        Value::String(text) => Some(text.as_bytes().to_vec()),
        Value::Object(_) => blob_from_json(raw),
        _ => None,
    }
}

fn coerce_temporal(raw: &Value) -> Option<String> {
    match raw {
        Value::String(text) => normalize_temporal(text),
        Value::Number(number) => number
            .as_i64()
            .and_then(|seconds| OffsetDateTime::from_unix_timestamp(seconds).ok())
            .and_then(canonical_timestamp),
        _ => None,
    }
}

/// Returns the re-serialized structure and whether the source had to be replaced by `{}`.
fn coerce_structured(raw: &Value) -> (Option<String>, bool) {
    match raw {
        Value::Null => (None, false),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(parsed) => (Some(parsed.to_string()), false),
            Err(_) => (Some("{}".to_string()), true),
        },
        other => (Some(other.to_string()), false),
    }
}

/// Format a timestamp in the canonical `YYYY-MM-DD HH:MM:SS` UTC form.
#[must_use]
pub fn canonical_timestamp(value: OffsetDateTime) -> Option<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .ok()
}

/// Parse a loosely formatted temporal string into the canonical timestamp form.
///
/// Zero dates (`0000-00-00 ...`) and anything unparsable yield `None`.
#[must_use]
pub fn normalize_temporal(raw: &str) -> Option<String> {
    let text = raw.trim();
    if text.is_empty() || text.starts_with("0000-00-00") {
        return None;
    }

    if let Ok(parsed) =
        OffsetDateTime::parse(text, &time::format_description::well_known::Rfc3339)
    {
        return canonical_timestamp(parsed);
    }

    let datetime_formats = [
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"),
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
        format_description!("[year]-[month]-[day] [hour]:[minute]"),
        format_description!("[year]/[month]/[day] [hour]:[minute]:[second]"),
    ];
    for format in datetime_formats {
        if let Ok(parsed) = PrimitiveDateTime::parse(text, format) {
            return canonical_timestamp(parsed.assume_utc());
        }
    }

    let date_formats =
        [format_description!("[year]-[month]-[day]"), format_description!("[year]/[month]/[day]")];
    for format in date_formats {
        if let Ok(parsed) = Date::parse(text, format) {
            return canonical_timestamp(parsed.midnight().assume_utc());
        }
    }

    text.parse::<i64>()
        .ok()
        .and_then(|seconds| OffsetDateTime::from_unix_timestamp(seconds).ok())
        .and_then(canonical_timestamp)
}

fn default_for(
    spec: &FieldSpec,
    class: FieldClass,
    policy: &DefaultsPolicy,
    context: &ReconcileContext,
) -> Option<FieldValue> {
    if let Some(configured) = policy.overrides.get(&spec.name) {
        let mut ignored = Vec::new();
        let value = coerce(configured, spec, &mut ignored);
        if !value.is_null() {
            return Some(value);
        }
    }

    if class == FieldClass::Credential {
        return None;
    }

    if spec.kind == FieldKind::Text {
        let text = match class {
            FieldClass::Name => policy.placeholder_name.clone(),
            FieldClass::Email => format!(
                "restored+{}@{}",
                context.placeholder_suffix, policy.placeholder_email_domain
            ),
            FieldClass::Role => policy.least_privileged_role.clone(),
            FieldClass::Status => policy.default_status.clone(),
            FieldClass::Plain | FieldClass::Credential => String::new(),
        };
        return Some(FieldValue::Text(text));
    }

    Some(match spec.kind {
        FieldKind::Integer => FieldValue::Integer(0),
        FieldKind::Float => FieldValue::Real(0.0),
        FieldKind::Temporal => {
            canonical_timestamp(context.now).map_or(FieldValue::Null, FieldValue::Text)
        }
        FieldKind::Structured => FieldValue::Text("{}".to_string()),
        FieldKind::Binary => FieldValue::Blob(Vec::new()),
        FieldKind::Text => FieldValue::Text(String::new()),
    })
}

fn truncate(value: FieldValue, spec: &FieldSpec, notes: &mut Vec<FieldNote>) -> FieldValue {
    match (value, spec.kind, spec.max_length) {
        (FieldValue::Text(text), FieldKind::Text, Some(max)) => {
            let length = text.chars().count();
            if length <= max {
                return FieldValue::Text(text);
            }
            notes.push(FieldNote::new(
                &spec.name,
                FieldNoteKind::Truncated { from: length, to: max },
            ));
            FieldValue::Text(text.chars().take(max).collect())
        }
        (value, _, _) => value,
    }
}
