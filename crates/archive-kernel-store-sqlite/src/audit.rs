use anyhow::{anyhow, Context, Result};
use archive_kernel_core::{
    ArchivalId, AuditEntry, AuditId, AuditOperation, AuditOutcome, DecodeQuality, DefaultsPolicy,
    FieldClass, FieldMap, RecordId, RequestOrigin, StoredAuditEntry,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use serde_json::Value;

use crate::introspect::quote_ident;
use crate::{parse_rfc3339, rfc3339};

pub(crate) const AUDIT_FALLBACK_TARGET: &str = "archive_kernel::audit_fallback";

const REDACTED: &str = "[redacted]";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub archival_id: Option<ArchivalId>,
    pub original_id: Option<RecordId>,
    pub operation: Option<AuditOperation>,
    pub limit: Option<usize>,
}

/// Append one entry. Callers on the success path pass their open transaction.
pub(crate) fn record(conn: &Connection, table: &str, entry: &AuditEntry) -> rusqlite::Result<AuditId> {
    let recorded_at = rfc3339(entry.recorded_at)
        .map_err(|err| rusqlite::Error::ToSqlConversionFailure(err.into()))?;
    let sql = format!(
        "INSERT INTO {}(
            operation, archival_id, original_id, resulting_id, admin_id, reason, outcome,
            before_state, after_state, error_detail, decode_quality, origin_ip, user_agent,
            recorded_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        quote_ident(table)
    );
    conn.execute(
        &sql,
        params![
            entry.operation.as_str(),
            entry.archival_id.map(|id| id.0),
            entry.original_id.map(|id| id.0),
            entry.resulting_id.map(|id| id.0),
            entry.admin_id.0,
            entry.reason,
            entry.outcome.as_str(),
            entry.before_state.as_ref().map(Value::to_string),
            entry.after_state.as_ref().map(Value::to_string),
            entry.error_detail,
            entry.decode_quality.map(DecodeQuality::as_str),
            entry.origin.ip,
            entry.origin.user_agent,
            recorded_at,
        ],
    )?;
    Ok(AuditId(conn.last_insert_rowid()))
}

/// Persist a failure entry in its own transaction, after the operation rolled back.
///
/// When the audit store is unreachable too, the entry goes to the diagnostic log instead;
/// the caller's original error is returned untouched either way.
pub(crate) fn record_failure(conn: &mut Connection, table: &str, entry: &AuditEntry) {
    let persisted = conn.transaction().and_then(|tx| {
        record(&tx, table, entry)?;
        tx.commit()
    });

    if let Err(err) = persisted {
        let serialized = serde_json::to_string(entry)
            .unwrap_or_else(|encode_err| format!("<unserializable audit entry: {encode_err}>"));
        tracing::error!(
            target: AUDIT_FALLBACK_TARGET,
            error = %err,
            entry = %serialized,
            "failed to persist failure audit entry"
        );
    }
}

pub(crate) fn list(conn: &Connection, table: &str, filter: &AuditFilter) -> Result<Vec<StoredAuditEntry>> {
    let mut clauses = Vec::new();
    let mut bindings = Vec::new();
    if let Some(archival_id) = filter.archival_id {
        bindings.push(SqlValue::Integer(archival_id.0));
        clauses.push(format!("archival_id = ?{}", bindings.len()));
    }
    if let Some(original_id) = filter.original_id {
        bindings.push(SqlValue::Integer(original_id.0));
        clauses.push(format!("original_id = ?{}", bindings.len()));
    }
    if let Some(operation) = filter.operation {
        bindings.push(SqlValue::Text(operation.as_str().to_string()));
        clauses.push(format!("operation = ?{}", bindings.len()));
    }

    let mut sql = format!(
        "SELECT audit_id, operation, archival_id, original_id, resulting_id, admin_id, reason,
                outcome, before_state, after_state, error_detail, decode_quality, origin_ip,
                user_agent, recorded_at
         FROM {}",
        quote_ident(table)
    );
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY audit_id DESC");
    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    let mut stmt = conn.prepare(&sql).context("failed to prepare audit listing query")?;
    let mut rows = stmt.query(params_from_iter(bindings.iter()))?;
    let mut out = Vec::new();

    while let Some(row) = rows.next()? {
        let operation: String = row.get(1)?;
        let outcome: String = row.get(7)?;
        let before_state: Option<String> = row.get(8)?;
        let after_state: Option<String> = row.get(9)?;
        let decode_quality: Option<String> = row.get(11)?;
        let recorded_at: String = row.get(14)?;

        out.push(StoredAuditEntry {
            audit_id: AuditId(row.get(0)?),
            entry: AuditEntry {
                operation: AuditOperation::parse(&operation)
                    .ok_or_else(|| anyhow!("invalid audit operation: {operation}"))?,
                archival_id: row.get::<_, Option<i64>>(2)?.map(ArchivalId),
                original_id: row.get::<_, Option<i64>>(3)?.map(RecordId),
                resulting_id: row.get::<_, Option<i64>>(4)?.map(RecordId),
                admin_id: RecordId(row.get(5)?),
                reason: row.get(6)?,
                outcome: AuditOutcome::parse(&outcome)
                    .ok_or_else(|| anyhow!("invalid audit outcome: {outcome}"))?,
                before_state: parse_state(before_state.as_deref())?,
                after_state: parse_state(after_state.as_deref())?,
                error_detail: row.get(10)?,
                decode_quality: decode_quality.as_deref().and_then(DecodeQuality::parse),
                origin: RequestOrigin { ip: row.get(12)?, user_agent: row.get(13)? },
                recorded_at: parse_rfc3339(&recorded_at)?,
            },
        });
    }

    Ok(out)
}

fn parse_state(raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(|text| serde_json::from_str(text).context("audit state is not valid JSON"))
        .transpose()
}

/// Serialize a live-row image for the audit trail with credential columns masked.
pub(crate) fn redact(fields: &FieldMap, policy: &DefaultsPolicy) -> Value {
    let object = fields
        .iter()
        .map(|(key, value)| {
            let shown = if policy.classify(key) == FieldClass::Credential && !value.is_null() {
                Value::String(REDACTED.to_string())
            } else {
                value.clone()
            };
            (key.clone(), shown)
        })
        .collect::<serde_json::Map<_, _>>();
    Value::Object(object)
}
