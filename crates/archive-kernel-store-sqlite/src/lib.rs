use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use archive_kernel_core::{
    decode_payload, reconcile, ArchivalId, ArchiveError, ArchiveOutcome, ArchiveRequest,
    ArchivedRecord, AuditEntry, AuditOperation, DecodedPayload, DefaultsPolicy, FieldMap,
    LiveStatus, ReconcileContext, RecordId, RestoreOutcome, RestoreRequest, RestoreWarning,
    SchemaDescriptor, StoredAuditEntry,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

mod audit;
mod introspect;
mod resolver;

pub use audit::AuditFilter;

use introspect::{json_to_sql, quote_ident, row_to_map, select_row};

const LATEST_SCHEMA_VERSION: i64 = 2;

const STORE_TARGET: &str = "archive_kernel::store";

/// VM instructions between deadline checks.
const PROGRESS_HANDLER_OPS: i32 = 16;

const SNAPSHOT_COLUMN: &str = "snapshot";

/// Columns of the archive table that describe the archival itself rather than the record.
const ARCHIVE_METADATA_COLUMNS: [&str; 9] = [
    "archival_id",
    "original_id",
    SNAPSHOT_COLUMN,
    "archived_by",
    "archived_at",
    "reason",
    "notes",
    "restore_count",
    "last_restored_at",
];

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

/// Names of the tables and columns the kernel reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreLayout {
    pub live_table: String,
    pub archive_table: String,
    pub audit_table: String,
    pub id_column: String,
    pub status_column: String,
    pub role_column: String,
    /// Roles whose holders may not archive themselves.
    pub elevated_roles: Vec<String>,
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self {
            live_table: "users".to_string(),
            archive_table: "archived_users".to_string(),
            audit_table: "archive_audit_log".to_string(),
            id_column: "id".to_string(),
            status_column: "status".to_string(),
            role_column: "role".to_string(),
            elevated_roles: vec!["Admin".to_string()],
        }
    }
}

impl StoreLayout {
    /// Check that every configured table and column name is a plain SQL identifier.
    ///
    /// # Errors
    /// Returns an error naming the first offending identifier.
    pub fn validate(&self) -> Result<()> {
        let pattern = regex_lite::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")
            .context("failed to compile identifier pattern")?;
        for (setting, value) in [
            ("live_table", &self.live_table),
            ("archive_table", &self.archive_table),
            ("audit_table", &self.audit_table),
            ("id_column", &self.id_column),
            ("status_column", &self.status_column),
            ("role_column", &self.role_column),
        ] {
            if !pattern.is_match(value) {
                return Err(anyhow!("{setting} is not a valid SQL identifier: {value:?}"));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn is_elevated(&self, role: &str) -> bool {
        self.elevated_roles.iter().any(|elevated| elevated.eq_ignore_ascii_case(role.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// How long a statement waits on a locked database before giving up.
    pub busy_timeout_ms: u64,
    /// Deadline for one whole archive or restore, including its transaction.
    pub operation_timeout_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self { busy_timeout_ms: 5_000, operation_timeout_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    pub layout: StoreLayout,
    pub timeouts: Timeouts,
    pub defaults: DefaultsPolicy,
}

pub struct SqliteStore {
    conn: Connection,
    layout: StoreLayout,
    defaults: DefaultsPolicy,
    operation_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

impl SqliteStore {
    /// Open a store with the default layout, timeouts, and defaults policy.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, &StoreOptions::default())
    }

    /// Open a SQLite-backed live and archival store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the layout is invalid, the database cannot be opened, or
    /// pragmas cannot be applied.
    pub fn open_with(path: &Path, options: &StoreOptions) -> Result<Self> {
        options.layout.validate()?;

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.busy_timeout(Duration::from_millis(options.timeouts.busy_timeout_ms))
            .context("failed to configure sqlite busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            layout: options.layout.clone(),
            defaults: options.defaults.clone(),
            operation_timeout: Duration::from_millis(options.timeouts.operation_timeout_ms),
        })
    }

    #[must_use]
    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn set_operation_timeout(&mut self, timeout: Duration) {
        self.operation_timeout = timeout;
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) =
            detect_effective_schema_version(&self.conn, &self.layout)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        let archive = &self.layout.archive_table;

        if !table_exists(&self.conn, archive)? {
            self.conn
                .execute_batch(&migration_001_sql(&self.layout))
                .context("failed to apply migration 001")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        if table_has_column(&self.conn, archive, SNAPSHOT_COLUMN)? {
            // Tables already carry the snapshot column but the migration rows are missing.
            self.conn
                .execute_batch(&migration_001_sql(&self.layout))
                .context("failed to apply migration 001")?;
            record_schema_version(&self.conn, 1)?;
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }

        if table_has_column(&self.conn, archive, "original_id")? {
            // Archives written before snapshots existed. Version 2 adds the column; rows
            // without a snapshot keep restoring from their auxiliary columns.
            self.conn
                .execute_batch(&migration_001_sql(&self.layout))
                .context("failed to apply migration 001")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        Err(anyhow!("database schema is invalid: {archive} has no original_id column"))
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let archive = self.layout.archive_table.clone();
        let tx = self.conn.transaction().context("failed to start migration 002")?;

        if !table_has_column(&tx, &archive, SNAPSHOT_COLUMN)? {
            tx.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {SNAPSHOT_COLUMN} TEXT;",
                quote_ident(&archive)
            ))
            .context("failed to add snapshot column to archive table")?;
        }
        record_schema_version(&tx, 2)?;

        tx.commit().context("failed to commit migration 002")?;
        Ok(())
    }

    /// Describe the current column shape of `entity` from the live catalog.
    ///
    /// # Errors
    /// Returns [`ArchiveError::StoreUnavailable`] when the catalog cannot be read.
    pub fn describe(&self, entity: &str) -> Result<SchemaDescriptor, ArchiveError> {
        introspect::describe(&self.conn, entity).map_err(store_error)
    }

    /// Copy a live record into the archive, mark it archived, and audit the attempt.
    ///
    /// # Errors
    /// Returns [`ArchiveError::NotFound`] for unknown records,
    /// [`ArchiveError::SelfOperationDenied`] when an administrator targets their own
    /// active elevated identity, [`ArchiveError::AlreadyArchived`] for records already
    /// archived, and store failures as constraint or availability errors. Every failure
    /// leaves live and archival state untouched and writes one failure audit entry.
    pub fn archive(&mut self, request: &ArchiveRequest) -> Result<ArchiveOutcome, ArchiveError> {
        let mut entry = AuditEntry::new(
            AuditOperation::Archive,
            Some(request.original_id),
            &request.actor,
            request.reason.clone(),
            request.origin.clone(),
        );
        let result = self.with_deadline(|store| store.archive_in_tx(request, &mut entry));

        if let Ok(outcome) = &result {
            tracing::info!(
                target: STORE_TARGET,
                archival_id = %outcome.archival_id,
                original_id = %outcome.original_id,
                admin_id = %request.actor.admin_id,
                "archive committed"
            );
        }
        self.conclude(entry, result)
    }

    /// Rebuild a live record from an archival row and write it back under its original id.
    ///
    /// # Errors
    /// Returns [`ArchiveError::NotFound`] for unknown archival rows, and constraint or
    /// availability errors when the write cannot be applied. Undecodable payloads are not
    /// an error: they surface as a [`RestoreWarning::DecodeDegraded`] warning.
    pub fn restore(&mut self, request: &RestoreRequest) -> Result<RestoreOutcome, ArchiveError> {
        let mut entry = AuditEntry::new(
            AuditOperation::Restore,
            None,
            &request.actor,
            request.reason.clone(),
            request.origin.clone(),
        );
        entry.archival_id = Some(request.archival_id);
        let result = self.with_deadline(|store| store.restore_in_tx(request, &mut entry));

        if let Ok(outcome) = &result {
            tracing::info!(
                target: STORE_TARGET,
                archival_id = %outcome.archival_id,
                resulting_id = %outcome.resulting_id,
                mode = outcome.mode.as_str(),
                decode_quality = outcome.decode_quality.as_str(),
                credential_reset_required = outcome.credential_reset_required,
                "restore committed"
            );
        }
        self.conclude(entry, result)
    }

    /// List archival rows, newest first, optionally for a single original identity.
    ///
    /// # Errors
    /// Returns an error when the archive table cannot be read.
    pub fn list_archives(&self, original_id: Option<RecordId>) -> Result<Vec<ArchivedRecord>> {
        let mut sql = format!("SELECT * FROM {}", quote_ident(&self.layout.archive_table));
        let mut bindings = Vec::new();
        if let Some(original_id) = original_id {
            sql.push_str(" WHERE original_id = ?1");
            bindings.push(SqlValue::Integer(original_id.0));
        }
        sql.push_str(" ORDER BY archival_id DESC");

        let mut stmt = self.conn.prepare(&sql).context("failed to prepare archive listing")?;
        let names = introspect::column_names(&stmt);
        let rows = stmt
            .query_map(params_from_iter(bindings.iter()), |row| row_to_map(row, &names))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(archived_record_from_row).collect()
    }

    /// # Errors
    /// Returns an error when the archive table cannot be read or a row is malformed.
    pub fn get_archive(&self, archival_id: ArchivalId) -> Result<Option<ArchivedRecord>> {
        select_row(&self.conn, &self.layout.archive_table, "archival_id", archival_id.0)
            .with_context(|| format!("failed to load archival record {archival_id}"))?
            .map(archived_record_from_row)
            .transpose()
    }

    /// # Errors
    /// Returns an error when the audit table cannot be read or holds malformed rows.
    pub fn list_audit(&self, filter: &AuditFilter) -> Result<Vec<StoredAuditEntry>> {
        audit::list(&self.conn, &self.layout.audit_table, filter)
    }

    /// Run `operation` with the configured deadline enforced through SQLite's progress
    /// handler. Any transaction the operation left open is rolled back before returning.
    fn with_deadline<T>(
        &mut self,
        operation: impl FnOnce(&mut Self) -> Result<T, ArchiveError>,
    ) -> Result<T, ArchiveError> {
        if let Some(deadline) = Instant::now().checked_add(self.operation_timeout) {
            self.conn
                .progress_handler(PROGRESS_HANDLER_OPS, Some(move || Instant::now() >= deadline));
        }

        let result = operation(self);

        self.conn.progress_handler(PROGRESS_HANDLER_OPS, None::<fn() -> bool>);
        if !self.conn.is_autocommit() {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(target: STORE_TARGET, error = %err, "rollback after failed operation failed");
            }
        }
        result
    }

    /// Write the failure audit for `result` outside the rolled-back transaction.
    fn conclude<T>(
        &mut self,
        entry: AuditEntry,
        result: Result<T, ArchiveError>,
    ) -> Result<T, ArchiveError> {
        if let Err(err) = &result {
            tracing::warn!(
                target: STORE_TARGET,
                operation = entry.operation.as_str(),
                code = err.code(),
                error = %err,
                "operation rolled back"
            );
            let failed = entry.failed(err);
            audit::record_failure(&mut self.conn, &self.layout.audit_table, &failed);
        }
        result
    }

    fn archive_in_tx(
        &mut self,
        request: &ArchiveRequest,
        entry: &mut AuditEntry,
    ) -> Result<ArchiveOutcome, ArchiveError> {
        let live_schema =
            introspect::describe(&self.conn, &self.layout.live_table).map_err(store_error)?;
        let archive_schema =
            introspect::describe(&self.conn, &self.layout.archive_table).map_err(store_error)?;
        if archive_schema.is_empty() {
            return Err(ArchiveError::Internal(format!(
                "archive table {} is missing; run migrations",
                self.layout.archive_table
            )));
        }
        let auxiliary = auxiliary_columns(&archive_schema, &live_schema);

        let layout = &self.layout;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_error)?;

        let Some(live) = select_row(&tx, &layout.live_table, &layout.id_column, request.original_id.0)
            .map_err(store_error)?
        else {
            return Err(ArchiveError::NotFound(format!("record {}", request.original_id)));
        };
        entry.before_state = Some(audit::redact(&live, &self.defaults));

        let Some(status_value) = live.get(&layout.status_column) else {
            return Err(ArchiveError::Internal(format!(
                "{} has no {} column",
                layout.live_table, layout.status_column
            )));
        };
        let status = status_value.as_str().and_then(LiveStatus::parse);
        if status == Some(LiveStatus::Archived) {
            return Err(ArchiveError::AlreadyArchived(request.original_id));
        }

        let live_role = live.get(&layout.role_column).and_then(Value::as_str);
        let elevated = layout.is_elevated(&request.actor.role)
            || live_role.is_some_and(|role| layout.is_elevated(role));
        if request.actor.admin_id == request.original_id
            && status == Some(LiveStatus::Active)
            && elevated
        {
            return Err(ArchiveError::SelfOperationDenied { admin_id: request.actor.admin_id });
        }

        let archived_at = OffsetDateTime::now_utc();
        let mut columns = vec![
            "original_id".to_string(),
            "archived_by".to_string(),
            "archived_at".to_string(),
            "reason".to_string(),
            "notes".to_string(),
        ];
        let mut values = vec![
            SqlValue::Integer(request.original_id.0),
            SqlValue::Integer(request.actor.admin_id.0),
            SqlValue::Text(timestamp(archived_at)?),
            request.reason.clone().map_or(SqlValue::Null, SqlValue::Text),
            request.notes.clone().map_or(SqlValue::Null, SqlValue::Text),
        ];
        if archive_schema.has_field(SNAPSHOT_COLUMN) {
            let snapshot = serde_json::to_string(&live).map_err(|err| {
                ArchiveError::Internal(format!("failed to serialize live record: {err}"))
            })?;
            columns.push(SNAPSHOT_COLUMN.to_string());
            values.push(SqlValue::Text(snapshot));
        }
        for (archive_column, live_column) in &auxiliary {
            columns.push(archive_column.clone());
            values.push(live.get(live_column).map_or(SqlValue::Null, json_to_sql));
        }

        let placeholders = (1..=values.len()).map(|index| format!("?{index}")).collect::<Vec<_>>();
        tx.execute(
            &format!(
                "INSERT INTO {}({}) VALUES ({})",
                quote_ident(&layout.archive_table),
                columns.iter().map(|column| quote_ident(column)).collect::<Vec<_>>().join(", "),
                placeholders.join(", ")
            ),
            params_from_iter(values),
        )
        .map_err(store_error)?;
        let archival_id = ArchivalId(tx.last_insert_rowid());

        tx.execute(
            &format!(
                "UPDATE {} SET {} = ?1 WHERE {} = ?2",
                quote_ident(&layout.live_table),
                quote_ident(&layout.status_column),
                quote_ident(&layout.id_column)
            ),
            params![LiveStatus::Archived.as_str(), request.original_id.0],
        )
        .map_err(store_error)?;

        let mut after = live.clone();
        after.insert(layout.status_column.clone(), Value::from(LiveStatus::Archived.as_str()));
        let mut success = entry.clone();
        success.archival_id = Some(archival_id);
        success.resulting_id = Some(request.original_id);
        success.after_state = Some(audit::redact(&after, &self.defaults));

        audit::record(&tx, &layout.audit_table, &success).map_err(store_error)?;
        tx.commit().map_err(store_error)?;

        Ok(ArchiveOutcome { archival_id, original_id: request.original_id, archived_at })
    }

    fn restore_in_tx(
        &mut self,
        request: &RestoreRequest,
        entry: &mut AuditEntry,
    ) -> Result<RestoreOutcome, ArchiveError> {
        let live_schema =
            introspect::describe(&self.conn, &self.layout.live_table).map_err(store_error)?;
        let archive_schema =
            introspect::describe(&self.conn, &self.layout.archive_table).map_err(store_error)?;
        let mirrored = auxiliary_columns(&archive_schema, &live_schema);

        let layout = &self.layout;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_error)?;

        let Some(archived) =
            select_row(&tx, &layout.archive_table, "archival_id", request.archival_id.0)
                .map_err(store_error)?
        else {
            return Err(ArchiveError::NotFound(format!("archival record {}", request.archival_id)));
        };
        let original_id = archived
            .get("original_id")
            .and_then(Value::as_i64)
            .map(RecordId)
            .ok_or_else(|| {
                ArchiveError::Internal(format!(
                    "archival record {} has no original_id",
                    request.archival_id
                ))
            })?;
        entry.original_id = Some(original_id);

        let decoded = match archived.get(SNAPSHOT_COLUMN).and_then(introspect::text_content) {
            Some(raw) => decode_payload(&raw),
            None => {
                tracing::debug!(
                    target: STORE_TARGET,
                    archival_id = %request.archival_id,
                    "archival record has no snapshot; rebuilding from auxiliary columns"
                );
                DecodedPayload::empty()
            }
        };
        entry.decode_quality = Some(decoded.quality);

        let auxiliary = mirrored
            .iter()
            .filter_map(|(archive_column, live_column)| {
                archived.get(archive_column).map(|value| (live_column.clone(), value.clone()))
            })
            .collect::<FieldMap>();
        let now = OffsetDateTime::now_utc();
        let context = ReconcileContext {
            now,
            placeholder_suffix: format!("{original_id}-{}", request.archival_id),
        };
        let reconciled =
            reconcile(&decoded.fields, &live_schema, &auxiliary, &self.defaults, &context);
        for note in &reconciled.notes {
            tracing::debug!(
                target: STORE_TARGET,
                archival_id = %request.archival_id,
                field = %note.field,
                note = ?note.kind,
                "reconciled field"
            );
        }

        let resolution = resolver::resolve(
            &tx,
            layout,
            &live_schema,
            &self.defaults,
            original_id,
            reconciled.record,
        )?;

        tx.execute(
            &format!(
                "UPDATE {} SET restore_count = COALESCE(restore_count, 0) + 1, last_restored_at = ?1
                 WHERE archival_id = ?2",
                quote_ident(&layout.archive_table)
            ),
            params![timestamp(now)?, request.archival_id.0],
        )
        .map_err(store_error)?;
        let restore_count = archived.get("restore_count").and_then(Value::as_i64).unwrap_or(0) + 1;

        let mut warnings = Vec::new();
        if decoded.quality.is_degraded() {
            warnings.push(RestoreWarning::DecodeDegraded { quality: decoded.quality });
        }
        if let Some(field) = &resolution.credential_field {
            warnings.push(RestoreWarning::CredentialResetRequired { field: field.clone() });
        }

        let mut success = entry.clone();
        success.resulting_id = Some(resolution.resulting_id);
        success.before_state =
            resolution.before.as_ref().map(|before| audit::redact(before, &self.defaults));
        success.after_state = Some(json!({
            "mode": resolution.mode.as_str(),
            "record": audit::redact(&resolution.after, &self.defaults),
            "notes": reconciled.notes,
            "warnings": warnings,
        }));

        audit::record(&tx, &layout.audit_table, &success).map_err(store_error)?;
        tx.commit().map_err(store_error)?;

        Ok(RestoreOutcome {
            archival_id: request.archival_id,
            original_id,
            resulting_id: resolution.resulting_id,
            mode: resolution.mode,
            credential_reset_required: resolution.credential_field.is_some(),
            decode_quality: decoded.quality,
            restore_count,
            warnings,
            notes: reconciled.notes,
        })
    }
}

/// Archive-table columns that mirror live columns, paired as (archive name, live name).
fn auxiliary_columns(
    archive_schema: &SchemaDescriptor,
    live_schema: &SchemaDescriptor,
) -> Vec<(String, String)> {
    archive_schema
        .fields
        .iter()
        .filter(|field| {
            !ARCHIVE_METADATA_COLUMNS.iter().any(|meta| meta.eq_ignore_ascii_case(&field.name))
        })
        .filter_map(|field| {
            live_schema
                .field(&field.name)
                .filter(|live| !live.primary_key)
                .map(|live| (field.name.clone(), live.name.clone()))
        })
        .collect()
}

fn archived_record_from_row(mut row: FieldMap) -> Result<ArchivedRecord> {
    let mut take = |column: &str| row.remove(column).filter(|value| !value.is_null());

    let archival_id = take("archival_id")
        .and_then(|value| value.as_i64())
        .map(ArchivalId)
        .ok_or_else(|| anyhow!("archival row is missing archival_id"))?;
    let original_id = take("original_id")
        .and_then(|value| value.as_i64())
        .map(RecordId)
        .ok_or_else(|| anyhow!("archival record {archival_id} is missing original_id"))?;
    let payload = take(SNAPSHOT_COLUMN).as_ref().and_then(introspect::text_content);
    let archived_by = take("archived_by").and_then(|value| value.as_i64()).map(RecordId);
    let archived_at = take("archived_at")
        .and_then(|value| value.as_str().map(str::to_string))
        .map(|raw| parse_timestamp(&raw))
        .transpose()?;
    let reason = take("reason").and_then(|value| value.as_str().map(str::to_string));
    let notes = take("notes").and_then(|value| value.as_str().map(str::to_string));
    let restore_count = take("restore_count").and_then(|value| value.as_i64()).unwrap_or(0);
    let last_restored_at = take("last_restored_at")
        .and_then(|value| value.as_str().map(str::to_string))
        .map(|raw| parse_timestamp(&raw))
        .transpose()?;

    Ok(ArchivedRecord {
        archival_id,
        original_id,
        auxiliary: row,
        payload,
        archived_by,
        archived_at,
        reason,
        notes,
        restore_count,
        last_restored_at,
    })
}

/// Classify a SQLite failure into the kernel's error taxonomy. The full driver text is
/// kept as detail for the audit trail.
pub(crate) fn store_error(err: rusqlite::Error) -> ArchiveError {
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => {
            ArchiveError::SchemaConstraintViolation(err.to_string())
        }
        Some(ErrorCode::OperationInterrupted) => {
            ArchiveError::StoreUnavailable(format!("operation deadline exceeded: {err}"))
        }
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::SystemIoFailure
            | ErrorCode::CannotOpen
            | ErrorCode::DiskFull
            | ErrorCode::ReadOnly
            | ErrorCode::FileLockingProtocolFailed,
        ) => ArchiveError::StoreUnavailable(err.to_string()),
        Some(_) => ArchiveError::SchemaConstraintViolation(err.to_string()),
        None => ArchiveError::Internal(err.to_string()),
    }
}

pub(crate) fn migration_001_sql(layout: &StoreLayout) -> String {
    let live = quote_ident(&layout.live_table);
    let archive = quote_ident(&layout.archive_table);
    let audit = quote_ident(&layout.audit_table);
    let id = quote_ident(&layout.id_column);
    let status = quote_ident(&layout.status_column);
    let role = quote_ident(&layout.role_column);
    let archive_index = quote_ident(&format!("idx_{}_original_id", layout.archive_table));
    let audit_index = quote_ident(&format!("idx_{}_archival_id", layout.audit_table));

    format!(
        "
CREATE TABLE IF NOT EXISTS {live} (
  {id} INTEGER PRIMARY KEY,
  name VARCHAR(100) NOT NULL,
  email VARCHAR(255) NOT NULL UNIQUE,
  password VARCHAR(255) NOT NULL,
  {role} VARCHAR(20) NOT NULL DEFAULT 'Member',
  {status} VARCHAR(20) NOT NULL DEFAULT 'Active'
    CHECK ({status} IN ('Active', 'Archived', 'Rejected', 'Suspended')),
  phone VARCHAR(20),
  created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS {archive} (
  archival_id INTEGER PRIMARY KEY AUTOINCREMENT,
  original_id INTEGER NOT NULL,
  name VARCHAR(100),
  email VARCHAR(255),
  {role} VARCHAR(20),
  phone VARCHAR(20),
  archived_by INTEGER,
  archived_at TEXT NOT NULL,
  reason TEXT,
  notes TEXT,
  restore_count INTEGER NOT NULL DEFAULT 0 CHECK (restore_count >= 0),
  last_restored_at TEXT
);

CREATE TABLE IF NOT EXISTS {audit} (
  audit_id INTEGER PRIMARY KEY AUTOINCREMENT,
  operation TEXT NOT NULL CHECK (operation IN ('archive', 'restore')),
  archival_id INTEGER,
  original_id INTEGER,
  resulting_id INTEGER,
  admin_id INTEGER NOT NULL,
  reason TEXT,
  outcome TEXT NOT NULL CHECK (outcome IN ('success', 'failed')),
  before_state TEXT,
  after_state TEXT,
  error_detail TEXT,
  decode_quality TEXT,
  origin_ip TEXT,
  user_agent TEXT,
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS {archive_index} ON {archive}(original_id);
CREATE INDEX IF NOT EXISTS {audit_index} ON {audit}(archival_id);
"
    )
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }
    let schema = introspect::describe(conn, table)
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    Ok(schema.has_field(column))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection, layout: &StoreLayout) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    let archive = &layout.archive_table;
    if !table_exists(conn, archive)? {
        return Ok((0, false));
    }

    if table_has_column(conn, archive, SNAPSHOT_COLUMN)? {
        return Ok((2, true));
    }

    if table_has_column(conn, archive, "original_id")? {
        return Ok((1, true));
    }

    Err(anyhow!("database schema is invalid: {archive} has no original_id column"))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

pub(crate) fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

/// Archive timestamps are RFC3339; rows imported from older tooling may use SQL datetimes.
fn parse_timestamp(value: &str) -> Result<OffsetDateTime> {
    parse_rfc3339(value).or_else(|err| {
        PrimitiveDateTime::parse(
            value,
            format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        )
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|_| err)
    })
}

fn timestamp(value: OffsetDateTime) -> Result<String, ArchiveError> {
    rfc3339(value).map_err(|err| ArchiveError::Internal(format!("{err:#}")))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;

    use archive_kernel_core::{
        Actor, AuditOutcome, DecodeQuality, RequestOrigin, RestoreMode,
    };
    use ulid::Ulid;

    use super::*;

    fn admin() -> Actor {
        Actor { admin_id: RecordId(1), role: "Admin".to_string() }
    }

    fn migrated_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        seed_user(&store, 1, "Site Admin", "admin@x.com", "Admin")?;
        Ok(store)
    }

    fn seed_user(store: &SqliteStore, id: i64, name: &str, email: &str, role: &str) -> Result<()> {
        store.conn.execute(
            "INSERT INTO users(id, name, email, password, role, status, phone)
             VALUES (?1, ?2, ?3, 'sha256:seeded', ?4, 'Active', '555-0100')",
            params![id, name, email, role],
        )?;
        Ok(())
    }

    fn archive_request(original_id: i64, actor: Actor) -> ArchiveRequest {
        ArchiveRequest {
            original_id: RecordId(original_id),
            actor,
            reason: Some("policy violation".to_string()),
            notes: None,
            origin: RequestOrigin {
                ip: Some("192.0.2.10".to_string()),
                user_agent: Some("admin-console".to_string()),
            },
        }
    }

    fn restore_request(archival_id: ArchivalId) -> RestoreRequest {
        RestoreRequest {
            archival_id,
            actor: admin(),
            reason: Some("appeal upheld".to_string()),
            origin: RequestOrigin::default(),
        }
    }

    fn live_status(store: &SqliteStore, id: i64) -> Result<Option<String>> {
        let row = select_row(&store.conn, "users", "id", id)?;
        Ok(row.and_then(|row| row.get("status").and_then(Value::as_str).map(str::to_string)))
    }

    fn audit_count(store: &SqliteStore) -> Result<usize> {
        Ok(store.list_audit(&AuditFilter::default())?.len())
    }

    // Test IDs: TDB-001
    #[test]
    fn migrate_fresh_database_reaches_latest_version() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1, 2]);

        store.migrate()?;
        store.migrate()?;

        let after = store.schema_status()?;
        assert_eq!(after.current_version, 2);
        assert!(after.pending_versions.is_empty());
        assert!(!after.inferred_from_legacy);
        assert!(table_has_column(&store.conn, "archived_users", SNAPSHOT_COLUMN)?);
        Ok(())
    }

    // Test IDs: TDB-002
    #[test]
    fn schema_status_reports_pending_migration_for_legacy_archive_table() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(&migration_001_sql(&StoreLayout::default()))?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert_eq!(status.pending_versions, vec![2]);
        assert!(status.inferred_from_legacy);
        Ok(())
    }

    // Test IDs: TDB-003
    #[test]
    fn migrate_rejects_archive_table_without_original_id() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch("CREATE TABLE archived_users(archival_id INTEGER PRIMARY KEY);")?;

        let err = match store.migrate() {
            Ok(()) => return Err(anyhow!("expected migration to fail on invalid archive table")),
            Err(err) => err,
        };

        assert!(err.to_string().contains("archived_users has no original_id column"));
        Ok(())
    }

    #[test]
    fn invalid_layout_identifiers_are_rejected_on_open() {
        let options = StoreOptions {
            layout: StoreLayout {
                live_table: "users; DROP TABLE users".to_string(),
                ..StoreLayout::default()
            },
            ..StoreOptions::default()
        };

        let result = SqliteStore::open_with(Path::new(":memory:"), &options);

        assert!(result.is_err());
    }

    // Test IDs: TARC-001
    #[test]
    fn archive_then_restore_recreates_deleted_identity_with_original_id() -> Result<()> {
        let mut store = migrated_store()?;
        seed_user(&store, 42, "Jane Doe", "jane@x.com", "Trainer")?;

        let archived = store.archive(&archive_request(42, admin()))?;
        assert_eq!(archived.original_id, RecordId(42));
        assert_eq!(live_status(&store, 42)?.as_deref(), Some("Archived"));

        store.conn.execute("DELETE FROM users WHERE id = 42", [])?;

        let restored = store.restore(&restore_request(archived.archival_id))?;

        assert_eq!(restored.mode, RestoreMode::Recreated);
        assert_eq!(restored.resulting_id, RecordId(42));
        assert_eq!(restored.decode_quality, DecodeQuality::Strict);
        assert!(!restored.credential_reset_required);
        assert!(restored.warnings.is_empty());
        assert_eq!(restored.restore_count, 1);

        let Some(row) = select_row(&store.conn, "users", "id", 42)? else {
            return Err(anyhow!("restored row 42 not found"));
        };
        assert_eq!(row.get("name"), Some(&json!("Jane Doe")));
        assert_eq!(row.get("email"), Some(&json!("jane@x.com")));
        assert_eq!(row.get("role"), Some(&json!("Trainer")));
        assert_eq!(row.get("status"), Some(&json!("Active")));
        assert_eq!(row.get("password"), Some(&json!("sha256:seeded")));

        let Some(record) = store.get_archive(archived.archival_id)? else {
            return Err(anyhow!("archival record missing after restore"));
        };
        assert_eq!(record.restore_count, 1);
        assert!(record.last_restored_at.is_some());
        assert_eq!(record.reason.as_deref(), Some("policy violation"));
        assert_eq!(record.archived_by, Some(RecordId(1)));
        assert_eq!(record.auxiliary.get("email"), Some(&json!("jane@x.com")));
        Ok(())
    }

    // Test IDs: TARC-002
    #[test]
    fn restore_of_archived_live_row_updates_in_place() -> Result<()> {
        let mut store = migrated_store()?;
        seed_user(&store, 42, "Jane Doe", "jane@x.com", "Trainer")?;
        let archived = store.archive(&archive_request(42, admin()))?;

        let first = store.restore(&restore_request(archived.archival_id))?;
        let second = store.restore(&restore_request(archived.archival_id))?;

        assert_eq!(first.mode, RestoreMode::UpdatedInPlace);
        assert_eq!(second.mode, RestoreMode::UpdatedInPlace);
        assert_eq!(second.restore_count, 2);
        assert_eq!(live_status(&store, 42)?.as_deref(), Some("Active"));

        let restores = store.list_audit(&AuditFilter {
            archival_id: Some(archived.archival_id),
            operation: Some(AuditOperation::Restore),
            ..AuditFilter::default()
        })?;
        assert_eq!(restores.len(), 2);
        let Some(before) = &restores[0].entry.before_state else {
            return Err(anyhow!("update-in-place restore should record a before image"));
        };
        assert_eq!(before.get("password"), Some(&json!("[redacted]")));
        Ok(())
    }

    // Test IDs: TARC-003
    #[test]
    fn undecodable_snapshot_restores_from_auxiliary_columns() -> Result<()> {
        let mut store = migrated_store()?;
        seed_user(&store, 42, "Jane Doe", "jane@x.com", "Trainer")?;
        let archived = store.archive(&archive_request(42, admin()))?;
        store.conn.execute(
            "UPDATE archived_users SET snapshot = 'not-json-at-all' WHERE archival_id = ?1",
            params![archived.archival_id.0],
        )?;
        store.conn.execute("DELETE FROM users WHERE id = 42", [])?;

        let restored = store.restore(&restore_request(archived.archival_id))?;

        assert_eq!(restored.mode, RestoreMode::Recreated);
        assert_eq!(restored.decode_quality, DecodeQuality::None);
        assert!(restored.credential_reset_required);
        assert!(restored
            .warnings
            .contains(&RestoreWarning::DecodeDegraded { quality: DecodeQuality::None }));

        let Some(row) = select_row(&store.conn, "users", "id", 42)? else {
            return Err(anyhow!("restored row 42 not found"));
        };
        assert_eq!(row.get("name"), Some(&json!("Jane Doe")));
        assert_eq!(row.get("email"), Some(&json!("jane@x.com")));
        assert_eq!(row.get("role"), Some(&json!("Trainer")));
        assert_eq!(row.get("status"), Some(&json!("Active")));
        let password = row.get("password").and_then(Value::as_str).unwrap_or_default();
        assert!(password.starts_with("reset-required:sha256:"));

        let audits = store.list_audit(&AuditFilter {
            archival_id: Some(archived.archival_id),
            operation: Some(AuditOperation::Restore),
            ..AuditFilter::default()
        })?;
        assert_eq!(audits[0].entry.decode_quality, Some(DecodeQuality::None));
        let recorded = audits[0].entry.after_state.clone().unwrap_or_default();
        assert_eq!(recorded["record"]["password"], json!("[redacted]"));
        Ok(())
    }

    // Test IDs: TARC-004
    #[test]
    fn legacy_archive_without_snapshot_column_restores_after_migration() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(&migration_001_sql(&StoreLayout::default()))?;
        store.conn.execute(
            "INSERT INTO archived_users(original_id, name, email, role, archived_at)
             VALUES (77, 'Legacy Member', 'legacy@x.com', 'Member', '2019-05-01 10:00:00')",
            [],
        )?;

        store.migrate()?;
        let archives = store.list_archives(Some(RecordId(77)))?;
        assert_eq!(archives.len(), 1);
        assert_eq!(archives[0].payload, None);

        let restored = store.restore(&restore_request(archives[0].archival_id))?;

        assert_eq!(restored.mode, RestoreMode::Recreated);
        assert_eq!(restored.resulting_id, RecordId(77));
        assert_eq!(live_status(&store, 77)?.as_deref(), Some("Active"));
        Ok(())
    }

    // Test IDs: TARC-005
    #[test]
    fn self_archive_of_elevated_admin_is_denied_before_any_write() -> Result<()> {
        let mut store = migrated_store()?;

        let result = store.archive(&archive_request(1, admin()));

        assert_eq!(result, Err(ArchiveError::SelfOperationDenied { admin_id: RecordId(1) }));
        assert_eq!(live_status(&store, 1)?.as_deref(), Some("Active"));
        assert!(store.list_archives(None)?.is_empty());
        let audits = store.list_audit(&AuditFilter::default())?;
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].entry.outcome, AuditOutcome::Failed);
        assert_eq!(audits[0].entry.archival_id, None);
        Ok(())
    }

    // Test IDs: TARC-006
    #[test]
    fn non_elevated_identity_may_archive_itself() -> Result<()> {
        let mut store = migrated_store()?;
        seed_user(&store, 9, "Front Desk", "desk@x.com", "Member")?;
        let actor = Actor { admin_id: RecordId(9), role: "Member".to_string() };

        store.archive(&archive_request(9, actor))?;

        assert_eq!(live_status(&store, 9)?.as_deref(), Some("Archived"));
        Ok(())
    }

    // Test IDs: TARC-007
    #[test]
    fn archiving_twice_reports_already_archived() -> Result<()> {
        let mut store = migrated_store()?;
        seed_user(&store, 42, "Jane Doe", "jane@x.com", "Trainer")?;
        store.archive(&archive_request(42, admin()))?;

        let second = store.archive(&archive_request(42, admin()));

        assert_eq!(second, Err(ArchiveError::AlreadyArchived(RecordId(42))));
        assert_eq!(store.list_archives(Some(RecordId(42)))?.len(), 1);
        Ok(())
    }

    // Test IDs: TARC-008
    #[test]
    fn missing_targets_are_not_found_and_still_audited() -> Result<()> {
        let mut store = migrated_store()?;

        let archive = store.archive(&archive_request(404, admin()));
        let restore = store.restore(&restore_request(ArchivalId(404)));

        assert!(matches!(archive, Err(ArchiveError::NotFound(_))));
        assert!(matches!(restore, Err(ArchiveError::NotFound(_))));
        let audits = store.list_audit(&AuditFilter::default())?;
        assert_eq!(audits.len(), 2);
        assert_eq!(audits[0].entry.operation, AuditOperation::Restore);
        assert_eq!(audits[0].entry.original_id, None);
        assert_eq!(audits[0].entry.archival_id, Some(ArchivalId(404)));
        assert!(audits.iter().all(|stored| stored.entry.outcome == AuditOutcome::Failed));
        Ok(())
    }

    // Test IDs: TARC-009
    #[test]
    fn constraint_violation_rolls_back_restore_and_audits_detail() -> Result<()> {
        let mut store = migrated_store()?;
        seed_user(&store, 42, "Jane Doe", "jane@x.com", "Trainer")?;
        let archived = store.archive(&archive_request(42, admin()))?;
        store.conn.execute("DELETE FROM users WHERE id = 42", [])?;
        seed_user(&store, 43, "Email Squatter", "jane@x.com", "Member")?;

        let result = store.restore(&restore_request(archived.archival_id));

        let Err(err) = result else {
            return Err(anyhow!("restore should collide on the unique email"));
        };
        assert!(matches!(err, ArchiveError::SchemaConstraintViolation(_)));
        assert_eq!(
            err.public_message(AuditOperation::Restore),
            "restoration failed; contact an administrator"
        );
        assert!(select_row(&store.conn, "users", "id", 42)?.is_none());
        let Some(record) = store.get_archive(archived.archival_id)? else {
            return Err(anyhow!("archival record should survive a failed restore"));
        };
        assert_eq!(record.restore_count, 0);

        let audits = store.list_audit(&AuditFilter::default())?;
        assert_eq!(audits[0].entry.outcome, AuditOutcome::Failed);
        assert_eq!(audits[0].entry.resulting_id, None);
        assert!(audits[0].entry.error_detail.as_deref().unwrap_or_default().contains("UNIQUE"));
        Ok(())
    }

    // Test IDs: TARC-010
    #[test]
    fn expired_deadline_rolls_back_and_records_failure() -> Result<()> {
        let mut store = migrated_store()?;
        seed_user(&store, 42, "Jane Doe", "jane@x.com", "Trainer")?;
        store.set_operation_timeout(Duration::ZERO);

        let result = store.archive(&archive_request(42, admin()));

        let Err(err) = result else {
            return Err(anyhow!("archive should exceed a zero deadline"));
        };
        assert!(err.is_retryable());
        assert_eq!(live_status(&store, 42)?.as_deref(), Some("Active"));
        assert!(store.list_archives(None)?.is_empty());
        let audits = store.list_audit(&AuditFilter::default())?;
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].entry.outcome, AuditOutcome::Failed);
        Ok(())
    }

    // Test IDs: TARC-011
    #[test]
    fn every_call_writes_exactly_one_audit_entry() -> Result<()> {
        let mut store = migrated_store()?;
        seed_user(&store, 42, "Jane Doe", "jane@x.com", "Trainer")?;

        let archived = store.archive(&archive_request(42, admin()))?;
        assert_eq!(audit_count(&store)?, 1);
        let _ = store.archive(&archive_request(42, admin()));
        assert_eq!(audit_count(&store)?, 2);
        store.restore(&restore_request(archived.archival_id))?;
        assert_eq!(audit_count(&store)?, 3);
        let _ = store.restore(&restore_request(ArchivalId(999)));
        assert_eq!(audit_count(&store)?, 4);
        let _ = store.archive(&archive_request(1, admin()));
        assert_eq!(audit_count(&store)?, 5);
        Ok(())
    }

    #[test]
    fn describe_reports_live_schema() -> Result<()> {
        let store = migrated_store()?;

        let schema = store.describe("users")?;

        assert!(schema.has_field("email"));
        assert_eq!(schema.primary_key().map(|field| field.name.as_str()), Some("id"));
        assert!(store.describe("no_such_entity")?.is_empty());
        Ok(())
    }

    // Test IDs: TARC-012
    #[test]
    fn snapshot_stored_with_blob_affinity_decodes_strictly() -> Result<()> {
        let mut store = migrated_store()?;
        seed_user(&store, 42, "Jane Doe", "jane@x.com", "Trainer")?;
        let archived = store.archive(&archive_request(42, admin()))?;
        store.conn.execute(
            "UPDATE archived_users
             SET snapshot = CAST('{\"name\":\"Jane Q. Doe\",\"email\":\"jane.q@x.com\",\"role\":\"Trainer\"}' AS BLOB)
             WHERE archival_id = ?1",
            params![archived.archival_id.0],
        )?;
        store.conn.execute("DELETE FROM users WHERE id = 42", [])?;

        let restored = store.restore(&restore_request(archived.archival_id))?;

        assert_eq!(restored.mode, RestoreMode::Recreated);
        assert_eq!(restored.decode_quality, DecodeQuality::Strict);
        let Some(row) = select_row(&store.conn, "users", "id", 42)? else {
            return Err(anyhow!("restored row 42 not found"));
        };
        assert_eq!(row.get("name"), Some(&json!("Jane Q. Doe")));
        assert_eq!(row.get("email"), Some(&json!("jane.q@x.com")));
        assert_eq!(row.get("role"), Some(&json!("Trainer")));

        let Some(shown) = store.get_archive(archived.archival_id)? else {
            return Err(anyhow!("archival record {} not found", archived.archival_id));
        };
        assert!(shown.payload.as_deref().is_some_and(|payload| payload.contains("Jane Q. Doe")));
        Ok(())
    }

    // Test IDs: TARC-013
    #[test]
    fn binary_columns_survive_archive_and_restore() -> Result<()> {
        let mut store = migrated_store()?;
        store.conn.execute_batch("ALTER TABLE users ADD COLUMN avatar BLOB;")?;
        seed_user(&store, 42, "Jane Doe", "jane@x.com", "Trainer")?;
        store.conn.execute("UPDATE users SET avatar = x'0aff' WHERE id = 42", [])?;

        let archived = store.archive(&archive_request(42, admin()))?;
        store.conn.execute("DELETE FROM users WHERE id = 42", [])?;
        let restored = store.restore(&restore_request(archived.archival_id))?;
        assert_eq!(restored.mode, RestoreMode::Recreated);
        assert_eq!(restored.decode_quality, DecodeQuality::Strict);

        let (kind, length, encoded): (String, i64, String) = store.conn.query_row(
            "SELECT typeof(avatar), length(avatar), hex(avatar) FROM users WHERE id = 42",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        assert_eq!((kind.as_str(), length, encoded.as_str()), ("blob", 2, "0AFF"));
        Ok(())
    }

    // Test IDs: TARC-014
    #[test]
    fn truncated_and_binary_garbage_snapshots_still_restore() -> Result<()> {
        let mut store = migrated_store()?;
        seed_user(&store, 42, "Jane Doe", "jane@x.com", "Trainer")?;

        let archived = store.archive(&archive_request(42, admin()))?;
        store.conn.execute(
            "UPDATE archived_users
             SET snapshot = '{\"name\": \"Jane Q. Doe\", \"email\": \"jane@x.com\", \"role\": \"Tra'
             WHERE archival_id = ?1",
            params![archived.archival_id.0],
        )?;
        store.conn.execute("DELETE FROM users WHERE id = 42", [])?;

        let restored = store.restore(&restore_request(archived.archival_id))?;
        assert_eq!(restored.mode, RestoreMode::Recreated);
        assert_eq!(restored.decode_quality, DecodeQuality::Heuristic);
        assert!(restored
            .warnings
            .contains(&RestoreWarning::DecodeDegraded { quality: DecodeQuality::Heuristic }));
        let Some(row) = select_row(&store.conn, "users", "id", 42)? else {
            return Err(anyhow!("restored row 42 not found"));
        };
        assert_eq!(row.get("name"), Some(&json!("Jane Q. Doe")));
        assert_eq!(row.get("role"), Some(&json!("Member")));

        let again = store.archive(&archive_request(42, admin()))?;
        store.conn.execute(
            "UPDATE archived_users SET snapshot = x'00ff10fe7b' WHERE archival_id = ?1",
            params![again.archival_id.0],
        )?;
        store.conn.execute("DELETE FROM users WHERE id = 42", [])?;

        let restored = store.restore(&restore_request(again.archival_id))?;
        assert_eq!(restored.mode, RestoreMode::Recreated);
        assert_eq!(restored.decode_quality, DecodeQuality::None);
        let Some(row) = select_row(&store.conn, "users", "id", 42)? else {
            return Err(anyhow!("restored row 42 not found"));
        };
        assert_eq!(row.get("email"), Some(&json!("jane@x.com")));
        assert_eq!(row.get("status"), Some(&json!("Active")));
        Ok(())
    }

    // Test IDs: TCONC-001
    #[test]
    fn concurrent_restores_never_duplicate_an_identity() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("archivekernel-concurrency-{}.sqlite3", Ulid::new()));
        let archival_id = {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
            seed_user(&init, 1, "Site Admin", "admin@x.com", "Admin")?;
            seed_user(&init, 42, "Jane Doe", "jane@x.com", "Trainer")?;
            let archived = init.archive(&archive_request(42, admin()))?;
            init.conn.execute("DELETE FROM users WHERE id = 42", [])?;
            archived.archival_id
        };

        let restorer_threads = 4;
        let mut handles = Vec::new();
        for _ in 0..restorer_threads {
            let path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<Result<RestoreOutcome, ArchiveError>> {
                let mut store = SqliteStore::open(&path)?;
                Ok(store.restore(&restore_request(archival_id)))
            }));
        }

        let mut recreated = 0;
        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("restore thread panicked"));
            };
            match thread_result? {
                Ok(outcome) if outcome.mode == RestoreMode::Recreated => recreated += 1,
                Ok(_)
                | Err(
                    ArchiveError::SchemaConstraintViolation(_) | ArchiveError::StoreUnavailable(_),
                ) => {}
                Err(other) => return Err(anyhow!("unexpected restore failure: {other}")),
            }
        }
        assert_eq!(recreated, 1);

        let store = SqliteStore::open(&db_path)?;
        let rows: i64 =
            store.conn.query_row("SELECT COUNT(*) FROM users WHERE id = 42", [], |row| row.get(0))?;
        assert_eq!(rows, 1);
        assert_eq!(audit_count(&store)?, 1 + restorer_threads);
        drop(store);

        for suffix in ["", "-wal", "-shm"] {
            let path = if suffix.is_empty() {
                db_path.clone()
            } else {
                std::path::PathBuf::from(format!("{}{}", db_path.display(), suffix))
            };
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }
}
