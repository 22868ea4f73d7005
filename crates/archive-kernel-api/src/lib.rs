use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use archive_kernel_core::{
    ArchivalId, ArchiveError, ArchiveOutcome, ArchiveRequest, ArchivedRecord, DefaultsPolicy,
    RecordId, RestoreOutcome, RestoreRequest, SchemaDescriptor, StoredAuditEntry,
};
use archive_kernel_store_sqlite::{
    AuditFilter, SchemaStatus, SqliteStore, StoreLayout, StoreOptions, Timeouts,
};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Everything an embedding application can tune, loadable from YAML. Absent keys keep
/// their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub layout: StoreLayout,
    pub defaults: DefaultsPolicy,
    pub timeouts: Timeouts,
}

impl KernelConfig {
    /// Parse and validate a YAML configuration document.
    ///
    /// # Errors
    /// Returns an error when the document is not valid YAML for this shape or fails
    /// [`KernelConfig::validate`].
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("failed to parse kernel config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML configuration file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or its contents are invalid.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read kernel config {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("invalid kernel config {}", path.display()))
    }

    /// # Errors
    /// Returns an error when a configured identifier is not a plain SQL identifier or the
    /// least-privileged role is not one of the valid roles.
    pub fn validate(&self) -> Result<()> {
        self.layout.validate()?;
        let policy = &self.defaults;
        if !policy.valid_roles.is_empty()
            && !policy
                .valid_roles
                .iter()
                .any(|role| role.eq_ignore_ascii_case(&policy.least_privileged_role))
        {
            return Err(anyhow!(
                "least_privileged_role {:?} is not listed in valid_roles",
                policy.least_privileged_role
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            layout: self.layout.clone(),
            timeouts: self.timeouts,
            defaults: self.defaults.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditQuery {
    pub archival_id: Option<ArchivalId>,
    pub original_id: Option<RecordId>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ArchiveKernelApi {
    db_path: PathBuf,
    config: KernelConfig,
}

impl ArchiveKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_config(db_path, KernelConfig::default())
    }

    #[must_use]
    pub fn with_config(db_path: PathBuf, config: KernelConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open_with(&self.db_path, &self.config.store_options())
    }

    /// Open and migrate the store ahead of a mutating call. Failing here means no audit
    /// trail can be written either, so the error is reported as an availability problem.
    fn open_for_write(&self) -> Result<SqliteStore, ArchiveError> {
        let opened = self.open_store().and_then(|mut store| {
            store.migrate()?;
            Ok(store)
        });
        opened.map_err(|err| {
            tracing::error!(
                target: "archive_kernel::audit_fallback",
                db = %self.db_path.display(),
                error = %format!("{err:#}"),
                "store could not be opened; operation not attempted and not audited"
            );
            ArchiveError::StoreUnavailable(format!("{err:#}"))
        })
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Describe the live shape of `entity`. Unknown entities describe as empty.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or its catalog cannot be read.
    pub fn describe(&self, entity: &str) -> Result<SchemaDescriptor> {
        let store = self.open_store()?;
        Ok(store.describe(entity)?)
    }

    /// Archive one live record.
    ///
    /// # Errors
    /// Returns an [`ArchiveError`] (inside `anyhow`) for every rejected or failed attempt.
    pub fn archive(&self, request: &ArchiveRequest) -> Result<ArchiveOutcome> {
        let mut store = self.open_for_write()?;
        Ok(store.archive(request)?)
    }

    /// Restore one archival record into the live store.
    ///
    /// # Errors
    /// Returns an [`ArchiveError`] (inside `anyhow`) for every rejected or failed attempt.
    pub fn restore(&self, request: &RestoreRequest) -> Result<RestoreOutcome> {
        let mut store = self.open_for_write()?;
        Ok(store.restore(request)?)
    }

    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn list_archives(&self, original_id: Option<RecordId>) -> Result<Vec<ArchivedRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_archives(original_id)
    }

    /// # Errors
    /// Returns [`ArchiveError::NotFound`] (inside `anyhow`) when no such archival record
    /// exists, and other errors when the store cannot be read.
    pub fn get_archive(&self, archival_id: ArchivalId) -> Result<ArchivedRecord> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store
            .get_archive(archival_id)?
            .ok_or_else(|| ArchiveError::NotFound(format!("archival record {archival_id}")).into())
    }

    /// # Errors
    /// Returns an error when the store cannot be opened or the audit trail cannot be read.
    pub fn list_audit(&self, query: &AuditQuery) -> Result<Vec<StoredAuditEntry>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_audit(&AuditFilter {
            archival_id: query.archival_id,
            original_id: query.original_id,
            operation: None,
            limit: query.limit,
        })
    }
}
