use archive_kernel_core::{
    ArchiveError, DefaultsPolicy, FieldClass, FieldMap, FieldValue, LiveStatus, RecordId,
    RestoreMode, SanitizedRecord, SchemaDescriptor,
};
use rand::RngCore;
use rusqlite::{params_from_iter, Transaction};
use sha2::{Digest, Sha256};

use crate::introspect::{field_to_sql, quote_ident, select_row};
use crate::{store_error, StoreLayout};

const CREDENTIAL_PLACEHOLDER_PREFIX: &str = "reset-required:sha256:";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Resolution {
    pub resulting_id: RecordId,
    pub mode: RestoreMode,
    /// Set when a one-time placeholder credential was written to this column.
    pub credential_field: Option<String>,
    pub before: Option<FieldMap>,
    pub after: FieldMap,
}

/// Write `record` back under `original_id`, reviving the row if it still exists and
/// recreating it with the same identifier otherwise.
///
/// Must run inside the caller's write transaction; the existence check and the write are
/// only race-free because that transaction already holds the write lock.
pub(crate) fn resolve(
    tx: &Transaction<'_>,
    layout: &StoreLayout,
    schema: &SchemaDescriptor,
    policy: &DefaultsPolicy,
    original_id: RecordId,
    mut record: SanitizedRecord,
) -> Result<Resolution, ArchiveError> {
    record.retain(|column, _| !column.eq_ignore_ascii_case(&layout.id_column));
    if schema.is_empty() || schema.has_field(&layout.status_column) {
        record.insert(
            layout.status_column.clone(),
            FieldValue::Text(LiveStatus::Active.as_str().to_string()),
        );
    }

    let existing =
        select_row(tx, &layout.live_table, &layout.id_column, original_id.0).map_err(store_error)?;

    match existing {
        Some(before) => {
            update_in_place(tx, layout, original_id, &record)?;
            let mut after = before.clone();
            for (column, value) in &record {
                after.insert(column.clone(), value.to_json());
            }
            Ok(Resolution {
                resulting_id: original_id,
                mode: RestoreMode::UpdatedInPlace,
                credential_field: None,
                before: Some(before),
                after,
            })
        }
        None => {
            let credential_field = missing_credential(schema, policy, &record);
            if let Some(column) = &credential_field {
                record.insert(column.clone(), FieldValue::Text(placeholder_credential()));
            }
            insert_with_identity(tx, layout, original_id, &record)?;
            let mut after = record
                .iter()
                .map(|(column, value)| (column.clone(), value.to_json()))
                .collect::<FieldMap>();
            after.insert(layout.id_column.clone(), original_id.0.into());
            Ok(Resolution {
                resulting_id: original_id,
                mode: RestoreMode::Recreated,
                credential_field,
                before: None,
                after,
            })
        }
    }
}

fn update_in_place(
    tx: &Transaction<'_>,
    layout: &StoreLayout,
    original_id: RecordId,
    record: &SanitizedRecord,
) -> Result<(), ArchiveError> {
    if record.is_empty() {
        return Ok(());
    }
    let assignments = record
        .keys()
        .enumerate()
        .map(|(index, column)| format!("{} = ?{}", quote_ident(column), index + 1))
        .collect::<Vec<_>>();
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?{}",
        quote_ident(&layout.live_table),
        assignments.join(", "),
        quote_ident(&layout.id_column),
        record.len() + 1
    );
    let bindings = record
        .values()
        .map(field_to_sql)
        .chain(std::iter::once(rusqlite::types::Value::Integer(original_id.0)));

    let changed = tx.execute(&sql, params_from_iter(bindings)).map_err(store_error)?;
    if changed == 1 {
        Ok(())
    } else {
        Err(ArchiveError::Internal(format!(
            "expected to update one {} row for id {original_id}, updated {changed}",
            layout.live_table
        )))
    }
}

fn insert_with_identity(
    tx: &Transaction<'_>,
    layout: &StoreLayout,
    original_id: RecordId,
    record: &SanitizedRecord,
) -> Result<(), ArchiveError> {
    let columns = std::iter::once(quote_ident(&layout.id_column))
        .chain(record.keys().map(|column| quote_ident(column)))
        .collect::<Vec<_>>();
    let placeholders = (1..=columns.len()).map(|index| format!("?{index}")).collect::<Vec<_>>();
    let sql = format!(
        "INSERT INTO {}({}) VALUES ({})",
        quote_ident(&layout.live_table),
        columns.join(", "),
        placeholders.join(", ")
    );
    let bindings = std::iter::once(rusqlite::types::Value::Integer(original_id.0))
        .chain(record.values().map(field_to_sql));

    tx.execute(&sql, params_from_iter(bindings)).map_err(store_error)?;
    Ok(())
}

/// The first required credential column the record cannot fill on its own.
fn missing_credential(
    schema: &SchemaDescriptor,
    policy: &DefaultsPolicy,
    record: &SanitizedRecord,
) -> Option<String> {
    schema
        .fields
        .iter()
        .filter(|spec| !spec.nullable && !spec.has_default && !spec.primary_key)
        .filter(|spec| policy.classify(&spec.name) == FieldClass::Credential)
        .find(|spec| record.get(&spec.name).map_or(true, FieldValue::is_null))
        .map(|spec| spec.name.clone())
}

/// A credential nobody knows: the random secret is hashed and immediately discarded.
fn placeholder_credential() -> String {
    let mut secret = [0_u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    let digest = Sha256::digest(secret);
    format!("{CREDENTIAL_PLACEHOLDER_PREFIX}{}", hex::encode(digest))
}
