use archive_kernel_core::{
    blob_from_json, blob_to_json, FieldMap, FieldSpec, FieldValue, SchemaDescriptor,
};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

/// Describe the current column shape of `entity` from the SQLite catalog.
///
/// An entity without a catalog entry yields an empty descriptor rather than an error.
pub(crate) fn describe(conn: &Connection, entity: &str) -> rusqlite::Result<SchemaDescriptor> {
    let mut stmt = conn.prepare(
        "SELECT name, type, \"notnull\", dflt_value IS NOT NULL, pk
         FROM pragma_table_info(?1)
         ORDER BY cid",
    )?;
    let fields = stmt
        .query_map(params![entity], |row| {
            let name: String = row.get(0)?;
            let declared: Option<String> = row.get(1)?;
            let not_null = row.get::<_, i64>(2)? != 0;
            let has_default: bool = row.get(3)?;
            let primary_key = row.get::<_, i64>(4)? > 0;
            Ok(FieldSpec::from_catalog(
                &name,
                declared.as_deref().unwrap_or_default(),
                not_null,
                has_default,
                primary_key,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(SchemaDescriptor { entity: entity.to_string(), fields })
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Text content of a column that may have been stored with BLOB affinity.
pub(crate) fn text_content(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        other => blob_from_json(other).map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
    }
}

/// Load one row keyed by `key_column` as a loosely typed field map.
pub(crate) fn select_row(
    conn: &Connection,
    table: &str,
    key_column: &str,
    key: i64,
) -> rusqlite::Result<Option<FieldMap>> {
    let sql = format!(
        "SELECT * FROM {} WHERE {} = ?1",
        quote_ident(table),
        quote_ident(key_column)
    );
    let mut stmt = conn.prepare(&sql)?;
    let names = column_names(&stmt);
    stmt.query_row(params![key], |row| row_to_map(row, &names)).optional()
}

pub(crate) fn column_names(stmt: &rusqlite::Statement<'_>) -> Vec<String> {
    stmt.column_names().into_iter().map(str::to_string).collect()
}

pub(crate) fn row_to_map(row: &Row<'_>, names: &[String]) -> rusqlite::Result<FieldMap> {
    let mut map = FieldMap::new();
    for (index, name) in names.iter().enumerate() {
        let value = match row.get_ref(index)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(value) => Value::from(value),
            ValueRef::Real(value) => {
                serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
            }
            ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => blob_to_json(bytes),
        };
        map.insert(name.clone(), value);
    }
    Ok(map)
}

pub(crate) fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => {
            blob_from_json(value).map_or_else(|| SqlValue::Text(value.to_string()), SqlValue::Blob)
        }
    }
}

pub(crate) fn field_to_sql(value: &FieldValue) -> SqlValue {
    match value {
        FieldValue::Null => SqlValue::Null,
        FieldValue::Integer(value) => SqlValue::Integer(*value),
        FieldValue::Real(value) => SqlValue::Real(*value),
        FieldValue::Text(value) => SqlValue::Text(value.clone()),
        FieldValue::Blob(bytes) => SqlValue::Blob(bytes.clone()),
    }
}
