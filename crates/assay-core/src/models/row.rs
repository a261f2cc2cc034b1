//! Full-row snapshots of synchronizable entities

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map, Value as Json};

use crate::error::RowError;
use crate::models::entity::{EntityKind, FieldSpec, FieldType};
use crate::timestamp::Timestamp;

/// A typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    Blob(Vec<u8>),
    Timestamp(Timestamp),
}

impl FieldValue {
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    /// Decode a JSON value as the given field's type.
    fn from_json(field: &FieldSpec, value: &Json) -> Result<Self, RowError> {
        if value.is_null() {
            return Ok(Self::Null);
        }
        let mistyped = || {
            RowError::malformed(format!(
                "field `{}` expects {}, got {value}",
                field.name,
                describe(field.ty)
            ))
        };
        match field.ty {
            FieldType::Integer => value.as_i64().map(Self::Integer).ok_or_else(mistyped),
            FieldType::Real => value.as_f64().map(Self::Real).ok_or_else(mistyped),
            FieldType::Text => value
                .as_str()
                .map(|text| Self::Text(text.to_string()))
                .ok_or_else(mistyped),
            FieldType::Bool => match value {
                Json::Bool(flag) => Ok(Self::Bool(*flag)),
                // Local installs keep booleans as TINYINT.
                Json::Number(number) => match number.as_i64() {
                    Some(0) => Ok(Self::Bool(false)),
                    Some(1) => Ok(Self::Bool(true)),
                    _ => Err(mistyped()),
                },
                _ => Err(mistyped()),
            },
            FieldType::Blob => value
                .as_str()
                .and_then(|text| BASE64.decode(text).ok())
                .map(Self::Blob)
                .ok_or_else(mistyped),
            FieldType::Timestamp => {
                let parsed = match value {
                    Json::String(text) => Timestamp::parse(text).ok(),
                    Json::Number(number) => number.as_i64().and_then(Timestamp::checked_from_millis),
                    _ => None,
                };
                parsed.map(Self::Timestamp).ok_or_else(mistyped)
            }
        }
    }

    fn to_json(&self) -> Json {
        match self {
            Self::Null => Json::Null,
            Self::Integer(value) => Json::from(*value),
            Self::Real(value) => Json::from(*value),
            Self::Text(value) => Json::String(value.clone()),
            Self::Bool(value) => Json::Bool(*value),
            Self::Blob(bytes) => Json::String(BASE64.encode(bytes)),
            Self::Timestamp(ts) => Json::String(ts.to_string()),
        }
    }

    /// Convert to a libSQL parameter (booleans and timestamps as integers).
    pub(crate) fn to_sql(&self) -> libsql::Value {
        match self {
            Self::Null => libsql::Value::Null,
            Self::Integer(value) => libsql::Value::Integer(*value),
            Self::Real(value) => libsql::Value::Real(*value),
            Self::Text(value) => libsql::Value::Text(value.clone()),
            Self::Bool(value) => libsql::Value::Integer(i64::from(*value)),
            Self::Blob(bytes) => libsql::Value::Blob(bytes.clone()),
            Self::Timestamp(ts) => libsql::Value::Integer(ts.as_millis()),
        }
    }

    /// Read a stored column back into the field's type.
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn from_sql(ty: FieldType, value: libsql::Value) -> crate::Result<Self> {
        use libsql::Value as Sql;

        let decoded = match (ty, value) {
            (_, Sql::Null) => Self::Null,
            (FieldType::Integer, Sql::Integer(value)) => Self::Integer(value),
            (FieldType::Real, Sql::Real(value)) => Self::Real(value),
            (FieldType::Real, Sql::Integer(value)) => Self::Real(value as f64),
            (FieldType::Text, Sql::Text(value)) => Self::Text(value),
            (FieldType::Bool, Sql::Integer(value)) => Self::Bool(value != 0),
            (FieldType::Blob, Sql::Blob(bytes)) => Self::Blob(bytes),
            (FieldType::Timestamp, Sql::Integer(millis)) => {
                Self::Timestamp(Timestamp::from_millis(millis))
            }
            (ty, other) => {
                return Err(crate::Error::Database(format!(
                    "stored value {other:?} does not match column type {ty:?}"
                )))
            }
        };
        Ok(decoded)
    }
}

const fn describe(ty: FieldType) -> &'static str {
    match ty {
        FieldType::Integer => "an integer",
        FieldType::Real => "a number",
        FieldType::Text => "a string",
        FieldType::Bool => "a boolean",
        FieldType::Blob => "a base64 string",
        FieldType::Timestamp => "a timestamp",
    }
}

/// One record of a synchronizable entity.
///
/// `values` holds only the fields that are known: a stored row carries every
/// column, a pushed row carries whatever the sender included.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRow {
    pub kind: EntityKind,
    pub id: i64,
    pub modified: Timestamp,
    pub values: BTreeMap<&'static str, FieldValue>,
}

impl EntityRow {
    pub fn new(kind: EntityKind, id: i64, modified: Timestamp) -> Self {
        Self {
            kind,
            id,
            modified,
            values: BTreeMap::new(),
        }
    }

    /// Builder-style setter; unknown field names are ignored.
    #[must_use]
    pub fn with(mut self, name: &str, value: FieldValue) -> Self {
        if let Some(field) = self.kind.field(name) {
            self.values.insert(field.name, value);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values.get(name)
    }

    /// Parse a pushed JSON object.
    ///
    /// `id` and `modified` are required. Keys that are not part of the
    /// entity's field table are ignored so senders can include extra columns.
    pub fn from_json(kind: EntityKind, payload: &Json) -> Result<Self, RowError> {
        let object = payload
            .as_object()
            .ok_or_else(|| RowError::malformed(format!("{kind} row must be a JSON object")))?;

        let id = object
            .get("id")
            .ok_or_else(|| RowError::malformed("missing `id`"))?
            .as_i64()
            .ok_or_else(|| RowError::malformed("`id` must be an integer"))?;

        let modified = match object.get("modified") {
            None | Some(Json::Null) => return Err(RowError::malformed("missing `modified`")),
            Some(Json::String(text)) => Timestamp::parse(text)
                .map_err(|error| RowError::malformed(format!("`modified`: {error}")))?,
            Some(Json::Number(number)) => number
                .as_i64()
                .and_then(Timestamp::checked_from_millis)
                .ok_or_else(|| {
                    RowError::malformed(format!("`modified` must be in-range integer millis, got {number}"))
                })?,
            Some(other) => {
                return Err(RowError::malformed(format!(
                    "`modified` must be a timestamp, got {other}"
                )))
            }
        };

        let mut row = Self::new(kind, id, modified);
        for field in kind.fields() {
            if let Some(value) = object.get(field.name) {
                row.values
                    .insert(field.name, FieldValue::from_json(field, value)?);
            }
        }
        Ok(row)
    }

    /// Serialize as a JSON object (`id`, `modified`, then the known fields).
    pub fn to_json(&self) -> Map<String, Json> {
        let mut object = Map::new();
        object.insert("id".into(), Json::from(self.id));
        object.insert("modified".into(), Json::String(self.modified.to_string()));
        for field in self.kind.fields() {
            if let Some(value) = self.values.get(field.name) {
                object.insert(field.name.into(), value.to_json());
            }
        }
        object
    }
}

impl serde::Serialize for EntityRow {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::RowErrorKind;

    #[test]
    fn parses_known_fields_and_ignores_extras() {
        let payload = json!({
            "id": 7,
            "modified": "2024-05-01T09:00:00Z",
            "customer": 3,
            "itemcode": "A-100",
            "ready": 1,
            "sampleweight": 12.5,
            "deleted": false,
            "customer_name": "Lee"
        });
        let row = EntityRow::from_json(EntityKind::AssayResult, &payload).unwrap();
        assert_eq!(row.id, 7);
        assert_eq!(row.get("customer"), Some(&FieldValue::Integer(3)));
        assert_eq!(row.get("ready"), Some(&FieldValue::Bool(true)));
        assert_eq!(row.get("sampleweight"), Some(&FieldValue::Real(12.5)));
        assert!(row.get("deleted").is_none());
        assert_eq!(row.values.len(), 4);
    }

    #[test]
    fn explicit_null_is_kept_absent_is_skipped() {
        let payload = json!({ "id": 1, "modified": 10, "itemcode": null });
        let row = EntityRow::from_json(EntityKind::SpoilRecord, &payload).unwrap();
        assert_eq!(row.get("itemcode"), Some(&FieldValue::Null));
        assert!(row.get("collector").is_none());
    }

    #[test]
    fn out_of_range_timestamps_are_malformed() {
        let far = json!({ "id": 1, "modified": 9_000_000_000_000_000_i64 });
        let err = EntityRow::from_json(EntityKind::Loss, &far).unwrap_err();
        assert_eq!(err.kind(), RowErrorKind::MalformedRow);

        let created = json!({ "id": 1, "modified": 10, "created": -9_000_000_000_000_000_i64 });
        let err = EntityRow::from_json(EntityKind::Loss, &created).unwrap_err();
        assert_eq!(err.kind(), RowErrorKind::MalformedRow);
    }

    #[test]
    fn missing_id_or_modified_is_malformed() {
        let no_id = EntityRow::from_json(EntityKind::Loss, &json!({ "modified": 1 }));
        assert!(matches!(no_id, Err(RowError::MalformedRow(_))));

        let no_modified = EntityRow::from_json(EntityKind::Loss, &json!({ "id": 1 }));
        assert!(matches!(no_modified, Err(RowError::MalformedRow(_))));

        let not_object = EntityRow::from_json(EntityKind::Loss, &json!([1, 2]));
        assert!(matches!(not_object, Err(RowError::MalformedRow(_))));
    }

    #[test]
    fn mistyped_field_names_the_field() {
        let payload = json!({ "id": 1, "modified": 1, "pct": "high" });
        let err = EntityRow::from_json(EntityKind::Loss, &payload).unwrap_err();
        assert!(err.reason().contains("`pct`"));
    }

    #[test]
    fn blob_fields_travel_as_base64() {
        let row = EntityRow::new(EntityKind::User, 4, Timestamp::from_millis(5))
            .with("salt", FieldValue::Blob(vec![1, 2, 3]));
        let json = Json::Object(row.to_json());
        assert_eq!(json["salt"], "AQID");

        let parsed = EntityRow::from_json(EntityKind::User, &json).unwrap();
        assert_eq!(parsed.get("salt"), Some(&FieldValue::Blob(vec![1, 2, 3])));
    }

    #[test]
    fn sql_bool_and_timestamp_columns_decode() {
        assert_eq!(
            FieldValue::from_sql(FieldType::Bool, libsql::Value::Integer(0)).unwrap(),
            FieldValue::Bool(false)
        );
        assert_eq!(
            FieldValue::from_sql(FieldType::Timestamp, libsql::Value::Integer(99)).unwrap(),
            FieldValue::Timestamp(Timestamp::from_millis(99))
        );
        assert!(FieldValue::from_sql(FieldType::Text, libsql::Value::Integer(1)).is_err());
    }
}
