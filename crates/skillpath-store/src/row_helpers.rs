use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a JSON string column into a typed value, returning CorruptRow on
/// parse failure.
pub fn parse_json<T: DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Parse an optional JSON string column.
pub fn parse_json_opt<T: DeserializeOwned>(
    raw: Option<&str>,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    raw.map(|s| parse_json(s, table, column)).transpose()
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

/// Serialize a value into a JSON string column.
pub fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Serialize an optional value into an optional JSON string column.
pub fn to_json_opt<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>, StoreError> {
    value.map(|v| to_json(v)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillpath_core::model::RunStatus;

    #[test]
    fn parse_enum_success() {
        let result: Result<RunStatus, _> = parse_enum("completed", "runs", "status");
        assert!(result.is_ok());
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<RunStatus, _> = parse_enum("INVALID", "runs", "status");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "runs", column: "status", .. })
        ));
    }

    #[test]
    fn parse_json_success() {
        let result: Result<serde_json::Value, _> =
            parse_json(r#"{"key": "value"}"#, "stages", "input");
        assert!(result.is_ok());
        assert_eq!(result.unwrap()["key"], "value");
    }

    #[test]
    fn parse_json_failure() {
        let result: Result<serde_json::Value, _> = parse_json("not valid json", "stages", "input");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "stages", column: "input", .. })
        ));
    }

    #[test]
    fn parse_json_opt_none_passes_through() {
        let result: Option<serde_json::Value> = parse_json_opt(None, "runs", "output").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn to_json_opt_roundtrip() {
        let value = serde_json::json!({"a": 1});
        let encoded = to_json_opt(Some(&value)).unwrap().unwrap();
        let decoded: serde_json::Value = parse_json(&encoded, "runs", "output").unwrap();
        assert_eq!(decoded, value);

        assert!(to_json_opt::<serde_json::Value>(None).unwrap().is_none());
    }
}
