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

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::messages::MessageStatus;

    #[test]
    fn parse_enum_success() {
        let result: Result<MessageStatus, _> = parse_enum("delivered", "messages", "status");
        assert_eq!(result.unwrap(), MessageStatus::Delivered);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<MessageStatus, _> = parse_enum("INVALID", "messages", "status");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "messages", column: "status", .. })
        ));
    }
}
