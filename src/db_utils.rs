use crate::error::PersistenceError;

/// Converts a stored i64 money column back to cents, rejecting negatives that
/// could only come from manual edits or a corrupt row.
pub(crate) fn cents_from_db_i64(db_value: i64) -> Result<u64, PersistenceError> {
    u64::try_from(db_value).map_err(|_| PersistenceError::InvalidAmount(db_value))
}

pub(crate) fn cents_to_db_i64(cents: u64) -> Result<i64, PersistenceError> {
    i64::try_from(cents).map_err(|_| PersistenceError::AmountOverflow(cents))
}

pub(crate) fn quantity_from_db_i64(db_value: i64) -> Result<u32, PersistenceError> {
    u32::try_from(db_value)
        .ok()
        .filter(|quantity| *quantity > 0)
        .ok_or(PersistenceError::InvalidQuantity(db_value))
}

pub(crate) fn json_from_db(
    column: &'static str,
    raw: &str,
) -> Result<serde_json::Value, PersistenceError> {
    serde_json::from_str(raw).map_err(|source| PersistenceError::CorruptJson { column, source })
}
