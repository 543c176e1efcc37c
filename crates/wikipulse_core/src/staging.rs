use crate::model::EditRecord;

/// Staged view over the raw edit table: every row that carries a timestamp,
/// untouched and in input order.
pub fn stage_edits<I>(records: I) -> Vec<EditRecord>
where
    I: IntoIterator<Item = EditRecord>,
{
    records
        .into_iter()
        .filter(|record| record.timestamp.is_some())
        .collect()
}
