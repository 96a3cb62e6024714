//! Event Transformer
//!
//! Reduces a record to the sub-events the filter set lets through.

use crate::event::Record;
use crate::filter::FilterSet;

/// Build a reduced copy of `record` holding only the sub-events whose
/// category is enabled and whose pattern matches the record's device id.
///
/// Order is preserved. A record with nothing left is still a valid result;
/// callers forward it as-is.
pub fn transform(record: &Record, filters: &FilterSet) -> Record {
    let kept = record
        .data
        .iter()
        .filter(|ev| filters.matches(&ev.typ, &record.device_id))
        .cloned()
        .collect();

    record.with_data(kept)
}
