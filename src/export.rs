//! Result sets exported from the EODMS web interface
//!
//! The export is a CSV file with one row per image. Column names vary between
//! exports and are matched case-insensitively; only the collection and the
//! record id are read. Exports are not always UTF-8, so fields are decoded
//! lossily.

use std::collections::HashSet;
use std::path::Path;

use crate::error::{Error, Result};
use crate::types::RecordKey;

const COLLECTION_COLUMNS: [&str; 3] = ["collection id", "collectionid", "collection"];
const RECORD_ID_COLUMNS: [&str; 3] = ["record id", "recordid", "sequence id"];

fn find_column(header: &csv::ByteRecord, names: &[&str]) -> Option<usize> {
    let header: Vec<String> = header
        .iter()
        .map(|field| {
            String::from_utf8_lossy(field)
                .trim()
                .trim_start_matches('\u{feff}')
                .to_ascii_lowercase()
        })
        .collect();
    names
        .iter()
        .find_map(|name| header.iter().position(|column| column == name))
}

/// Read the records of an exported result set, in file order
///
/// Rows without a collection or record id are skipped, as are repeats.
///
/// # Errors
/// An unreadable file, or one without a collection or record id column.
pub fn load_export(path: &Path) -> Result<Vec<RecordKey>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)?;
    let header = reader.byte_headers()?.clone();

    let missing = |what: &str| {
        Error::InvalidInput(format!(
            "{} has no {what} column; expected one of the EODMS export columns",
            path.display()
        ))
    };
    let collection_col = find_column(&header, &COLLECTION_COLUMNS)
        .ok_or_else(|| missing("collection"))?;
    let record_col =
        find_column(&header, &RECORD_ID_COLUMNS).ok_or_else(|| missing("record id"))?;

    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    let mut skipped = 0usize;
    for row in reader.byte_records() {
        let row = row?;
        let field = |index: usize| {
            row.get(index)
                .map(|value| String::from_utf8_lossy(value).trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let (Some(collection), Some(record_id)) = (field(collection_col), field(record_col))
        else {
            skipped += 1;
            continue;
        };
        let key = RecordKey::new(collection, record_id);
        if seen.insert(key.clone()) {
            keys.push(key);
        }
    }

    if skipped > 0 {
        tracing::warn!(
            path = %path.display(),
            rows = skipped,
            "Skipped export rows without a collection or record id"
        );
    }
    tracing::info!(path = %path.display(), records = keys.len(), "Export loaded");
    Ok(keys)
}
