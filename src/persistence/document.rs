//! Domain file format
//!
//! ## Layout
//! ```text
//! {
//!   "lastSaved": 1712345678901,     // unix millis of the write
//!   "checksum": 2309480984,         // CRC32 of the serialized "records" value
//!   "records": { "<id>": { ... } }  // or an array of objects carrying an id field
//! }
//! ```
//!
//! Writes go to `{file}.tmp`, are fsynced, and are renamed into place after
//! the previous file has been moved to `{file}.bak`. A reader that finds the
//! primary file missing or damaged falls back to the `.bak` copy, so a crash
//! at any point of the sequence leaves one complete document on disk.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::error::{CairnError, Result};

use super::domain::DomainSpec;
use super::resolve::{normalize_numeric_fields, Resolution};

/// Records of a domain keyed by identifier
pub type Records = BTreeMap<String, Value>;

/// A decoded domain document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainDocument {
    /// When the document was written, if recorded
    pub last_saved: Option<u64>,

    /// Records keyed by identifier
    pub records: Records,

    /// Same-identifier collisions resolved while decoding
    pub duplicates: usize,

    /// Fields converted from numeric strings while decoding
    pub normalized: usize,
}

/// Where a document was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentSource {
    Primary,
    Backup,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentOut<'a> {
    last_saved: u64,
    checksum: u32,
    records: &'a Records,
}

/// File name of a domain's document
pub fn domain_file_name(domain: &str) -> String {
    format!("{}.json", domain)
}

/// Path of a domain's document inside `data_dir`
pub fn domain_file_path(data_dir: &Path, domain: &str) -> PathBuf {
    data_dir.join(domain_file_name(domain))
}

/// Path of the backup copy kept next to a domain file
pub fn backup_path(path: &Path) -> PathBuf {
    with_suffix(path, ".bak")
}

/// Path a new version of a domain file is written to before the rename
pub fn temp_path(path: &Path) -> PathBuf {
    with_suffix(path, ".tmp")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// CRC32 of the canonical serialization of a records value
pub fn checksum(records: &impl Serialize) -> Result<u32> {
    let bytes = serde_json::to_vec(records)?;
    Ok(crc32fast::hash(&bytes))
}

/// Read and decode a single document file
///
/// Returns `Ok(None)` when the file does not exist.
pub fn read_document(path: &Path, spec: &DomainSpec) -> Result<Option<DomainDocument>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CairnError::persistence(&spec.name, e)),
    };

    let root: Value = serde_json::from_slice(&bytes)?;
    let Value::Object(mut root) = root else {
        return Err(CairnError::Serialization(format!(
            "{}: document root is not an object",
            path.display()
        )));
    };

    let last_saved = root.get("lastSaved").and_then(Value::as_u64);
    let stored_checksum = root.get("checksum").and_then(Value::as_u64);
    let records = root.remove("records").unwrap_or(Value::Null);

    if let Some(expected) = stored_checksum {
        let actual = checksum(&records)?;
        if u64::from(actual) != expected {
            return Err(CairnError::Serialization(format!(
                "{}: checksum mismatch (expected {:#010x}, got {:#010x})",
                path.display(),
                expected,
                actual
            )));
        }
    }

    let mut document = decode_records(records, spec)?;
    document.last_saved = last_saved;
    Ok(Some(document))
}

/// Read a domain file, falling back to its backup copy
pub fn read_with_fallback(
    path: &Path,
    spec: &DomainSpec,
) -> Result<Option<(DomainDocument, DocumentSource)>> {
    let primary_err = match read_document(path, spec) {
        Ok(Some(doc)) => return Ok(Some((doc, DocumentSource::Primary))),
        Ok(None) => None,
        Err(e) => Some(e),
    };

    let backup = backup_path(path);
    match read_document(&backup, spec) {
        Ok(Some(doc)) => {
            tracing::warn!(
                "Domain '{}': primary file {} unusable ({}), loaded backup",
                spec.name,
                path.display(),
                primary_err
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "missing".to_string())
            );
            Ok(Some((doc, DocumentSource::Backup)))
        }
        Ok(None) => match primary_err {
            Some(e) => Err(e),
            None => Ok(None),
        },
        Err(backup_err) => match primary_err {
            Some(e) => Err(e),
            None => Err(backup_err),
        },
    }
}

/// Decode a records value (object or array form) for a domain
///
/// Array elements are keyed by the domain's `id_field`; duplicates are
/// collapsed with the domain's resolver. Elements without an identifier are
/// skipped with a warning.
pub fn decode_records(records: Value, spec: &DomainSpec) -> Result<DomainDocument> {
    let mut document = DomainDocument::default();

    match records {
        Value::Null => {}
        Value::Object(map) => {
            for (id, mut record) in map {
                document.normalized += normalize_numeric_fields(&mut record, &spec.numeric_fields);
                document.records.insert(id, record);
            }
        }
        Value::Array(items) => {
            for mut record in items {
                let Some(id) = record_id(&record, &spec.id_field) else {
                    tracing::warn!(
                        "Domain '{}': skipping record without '{}' field",
                        spec.name,
                        spec.id_field
                    );
                    continue;
                };
                document.normalized += normalize_numeric_fields(&mut record, &spec.numeric_fields);

                match document.records.get_mut(&id) {
                    None => {
                        document.records.insert(id, record);
                    }
                    Some(existing) => {
                        document.duplicates += 1;
                        match spec.resolver.resolve(existing, &record) {
                            Resolution::TakeIncoming => {
                                tracing::warn!(
                                    "Domain '{}': duplicate record '{}', keeping later copy",
                                    spec.name,
                                    id
                                );
                                *existing = record;
                            }
                            Resolution::KeepExisting => {
                                tracing::warn!(
                                    "Domain '{}': duplicate record '{}', keeping first copy",
                                    spec.name,
                                    id
                                );
                            }
                        }
                    }
                }
            }
        }
        other => {
            return Err(CairnError::Serialization(format!(
                "domain '{}': records must be an object or array, got {}",
                spec.name,
                json_kind(&other)
            )))
        }
    }

    Ok(document)
}

fn record_id(record: &Value, id_field: &str) -> Option<String> {
    match record.get(id_field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Atomically replace a domain file with `records`
pub fn write_document(path: &Path, records: &Records, saved_at: u64, sync: bool) -> io::Result<()> {
    let checksum = checksum(records).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let body = serde_json::to_vec_pretty(&DocumentOut {
        last_saved: saved_at,
        checksum,
        records,
    })
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = temp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&body)?;
        if sync {
            file.sync_all()?;
        }
    }

    if path.exists() {
        fs::rename(path, backup_path(path))?;
    }
    fs::rename(&tmp, path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::DomainKind;
    use serde_json::json;
    use tempfile::TempDir;

    fn spec() -> DomainSpec {
        DomainSpec::new("ledger", DomainKind::Entries).with_numeric_field("amount")
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        let mut records = Records::new();
        records.insert("a".into(), json!({"amount": 3}));

        write_document(&path, &records, 1234, false).unwrap();
        let doc = read_document(&path, &spec()).unwrap().unwrap();

        assert_eq!(doc.last_saved, Some(1234));
        assert_eq!(doc.records, records);
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let doc = read_document(&dir.path().join("nope.json"), &spec()).unwrap();
        assert!(doc.is_none());
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        fs::write(
            &path,
            r#"{"lastSaved": 1, "checksum": 1, "records": {"a": {"amount": 3}}}"#,
        )
        .unwrap();

        let err = read_document(&path, &spec()).unwrap_err();
        assert!(matches!(err, CairnError::Serialization(_)));
    }

    #[test]
    fn test_second_write_keeps_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        let mut records = Records::new();
        records.insert("a".into(), json!(1));
        write_document(&path, &records, 1, false).unwrap();

        records.insert("b".into(), json!(2));
        write_document(&path, &records, 2, false).unwrap();

        let backup = read_document(&backup_path(&path), &spec()).unwrap().unwrap();
        assert_eq!(backup.records.len(), 1);
        assert_eq!(backup.last_saved, Some(1));
    }

    #[test]
    fn test_torn_primary_falls_back_to_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        let mut records = Records::new();
        records.insert("a".into(), json!({"amount": 1}));
        write_document(&path, &records, 1, false).unwrap();
        write_document(&path, &records, 2, false).unwrap();

        fs::write(&path, b"{\"lastSaved\": 3, \"recor").unwrap();

        let (doc, source) = read_with_fallback(&path, &spec()).unwrap().unwrap();
        assert_eq!(source, DocumentSource::Backup);
        assert_eq!(doc.records, records);
    }

    #[test]
    fn test_array_records_with_duplicates() {
        let records = json!([
            {"id": "a", "amount": "10"},
            {"id": "b", "amount": 2},
            {"id": "a", "amount": "10", "memo": "settled"},
            {"amount": 99},
        ]);

        let doc = decode_records(records, &spec()).unwrap();

        assert_eq!(doc.duplicates, 1);
        assert_eq!(doc.records.len(), 2);
        assert_eq!(doc.records["a"]["memo"], json!("settled"));
        assert_eq!(doc.records["a"]["amount"], json!(10));
        assert_eq!(doc.normalized, 2);
    }

    #[test]
    fn test_scalar_records_rejected() {
        let err = decode_records(json!("oops"), &spec()).unwrap_err();
        assert!(matches!(err, CairnError::Serialization(_)));
    }
}
