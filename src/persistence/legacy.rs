//! Legacy combined-file migration
//!
//! Older deployments kept every domain in one document:
//! ```text
//! { "lastSaved": 1700000000000, "<domain>": { ... } | [ ... ], ... }
//! ```
//! Migration splits it into per-domain files. A domain is only written when
//! neither its file nor its backup exists, so running the migration again
//! after a restart is a no-op. The legacy file itself is never modified.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{CairnError, Result};

use super::document::{backup_path, decode_records, write_document};
use super::domain::DomainSpec;

/// What a migration run did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Domains written from the legacy file
    pub migrated: Vec<String>,

    /// Records written across all migrated domains
    pub records: usize,

    /// Duplicate records collapsed while splitting
    pub duplicates: usize,
}

impl MigrationReport {
    pub fn is_empty(&self) -> bool {
        self.migrated.is_empty()
    }
}

/// Split the legacy file into per-domain files where they are missing
pub fn migrate_legacy<F>(
    legacy_path: &Path,
    domains: &[DomainSpec],
    domain_path: F,
    saved_at: u64,
    sync: bool,
) -> Result<MigrationReport>
where
    F: Fn(&DomainSpec) -> PathBuf,
{
    let mut report = MigrationReport::default();

    let pending: Vec<&DomainSpec> = domains
        .iter()
        .filter(|spec| {
            let path = domain_path(spec);
            !path.exists() && !backup_path(&path).exists()
        })
        .collect();
    if pending.is_empty() {
        return Ok(report);
    }

    let bytes = match fs::read(legacy_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(CairnError::Io(e)),
    };

    let root: Value = serde_json::from_slice(&bytes)?;
    let Value::Object(mut sections) = root else {
        return Err(CairnError::Serialization(format!(
            "{}: legacy document root is not an object",
            legacy_path.display()
        )));
    };

    tracing::info!(
        "Migrating legacy file {} into {} domain file(s)",
        legacy_path.display(),
        pending.len()
    );

    for spec in pending {
        let Some(section) = sections.remove(spec.legacy_section()) else {
            tracing::debug!("Legacy file has no section for domain '{}'", spec.name);
            continue;
        };

        let document = decode_records(section, spec)?;
        let path = domain_path(spec);
        write_document(&path, &document.records, saved_at, sync)
            .map_err(|e| CairnError::persistence(&spec.name, e))?;

        tracing::debug!(
            "Migrated domain '{}': {} records ({} duplicates collapsed)",
            spec.name,
            document.records.len(),
            document.duplicates
        );

        report.records += document.records.len();
        report.duplicates += document.duplicates;
        report.migrated.push(spec.name.clone());
    }

    Ok(report)
}
