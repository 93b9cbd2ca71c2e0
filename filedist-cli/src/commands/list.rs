//! `filedist list` - show artifacts in the local store.

use std::fs;
use std::path::Path;

use filedist::ArtifactStore;
use serde_json::json;

use super::CommandError;

pub fn run(dir: &Path, json: bool) -> Result<(), CommandError> {
    let store = ArtifactStore::open(dir)?;
    let fingerprints = store.fingerprints()?;

    let mut rows = Vec::new();
    for fingerprint in fingerprints {
        match store.lookup(&fingerprint) {
            Ok(Some(path)) => {
                let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                rows.push((fingerprint.to_string(), name, size, None));
            }
            Ok(None) => {}
            Err(error) => {
                rows.push((fingerprint.to_string(), String::new(), 0, Some(error.to_string())));
            }
        }
    }

    if json {
        let entries: Vec<_> = rows
            .iter()
            .map(|(fingerprint, name, size, error)| match error {
                Some(error) => json!({ "fingerprint": fingerprint, "error": error }),
                None => json!({ "fingerprint": fingerprint, "file": name, "size": size }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("store at {} is empty", dir.display());
        return Ok(());
    }
    for (fingerprint, name, size, error) in rows {
        match error {
            Some(error) => println!("{fingerprint:<40} CORRUPT: {error}"),
            None => println!("{fingerprint:<40} {name:<30} {size:>12}"),
        }
    }
    Ok(())
}
