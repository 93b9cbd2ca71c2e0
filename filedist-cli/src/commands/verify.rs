//! `filedist verify` - check the store for corrupt artifacts.

use std::path::Path;

use filedist::ArtifactStore;

use super::CommandError;

pub fn run(dir: &Path) -> Result<(), CommandError> {
    let store = ArtifactStore::open(dir)?;
    let fingerprints = store.fingerprints()?;
    let total = fingerprints.len();

    let mut corrupt = 0usize;
    for fingerprint in fingerprints {
        match store.lookup(&fingerprint) {
            Ok(Some(_)) => {}
            // Removed between listing and lookup; nothing to report.
            Ok(None) => {}
            Err(error) => {
                corrupt += 1;
                eprintln!("{fingerprint}: {error}");
            }
        }
    }

    if corrupt > 0 {
        return Err(format!("{corrupt} of {total} artifact(s) corrupt").into());
    }
    println!("store is clean ({total} artifact(s))");
    Ok(())
}
