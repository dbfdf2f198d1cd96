//! Repository fingerprint: sha-256 over `{relative_path, 0x00, file_bytes,
//! 0x00}` for every fingerprint-input file in sorted order. The same
//! snapshot always hashes to the same value, which keys recipe reuse.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

pub fn compute(repo_dir: &Path, sorted_inputs: &[String]) -> Result<String> {
    let mut hasher = Sha256::new();
    for rel in sorted_inputs {
        let bytes = fs::read(repo_dir.join(rel))
            .with_context(|| format!("failed to read fingerprint input {rel}"))?;
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update(&bytes);
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}
