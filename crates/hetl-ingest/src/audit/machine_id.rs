//! Machine ID generation for audit trail
//!
//! Generates a stable machine identifier without collecting personal information.

use hetl_common::{EtlError, Result};
use std::fs;
use std::path::Path;
use uuid::Uuid;

const MACHINE_ID_FILE: &str = "machine-id";

/// Get or create the machine ID stored in `state_dir`
///
/// Format: `{hostname}-{random-suffix}`. The ID is written to
/// `state_dir/machine-id` and reused by later jobs.
pub fn get_machine_id(state_dir: &Path) -> Result<String> {
    let id_file = state_dir.join(MACHINE_ID_FILE);

    if let Ok(id) = fs::read_to_string(&id_file) {
        let trimmed = id.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let machine_id = generate_machine_id()?;
    fs::create_dir_all(state_dir).map_err(|e| EtlError::write(state_dir, e))?;
    fs::write(&id_file, &machine_id).map_err(|e| EtlError::write(&id_file, e))?;

    Ok(machine_id)
}

fn generate_machine_id() -> Result<String> {
    let hostname = hostname::get()
        .map_err(|e| EtlError::audit(format!("Failed to get hostname: {e}")))?
        .to_string_lossy()
        .to_string();

    let suffix = &Uuid::new_v4().simple().to_string()[..8];
    Ok(format!("{}-{suffix}", sanitize_hostname(&hostname)))
}

fn sanitize_hostname(hostname: &str) -> String {
    hostname
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .take(32)
        .collect()
}
