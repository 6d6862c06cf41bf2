//! `hetl audit` command implementation

use crate::audit::verify_chain;
use crate::AuditCommand;
use colored::Colorize;
use hetl_common::{EtlError, Result};
use std::path::Path;

/// Execute audit command
pub async fn run(command: &AuditCommand) -> Result<()> {
    match command {
        AuditCommand::Verify { log } => verify(log).await,
    }
}

async fn verify(log: &Path) -> Result<()> {
    if !log.exists() {
        return Err(EtlError::audit(format!(
            "No audit trail found at '{}'. Run 'hetl run' first.",
            log.display()
        )));
    }

    println!("{} Verifying audit trail integrity...", "→".cyan());
    let report = verify_chain(log)?;

    if report.valid {
        println!("{} Audit trail verified successfully", "✓".green().bold());
        println!("  {} {} events, hash chain is intact", "→".cyan(), report.events);
        Ok(())
    } else {
        println!("{} Audit trail verification FAILED", "✗".red().bold());
        let line = report.first_invalid_line.unwrap_or(0);
        let reason = report.reason.unwrap_or_default();
        println!("  {} Line {line}: {reason}", "→".yellow());
        Err(EtlError::audit(format!(
            "audit chain '{}' is broken at line {line}: {reason}",
            log.display()
        )))
    }
}
