//! `hetl layout` command implementation

use crate::commands::run::apply_record_struct;
use crate::config::JobConfig;
use crate::LayoutArgs;
use colored::Colorize;
use hetl_common::Result;

/// Print the layout a job with these options would use
pub async fn run(args: &LayoutArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => JobConfig::from_toml_file(path)?,
        None => JobConfig::default(),
    };
    apply_record_struct(&mut config, args.record_struct.as_deref(), &args.field_names);
    let layout = config.layout.resolve()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&layout)?);
        return Ok(());
    }

    println!("{}", "Record layout:".cyan().bold());
    print!("{layout}");
    if let Ok(format) = layout.to_format() {
        println!("  format: {format}");
    }
    Ok(())
}
