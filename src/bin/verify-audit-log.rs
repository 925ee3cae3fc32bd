use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{error, info};

use logbook_verification::audit::logger::load_records;
use logbook_verification::audit::{verify_audit_log_file, AuditRecord};

fn main() -> Result<()> {
    let matches = Command::new("verify-audit-log")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Verify logbook verification audit log integrity")
        .arg(
            Arg::new("log-path")
                .short('l')
                .long("log-path")
                .value_name("PATH")
                .help("Path to audit log file")
                .required(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Print a summary of the log"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let log_path = matches
        .get_one::<String>("log-path")
        .ok_or_else(|| anyhow!("--log-path is required"))?;
    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");

    let level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let path = Path::new(log_path);
    let report = verify_audit_log_file(path);

    if !report.is_valid {
        error!(
            "Audit log verification failed: {}",
            report.error_message.as_deref().unwrap_or("unknown error")
        );
        std::process::exit(1);
    }

    info!("Verified {} records", report.record_count);

    if verbose {
        print_summary(&load_records(path)?);
    }

    if !quiet {
        println!(
            "✓ Audit log verified: {} records, head {}",
            report.record_count,
            report.head_hash.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}

fn print_summary(records: &[AuditRecord]) {
    let (Some(first), Some(last)) = (records.first(), records.last()) else {
        return;
    };

    println!("\nAudit Log Summary:");
    println!("  Total records: {}", records.len());
    println!("  First record: {}", first.timestamp);
    println!("  Last record: {}", last.timestamp);

    let mut actions: BTreeMap<&str, usize> = BTreeMap::new();
    for record in records {
        *actions.entry(record.action.as_str()).or_insert(0) += 1;
    }

    println!("\nAction distribution:");
    for (action, count) in actions {
        println!("  {}: {}", action, count);
    }
}
