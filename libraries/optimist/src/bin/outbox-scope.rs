use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use optimist::store::file::{
    LogOp, OUTBOX_LOG_VERSION, live_records, outbox_log_version, parse_outbox_log,
};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() != 2 {
        eprintln!("Usage: {} <path-to-outbox-log>", args[0]);
        eprintln!("\nExample: {} ./store/outbox.log", args[0]);
        std::process::exit(1);
    }

    let file_path = PathBuf::from(&args[1]);

    if !file_path.exists() {
        eprintln!("Error: File '{}' does not exist", file_path.display());
        std::process::exit(1);
    }

    let mut file = match File::open(&file_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", file_path.display(), e);
            std::process::exit(1);
        }
    };

    let mut bytes = Vec::new();
    if let Err(e) = file.read_to_end(&mut bytes) {
        eprintln!("Error reading file '{}': {}", file_path.display(), e);
        std::process::exit(1);
    }

    println!("OutboxScope - Pending Mutation Log Analyzer");
    println!("===========================================");
    println!("File: {}", file_path.display());
    println!(
        "Size: {} bytes ({:.2} KB)",
        bytes.len(),
        bytes.len() as f64 / 1024.0
    );

    match outbox_log_version(&bytes) {
        Some(version) if version == OUTBOX_LOG_VERSION => println!("Version: {version}"),
        Some(version) => println!("Version: {version} (unsupported, expected {OUTBOX_LOG_VERSION})"),
        None => println!("Version: none (missing or invalid header)"),
    }
    println!();

    let entries = parse_outbox_log(&bytes);

    println!("Log Entries:");
    println!("------------");
    if entries.is_empty() {
        println!("  No entries found");
    }

    let mut seen = BTreeSet::new();
    let mut pending = BTreeSet::new();
    let mut anomalies = Vec::new();

    for (i, entry) in entries.iter().enumerate() {
        let id = &entry.client_mutation_id;
        match (entry.op, &entry.record) {
            (LogOp::Put, Some(record)) => {
                println!("  #{i} PUT    {id}");
                println!("      Plan: {}", record.plan_key);
                println!("      Operation: {}", record.operation.name);
                if let Some(entity_type) = &record.entity_type {
                    println!("      Entity type: {entity_type}");
                }
                println!("      Created: {}", record.created_at);

                let variables = serde_json::to_string(&record.variables)
                    .unwrap_or_else(|_| "Invalid JSON".to_string());
                println!("      Variables: {}", preview(&variables, 100));

                if !seen.insert(id.clone()) {
                    anomalies.push(format!("#{i}: {id} was put again after an earlier put"));
                }
                pending.insert(id.clone());
            }
            (LogOp::Put, None) => {
                println!("  #{i} PUT    {id} (no payload)");
                anomalies.push(format!("#{i}: put for {id} has no record"));
            }
            (LogOp::Delete, _) => {
                println!("  #{i} DELETE {id}");
                if !pending.remove(id) {
                    anomalies.push(format!("#{i}: delete for {id}, which was not pending"));
                }
            }
        }
    }

    println!();
    println!("Live Pending Mutations:");
    println!("-----------------------");
    let live = live_records(entries.clone());
    if live.is_empty() {
        println!("  None");
    }
    for (id, record) in &live {
        println!("  {id} ({}, created {})", record.plan_key, record.created_at);
    }

    println!();
    println!("Summary:");
    println!("--------");
    let puts = entries.iter().filter(|e| e.op == LogOp::Put).count();
    println!("  Entries: {} ({puts} puts, {} deletes)", entries.len(), entries.len() - puts);
    println!("  Live: {}", live.len());

    if anomalies.is_empty() {
        println!("  ✅ No anomalies found");
    } else {
        for anomaly in &anomalies {
            println!("  ⚠️  {anomaly}");
        }
    }
}

fn preview(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
