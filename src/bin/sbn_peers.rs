use clap::{App, Arg};
use colored::*;
use sbn::peer_file::{self, PeerFileEntry};
use sbn::transport::{protocol_name, PROTOCOL_IPV4};
use std::path::Path;
use std::process;

fn main() {
    let matches = App::new("sbn-peers")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("Validates an SBN peer file and shows which entries are hosts and which are peers")
        .arg(
            Arg::with_name("FILE")
                .help("Peer file to check")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("cpu-id")
                .long("cpu-id")
                .value_name("ID")
                .help("Processor id of the local CPU")
                .takes_value(true)
                .default_value("1")
                .validator(|v| match v.parse::<u32>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("CPU id must be a valid number".into()),
                }),
        )
        .arg(
            Arg::with_name("cpu-name")
                .long("cpu-name")
                .value_name("NAME")
                .help("Name of the local CPU")
                .takes_value(true)
                .default_value("CPU1"),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table"),
        )
        .get_matches();

    let path = matches.value_of("FILE").unwrap_or_default();
    let cpu_id: u32 = matches.value_of("cpu-id").and_then(|v| v.parse().ok()).unwrap_or(1);
    let cpu_name = matches.value_of("cpu-name").unwrap_or("CPU1");

    let parsed = match peer_file::load_path(Path::new(path)) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            process::exit(2);
        }
    };

    if matches.value_of("format") == Some("json") {
        let report = serde_json::json!({
            "entries": parsed.entries,
            "rejected": parsed.rejected.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("{} {}", "error:".red().bold(), e);
                process::exit(2);
            }
        }
    } else {
        print_table(&parsed.entries, cpu_id, cpu_name);
        for e in &parsed.rejected {
            println!("{} {}", "rejected:".red().bold(), e);
        }
    }

    if !parsed.rejected.is_empty() {
        process::exit(1);
    }
}

/// Mirrors the classification the transports make at startup: IPv4 by
/// processor id, everything else by name.
fn is_host(entry: &PeerFileEntry, cpu_id: u32, cpu_name: &str) -> bool {
    if entry.identity.protocol_id == PROTOCOL_IPV4 {
        entry.identity.processor_id == cpu_id
    } else {
        entry.identity.name.as_str() == cpu_name
    }
}

fn print_table(entries: &[PeerFileEntry], cpu_id: u32, cpu_name: &str) {
    println!(
        "{}",
        format!(
            "{:<5} {:<8} {:>6} {:<10} {:>6} {:>4} {:<5} {}",
            "ENTRY", "NAME", "CPU", "PROTOCOL", "SCID", "QOS", "ROLE", "FIELDS"
        )
        .bright_blue()
        .bold()
    );
    for entry in entries {
        let id = &entry.identity;
        let protocol = match protocol_name(id.protocol_id) {
            Some(name) => name.normal(),
            None => format!("?{}", id.protocol_id).red(),
        };
        let role = if is_host(entry, cpu_id, cpu_name) { "host".bright_green() } else { "peer".bright_cyan() };
        println!(
            "{:<5} {:<8} {:>6} {:<10} {:>6} {:>4} {:<5} {}",
            entry.entry,
            id.name.as_str(),
            id.processor_id,
            protocol,
            id.spacecraft_id,
            id.qos,
            role,
            entry.protocol_fields.join(", ")
        );
    }
}
