//! Peer file loading and parsing.
//!
//! ```text
//! CPU1, 1, 1, 66, 0, 127.0.0.1, 2234;
//! CPU2, 2, 1, 66, 0, 127.0.0.1, 2235;
//! !
//! ```
//!
//! Fields are comma separated and whitespace is insignificant. `;` closes
//! an entry and `!` ends the file. The first five fields are common to every
//! link (name, processor id, protocol id, spacecraft id, QoS); the rest belong
//! to the transport named by the protocol id.

use crate::events::EventId;
use crate::peer::{InterfaceIdentity, PeerName, MAX_PEERNAME_LENGTH};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub const COMMON_FIELDS: usize = 5;

#[derive(Debug, Error)]
pub enum PeerFileError {
    #[error("cannot read peer file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no peer file found (tried {0:?})")]
    NotFound(Vec<PathBuf>),
    #[error("entry {entry}: expected at least {COMMON_FIELDS} fields, found {found}")]
    FieldCount { entry: usize, found: usize },
    #[error("entry {entry}: invalid {field} {value:?}")]
    BadField { entry: usize, field: &'static str, value: String },
    #[error("entry {entry}: name {name:?} must be 1 to {max} characters")]
    BadName { entry: usize, name: String, max: usize },
}

/// One parsed entry: the common identity plus the transport's own fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerFileEntry {
    /// 1-based position in the file.
    pub entry: usize,
    pub identity: InterfaceIdentity,
    pub protocol_fields: Vec<String>,
}

impl PeerFileEntry {
    pub fn protocol_fields(&self) -> Vec<&str> {
        self.protocol_fields.iter().map(String::as_str).collect()
    }
}

#[derive(Debug, Default)]
pub struct ParsedPeerFile {
    pub entries: Vec<PeerFileEntry>,
    /// Entries that were skipped, with the reason.
    pub rejected: Vec<PeerFileError>,
}

/// Splits the file into raw entries of trimmed fields.
fn split_entries(text: &str) -> Vec<Vec<String>> {
    let mut entries = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut field = String::new();

    for c in text.chars() {
        match c {
            '!' => break,
            ';' => {
                fields.push(core::mem::take(&mut field));
                entries.push(core::mem::take(&mut fields));
            }
            ',' => fields.push(core::mem::take(&mut field)),
            c if c.is_whitespace() => {}
            c => field.push(c),
        }
    }
    // An unterminated last entry still counts.
    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        entries.push(fields);
    }
    entries
}

fn parse_num<T: core::str::FromStr>(entry: usize, field: &'static str, value: &str) -> Result<T, PeerFileError> {
    value.parse().map_err(|_| PeerFileError::BadField { entry, field, value: value.to_string() })
}

fn parse_entry(entry: usize, fields: Vec<String>) -> Result<PeerFileEntry, PeerFileError> {
    if fields.len() < COMMON_FIELDS {
        return Err(PeerFileError::FieldCount { entry, found: fields.len() });
    }
    let bad_name = || PeerFileError::BadName { entry, name: fields[0].clone(), max: MAX_PEERNAME_LENGTH };
    if fields[0].is_empty() {
        return Err(bad_name());
    }
    let name = PeerName::from(&fields[0]).map_err(|_| bad_name())?;
    let identity = InterfaceIdentity {
        name,
        processor_id: parse_num(entry, "processor_id", &fields[1])?,
        protocol_id: parse_num(entry, "protocol_id", &fields[2])?,
        spacecraft_id: parse_num(entry, "spacecraft_id", &fields[3])?,
        qos: parse_num(entry, "qos", &fields[4])?,
    };
    Ok(PeerFileEntry { entry, identity, protocol_fields: fields[COMMON_FIELDS..].to_vec() })
}

/// Parses peer file text. Bad entries are reported and skipped.
pub fn parse(text: &str) -> ParsedPeerFile {
    let mut parsed = ParsedPeerFile::default();
    for (idx, fields) in split_entries(text).into_iter().enumerate() {
        if fields.iter().all(String::is_empty) {
            continue;
        }
        match parse_entry(idx + 1, fields) {
            Ok(entry) => parsed.entries.push(entry),
            Err(e) => {
                warn!(eid = %EventId::File, "skipping peer file entry: {e}");
                parsed.rejected.push(e);
            }
        }
    }
    parsed
}

/// Reads the first peer file that opens, in the order given.
pub fn load(candidates: &[&Path]) -> Result<(PathBuf, ParsedPeerFile), PeerFileError> {
    for path in candidates {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                info!(eid = %EventId::File, path = %path.display(), "opened peer data file");
                return Ok((path.to_path_buf(), parse(&text)));
            }
            Err(e) => {
                warn!(eid = %EventId::File, path = %path.display(), "failed to open peer file: {e}");
            }
        }
    }
    Err(PeerFileError::NotFound(candidates.iter().map(|p| p.to_path_buf()).collect()))
}

/// Reads and parses one specific file.
pub fn load_path(path: &Path) -> Result<ParsedPeerFile, PeerFileError> {
    let text = std::fs::read_to_string(path).map_err(|source| PeerFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse(&text))
}
