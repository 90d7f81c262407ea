//! Textual SID cache snapshots.
//!
//! The snapshot is a hierarchical text format, one `<ServerDef>` block per
//! record:
//!
//! ```text
//! <ServerDefines>
//!     <ServerDef>
//!         Alias io-node-3
//!         SID 00000000-0000-0000-0000-000000000001
//!         Address tcp://a:3334(17)
//!         Attributes load=3 latency=20
//!         Type META(9) DATA(9)
//!     </ServerDef>
//! </ServerDefines>
//! ```
//!
//! Unknown role names are load errors. Unknown attribute names are skipped
//! with a debug log, so snapshots written by newer servers stay loadable.

use std::io::{BufRead, Write};

use log::debug;

use crate::error::{EngineError, Result};
use crate::sid::record::{attr_slot, Sid, SidRecord, SidTypeBinding, SID_ATTR_NAMES};

const OPEN_DEFINES: &str = "<ServerDefines>";
const CLOSE_DEFINES: &str = "</ServerDefines>";
const OPEN_DEF: &str = "<ServerDef>";
const CLOSE_DEF: &str = "</ServerDef>";

/// Write records as a snapshot.
pub(crate) fn write_snapshot<'a, W, I>(writer: &mut W, records: I) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = (&'a Sid, &'a SidRecord)>,
{
    writeln!(writer, "{OPEN_DEFINES}")?;
    for (sid, record) in records {
        writeln!(writer, "\t{OPEN_DEF}")?;
        if let Some(alias) = &record.alias {
            writeln!(writer, "\t\tAlias {alias}")?;
        }
        writeln!(writer, "\t\tSID {sid}")?;
        writeln!(writer, "\t\tAddress {}({})", record.url, record.bmi_addr)?;
        let attrs: Vec<String> = SID_ATTR_NAMES
            .iter()
            .zip(record.attrs.iter())
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        writeln!(writer, "\t\tAttributes {}", attrs.join(" "))?;
        if !record.types.is_empty() {
            let types: Vec<String> = record.types.iter().map(|t| t.to_string()).collect();
            writeln!(writer, "\t\tType {}", types.join(" "))?;
        }
        writeln!(writer, "\t{CLOSE_DEF}")?;
    }
    writeln!(writer, "{CLOSE_DEFINES}")?;
    Ok(())
}

/// Parse a snapshot into records, preserving file order.
pub(crate) fn read_snapshot<R: BufRead>(reader: R) -> Result<Vec<(Sid, SidRecord)>> {
    let mut lines = reader.lines();
    let mut records = Vec::new();

    let first = next_meaningful(&mut lines)?
        .ok_or_else(|| EngineError::InvalidArgument("empty SID snapshot".into()))?;
    if first != OPEN_DEFINES {
        return Err(EngineError::InvalidArgument(format!(
            "SID snapshot must start with {OPEN_DEFINES}, found {first:?}"
        )));
    }

    loop {
        let line = next_meaningful(&mut lines)?.ok_or_else(|| {
            EngineError::InvalidArgument(format!("SID snapshot ended before {CLOSE_DEFINES}"))
        })?;
        match line.as_str() {
            CLOSE_DEFINES => return Ok(records),
            OPEN_DEF => records.push(parse_record(&mut lines)?),
            other => {
                return Err(EngineError::InvalidArgument(format!(
                    "unexpected snapshot line {other:?}"
                )))
            }
        }
    }
}

fn next_meaningful<I>(lines: &mut I) -> Result<Option<String>>
where
    I: Iterator<Item = std::io::Result<String>>,
{
    for line in lines {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Ok(Some(trimmed.to_owned()));
        }
    }
    Ok(None)
}

fn parse_record<I>(lines: &mut I) -> Result<(Sid, SidRecord)>
where
    I: Iterator<Item = std::io::Result<String>>,
{
    let mut sid: Option<Sid> = None;
    let mut record = SidRecord::new("");

    loop {
        let line = next_meaningful(lines)?.ok_or_else(|| {
            EngineError::InvalidArgument(format!("SID snapshot ended before {CLOSE_DEF}"))
        })?;
        if line == CLOSE_DEF {
            let sid = sid.ok_or_else(|| {
                EngineError::InvalidArgument("ServerDef block without a SID line".into())
            })?;
            if record.url.is_empty() {
                return Err(EngineError::InvalidArgument(format!(
                    "ServerDef {sid} has no Address line"
                )));
            }
            return Ok((sid, record));
        }
        let (tag, rest) = match line.split_once(char::is_whitespace) {
            Some((tag, rest)) => (tag, rest.trim()),
            None => (line.as_str(), ""),
        };
        match tag {
            "Alias" => record.alias = Some(rest.to_owned()),
            "SID" => sid = Some(rest.parse()?),
            "Address" => {
                let (url, bmi) = parse_address(rest)?;
                record.url = url;
                record.bmi_addr = bmi;
            }
            "Attributes" => parse_attributes(rest, &mut record)?,
            "Type" => {
                for word in rest.split_whitespace() {
                    record.types.push(parse_type(word)?);
                }
            }
            other => {
                return Err(EngineError::InvalidArgument(format!(
                    "unknown ServerDef field {other:?}"
                )))
            }
        }
    }
}

/// `url(bmi_int)`; the bmi handle suffix is optional.
fn parse_address(text: &str) -> Result<(String, u64)> {
    if let Some(open) = text.rfind('(') {
        let close = text.rfind(')').ok_or_else(|| {
            EngineError::InvalidArgument(format!("unbalanced address {text:?}"))
        })?;
        if close < open {
            return Err(EngineError::InvalidArgument(format!(
                "unbalanced address {text:?}"
            )));
        }
        let bmi = text[open + 1..close].parse::<u64>().map_err(|_| {
            EngineError::InvalidArgument(format!("bad bmi handle in address {text:?}"))
        })?;
        Ok((text[..open].to_owned(), bmi))
    } else {
        Ok((text.to_owned(), 0))
    }
}

fn parse_attributes(text: &str, record: &mut SidRecord) -> Result<()> {
    for word in text.split_whitespace() {
        let (name, value) = word.split_once('=').ok_or_else(|| {
            EngineError::InvalidArgument(format!("attribute {word:?} is not name=value"))
        })?;
        let value = value.parse::<i32>().map_err(|_| {
            EngineError::InvalidArgument(format!("attribute {word:?} has a non-integer value"))
        })?;
        match attr_slot(name) {
            Some(slot) => record.attrs[slot] = value,
            None => debug!("ignoring unknown SID attribute {name:?}"),
        }
    }
    Ok(())
}

/// `ROLE(fs_id)`, or a bare `ROLE` meaning every filesystem.
fn parse_type(word: &str) -> Result<SidTypeBinding> {
    match word.split_once('(') {
        Some((role, rest)) => {
            let fs_id = rest.strip_suffix(')').ok_or_else(|| {
                EngineError::InvalidArgument(format!("unbalanced type binding {word:?}"))
            })?;
            let fs_id = fs_id.trim().parse::<u32>().map_err(|_| {
                EngineError::InvalidArgument(format!("bad fs_id in type binding {word:?}"))
            })?;
            Ok(SidTypeBinding::new(role.parse()?, fs_id))
        }
        None => Ok(SidTypeBinding::new(word.parse()?, 0)),
    }
}
