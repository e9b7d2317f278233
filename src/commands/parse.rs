use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::info;

use adsb_bridge::sbs::{describe_fields, parse_sbs_line};

#[derive(Debug, Default, PartialEq, Eq)]
struct ParseTally {
    parsed: u64,
    rejected: u64,
}

pub fn handle_parse(input: Option<&Path>, fields: bool) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let tally = match input {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
            parse_lines(BufReader::new(file), &mut out, fields)?
        }
        None => parse_lines(std::io::stdin().lock(), &mut out, fields)?,
    };

    if !fields {
        info!("{} records parsed, {} lines rejected", tally.parsed, tally.rejected);
    }
    Ok(())
}

/// One JSON object per line: the record, or the reason it was rejected
fn parse_lines<R: BufRead, W: Write>(reader: R, out: &mut W, fields: bool) -> Result<ParseTally> {
    let mut tally = ParseTally::default();

    for (index, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }

        if fields {
            writeln!(out, "line {}:\n{}", index + 1, describe_fields(&line))?;
            continue;
        }

        match parse_sbs_line(&line) {
            Ok(record) => {
                tally.parsed += 1;
                writeln!(out, "{}", serde_json::to_string(&record)?)?;
            }
            Err(rejection) => {
                tally.rejected += 1;
                let value = serde_json::json!({
                    "line": index + 1,
                    "rejected": rejection.to_string(),
                });
                writeln!(out, "{}", value)?;
            }
        }
    }

    Ok(tally)
}
