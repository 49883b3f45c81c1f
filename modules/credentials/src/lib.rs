//! Credential material: telling keys from passwords, and bulk import.

use audit_core::Credential;
use regex::Regex;
use serde::Deserialize;
use std::io::{BufRead, Read};
use std::sync::OnceLock;

pub const DEFAULT_SCAN_INTERVAL: i64 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Password,
    /// PEM-armoured private key, tried with public-key auth only.
    PrivateKey,
}

fn pem_private_key() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)^\s*-----BEGIN (?:[A-Z0-9]+ )*PRIVATE KEY-----.+-----END (?:[A-Z0-9]+ )*PRIVATE KEY-----\s*$")
            .expect("static regex")
    })
}

pub fn secret_kind(secret: &str) -> SecretKind {
    if pem_private_key().is_match(secret) { SecretKind::PrivateKey } else { SecretKind::Password }
}

/// An input row that could not be turned into a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct Imported {
    pub credentials: Vec<Credential>,
    pub rejected: Vec<Rejected>,
}

/// Read `user<TAB>password[<TAB>interval]` rows.
///
/// Rows with the wrong field count or a non-numeric interval are rejected
/// individually; the rest of the input is still imported.
pub fn import_tsv<R: Read>(input: R, default_interval: i64) -> Imported {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_reader(input);

    let mut out = Imported::default();
    for (idx, rec) in rdr.records().enumerate() {
        let line = idx + 1;
        let rec = match rec {
            Ok(r) => r,
            Err(e) => {
                out.rejected.push(Rejected { line, reason: e.to_string() });
                continue;
            }
        };
        let interval = match rec.len() {
            2 => default_interval,
            3 => match rec[2].trim().parse::<i64>() {
                Ok(n) if n >= 0 => n,
                _ => {
                    out.rejected.push(Rejected { line, reason: format!("invalid scan interval {:?}", &rec[2]) });
                    continue;
                }
            },
            n => {
                out.rejected.push(Rejected { line, reason: format!("expected 2 or 3 fields, got {n}") });
                continue;
            }
        };
        out.credentials.push(Credential::new(&rec[0], &rec[1], interval));
    }
    out
}

#[derive(Deserialize)]
struct CredentialLine {
    user: String,
    password: String,
    scan_interval: Option<i64>,
}

/// Read one JSON object per line, the format `credential list` writes.
pub fn import_json_lines<R: BufRead>(input: R, default_interval: i64) -> Imported {
    let mut out = Imported::default();
    for (idx, line) in input.lines().enumerate() {
        let line_no = idx + 1;
        let text = match line {
            Ok(t) => t,
            Err(e) => {
                out.rejected.push(Rejected { line: line_no, reason: e.to_string() });
                break;
            }
        };
        if text.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CredentialLine>(&text) {
            Ok(c) => out.credentials.push(Credential::new(
                c.user,
                c.password,
                c.scan_interval.unwrap_or(default_interval),
            )),
            Err(e) => out.rejected.push(Rejected { line: line_no, reason: e.to_string() }),
        }
    }
    out
}
