//! AFL-style token dictionaries.
//!
//! One token per line, either `name="value"` or a bare `"value"`. Lines
//! starting with `#` and blank lines are skipped. Inside the quotes the
//! escapes `\\`, `\"` and `\xNN` are honoured; everything else is taken
//! verbatim.

use std::{fs, path::Path};

use tracing::info;

use crate::error::{FuzzerError, Result};

pub fn load_dictionary(path: &Path) -> Result<Vec<Vec<u8>>> {
    let content = fs::read_to_string(path).map_err(|err| {
        FuzzerError::init(format!("cannot read dictionary {}: {err}", path.display()))
    })?;

    let mut tokens = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let token = parse_line(line).map_err(|reason| FuzzerError::Dictionary {
            path: path.to_path_buf(),
            line: index + 1,
            reason,
        })?;
        if let Some(token) = token {
            tokens.push(token);
        }
    }

    info!(tokens = tokens.len(), path = %path.display(), "dictionary loaded");
    Ok(tokens)
}

fn parse_line(line: &str) -> std::result::Result<Option<Vec<u8>>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let open = line
        .find('"')
        .ok_or_else(|| "expected a quoted token".to_owned())?;
    let rest = &line[open + 1..];
    if !rest.ends_with('"') {
        return Err("token is missing its closing quote".to_owned());
    }
    let body = &rest[..rest.len() - 1];

    let mut token = Vec::with_capacity(body.len());
    let mut bytes = body.bytes();
    while let Some(byte) = bytes.next() {
        if byte != b'\\' {
            token.push(byte);
            continue;
        }
        match bytes.next() {
            Some(b'\\') => token.push(b'\\'),
            Some(b'"') => token.push(b'"'),
            Some(b'x') => {
                let hi = bytes.next();
                let lo = bytes.next();
                let (Some(hi), Some(lo)) = (hi, lo) else {
                    return Err("truncated \\xNN escape".to_owned());
                };
                let digits = [hi, lo];
                let digits = std::str::from_utf8(&digits).map_err(|_| "bad hex digits")?;
                let value =
                    u8::from_str_radix(digits, 16).map_err(|_| format!("bad hex escape \\x{digits}"))?;
                token.push(value);
            }
            other => {
                return Err(format!(
                    "unsupported escape \\{}",
                    other.map(|b| (b as char).to_string()).unwrap_or_default()
                ));
            }
        }
    }

    if token.is_empty() {
        return Err("empty token".to_owned());
    }
    Ok(Some(token))
}
