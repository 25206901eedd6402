//! Server trust store.
//!
//! Line-oriented `host:port=fp_hex[,tls=1]`, `#`/`;` comments (at line
//! start or after whitespace), keys sorted on rewrite. The text itself is
//! platform-wrapped on disk (`MI_TRUST1` / `mi_e2ee_trust_store_v1`); a
//! legacy plaintext file is accepted once and re-wrapped on the next store.

use std::path::Path;

use crate::error::ClientError;
use crate::store::{fs, secure_store};

pub const TRUST_MAGIC: &str = "MI_TRUST1";
pub const TRUST_ENTROPY: &str = "mi_e2ee_trust_store_v1";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustEntry {
    /// Lowercase hex SHA-256 of the server leaf certificate DER.
    pub fingerprint: String,
    /// The endpoint must be reached over TLS; plaintext is refused.
    pub tls_required: bool,
}

pub fn is_hex64(v: &str) -> bool {
    v.len() == 64 && v.chars().all(|c| c.is_ascii_hexdigit())
}

fn strip_inline_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if (b == b'#' || b == b';') && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return line[..i].trim();
        }
    }
    line
}

fn parse_value(value: &str) -> Option<TrustEntry> {
    let mut parts = value.split(',').map(str::trim);
    let fp = parts.next()?.to_ascii_lowercase();
    if !is_hex64(&fp) {
        return None;
    }
    let mut entry = TrustEntry {
        fingerprint: fp,
        tls_required: false,
    };
    for token in parts {
        match token.to_ascii_lowercase().as_str() {
            "tls=1" | "tls=true" | "tls=on" | "tls_required=1" | "tls_required=true" => {
                entry.tls_required = true;
            }
            _ => {}
        }
    }
    Some(entry)
}

fn build_value(entry: &TrustEntry) -> String {
    if entry.tls_required {
        format!("{},tls=1", entry.fingerprint)
    } else {
        entry.fingerprint.clone()
    }
}

fn parse_lines(text: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in text.lines() {
        let line = strip_inline_comment(raw.trim());
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        out.push((key.to_string(), value.to_string()));
    }
    out
}

fn store_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn load_text(username: &str, path: &Path) -> Result<Option<String>, ClientError> {
    if !path.exists() {
        return Ok(None);
    }
    fs::check_not_world_writable(path)?;
    let bytes = std::fs::read(path).map_err(|e| ClientError::Resource(format!("read trust store: {e}")))?;
    if bytes.is_empty() {
        return Ok(None);
    }
    let (plain, _was_wrapped) =
        secure_store::maybe_unprotect(store_dir(path), username, TRUST_MAGIC, TRUST_ENTROPY, &bytes)?;
    String::from_utf8(plain.to_vec())
        .map(Some)
        .map_err(|_| ClientError::Resource("trust store not UTF-8".into()))
}

fn store_text(username: &str, path: &Path, text: &str) -> Result<(), ClientError> {
    let wrapped = secure_store::protect(
        store_dir(path),
        username,
        TRUST_MAGIC,
        TRUST_ENTROPY,
        text.as_bytes(),
    )?;
    fs::atomic_write(path, &wrapped)?;
    fs::restrict_permissions(path)
}

/// Look up the pinned entry for `host:port`.
pub fn load_entry(
    username: &str,
    path: &Path,
    endpoint: &str,
) -> Result<Option<TrustEntry>, ClientError> {
    let Some(text) = load_text(username, path)? else {
        return Ok(None);
    };
    for (key, value) in parse_lines(&text) {
        if key == endpoint {
            return Ok(parse_value(&value));
        }
    }
    Ok(None)
}

/// Insert or replace the entry for `endpoint`; other entries survive and
/// the file is rewritten sorted.
pub fn store_entry(
    username: &str,
    path: &Path,
    endpoint: &str,
    entry: &TrustEntry,
) -> Result<(), ClientError> {
    if endpoint.is_empty() || !is_hex64(&entry.fingerprint) {
        return Err(ClientError::InvalidInput("invalid trust entry".into()));
    }
    let mut entries: Vec<(String, String)> = match load_text(username, path)? {
        Some(text) => parse_lines(&text)
            .into_iter()
            .filter(|(key, _)| key != endpoint)
            .collect(),
        None => Vec::new(),
    };
    entries.push((endpoint.to_string(), build_value(entry)));
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut text = String::new();
    text.push_str("# mi_e2ee client trust store\n");
    text.push_str("# format: host:port=sha256(cert_der)_hex[,tls=1]\n");
    for (key, value) in entries {
        text.push_str(&key);
        text.push('=');
        text.push_str(&value);
        text.push('\n');
    }
    store_text(username, path, &text)
}
