use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Strip path separators and shell-hostile characters from an uploaded
/// filename before it is staged on disk or quoted into a guest command.
pub fn sanitize_filename(filename: &str) -> String {
    if filename.is_empty() {
        return "unknown".to_string();
    }
    let mut cleaned: String = filename
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\'' => '_',
            c => c,
        })
        .collect();
    while cleaned.contains("..") {
        cleaned = cleaned.replace("..", ".");
    }
    if cleaned.len() > 255 {
        cleaned.truncate(255);
    }
    cleaned
}

const UTC_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
];

/// Rewrite a vendor timestamp string to local display form. Storage keeps the
/// vendor string verbatim; this runs only when the HTTP result handler
/// serializes a response, so re-serialization never double-converts.
/// Unparseable strings pass through unchanged.
pub fn to_local_time(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    for fmt in UTC_TIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            let utc: DateTime<Utc> = Utc.from_utc_datetime(&naive);
            return utc.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string();
        }
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_bytes() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sanitizes_traversal_and_separators() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "._._etc_passwd");
        assert_eq!(sanitize_filename("mal'ware?.exe"), "mal_ware_.exe");
        assert_eq!(sanitize_filename(""), "unknown");
    }

    #[test]
    fn unparseable_timestamps_pass_through() {
        assert_eq!(to_local_time("今天，10:00:00"), "今天，10:00:00");
        assert_eq!(to_local_time(""), "");
    }

    #[test]
    fn parses_iso_timestamps() {
        // Conversion target depends on the host timezone; assert shape, not value.
        let out = to_local_time("2025-06-01T12:00:00Z");
        assert_eq!(out.len(), 19);
        assert!(out.contains("2025-"));
    }
}
