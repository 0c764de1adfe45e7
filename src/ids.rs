//! Opaque per-request identifiers.
//!
//! The wire format mirrors the original `progai-middleware`: current
//! wall-clock nanoseconds rendered in base 16. It is reused for every chunk
//! of a streamed response and for issued tool-call ids.

pub fn nanosecond_hex_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{nanos:x}")
}

pub fn now_unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
