//! Foundational low-level utilities shared across Courier crates.
//!
//! Provides atomic file-write helpers and time utilities used by credential
//! persistence and message-cache expiry calculations.

pub mod atomic_io;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms};

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;

    use super::*;

    #[test]
    fn time_utils_round_trip_bounds() {
        let now_s = current_unix_timestamp();
        let now_ms = current_unix_timestamp_ms();
        let now_ms_s = now_ms / 1_000;
        assert!(now_ms_s >= now_s);
        assert!(now_ms_s <= now_s.saturating_add(1));
    }

    #[test]
    fn write_text_atomic_writes_content() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("creds.json");
        write_text_atomic(&path, "{\"registered\":false}").expect("write");
        let contents = read_to_string(&path).expect("read");
        assert_eq!(contents, "{\"registered\":false}");
    }

    #[test]
    fn write_text_atomic_overwrites_existing_file() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("creds.json");
        write_text_atomic(&path, "first").expect("write");
        write_text_atomic(&path, "second").expect("overwrite");
        assert_eq!(read_to_string(&path).expect("read"), "second");
    }
}
