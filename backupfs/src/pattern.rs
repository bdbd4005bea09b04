//! Backup path pattern expansion.
//!
//! A pattern is copied character by character, except for `%` directives:
//!
//! - `%Y` year (4 digits), `%M` month, `%D` day, `%h` hour, `%m` minute,
//!   `%s` second (2 digits each), taken from the local wall clock
//! - `%u` a random token: 16 random bytes as lowercase hex with a `-`
//!   after the 4th, 6th and 8th byte (`xxxxxxxx-xxxx-xxxx-xxxxxxxxxxxxxxxx`).
//!   This is not a canonical UUID and must stay in this legacy layout.
//! - `%%` a literal `%`
//!
//! Unknown directives and a trailing `%` are copied as-is. Output longer
//! than [`MAX_EXPANDED_LEN`] is cut at the limit instead of failing.

use std::fmt::Write as _;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use rand::TryRngCore;
use rand::rngs::OsRng;

use crate::error::{BackupFsError, Result};

/// Longest path the expander produces (`PATH_MAX` minus the terminator).
pub const MAX_EXPANDED_LEN: usize = libc::PATH_MAX as usize - 1;

/// Random bytes consumed by one `%u`.
pub const TOKEN_BYTES: usize = 16;

/// Rendered `%u` length: 32 hex digits plus 3 separators.
pub const TOKEN_LEN: usize = TOKEN_BYTES * 2 + TOKEN_SEPARATORS.len();

/// Byte indices that are preceded by a `-` in the token.
const TOKEN_SEPARATORS: [usize; 3] = [4, 6, 8];

/// Wall-clock time broken down into the fields the directives print.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CalendarFields {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl CalendarFields {
    pub fn now() -> Self {
        Self::from(Local::now())
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for CalendarFields {
    fn from(dt: DateTime<Tz>) -> Self {
        CalendarFields {
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
        }
    }
}

/// A source of cryptographically random bytes.
pub trait EntropySource: Send + Sync {
    /// Fill `dest` completely or fail with [`BackupFsError::RandomUnavailable`].
    fn fill(&self, dest: &mut [u8]) -> Result<()>;
}

/// The operating system's random generator (`getrandom(2)`).
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, dest: &mut [u8]) -> Result<()> {
        OsRng
            .try_fill_bytes(dest)
            .map_err(|e| BackupFsError::RandomUnavailable(e.to_string()))
    }
}

/// Random bytes read from a device such as `/dev/random`.
///
/// Each fill is a single `read(2)`; a short read is reported as unavailable
/// rather than retried.
#[derive(Debug)]
pub struct DeviceEntropy {
    file: File,
}

impl DeviceEntropy {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::open(path)?;
        Ok(DeviceEntropy { file })
    }
}

impl EntropySource for DeviceEntropy {
    fn fill(&self, dest: &mut [u8]) -> Result<()> {
        let n = (&self.file)
            .read(dest)
            .map_err(|e| BackupFsError::RandomUnavailable(e.to_string()))?;
        if n < dest.len() {
            return Err(BackupFsError::RandomUnavailable(format!(
                "short read: {n} of {} bytes",
                dest.len()
            )));
        }
        Ok(())
    }
}

/// Expand `template` into a backing file path.
pub fn expand(template: &str, now: &CalendarFields, entropy: &dyn EntropySource) -> Result<String> {
    expand_with_limit(template, now, entropy, MAX_EXPANDED_LEN)
}

/// Like [`expand`], with an explicit output limit in bytes.
pub fn expand_with_limit(
    template: &str,
    now: &CalendarFields,
    entropy: &dyn EntropySource,
    limit: usize,
) -> Result<String> {
    let mut out = BoundedPath::new(limit);
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        let fits = if c != '%' {
            out.push(c)
        } else {
            match chars.next() {
                Some('Y') => out.push_str(&format!("{:04}", now.year)),
                Some('M') => out.push_str(&format!("{:02}", now.month)),
                Some('D') => out.push_str(&format!("{:02}", now.day)),
                Some('h') => out.push_str(&format!("{:02}", now.hour)),
                Some('m') => out.push_str(&format!("{:02}", now.minute)),
                Some('s') => out.push_str(&format!("{:02}", now.second)),
                Some('u') => {
                    let token = random_token(entropy).inspect_err(|e| {
                        error!("cannot expand pattern {template:?}: {e}");
                    })?;
                    out.push_str(&token)
                }
                Some('%') | None => out.push('%'),
                Some(other) => out.push('%') && out.push(other),
            }
        };
        if !fits {
            warn!("expanded pattern {template:?} truncated to {limit} bytes");
            break;
        }
    }

    let path = out.into_inner();
    info!("expanded pattern {template:?} to {path}");
    Ok(path)
}

fn random_token(entropy: &dyn EntropySource) -> Result<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    entropy.fill(&mut bytes)?;
    Ok(format_token(&bytes))
}

fn format_token(bytes: &[u8; TOKEN_BYTES]) -> String {
    let mut token = String::with_capacity(TOKEN_LEN);
    for (i, b) in bytes.iter().enumerate() {
        if TOKEN_SEPARATORS.contains(&i) {
            token.push('-');
        }
        let _ = write!(token, "{b:02x}");
    }
    token
}

/// Output buffer that refuses characters past its byte limit.
struct BoundedPath {
    buf: String,
    limit: usize,
}

impl BoundedPath {
    fn new(limit: usize) -> Self {
        BoundedPath {
            buf: String::new(),
            limit,
        }
    }

    /// Append `c`, returning false once the limit would be exceeded.
    fn push(&mut self, c: char) -> bool {
        if self.buf.len() + c.len_utf8() > self.limit {
            return false;
        }
        self.buf.push(c);
        true
    }

    fn push_str(&mut self, s: &str) -> bool {
        s.chars().all(|c| self.push(c))
    }

    fn into_inner(self) -> String {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    /// Hands out consecutive byte values, so every fill differs.
    struct CountingEntropy(Mutex<u8>);

    impl CountingEntropy {
        fn new() -> Self {
            CountingEntropy(Mutex::new(0))
        }
    }

    impl EntropySource for CountingEntropy {
        fn fill(&self, dest: &mut [u8]) -> Result<()> {
            let mut next = self.0.lock().unwrap();
            for b in dest.iter_mut() {
                *b = *next;
                *next = next.wrapping_add(1);
            }
            Ok(())
        }
    }

    struct DryEntropy;

    impl EntropySource for DryEntropy {
        fn fill(&self, _dest: &mut [u8]) -> Result<()> {
            Err(BackupFsError::RandomUnavailable("empty".into()))
        }
    }

    fn march_5th() -> CalendarFields {
        CalendarFields {
            year: 2024,
            month: 3,
            day: 5,
            hour: 7,
            minute: 8,
            second: 9,
        }
    }

    fn assert_token(token: &str) {
        assert_eq!(token.len(), TOKEN_LEN);
        for (i, c) in token.char_indices() {
            if [8, 13, 18].contains(&i) {
                assert_eq!(c, '-', "separator expected at {i} in {token}");
            } else {
                assert!(matches!(c, '0'..='9' | 'a'..='f'), "bad char {c:?} in {token}");
            }
        }
        assert_eq!(token.matches('-').count(), 3);
    }

    #[test]
    fn date_fields_are_zero_padded() {
        let out = expand("/b/%Y/%M/%D-%h%m%s.img", &march_5th(), &DryEntropy).unwrap();
        assert_eq!(out, "/b/2024/03/05-070809.img");
    }

    #[test]
    fn short_years_pad_to_four_digits() {
        let now = CalendarFields {
            year: 42,
            ..march_5th()
        };
        assert_eq!(expand("%Y", &now, &DryEntropy).unwrap(), "0042");
    }

    #[test]
    fn date_and_token_scenario() {
        let out = expand("%Y-%M-%D_%u", &march_5th(), &CountingEntropy::new()).unwrap();
        let token = out.strip_prefix("2024-03-05_").expect("date prefix");
        assert_token(token);
        assert_eq!(token, "00010203-0405-0607-08090a0b0c0d0e0f");
    }

    #[test]
    fn tokens_differ_between_expansions() {
        let entropy = CountingEntropy::new();
        let a = expand("/b/%u", &march_5th(), &entropy).unwrap();
        let b = expand("/b/%u", &march_5th(), &entropy).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn os_entropy_tokens_are_well_formed_and_unique() {
        let a = expand("%u", &march_5th(), &OsEntropy).unwrap();
        let b = expand("%u", &march_5th(), &OsEntropy).unwrap();
        assert_token(&a);
        assert_token(&b);
        assert_ne!(a, b);
    }

    #[test]
    fn deterministic_without_token() {
        let now = march_5th();
        let a = expand("/b/%Y%M%D%h%m%s", &now, &DryEntropy).unwrap();
        let b = expand("/b/%Y%M%D%h%m%s", &now, &DryEntropy).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn literal_and_unknown_directives() {
        let now = march_5th();
        assert_eq!(expand("100%%", &now, &DryEntropy).unwrap(), "100%");
        assert_eq!(expand("a%qb", &now, &DryEntropy).unwrap(), "a%qb");
        assert_eq!(expand("tail%", &now, &DryEntropy).unwrap(), "tail%");
        assert_eq!(expand("ünï/%D", &now, &DryEntropy).unwrap(), "ünï/05");
    }

    #[test]
    fn random_failure_produces_no_path() {
        let err = expand("/b/%Y_%u", &march_5th(), &DryEntropy).unwrap_err();
        assert!(matches!(err, BackupFsError::RandomUnavailable(_)));
    }

    #[test]
    fn overlong_output_is_truncated() {
        let template = "x".repeat(MAX_EXPANDED_LEN + 100);
        let out = expand(&template, &march_5th(), &DryEntropy).unwrap();
        assert_eq!(out.len(), MAX_EXPANDED_LEN);

        let out = expand_with_limit("/b/%Y%M%D", &march_5th(), &DryEntropy, 6).unwrap();
        assert_eq!(out, "/b/202");
    }

    #[test]
    fn truncation_stops_before_later_tokens() {
        // The limit is hit inside the literal, so the dry source is never asked.
        let out = expand_with_limit("abcdef%u", &march_5th(), &DryEntropy, 4).unwrap();
        assert_eq!(out, "abcd");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let out = expand_with_limit("aé", &march_5th(), &DryEntropy, 2).unwrap();
        assert_eq!(out, "a");
    }

    #[test]
    fn device_entropy_short_read() {
        let mut short = tempfile::NamedTempFile::new().unwrap();
        short.write_all(&[1, 2, 3]).unwrap();
        let entropy = DeviceEntropy::open(short.path()).unwrap();
        let err = expand("%u", &march_5th(), &entropy).unwrap_err();
        assert!(matches!(err, BackupFsError::RandomUnavailable(_)));
    }

    #[test]
    fn device_entropy_full_read() {
        let mut full = tempfile::NamedTempFile::new().unwrap();
        full.write_all(&[0xab; TOKEN_BYTES]).unwrap();
        let entropy = DeviceEntropy::open(full.path()).unwrap();
        let out = expand("%u", &march_5th(), &entropy).unwrap();
        assert_eq!(out, "abababab-abab-abab-abababababababab");
    }
}
