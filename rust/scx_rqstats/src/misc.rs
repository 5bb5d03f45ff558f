// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::bail;
use anyhow::Result;
use std::path::Path;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// Read a file and parse its content into the specified type.
///
/// Trims null and whitespace before parsing.
///
/// # Errors
/// Returns an error if reading or parsing fails.
pub fn read_from_file<T>(path: &Path) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let val = match std::fs::read_to_string(path) {
        Ok(val) => val,
        Err(_) => {
            bail!("Failed to open or read file {:?}", path);
        }
    };
    let val = val.trim_end_matches('\0');

    match val.trim().parse::<T>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => {
            bail!("Failed to parse content '{}' from {:?}", val.trim(), path);
        }
    }
}

/// Parse the leading unsigned decimal of an attribute write the way the
/// kernel's `sscanf(buf, "%u", &val)` does. Anything unparseable is 0.
pub fn parse_attr_u32(buf: &str) -> u32 {
    let digits: String = buf
        .trim_start()
        .trim_start_matches('+')
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u32>().unwrap_or(0)
}

/// Take a mutex, ignoring poisoning. All state guarded this way stays
/// consistent field by field, so a panicking holder cannot leave it torn.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn attr_parsing_matches_scanf() {
        assert_eq!(parse_attr_u32("37\n"), 37);
        assert_eq!(parse_attr_u32("  120ms"), 120);
        assert_eq!(parse_attr_u32("+5"), 5);
        assert_eq!(parse_attr_u32("abc"), 0);
        assert_eq!(parse_attr_u32("-3"), 0);
        assert_eq!(parse_attr_u32(""), 0);
        assert_eq!(parse_attr_u32("99999999999"), 0);
    }

    #[test]
    fn read_trimmed_value() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "1512000\n\0").unwrap();
        let val: u64 = read_from_file(file.path()).unwrap();
        assert_eq!(val, 1512000);

        write!(file, "garbage").unwrap();
        assert!(read_from_file::<u64>(file.path()).is_err());
    }
}
