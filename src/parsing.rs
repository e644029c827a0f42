//! Shared parsing helpers for the keyed-data formats cgroup v1 stat files
//! use (`parse_flat_keyed_data`/`parse_nested_keyed_data`/`parse_device_number`/
//! `parse_single_value`), grounded on `containers-youki`'s `stats.rs`
//! equivalents but normalized onto the crate-wide [`crate::error::Error`]
//! instead of a bespoke error enum per parser.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::kernel_fs::KernelFs;

/// Parses a single-value file (`cpuacct.usage`, `memory.usage_in_bytes`,
/// ...) to a `u64`. The kernel's `"max"` sentinel maps to `u64::MAX`.
pub fn parse_single_value(fs: &KernelFs, path: &Path) -> Result<u64> {
    let value = fs.read_to_string(path)?;
    let value = value.trim();
    if value == "max" {
        return Ok(u64::MAX);
    }
    value
        .parse()
        .map_err(|_| Error::failed_precondition(format!("malformed value {value:?} in {}", path.display())))
}

/// Parses "flat keyed" data: one `<key> <value>` pair per line
/// (`cpu.stat`, `cpuacct.stat`, `memory.stat`).
pub fn parse_flat_keyed_data(fs: &KernelFs, path: &Path) -> Result<HashMap<String, u64>> {
    let contents = fs.read_to_string(path)?;
    let mut stats = HashMap::new();
    for line in contents.lines() {
        let fields: Vec<&str> = line.split_ascii_whitespace().collect();
        if fields.len() != 2 {
            return Err(Error::failed_precondition(format!(
                "{} does not conform to 'key value': {line:?}",
                path.display()
            )));
        }
        let value = fields[1]
            .parse()
            .map_err(|_| Error::failed_precondition(format!("failed to parse {:?} in {}", fields[1], path.display())))?;
        stats.insert(fields[0].to_owned(), value);
    }
    Ok(stats)
}

/// Parses "nested keyed" data: `<key> <sub>=<value> <sub>=<value> ...`
/// (`memory.numa_stat`).
pub fn parse_nested_keyed_data(fs: &KernelFs, path: &Path) -> Result<HashMap<String, Vec<String>>> {
    let contents = fs.read_to_string(path)?;
    let mut stats: HashMap<String, Vec<String>> = HashMap::new();
    for line in contents.lines() {
        let fields: Vec<&str> = line.split_ascii_whitespace().collect();
        if fields.len() < 2 || !fields[1..].iter().all(|p| p.contains('=')) {
            return Err(Error::failed_precondition(format!(
                "{} does not conform to nested keyed format: {line:?}",
                path.display()
            )));
        }
        stats.insert(fields[0].to_owned(), fields[1..].iter().map(|s| s.to_string()).collect());
    }
    Ok(stats)
}

/// Parses a `<major>:<minor>` device number pair.
pub fn parse_device_number(device: &str) -> Result<(u64, u64)> {
    let parts: Vec<&str> = device.split_terminator(':').collect();
    if parts.len() != 2 {
        return Err(Error::failed_precondition(format!(
            "expected '<major>:<minor>', found {device:?}"
        )));
    }
    let major = parts[0]
        .parse()
        .map_err(|_| Error::failed_precondition(format!("malformed major device number in {device:?}")))?;
    let minor = parts[1]
        .parse()
        .map_err(|_| Error::failed_precondition(format!("malformed minor device number in {device:?}")))?;
    Ok((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_keyed_data_parses_pairs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cpu.stat");
        std::fs::write(&path, "nr_periods 10\nnr_throttled 2\n").unwrap();
        let data = parse_flat_keyed_data(&KernelFs::new(), &path).unwrap();
        assert_eq!(data.get("nr_periods"), Some(&10));
        assert_eq!(data.get("nr_throttled"), Some(&2));
    }

    #[test]
    fn flat_keyed_data_rejects_malformed_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cpu.stat");
        std::fs::write(&path, "nr_periods 10 extra\n").unwrap();
        let err = parse_flat_keyed_data(&KernelFs::new(), &path).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn single_value_max_maps_to_u64_max() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("memory.limit_in_bytes");
        std::fs::write(&path, "max\n").unwrap();
        assert_eq!(parse_single_value(&KernelFs::new(), &path).unwrap(), u64::MAX);
    }

    #[test]
    fn device_number_splits_major_minor() {
        assert_eq!(parse_device_number("8:0").unwrap(), (8, 0));
        assert!(parse_device_number("8").is_err());
    }
}
