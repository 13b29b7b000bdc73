//! Host resource probing
//!
//! Reads available memory from /proc/meminfo, free disk space of the temporary
//! directory through statvfs, and the logical core count. Configured limits cap
//! whatever the probe finds and stand in for it on platforms where it fails.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Capacity available to a run on this host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResources {
    /// Memory in bytes
    pub memory: u64,
    /// Disk in bytes (temporary directory filesystem)
    pub disk: u64,
    /// Logical cores
    pub cores: usize,
}

/// Optional caps on probed resources
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory: Option<u64>,
    pub disk: Option<u64>,
    pub cores: Option<usize>,
}

/// Probe the host, then apply `limits`
pub fn probe_host(temp_dir: &Path, limits: &ResourceLimits) -> Result<HostResources> {
    let memory = cap(available_memory(), limits.memory)
        .ok_or_else(|| anyhow::anyhow!("Cannot determine available memory; set a memory limit"))?;
    let disk = cap(available_disk(temp_dir), limits.disk).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot determine free disk space under {}; set a disk limit",
            temp_dir.display()
        )
    })?;
    let cores = match limits.cores {
        Some(limit) => limit.min(logical_cores()),
        None => logical_cores(),
    };

    let host = HostResources { memory, disk, cores };
    tracing::debug!(?host, "probed host resources");
    Ok(host)
}

fn cap(probed: Option<u64>, limit: Option<u64>) -> Option<u64> {
    match (probed, limit) {
        (Some(p), Some(l)) => Some(p.min(l)),
        (Some(p), None) => Some(p),
        (None, l) => l,
    }
}

/// Available memory from /proc/meminfo (MemAvailable, MemFree as fallback)
fn available_memory() -> Option<u64> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&meminfo)
}

fn parse_meminfo(meminfo: &str) -> Option<u64> {
    let mut free_kb = None;

    for line in meminfo.lines() {
        // MemAvailable:   12345678 kB
        let mut parts = line.split_whitespace();
        let Some(key) = parts.next() else {
            continue;
        };
        let value = parts.next().and_then(|v| v.parse::<u64>().ok());
        match key {
            "MemAvailable:" => return value.map(|kb| kb * 1024),
            "MemFree:" => free_kb = value,
            _ => {}
        }
    }

    free_kb.map(|kb| kb * 1024)
}

/// Free space available to unprivileged users on the filesystem holding `path`
fn available_disk(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
    if rc != 0 {
        return None;
    }

    Some((stats.f_bavail as u64).saturating_mul(stats.f_frsize as u64))
}

fn logical_cores() -> usize {
    num_cpus::get().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo_prefers_available() {
        let meminfo = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    8000000 kB\n";
        assert_eq!(parse_meminfo(meminfo), Some(8_000_000 * 1024));
    }

    #[test]
    fn test_parse_meminfo_falls_back_to_free() {
        let meminfo = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\n";
        assert_eq!(parse_meminfo(meminfo), Some(1_000_000 * 1024));
    }

    #[test]
    fn test_limits_cap_probe() {
        let dir = tempfile::tempdir().unwrap();
        let limits = ResourceLimits {
            memory: Some(1024),
            disk: Some(2048),
            cores: Some(1),
        };
        let host = probe_host(dir.path(), &limits).unwrap();

        assert!(host.memory <= 1024);
        assert!(host.disk <= 2048);
        assert_eq!(host.cores, 1);
    }

    #[test]
    fn test_cap_uses_limit_when_probe_missing() {
        assert_eq!(cap(None, Some(7)), Some(7));
        assert_eq!(cap(Some(3), Some(7)), Some(3));
        assert_eq!(cap(None, None), None);
    }
}
