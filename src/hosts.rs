//! Hosts file handling.
//!
//! One line per daemon: `<short-hostname> <transport-address>`. Line order
//! defines the 0-based host ids that the distributor hashes onto, so every
//! participant must read the same file. Daemons append their own line at
//! startup; the file is removed again when the job tears down.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::error::{FsError, FsResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub name: String,
    pub addr: String,
}

/// Parse a hosts file into its host list.
pub fn parse_hosts_file<P: AsRef<Path>>(path: P) -> FsResult<Vec<Host>> {
    let content = std::fs::read_to_string(path.as_ref())?;
    parse_hosts(&content)
}

fn parse_hosts(content: &str) -> FsResult<Vec<Host>> {
    let mut hosts = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let name = parts.next();
        let addr = parts.next();
        match (name, addr) {
            (Some(name), Some(addr)) => hosts.push(Host {
                name: name.to_string(),
                addr: addr.to_string(),
            }),
            _ => {
                return Err(FsError::InvalidArgument(format!(
                    "malformed hosts file line {}",
                    lineno + 1
                )))
            }
        }
    }
    Ok(hosts)
}

/// Append this daemon's registration line. Single `O_APPEND` write, so
/// concurrent daemons starting at the same time don't interleave.
pub fn register_daemon<P: AsRef<Path>>(path: P, name: &str, addr: &str) -> FsResult<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_ref())?;
    file.write_all(format!("{} {}\n", name, addr).as_bytes())?;
    Ok(())
}

/// Remove the hosts file; missing is fine.
pub fn destroy_hosts_file<P: AsRef<Path>>(path: P) -> FsResult<()> {
    match std::fs::remove_file(path.as_ref()) {
        Ok(()) => Ok(()),
        Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// The machine's hostname, optionally cut at the first dot.
pub fn get_my_hostname(short: bool) -> FsResult<String> {
    let mut buf = [0u8; 256];
    let name = nix::unistd::gethostname(&mut buf)?;
    let mut name = name.to_string_lossy().into_owned();
    if short {
        if let Some(pos) = name.find('.') {
            name.truncate(pos);
        }
    }
    Ok(name)
}
