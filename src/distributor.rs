//! Deterministic placement of file data and metadata onto daemons.
//!
//! The distributor is constructed once per process from the hosts file and
//! is immutable afterwards. Client and daemon must compute identical
//! placements, so the string hash is a keyed SipHash with fixed keys
//! rather than the process-randomized std hasher.

use std::hash::Hasher;

use siphasher::sip::SipHasher13;

pub type HostId = u64;
pub type ChunkId = u64;

fn str_hash(s: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write(s.as_bytes());
    hasher.finish()
}

/// Placement policy. A small tagged value instead of a trait object: every
/// variant implements the same locator set and callers match nothing.
#[derive(Debug, Clone)]
pub enum Distributor {
    /// Hash placement over all hosts; directory metadata on every host.
    SimpleHash { localhost: HostId, hosts: u64 },
    /// Everything on the local host (single-node development mode).
    LocalOnly { localhost: HostId },
    /// All data on one configured I/O node; metadata still hashed.
    Forwarder { fwd_host: HostId, hosts: u64 },
}

impl Distributor {
    pub fn hash(localhost: HostId, hosts: u64) -> Self {
        assert!(hosts > 0, "empty host set");
        Distributor::SimpleHash { localhost, hosts }
    }

    pub fn local_only(localhost: HostId) -> Self {
        Distributor::LocalOnly { localhost }
    }

    pub fn forwarder(fwd_host: HostId, hosts: u64) -> Self {
        assert!(hosts > 0, "empty host set");
        Distributor::Forwarder { fwd_host, hosts }
    }

    pub fn localhost(&self) -> HostId {
        match *self {
            Distributor::SimpleHash { localhost, .. } => localhost,
            Distributor::LocalOnly { localhost } => localhost,
            Distributor::Forwarder { fwd_host, .. } => fwd_host,
        }
    }

    pub fn hosts(&self) -> u64 {
        match *self {
            Distributor::SimpleHash { hosts, .. } => hosts,
            Distributor::LocalOnly { .. } => 1,
            Distributor::Forwarder { hosts, .. } => hosts,
        }
    }

    /// Host holding chunk `chunk_id` of `path`.
    pub fn locate_data(&self, path: &str, chunk_id: ChunkId) -> HostId {
        match *self {
            Distributor::SimpleHash { hosts, .. } => {
                str_hash(&format!("{}{}", path, chunk_id)) % hosts
            }
            Distributor::LocalOnly { localhost } => localhost,
            Distributor::Forwarder { fwd_host, .. } => fwd_host,
        }
    }

    /// Host holding the metadata record of `path`.
    pub fn locate_file_metadata(&self, path: &str) -> HostId {
        match *self {
            Distributor::SimpleHash { hosts, .. } => str_hash(path) % hosts,
            Distributor::LocalOnly { localhost } => localhost,
            Distributor::Forwarder { hosts, .. } => str_hash(path) % hosts,
        }
    }

    /// Hosts participating in a directory listing. Children hash onto
    /// arbitrary hosts, so listings fan out to all of them.
    pub fn locate_directory_metadata(&self, _path: &str) -> Vec<HostId> {
        match *self {
            Distributor::SimpleHash { hosts, .. } => (0..hosts).collect(),
            Distributor::LocalOnly { localhost } => vec![localhost],
            Distributor::Forwarder { hosts, .. } => (0..hosts).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_in_range() {
        let d = Distributor::hash(0, 4);
        let e = Distributor::hash(3, 4);
        for chunk in 0..64 {
            let host = d.locate_data("/some/file", chunk);
            assert!(host < 4);
            // placement must not depend on who asks
            assert_eq!(host, e.locate_data("/some/file", chunk));
        }
        assert_eq!(
            d.locate_file_metadata("/some/file"),
            e.locate_file_metadata("/some/file")
        );
    }

    #[test]
    fn chunks_spread_over_hosts() {
        let d = Distributor::hash(0, 4);
        let mut seen = std::collections::HashSet::new();
        for chunk in 0..256 {
            seen.insert(d.locate_data("/spread", chunk));
        }
        assert!(seen.len() > 1, "hash distributor never left one host");
    }

    #[test]
    fn local_only_pins_everything() {
        let d = Distributor::local_only(0);
        assert_eq!(d.locate_data("/a", 7), 0);
        assert_eq!(d.locate_file_metadata("/a"), 0);
        assert_eq!(d.locate_directory_metadata("/"), vec![0]);
    }

    #[test]
    fn forwarder_pins_data_but_hashes_metadata() {
        let d = Distributor::forwarder(2, 4);
        let h = Distributor::hash(0, 4);
        for chunk in 0..16 {
            assert_eq!(d.locate_data("/a", chunk), 2);
        }
        assert_eq!(d.locate_file_metadata("/a"), h.locate_file_metadata("/a"));
        assert_eq!(d.locate_directory_metadata("/").len(), 4);
    }
}
