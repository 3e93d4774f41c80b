//! Rendezvous (highest random weight) hashing.
//!
//! A key goes to the member with the highest `xorshift*(hash(key) ^ hash(member))`.
//! Removing a member only moves the keys that member owned.

use ahash::AHashMap;
use parking_lot::RwLock;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a.
pub fn fnv64a(data: &str) -> u64 {
    data.bytes()
        .fold(FNV_OFFSET, |hash, b| (hash ^ b as u64).wrapping_mul(FNV_PRIME))
}

fn xorshift_mult64(mut x: u64) -> u64 {
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    x.wrapping_mul(0x2545_f491_4f6c_dd1d)
}

#[derive(Debug, Default)]
struct Members {
    names: Vec<String>,
    hashes: Vec<u64>,
    // name -> index into `names` and `hashes`
    positions: AHashMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct Rendezvous {
    members: RwLock<Members>,
}

impl Rendezvous {
    pub fn new<S: AsRef<str>>(members: &[S]) -> Self {
        let ring = Self::default();
        for member in members {
            ring.add(member.as_ref());
        }
        ring
    }

    /// Add a member; no-op when already present.
    pub fn add(&self, member: &str) {
        let mut members = self.members.write();
        if members.positions.contains_key(member) {
            return;
        }
        let pos = members.names.len();
        members.positions.insert(member.to_string(), pos);
        members.names.push(member.to_string());
        members.hashes.push(fnv64a(member));
    }

    /// Remove a member by swapping it with the last one.
    pub fn remove(&self, member: &str) -> bool {
        let mut members = self.members.write();
        let Some(pos) = members.positions.remove(member) else {
            return false;
        };
        members.names.swap_remove(pos);
        members.hashes.swap_remove(pos);
        if let Some(moved) = members.names.get(pos).cloned() {
            members.positions.insert(moved, pos);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.members.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn members(&self) -> Vec<String> {
        let mut names = self.members.read().names.clone();
        names.sort();
        names
    }

    /// Highest scoring member for `key`.
    pub fn lookup(&self, key: &str) -> Option<String> {
        let members = self.members.read();
        let khash = fnv64a(key);
        members
            .hashes
            .iter()
            .enumerate()
            .max_by_key(|(_, h)| xorshift_mult64(khash ^ **h))
            .map(|(i, _)| members.names[i].clone())
    }

    /// Up to `n` members ordered by preference for `key`.
    pub fn lookup_top_n(&self, key: &str, n: usize) -> Vec<String> {
        let members = self.members.read();
        let khash = fnv64a(key);
        let mut scored: Vec<(u64, &String)> = members
            .hashes
            .iter()
            .zip(&members.names)
            .map(|(h, name)| (xorshift_mult64(khash ^ h), name))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(n)
            .map(|(_, name)| name.clone())
            .collect()
    }
}
