//! Hash chain over the event log.
//!
//! Every stored event carries `entry_hash = sha256(prev_hash || payload)`. The first entry
//! links to `GENESIS_HASH`. Rewriting or deleting a row breaks every later link.

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};

pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// Hashes a log entry payload with the previous chain hash.
pub fn hash_entry(prev_hash: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(payload);
    hasher.finalize().into()
}

/// One stored link, in insertion order.
#[derive(Clone, Debug)]
pub struct ChainLink {
    pub event_id: u64,
    pub prev_hash: [u8; 32],
    pub entry_hash: [u8; 32],
    pub payload: Vec<u8>,
}

/// Walks links in insertion order and returns how many verified.
pub fn verify_links(links: impl IntoIterator<Item = ChainLink>) -> Result<usize> {
    let mut expected_prev = GENESIS_HASH;
    let mut count = 0;
    for link in links {
        if link.prev_hash != expected_prev {
            return Err(anyhow!(
                "chain broken at event {}: prev_hash {} does not follow {}",
                link.event_id,
                hex::encode(link.prev_hash),
                hex::encode(expected_prev)
            ));
        }
        let computed = hash_entry(&link.prev_hash, &link.payload);
        if computed != link.entry_hash {
            return Err(anyhow!(
                "chain broken at event {}: entry_hash {} != computed {}",
                link.event_id,
                hex::encode(link.entry_hash),
                hex::encode(computed)
            ));
        }
        expected_prev = link.entry_hash;
        count += 1;
    }
    Ok(count)
}
