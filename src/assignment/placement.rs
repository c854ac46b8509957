//! Target selection for region opens
//!
//! The default policy uses HRW (Highest Random Weight) hashing of the region
//! name against each server, so a region keeps landing on the same server
//! while the fleet is stable.

use crate::assignment::{RegionInfo, ServerName};

pub trait PlacementPolicy: Send + Sync {
    /// Pick a server for `region` from `live`, avoiding `excluded`.
    /// `None` means nothing can host it right now.
    fn choose_node(
        &self,
        region: &RegionInfo,
        live: &[ServerName],
        excluded: &[ServerName],
    ) -> Option<ServerName>;
}

/// Rank servers for a key by descending BLAKE3 weight
pub fn hrw_rank(key: &str, servers: &[ServerName]) -> Vec<ServerName> {
    let mut weights: Vec<(ServerName, u64)> = servers
        .iter()
        .map(|server| {
            let combined = format!("{}{}", key, server);
            let hash = blake3::hash(combined.as_bytes());
            let mut head = [0u8; 8];
            head.copy_from_slice(&hash.as_bytes()[0..8]);
            (server.clone(), u64::from_le_bytes(head))
        })
        .collect();

    weights.sort_by(|a, b| b.1.cmp(&a.1));
    weights.into_iter().map(|(server, _)| server).collect()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HrwPlacement;

impl PlacementPolicy for HrwPlacement {
    fn choose_node(
        &self,
        region: &RegionInfo,
        live: &[ServerName],
        excluded: &[ServerName],
    ) -> Option<ServerName> {
        let ranked = hrw_rank(&region.name(), live);

        // Excluded servers are only a last resort
        ranked
            .iter()
            .find(|server| !excluded.contains(server))
            .or_else(|| ranked.first())
            .cloned()
    }
}
