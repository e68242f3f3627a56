//! Stable entity → partition mapping.

use catalog_core::EntityId;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Partition that carries every event of `entity_id`.
///
/// FNV-1a over the UUID bytes, so the mapping is identical across processes
/// and restarts. `partitions` of 0 is treated as 1.
pub fn partition_for(entity_id: EntityId, partitions: u32) -> u32 {
    let mut hash = FNV_OFFSET;
    for byte in entity_id.as_uuid().as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % u64::from(partitions.max(1))) as u32
}
