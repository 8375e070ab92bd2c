//! Tag Compatibility Matcher
//!
//! Decides whether a storage pool satisfies a disk offering's tag
//! requirements. The rule is deliberately asymmetric: an offering without
//! tags fits any pool, including untagged ones, while a tagged offering
//! needs a pool declaring a superset of its tags.

use crate::domain::model::{DiskOffering, StoragePool};
use std::collections::BTreeSet;

/// Whether a pool with `pool_tags` supports an offering requiring `offering_tags`
pub fn supports(pool_tags: &BTreeSet<String>, offering_tags: &BTreeSet<String>) -> bool {
    if offering_tags.is_empty() {
        return true;
    }
    if pool_tags.is_empty() {
        return false;
    }
    offering_tags.is_subset(pool_tags)
}

/// Whether `pool` supports `offering`
pub fn pool_supports_offering(pool: &StoragePool, offering: &DiskOffering) -> bool {
    supports(&pool.tags, &offering.tags)
}

/// Whether `pool_tags` supports a comma-separated offering tag list
pub fn supports_tag_string(pool_tags: &BTreeSet<String>, offering_tags: &str) -> bool {
    supports(pool_tags, &parse_tags(offering_tags))
}

/// Whether `pool` supports a comma-separated tag list; `None` means no tags
pub fn pool_supports_tags(pool: &StoragePool, offering_tags: Option<&str>) -> bool {
    supports_tag_string(&pool.tags, offering_tags.unwrap_or_default())
}

/// Parse a comma-separated tag list, trimming whitespace and dropping empties
pub fn parse_tags(tags: &str) -> BTreeSet<String> {
    tags.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}
