//! Proptest strategies for `usenet-engine`'s data model.
//!
//! Split into its own crate, mirroring the pack's generators-crate idiom, so
//! `proptest` never becomes a default dependency of the main library.

use proptest::collection::vec;
use proptest::prelude::*;
use usenet_engine::config::{ProviderConfig, ProviderKind};
use usenet_engine::usage::{UsageContext, UsageKind};

prop_compose! {
    /// A segment id list of `len` entries, each a plausible NNTP message-id.
    fn segment_ids_of_len(len: usize)
        (ids in vec("[a-zA-Z0-9]{8,16}@example\\.invalid", len)) -> Vec<String> {
        ids
    }
}

prop_compose! {
    /// A segment-id list with a caller-chosen size range.
    pub fn segment_ids(size_range: std::ops::Range<usize>)
        (len in size_range)
        (ids in segment_ids_of_len(len)) -> Vec<String> {
        ids
    }
}

/// Uniform-size segment list: `count` segments of `part_size` bytes each,
/// with the final segment trimmed so the total equals `file_size`.
pub fn uniform_segment_sizes(count: usize, part_size: u64, file_size: u64) -> Vec<u64> {
    if count == 0 {
        return Vec::new();
    }
    let mut sizes = vec![part_size; count];
    let sum_of_rest: u64 = sizes[..count - 1].iter().sum();
    sizes[count - 1] = file_size.saturating_sub(sum_of_rest);
    sizes
}

pub fn provider_kind() -> impl Strategy<Value = ProviderKind> {
    prop_oneof![
        Just(ProviderKind::Pooled),
        Just(ProviderKind::Pooled),
        Just(ProviderKind::Backup),
        Just(ProviderKind::BackupOnly),
    ]
}

fn provider_config_at(index: usize, max_connections: usize, kind: ProviderKind) -> ProviderConfig {
    ProviderConfig::builder()
        .index(index)
        .host(format!("provider-{index}.example.invalid"))
        .port(119u16)
        .use_tls(true)
        .username(format!("user-{index}"))
        .password("secret")
        .max_connections(max_connections)
        .kind(kind)
        .build()
}

/// A small pool of 1-5 providers with distinct, stable indices.
pub fn provider_configs() -> impl Strategy<Value = Vec<ProviderConfig>> {
    vec((1usize..20, provider_kind()), 1..=5).prop_map(|entries| {
        entries
            .into_iter()
            .enumerate()
            .map(|(index, (max_connections, kind))| provider_config_at(index, max_connections, kind))
            .collect()
    })
}

pub fn usage_kind() -> impl Strategy<Value = UsageKind> {
    prop_oneof![
        Just(UsageKind::Unknown),
        Just(UsageKind::Queue),
        Just(UsageKind::Streaming),
        Just(UsageKind::BufferedStreaming),
        Just(UsageKind::HealthCheck),
        Just(UsageKind::Repair),
        Just(UsageKind::Analysis),
    ]
}

prop_compose! {
    pub fn usage_context()(kind in usage_kind()) -> UsageContext {
        UsageContext::new(kind)
    }
}
