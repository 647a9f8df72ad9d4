//! # Asset Merge Rule
//!
//! How asset metadata pulled from the server combines with local download
//! state.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Pulled Asset vs Local Row                            │
//! │                                                                         │
//! │  no local row                  → insert, status = missing               │
//! │  same url, same checksum       → refresh size/owner, KEEP local_uri     │
//! │                                  and status                             │
//! │  url or checksum changed       → status = missing, local_uri = NULL,    │
//! │                                  old file reported as stale             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::types::{AssetRecord, AssetStatus};

/// Asset metadata carried by a pulled unit or lesson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAssetMeta {
    pub id: String,
    pub remote_url: String,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
}

/// Result of merging remote metadata into local state.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetMerge {
    /// Row to write.
    pub record: AssetRecord,
    /// Local file that no longer matches the remote asset and should be
    /// deleted once the row is committed.
    pub stale_local_uri: Option<String>,
    /// True when the underlying bytes changed remotely.
    pub content_changed: bool,
}

/// Merges pulled metadata into the existing local row (if any).
///
/// A checksum that the server stops sending is not treated as a change; a
/// checksum that appears or differs is.
pub fn merge_remote_asset(
    existing: Option<&AssetRecord>,
    incoming: &RemoteAssetMeta,
    unit_id: &str,
    owner_id: &str,
) -> AssetMerge {
    let fresh = AssetRecord {
        id: incoming.id.clone(),
        unit_id: unit_id.to_string(),
        owner_id: owner_id.to_string(),
        remote_url: incoming.remote_url.clone(),
        local_uri: None,
        status: AssetStatus::Missing,
        checksum: incoming.checksum.clone(),
        size: incoming.size,
    };

    let Some(local) = existing else {
        return AssetMerge {
            record: fresh,
            stale_local_uri: None,
            content_changed: false,
        };
    };

    let url_changed = local.remote_url != incoming.remote_url;
    let checksum_changed = match (&local.checksum, &incoming.checksum) {
        (Some(old), Some(new)) => !old.eq_ignore_ascii_case(new),
        (None, Some(_)) => true,
        _ => false,
    };

    if url_changed || checksum_changed {
        return AssetMerge {
            record: fresh,
            stale_local_uri: local.local_uri.clone(),
            content_changed: true,
        };
    }

    AssetMerge {
        record: AssetRecord {
            local_uri: local.local_uri.clone(),
            status: local.status,
            checksum: incoming.checksum.clone().or_else(|| local.checksum.clone()),
            size: incoming.size.or(local.size),
            ..fresh
        },
        stale_local_uri: None,
        content_changed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached(url: &str, checksum: Option<&str>) -> AssetRecord {
        AssetRecord {
            id: "a1".into(),
            unit_id: "u1".into(),
            owner_id: "u1".into(),
            remote_url: url.into(),
            local_uri: Some("/cache/a1".into()),
            status: AssetStatus::Cached,
            checksum: checksum.map(str::to_string),
            size: Some(10),
        }
    }

    fn meta(url: &str, checksum: Option<&str>) -> RemoteAssetMeta {
        RemoteAssetMeta {
            id: "a1".into(),
            remote_url: url.into(),
            checksum: checksum.map(str::to_string),
            size: Some(12),
        }
    }

    #[test]
    fn test_new_asset_starts_missing() {
        let merge = merge_remote_asset(None, &meta("https://cdn/a1.png", None), "u1", "L1");
        assert_eq!(merge.record.status, AssetStatus::Missing);
        assert_eq!(merge.record.owner_id, "L1");
        assert!(merge.record.local_uri.is_none());
        assert!(!merge.content_changed);
    }

    #[test]
    fn test_metadata_only_update_preserves_local_state() {
        let local = cached("https://cdn/a1.png", Some("abc"));
        let merge = merge_remote_asset(Some(&local), &meta("https://cdn/a1.png", Some("ABC")), "u1", "u1");
        assert_eq!(merge.record.status, AssetStatus::Cached);
        assert_eq!(merge.record.local_uri.as_deref(), Some("/cache/a1"));
        assert_eq!(merge.record.size, Some(12));
        assert!(merge.stale_local_uri.is_none());
    }

    #[test]
    fn test_changed_url_forces_redownload() {
        let local = cached("https://cdn/a1.png", None);
        let merge = merge_remote_asset(Some(&local), &meta("https://cdn/a1-v2.png", None), "u1", "u1");
        assert_eq!(merge.record.status, AssetStatus::Missing);
        assert!(merge.record.local_uri.is_none());
        assert_eq!(merge.stale_local_uri.as_deref(), Some("/cache/a1"));
        assert!(merge.content_changed);
    }

    #[test]
    fn test_changed_checksum_forces_redownload() {
        let local = cached("https://cdn/a1.png", Some("abc"));
        let merge = merge_remote_asset(Some(&local), &meta("https://cdn/a1.png", Some("def")), "u1", "u1");
        assert!(merge.content_changed);
        assert_eq!(merge.record.status, AssetStatus::Missing);
    }

    #[test]
    fn test_dropped_checksum_is_not_a_change() {
        let local = cached("https://cdn/a1.png", Some("abc"));
        let merge = merge_remote_asset(Some(&local), &meta("https://cdn/a1.png", None), "u1", "u1");
        assert!(!merge.content_changed);
        assert_eq!(merge.record.checksum.as_deref(), Some("abc"));
    }
}
