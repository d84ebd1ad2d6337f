//! Deterministic canary selection between published and draft values

use crate::types::{ConfigItem, ConfigVersion, GrayRule};

/// FNV-1a 32-bit hash
fn fnv1a_32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c9dc5;
    const PRIME: u32 = 0x0100_0193;

    let mut hash = OFFSET_BASIS;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Whether `client_id` falls inside the gray slice for `percentage`.
///
/// The mapping is stable per client and monotonic in the percentage: a
/// client inside the slice at p stays inside for any p' > p.
pub fn hits_gray(client_id: &str, percentage: u32) -> bool {
    if percentage == 0 {
        return false;
    }
    if percentage >= 100 {
        return true;
    }
    fnv1a_32(client_id.as_bytes()) % 100 < percentage
}

/// Compute the configuration version this client should see.
///
/// Clients inside an enabled gray slice receive the draft value; everyone
/// else, and every client when the draft slot is empty, receives the
/// published value.
pub fn effective_version(
    item: &ConfigItem,
    gray: Option<&GrayRule>,
    client_id: &str,
) -> ConfigVersion {
    let mut value = &item.published_value;
    let mut md5 = &item.published_md5;

    if let Some(rule) = gray.filter(|rule| rule.enabled) {
        if hits_gray(client_id, rule.percentage) && !item.draft_value.is_empty() {
            value = &item.draft_value;
            md5 = &item.draft_md5;
        }
    }

    ConfigVersion {
        namespace: item.namespace.clone(),
        key: item.key.clone(),
        md5: md5.clone(),
        value: value.clone(),
        format: item.format.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{fingerprint, ConfigFormat};
    use chrono::Utc;

    fn item() -> ConfigItem {
        let now = Utc::now();
        ConfigItem {
            namespace: "myapp".to_string(),
            key: "app.yaml".to_string(),
            format: ConfigFormat::Yaml,
            draft_value: "k: 2".to_string(),
            draft_md5: fingerprint("k: 2"),
            published_value: "k: 1".to_string(),
            published_md5: fingerprint("k: 1"),
            published_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    fn rule(percentage: u32, enabled: bool) -> GrayRule {
        let now = Utc::now();
        GrayRule {
            namespace: "myapp".to_string(),
            key: "app.yaml".to_string(),
            percentage,
            enabled,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn selection_is_deterministic() {
        let first = hits_gray("c1", 40);
        for _ in 0..10_000 {
            assert_eq!(hits_gray("c1", 40), first);
        }
    }

    #[test]
    fn selection_is_monotonic() {
        // a client inside the slice never falls out as the slice grows
        for i in 0..500 {
            let client = format!("client-{}", i);
            let mut inside = false;
            for p in 0..=100 {
                let now = hits_gray(&client, p);
                assert!(!inside || now, "client {} fell out at p={}", client, p);
                inside = now;
            }
            assert!(inside, "every client is inside at p=100");
        }
    }

    #[test]
    fn slice_fraction_tracks_percentage() {
        let percentage = 30;
        let total = 10_000;
        let hits = (0..total)
            .filter(|i| hits_gray(&format!("client-{}", i), percentage))
            .count();
        let fraction = hits as f64 / total as f64;
        assert!(
            (fraction - 0.30).abs() < 0.03,
            "fraction was {}",
            fraction
        );
    }

    #[test]
    fn boundary_percentages() {
        assert!(!hits_gray("anyone", 0));
        assert!(hits_gray("anyone", 100));
    }

    #[test]
    fn effective_version_routes_between_slots() {
        let item = item();

        // no rule, disabled rule: published
        let v = effective_version(&item, None, "c1");
        assert_eq!(v.value, "k: 1");
        let v = effective_version(&item, Some(&rule(100, false)), "c1");
        assert_eq!(v.value, "k: 1");

        // full rollout: draft
        let v = effective_version(&item, Some(&rule(100, true)), "c1");
        assert_eq!(v.value, "k: 2");
        assert_eq!(v.md5, fingerprint("k: 2"));
    }

    #[test]
    fn empty_draft_falls_back_to_published() {
        let mut item = item();
        item.draft_value = String::new();
        item.draft_md5 = String::new();

        let v = effective_version(&item, Some(&rule(100, true)), "c1");
        assert_eq!(v.value, "k: 1");
    }
}
