//! Stable fingerprints for unique-job dedup: a `(job name, args)` pair (or
//! an explicit override key) collapses to a fixed-width hash used as the
//! dedup key.
//!
//! `auth/api_key.rs`-style API key hashing uses `Sha3_512`; the same crate
//! covers this unrelated but structurally identical need — collapsing a
//! byte string down to a fixed-width, collision-resistant key.

use serde_json::{Map, Value};
use sha3::{Digest, Sha3_256};

/// A stable identity for "this job, with these arguments" used to suppress
/// duplicate enqueues of a unique job type. `args` is serialized through
/// `serde_json::Map`, which (absent the `preserve_order` feature) is
/// backed by a `BTreeMap` and so always serializes keys in sorted order —
/// two argument maps built in different orders still fingerprint
/// identically.
pub fn fingerprint(job_name: &str, args: &Map<String, Value>, explicit_key: Option<&str>) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(job_name.as_bytes());
    hasher.update([0u8]);
    match explicit_key {
        Some(key) => {
            hasher.update(b"key:");
            hasher.update(key.as_bytes());
        }
        None => {
            hasher.update(b"args:");
            // Map's Serialize impl always emits keys in the map's own
            // iteration order, which is sorted for the BTreeMap-backed
            // default build of serde_json::Map.
            let canonical = serde_json::to_vec(args).unwrap_or_default();
            hasher.update(&canonical);
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, i64)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), Value::from(*v))).collect()
    }

    #[test]
    fn same_name_and_args_fingerprint_identically() {
        let a = fingerprint("send_email", &args(&[("to", 1), ("from", 2)]), None);
        let b = fingerprint("send_email", &args(&[("from", 2), ("to", 1)]), None);
        assert_eq!(a, b, "argument insertion order must not affect the fingerprint");
    }

    #[test]
    fn different_args_fingerprint_differently() {
        let a = fingerprint("send_email", &args(&[("to", 1)]), None);
        let b = fingerprint("send_email", &args(&[("to", 2)]), None);
        assert_ne!(a, b);
    }

    #[test]
    fn different_job_names_fingerprint_differently() {
        let a = fingerprint("send_email", &Map::new(), None);
        let b = fingerprint("send_sms", &Map::new(), None);
        assert_ne!(a, b);
    }

    #[test]
    fn explicit_key_overrides_args() {
        let a = fingerprint("send_email", &args(&[("to", 1)]), Some("customer-42"));
        let b = fingerprint("send_email", &args(&[("to", 2)]), Some("customer-42"));
        assert_eq!(a, b, "an explicit unique key should ignore argument contents entirely");
    }

    #[test]
    fn fingerprint_is_hex() {
        let fp = fingerprint("send_email", &Map::new(), None);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
