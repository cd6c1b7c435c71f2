// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn generated_ids_carry_prefix() {
    let id = JobId::new();
    assert!(id.as_str().starts_with("job-"));
    assert_eq!(id.as_str().len(), 23);

    let id = InstanceId::new();
    assert!(id.as_str().starts_with("wfi-"));

    let id = ProcId::new();
    assert!(id.as_str().starts_with("prc-"));
}

#[test]
fn generated_ids_are_unique() {
    let a = JobId::new();
    let b = JobId::new();
    assert_ne!(a, b);
}

#[test]
fn from_string_accepts_foreign_ids() {
    let id = JobId::from_string("caller-chose-this");
    assert_eq!(id.as_str(), "caller-chose-this");
    assert_eq!(id, "caller-chose-this");
}

#[test]
fn id_serde_is_transparent() {
    let id = JobId::from_string("job-abc");
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, "\"job-abc\"");

    let parsed: JobId = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, id);
}

#[test]
fn id_borrow_allows_str_map_lookup() {
    use std::collections::HashMap;

    let mut map: HashMap<JobId, u32> = HashMap::new();
    map.insert(JobId::from_string("job-1"), 7);
    assert_eq!(map.get("job-1"), Some(&7));
}
