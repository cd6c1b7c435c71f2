// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serde_json::json;

#[test]
fn to_env_for_external_job() {
    let env = ChildEnv {
        ident: FrameIdent::job("job-1"),
        endpoint: Endpoint::Unix("/tmp/dl/job_job-1.sock".into()),
        metadata: Some(json!({"tenant": "acme"})),
        job_name: Some("resize".into()),
    };

    let vars = env.to_env();
    let get = |k: &str| {
        vars.iter()
            .find(|(name, _)| name == k)
            .map(|(_, v)| v.as_str())
    };

    assert_eq!(get(ENV_JOB_ID), Some("job-1"));
    assert_eq!(get(ENV_SOCKET_PATH), Some("/tmp/dl/job_job-1.sock"));
    assert_eq!(get(ENV_JOB_NAME), Some("resize"));
    assert_eq!(get(ENV_METADATA), Some(r#"{"tenant":"acme"}"#));
    assert_eq!(get(ENV_PROCESS_ID), None);
    assert_eq!(get(ENV_TCP_PORT), None);
}

#[test]
fn to_env_for_managed_process_over_tcp() {
    let env = ChildEnv {
        ident: FrameIdent::process("prc-7"),
        endpoint: Endpoint::Tcp(50321),
        metadata: None,
        job_name: None,
    };

    let vars = env.to_env();
    assert!(vars.iter().any(|(k, v)| k == ENV_PROCESS_ID && v == "prc-7"));
    assert!(vars.iter().any(|(k, v)| k == ENV_TCP_PORT && v == "50321"));
    assert!(!vars.iter().any(|(k, _)| k == ENV_SOCKET_PATH));
    assert!(!vars.iter().any(|(k, _)| k == ENV_METADATA));
}

#[test]
fn from_env_reads_the_contract_back() {
    // The only test touching these variables; no serialization needed.
    std::env::set_var(ENV_JOB_ID, "job-env");
    std::env::set_var(ENV_SOCKET_PATH, "/tmp/dl/job_job-env.sock");
    std::env::set_var(ENV_JOB_NAME, "resize");
    std::env::set_var(ENV_METADATA, r#"{"tenant":"acme"}"#);
    std::env::remove_var(ENV_PROCESS_ID);
    std::env::remove_var(ENV_TCP_PORT);

    let env = ChildEnv::from_env().unwrap();
    assert_eq!(env.ident, FrameIdent::job("job-env"));
    assert_eq!(env.endpoint, Endpoint::Unix("/tmp/dl/job_job-env.sock".into()));
    assert_eq!(env.job_name.as_deref(), Some("resize"));
    assert_eq!(env.metadata, Some(json!({"tenant": "acme"})));

    for var in [ENV_JOB_ID, ENV_SOCKET_PATH, ENV_JOB_NAME, ENV_METADATA] {
        std::env::remove_var(var);
    }
}

#[test]
fn instance_ident_has_no_identity_var() {
    let env = ChildEnv {
        ident: FrameIdent::instance("wfi-3"),
        endpoint: Endpoint::Unix("/tmp/dl/wfl_wfi-3.sock".into()),
        metadata: None,
        job_name: None,
    };
    let vars = env.to_env();
    assert!(!vars.iter().any(|(k, _)| k == ENV_JOB_ID || k == ENV_PROCESS_ID));
    assert!(vars.iter().any(|(k, _)| k == ENV_SOCKET_PATH));
}
