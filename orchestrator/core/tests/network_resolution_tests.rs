// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Endpoint address resolution across visibility scopes.

use svcagent_core::domain::network::{find_instance, NetworkError, NetworkInstance, NetworkMapping, NetworkScope};
use svcagent_core::domain::service::{ApiKind, Endpoint, Visibility};

fn endpoint() -> Endpoint {
    Endpoint {
        module: "backend".into(),
        service: "users".into(),
        name: "rest".into(),
        api: ApiKind::Rest,
        visibility: Visibility::Public,
    }
}

fn public_and_native() -> Vec<NetworkMapping> {
    vec![NetworkMapping {
        endpoint: endpoint(),
        instances: vec![
            NetworkInstance::new(NetworkScope::Public, "h", 1),
            NetworkInstance::new(NetworkScope::Native, "127.0.0.1", 2),
        ],
    }]
}

#[test]
fn test_native_scope_resolves_native_instance() {
    let instance = find_instance(&public_and_native(), &endpoint(), NetworkScope::Native).unwrap();
    assert_eq!(instance.port, 2);
    assert_eq!(instance.address(), "127.0.0.1:2");
}

#[test]
fn test_public_scope_resolves_public_instance() {
    let instance = find_instance(&public_and_native(), &endpoint(), NetworkScope::Public).unwrap();
    assert_eq!(instance.port, 1);
    assert_eq!(instance.host, "h");
}

#[test]
fn test_unmatched_scope_is_not_found() {
    let err = find_instance(&public_and_native(), &endpoint(), NetworkScope::Container).unwrap_err();
    assert_eq!(
        err,
        NetworkError::NotFound { endpoint: endpoint().key(), scope: NetworkScope::Container }
    );
}

#[test]
fn test_resolution_ignores_instance_order_across_scopes() {
    let mut mappings = public_and_native();
    mappings[0].instances.reverse();
    let instance = find_instance(&mappings, &endpoint(), NetworkScope::Native).unwrap();
    assert_eq!(instance.port, 2);
}

#[test]
fn test_duplicate_mappings_at_same_scope_are_ambiguous() {
    let mut mappings = public_and_native();
    mappings.push(NetworkMapping {
        endpoint: endpoint(),
        instances: vec![NetworkInstance::new(NetworkScope::Native, "127.0.0.1", 3)],
    });
    assert!(matches!(
        find_instance(&mappings, &endpoint(), NetworkScope::Native),
        Err(NetworkError::Ambiguous { count: 2, .. })
    ));
    // Public still has a single candidate
    assert_eq!(find_instance(&mappings, &endpoint(), NetworkScope::Public).unwrap().port, 1);
}
