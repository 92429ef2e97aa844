//! Property-based tests for annotation parsing and probe math
//!
//! These tests use proptest to generate adversarial annotation payloads and
//! verify that:
//! 1. Parsers never panic, whatever the annotation holds
//! 2. A well-formed token is honored regardless of surrounding garbage
//! 3. Validation is deterministic (same input = same output)

use proptest::prelude::*;

use kstone_operator::backup::{BackupConfig, BackupPolicy};
use kstone_operator::cluster::{parse_extension_url_map, rewrite_client_url, split_host_port};
use kstone_operator::etcd::SecretRef;
use kstone_operator::features::{FeatureName, gate_enabled};
use kstone_operator::inspection::key_labels;

proptest! {
    #[test]
    fn gate_parsing_never_panics(expression in ".*") {
        for name in FeatureName::ALL {
            let _ = gate_enabled(&expression, name);
        }
    }

    #[test]
    fn valid_gate_token_survives_surrounding_garbage(
        prefix in "[a-z=,]{0,24}",
        suffix in "[a-z=,]{0,24}",
    ) {
        let expression = format!("{},monitor=true,{}", prefix, suffix);
        prop_assert!(gate_enabled(&expression, FeatureName::Monitor));
    }

    #[test]
    fn gate_is_deterministic(expression in ".{0,64}") {
        let first = gate_enabled(&expression, FeatureName::Backup);
        let second = gate_enabled(&expression, FeatureName::Backup);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn key_labels_never_panic(key in ".{0,128}") {
        let (prefix, resource) = key_labels(&key);
        // labels always derive from the key's own components
        if !prefix.is_empty() {
            prop_assert!(key.contains(&prefix));
        }
        if !resource.is_empty() {
            prop_assert!(key.contains(&resource));
        }
    }

    #[test]
    fn secret_refs_with_many_slashes_are_rejected(
        a in "[a-z]{1,8}", b in "[a-z]{1,8}", c in "[a-z]{1,8}",
    ) {
        let reference = format!("{}/{}/{}", a, b, c);
        prop_assert!(SecretRef::parse(&reference, "default").is_err());
    }

    #[test]
    fn simple_secret_refs_use_the_default_namespace(name in "[a-z][a-z0-9-]{0,16}") {
        let parsed = SecretRef::parse(&name, "kstone").unwrap().unwrap();
        prop_assert_eq!(parsed.namespace, "kstone");
        prop_assert_eq!(parsed.name, name);
    }

    #[test]
    fn extension_map_entries_without_arrow_are_rejected(entry in "[a-z0-9:.]{1,24}") {
        prop_assert!(parse_extension_url_map(&entry).is_err());
    }

    #[test]
    fn unmapped_urls_fall_through_unchanged(
        host in "[a-z0-9.]{1,16}",
        port in 1024u16..65535,
    ) {
        let map = parse_extension_url_map("10.0.0.5:2379->192.168.1.1:32379").unwrap();
        let url = format!("https://{}:{}", host, port);
        if host != "10.0.0.5" || port != 2379 {
            prop_assert_eq!(rewrite_client_url(&url, &map), url);
        }
    }

    #[test]
    fn host_port_round_trips(host in "[a-z0-9.]{1,16}", port in 1u16..65535) {
        let url = format!("http://{}:{}", host, port);
        let (parsed_host, parsed_port) = split_host_port(&url).unwrap();
        prop_assert_eq!(parsed_host, host);
        prop_assert_eq!(parsed_port, port.to_string());
    }

    #[test]
    fn desired_backup_files_never_exceed_max_backups(
        interval in 1u64..200_000,
        max_backups in 0u64..1000,
    ) {
        let config = BackupConfig {
            backup_policy: BackupPolicy {
                backup_interval_in_second: interval,
                max_backups,
                timeout_in_second: 600,
            },
            ..Default::default()
        };
        prop_assert!(config.desired_daily_files() <= max_backups);
    }
}
