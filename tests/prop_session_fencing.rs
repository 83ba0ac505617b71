//! Property tests for session fencing and writer arbitration

use disk_agent_core::device_client::DeviceClient;
use disk_agent_core::models::{AccessMode, ClientId};
use proptest::prelude::*;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(10);

fn new_client() -> DeviceClient {
    DeviceClient::new(TIMEOUT, vec!["d1".to_string()])
}

fn devs() -> Vec<String> {
    vec!["d1".to_string()]
}

proptest! {
    /// A nonzero generation older than the stored one is always fenced,
    /// on acquire and on release alike.
    #[test]
    fn stale_generation_is_always_fenced(
        newer in 2u32..=u32::MAX,
        delta in 1u32..1000,
    ) {
        let older = newer.saturating_sub(delta).max(1);
        prop_assume!(older < newer);

        let dc = new_client();
        let vm = ClientId::Regular("vm-a".to_string());
        let now = Instant::now();

        dc.acquire_devices(&devs(), &vm, now, AccessMode::ReadWrite, 1, "vol0", newer)
            .unwrap();

        prop_assert!(dc
            .acquire_devices(&devs(), &vm, now, AccessMode::ReadWrite, 1, "vol0", older)
            .is_err());
        prop_assert!(dc.release_devices(&devs(), &vm, "vol0", older).is_err());

        // equal and newer generations pass
        prop_assert!(dc
            .acquire_devices(&devs(), &vm, now, AccessMode::ReadWrite, 1, "vol0", newer)
            .is_ok());
        prop_assert!(dc.release_devices(&devs(), &vm, "vol0", newer).is_ok());
    }

    /// Generation zero never participates in fencing.
    #[test]
    fn zero_generation_bypasses_fencing(stored in 1u32..=u32::MAX) {
        let dc = new_client();
        let vm = ClientId::Regular("vm-a".to_string());
        let now = Instant::now();

        dc.acquire_devices(&devs(), &vm, now, AccessMode::ReadWrite, 1, "vol0", stored)
            .unwrap();

        prop_assert!(dc
            .acquire_devices(&devs(), &vm, now, AccessMode::ReadWrite, 1, "vol0", 0)
            .is_ok());
    }

    /// With an active writer, a second writer wins exactly when its mount
    /// sequence number is strictly greater.
    #[test]
    fn writer_takeover_follows_mount_seq(
        seq_a in 0u64..1000,
        seq_b in 0u64..1000,
    ) {
        let dc = new_client();
        let now = Instant::now();
        let a = ClientId::Regular("vm-a".to_string());
        let b = ClientId::Regular("vm-b".to_string());

        dc.acquire_devices(&devs(), &a, now, AccessMode::ReadWrite, seq_a, "vol0", 1)
            .unwrap();

        let result = dc.acquire_devices(&devs(), &b, now, AccessMode::ReadWrite, seq_b, "vol0", 1);
        let winner = dc.get_writer_session("d1").unwrap().client_id;

        if seq_b > seq_a {
            prop_assert!(result.is_ok());
            prop_assert_eq!(winner, b);
        } else {
            prop_assert!(result.is_err());
            prop_assert_eq!(winner, a);
        }
    }

    /// Read acquires are idempotent: any number of repetitions leaves one
    /// session per distinct client.
    #[test]
    fn reader_sessions_are_idempotent(
        ids in proptest::collection::vec(0u8..5, 1..30),
    ) {
        let dc = new_client();
        let now = Instant::now();

        let mut distinct = std::collections::HashSet::new();
        for id in ids {
            let client = ClientId::Regular(format!("vm-{}", id));
            dc.acquire_devices(&devs(), &client, now, AccessMode::ReadOnly, 0, "vol0", 1)
                .unwrap();
            distinct.insert(id);
        }

        prop_assert_eq!(dc.get_reader_sessions("d1").len(), distinct.len());
    }

    /// Access checks agree with the session snapshots: the writer may do
    /// everything, readers only read, strangers nothing.
    #[test]
    fn access_matches_sessions(
        readers in proptest::collection::hash_set(0u8..4, 0..4),
        writer in proptest::option::of(4u8..8),
    ) {
        let dc = new_client();
        let now = Instant::now();

        for id in &readers {
            dc.acquire_devices(
                &devs(),
                &ClientId::Regular(format!("vm-{}", id)),
                now,
                AccessMode::ReadOnly,
                0,
                "vol0",
                1,
            )
            .unwrap();
        }
        if let Some(id) = writer {
            dc.acquire_devices(
                &devs(),
                &ClientId::Regular(format!("vm-{}", id)),
                now,
                AccessMode::ReadWrite,
                1,
                "vol0",
                1,
            )
            .unwrap();
        }

        for id in 0u8..8 {
            let client = ClientId::Regular(format!("vm-{}", id));
            let can_read = dc.access_device("d1", &client, AccessMode::ReadOnly).is_ok();
            let can_write = dc.access_device("d1", &client, AccessMode::ReadWrite).is_ok();

            let is_reader = readers.contains(&id);
            let is_writer = writer == Some(id);
            prop_assert_eq!(can_read, is_reader || is_writer);
            prop_assert_eq!(can_write, is_writer);
        }
    }
}
