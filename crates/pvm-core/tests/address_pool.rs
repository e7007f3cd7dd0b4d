mod common;

use std::sync::Arc;

use common::{harness, pool_request, seed_pool};
use futures_util::future::join_all;
use pvm_core::{AddressFilter, AddressStatus, Assignment, ErrorKind, Pagination, PoolUpdate};
use uuid::Uuid;

fn owned_by(owner: Uuid, hostname: &str) -> Assignment {
    Assignment {
        owner_id: Some(owner),
        hostname: Some(hostname.into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn create_pool_materializes_every_host_but_the_gateway() {
    let h = harness();
    let pool = seed_pool(&h).await;
    assert_eq!(pool.network, "10.0.0.0/24");
    assert_eq!(pool.subnet_mask, "255.255.255.0");

    let all = h
        .addresses
        .list_addresses(
            &AddressFilter {
                pool_id: Some(pool.id),
                ..Default::default()
            },
            Pagination {
                offset: 0,
                limit: 1000,
            },
        )
        .await
        .unwrap();

    assert_eq!(all.len(), 253);
    assert!(all.iter().all(|a| a.status == AddressStatus::Available));
    assert_eq!(all.first().unwrap().address, "10.0.0.2");
    assert_eq!(all.last().unwrap().address, "10.0.0.254");
    assert!(all.iter().all(|a| a.address != "10.0.0.1"));
}

#[tokio::test]
async fn create_pool_accepts_a_separate_subnet_mask() {
    let h = harness();
    let mut req = pool_request("lan", "192.168.1.0", "192.168.1.1");
    req.subnet_mask = Some("255.255.255.0".into());

    let pool = h.addresses.create_pool(&req).await.unwrap();
    assert_eq!(pool.network, "192.168.1.0/24");
    assert_eq!(h.addresses.statistics(Some(pool.id)).await.unwrap().total, 253);
}

#[tokio::test]
async fn create_pool_masks_host_bits_off_the_network() {
    let h = harness();
    let mut req = pool_request("lan", "192.168.2.5", "192.168.2.1");
    req.subnet_mask = Some("255.255.255.0".into());

    let pool = h.addresses.create_pool(&req).await.unwrap();
    assert_eq!(pool.network, "192.168.2.0/24");
    assert_eq!(h.addresses.statistics(Some(pool.id)).await.unwrap().total, 253);
}

#[tokio::test]
async fn malformed_pools_are_rejected_without_side_effects() {
    let h = harness();

    let mut bad_mask = pool_request("a", "10.0.0.0", "10.0.0.1");
    bad_mask.subnet_mask = Some("255.0.255.0".into());
    let mut bad_dns = pool_request("b", "10.0.0.0/24", "10.0.0.1");
    bad_dns.dns_servers = vec!["8.8.8.8".into(), "dns.example".into()];
    let mut bad_vlan = pool_request("c", "10.0.0.0/24", "10.0.0.1");
    bad_vlan.vlan_id = Some(4095);

    let cases = [
        bad_mask,
        bad_dns,
        bad_vlan,
        pool_request("d", "10.0.0.0/24", "10.0.1.1"),
        pool_request("e", "10.0.0.0/24", "10.0.0.0"),
        pool_request("f", "10.0.0.0/24", "gateway"),
        pool_request("g", "10.0.0/24", "10.0.0.1"),
        pool_request("h", "10.0.0.0/8", "10.0.0.1"),
        pool_request(" ", "10.0.0.0/24", "10.0.0.1"),
    ];
    for req in &cases {
        let err = h.addresses.create_pool(req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{req:?}: {err}");
    }

    assert!(h.addresses.list_pools(Pagination::default()).await.unwrap().is_empty());
    assert_eq!(h.addresses.statistics(None).await.unwrap().total, 0);
}

#[tokio::test]
async fn overlapping_pools_conflict() {
    let h = harness();
    seed_pool(&h).await;

    let err = h
        .addresses
        .create_pool(&pool_request("lan-2", "10.0.0.0/25", "10.0.0.126"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn allocate_twice_conflicts() {
    let h = harness();
    seed_pool(&h).await;
    let owner = Uuid::new_v4();

    let allocated = h
        .addresses
        .allocate("10.0.0.7", owned_by(owner, "web-1"))
        .await
        .unwrap();
    assert_eq!(allocated.status, AddressStatus::Allocated);
    assert_eq!(allocated.owner_id, Some(owner));
    assert_eq!(allocated.hostname.as_deref(), Some("web-1"));

    let err = h
        .addresses
        .allocate("10.0.0.7", owned_by(Uuid::new_v4(), "web-2"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let current = h.addresses.get_address("10.0.0.7").await.unwrap();
    assert_eq!(current.owner_id, Some(owner));
}

#[tokio::test]
async fn unknown_and_malformed_addresses() {
    let h = harness();
    seed_pool(&h).await;

    let missing = h
        .addresses
        .allocate("10.9.9.9", Assignment::default())
        .await
        .unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NotFound);

    let malformed = h.addresses.release("10.0.0.300").await.unwrap_err();
    assert_eq!(malformed.kind(), ErrorKind::Validation);

    let bad_mac = h
        .addresses
        .allocate(
            "10.0.0.8",
            Assignment {
                mac_address: Some("52:54:00".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(bad_mac.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn release_is_not_idempotent() {
    let h = harness();
    seed_pool(&h).await;

    let err = h.addresses.release("10.0.0.9").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    h.addresses
        .allocate(
            "10.0.0.9",
            Assignment {
                owner_id: Some(Uuid::new_v4()),
                hostname: Some("db-1".into()),
                mac_address: Some("52:54:00:12:34:56".into()),
                notes: Some("primary".into()),
            },
        )
        .await
        .unwrap();

    let released = h.addresses.release("10.0.0.9").await.unwrap();
    assert_eq!(released.status, AddressStatus::Available);
    assert_eq!(released.owner_id, None);
    assert_eq!(released.hostname, None);
    assert_eq!(released.mac_address, None);
    assert_eq!(released.notes, None);

    assert_eq!(
        h.addresses.release("10.0.0.9").await.unwrap_err().kind(),
        ErrorKind::Conflict
    );
}

#[tokio::test]
async fn reserved_addresses_are_skipped_and_releasable() {
    let h = harness();
    seed_pool(&h).await;

    let reserved = h
        .addresses
        .reserve("10.0.0.2", Some("router".into()))
        .await
        .unwrap();
    assert_eq!(reserved.status, AddressStatus::Reserved);
    assert_eq!(reserved.notes.as_deref(), Some("router"));

    let next = h.addresses.get_available(None).await.unwrap().unwrap();
    assert_eq!(next.address, "10.0.0.3");

    assert_eq!(
        h.addresses
            .allocate("10.0.0.2", Assignment::default())
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::Conflict
    );

    h.addresses.release("10.0.0.2").await.unwrap();
    let next = h.addresses.get_available(None).await.unwrap().unwrap();
    assert_eq!(next.address, "10.0.0.2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocations_have_exactly_one_winner() {
    let h = harness();
    seed_pool(&h).await;
    let addresses = Arc::new(h.addresses.clone());

    let attempts = (0..32).map(|i| {
        let addresses = addresses.clone();
        tokio::spawn(async move {
            addresses
                .allocate("10.0.0.50", owned_by(Uuid::new_v4(), &format!("vm-{i}")))
                .await
        })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.kind() == ErrorKind::Conflict))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(conflicts, 31);

    let stored = h.addresses.get_address("10.0.0.50").await.unwrap();
    assert_eq!(stored.status, AddressStatus::Allocated);
    let winner = results.into_iter().find_map(Result::ok).unwrap();
    assert_eq!(stored.owner_id, winner.owner_id);
}

#[tokio::test]
async fn statistics_of_empty_inventory_are_zero() {
    let h = harness();
    let stats = h.addresses.statistics(None).await.unwrap();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.available_percent, 0.0);
    assert_eq!(stats.allocated_percent, 0.0);
    assert_eq!(stats.reserved_percent, 0.0);

    // A /32 whose only host is the gateway holds no addresses at all.
    let pool = h
        .addresses
        .create_pool(&pool_request("p2p", "10.1.0.1/32", "10.1.0.1"))
        .await
        .unwrap();
    let stats = h.addresses.statistics(Some(pool.id)).await.unwrap();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.available_percent, 0.0);
}

#[tokio::test]
async fn statistics_count_each_status() {
    let h = harness();
    let pool = seed_pool(&h).await;
    h.addresses
        .allocate("10.0.0.2", Assignment::default())
        .await
        .unwrap();
    h.addresses.reserve("10.0.0.3", None).await.unwrap();

    let stats = h.addresses.statistics(Some(pool.id)).await.unwrap();
    assert_eq!(stats.total, 253);
    assert_eq!(stats.available, 251);
    assert_eq!(stats.allocated, 1);
    assert_eq!(stats.reserved, 1);
    assert_eq!(stats.allocated_percent, 0.4);
    assert_eq!(stats.available_percent, 99.21);

    let missing = h.addresses.statistics(Some(Uuid::new_v4())).await.unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn deactivated_pools_are_not_drawn_from() {
    let h = harness();
    let pool = seed_pool(&h).await;

    let updated = h
        .addresses
        .update_pool(
            pool.id,
            &PoolUpdate {
                is_active: Some(false),
                dns_servers: Some(vec!["9.9.9.9".into()]),
                vlan_id: Some(42),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!updated.is_active);
    assert_eq!(updated.dns_servers, vec!["9.9.9.9".to_string()]);
    assert_eq!(updated.vlan_id, Some(42));

    assert!(h.addresses.get_available(None).await.unwrap().is_none());
    assert!(h.addresses.get_available(Some(pool.id)).await.unwrap().is_none());

    let err = h
        .addresses
        .update_pool(
            pool.id,
            &PoolUpdate {
                dns_servers: Some(vec!["nope".into()]),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}
