use super::support::*;
use crate::connectivity::manager::{parse_stamp, select_stale, stamp_description};
use crate::connectivity::*;
use chrono::NaiveDate;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TWO_HOURS: Duration = Duration::from_secs(7200);

fn manager_for(locator: Arc<FakeLocator>) -> LeaseManager {
    LeaseManager::new(locator, test_settings())
}

fn torrent_spec() -> MappingSpec {
    MappingSpec::new(Protocol::TCP, HOST, 51413, TWO_HOURS).with_description("torrent")
}

async fn connected(gateway: &Arc<FakeGateway>) -> LeaseManager {
    let manager = manager_for(FakeLocator::with_gateway(gateway.clone()));
    manager.discover().await.unwrap();
    manager
}

#[tokio::test]
async fn test_ensure_without_gateway_stays_requested() {
    let manager = manager_for(FakeLocator::empty());
    assert!(manager.discover().await.is_err());

    let status = manager.ensure(torrent_spec()).await.unwrap();
    assert_eq!(status.state, MappingState::Requested);
    assert_eq!(status.external_port, 51413);
    assert_eq!(status.granted_lease, None);
    assert!(manager.wants_gateway().await);
}

#[tokio::test]
async fn test_ensure_maps_same_external_port() {
    let gateway = FakeGateway::new("http://192.168.1.1:5000/ctl/IPConn");
    let manager = connected(&gateway).await;

    let status = manager.ensure(torrent_spec()).await.unwrap();

    assert_eq!(status.state, MappingState::Active);
    assert_eq!(status.external_port, 51413);
    assert_eq!(status.internal.port(), 51413);
    assert_eq!(*status.internal.ip(), HOST);
    assert_eq!(status.granted_lease, Some(TWO_HOURS));

    let entry = gateway.entry(Protocol::TCP, 51413).expect("mapping on gateway");
    assert_eq!(entry.internal_client, HOST.to_string());
    assert!(entry.description.starts_with("portlease "));
    assert!(entry.description.ends_with(" torrent"));
}

#[tokio::test]
async fn test_ensure_is_idempotent() {
    let gateway = FakeGateway::new("http://gw/ctl");
    let manager = connected(&gateway).await;

    let first = manager.ensure(torrent_spec()).await.unwrap();
    let second = manager.ensure(torrent_spec()).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(gateway.add_calls().len(), 1, "Active mapping must not be re-requested");
    assert_eq!(manager.status().await.len(), 1);
}

#[tokio::test]
async fn test_redeclared_lease_is_requested_again() {
    let gateway = FakeGateway::new("http://gw/ctl");
    let manager = connected(&gateway).await;
    manager.ensure(torrent_spec()).await.unwrap();

    let longer = MappingSpec::new(Protocol::TCP, HOST, 51413, Duration::from_secs(14400))
        .with_description("torrent");
    let status = manager.ensure(longer).await.unwrap();

    let calls = gateway.add_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].lease, Duration::from_secs(14400));
    assert_eq!(calls[1].external_port, 51413);
    assert_eq!(status.granted_lease, Some(Duration::from_secs(14400)));
    assert_eq!(status.state, MappingState::Active);
}

#[tokio::test]
async fn test_redeclared_port_hint_moves_mapping() {
    let gateway = FakeGateway::new("http://gw/ctl");
    let manager = connected(&gateway).await;
    let first = manager.ensure(torrent_spec()).await.unwrap();

    let moved = torrent_spec().with_external_port(61413);
    let status = manager.ensure(moved).await.unwrap();

    assert_eq!(status.id, first.id);
    assert_eq!(status.external_port, 61413);
    assert_eq!(status.state, MappingState::Active);
    assert_eq!(
        gateway.delete_calls(),
        vec![MappingKey::new(Protocol::TCP, 51413)]
    );
    assert!(gateway.entry(Protocol::TCP, 51413).is_none());
    assert!(gateway.entry(Protocol::TCP, 61413).is_some());
    assert!(manager.mapping_status(Protocol::TCP, 51413).await.is_none());
}

#[tokio::test]
async fn test_gateway_lease_cap_is_tracked() {
    let gateway = FakeGateway::new("http://gw/ctl");
    gateway.set_lease_cap(Duration::from_secs(3600));
    let manager = connected(&gateway).await;

    let start = Instant::now();
    let status = manager.ensure(torrent_spec()).await.unwrap();
    assert_eq!(status.requested_lease, TWO_HOURS);
    assert_eq!(status.granted_lease, Some(Duration::from_secs(3600)));

    // Renewal follows the granted lease, not the requested one
    let report = manager.reconcile_at(start + Duration::from_secs(1000)).await;
    assert_eq!(report.renewed, 0);
    let report = manager.reconcile_at(start + Duration::from_secs(1801)).await;
    assert_eq!(report.renewed, 1);
}

#[tokio::test]
async fn test_table_lease_wins_over_echoed_request() {
    let gateway = FakeGateway::new("http://gw/ctl");
    gateway.set_lease_cap(Duration::from_secs(3600));
    gateway.set_silent_cap(true);
    let manager = connected(&gateway).await;

    let status = manager.ensure(torrent_spec()).await.unwrap();

    assert_eq!(status.granted_lease, Some(Duration::from_secs(3600)));
}

#[tokio::test]
async fn test_zero_table_lease_keeps_accepted_lease() {
    let gateway = FakeGateway::new("http://gw/ctl");
    gateway.set_hide_leases(true);
    let manager = connected(&gateway).await;

    let status = manager.ensure(torrent_spec()).await.unwrap();

    assert_eq!(status.state, MappingState::Active);
    assert_eq!(status.granted_lease, Some(TWO_HOURS));
}

#[tokio::test]
async fn test_slow_table_read_keeps_accepted_lease() {
    let gateway = FakeGateway::new("http://gw/ctl");
    gateway.set_lease_cap(Duration::from_secs(3600));
    gateway.set_silent_cap(true);
    let manager = connected(&gateway).await;
    gateway.set_table_delay(Duration::from_secs(2));

    let started = Instant::now();
    let status = manager.ensure(torrent_spec()).await.unwrap();

    // The add went through; only the read-back gave up after its own call timeout
    assert!(started.elapsed() < Duration::from_millis(1800));
    assert_eq!(status.state, MappingState::Active);
    assert_eq!(status.granted_lease, Some(TWO_HOURS));
    assert!(gateway.entry(Protocol::TCP, 51413).is_some());
}

#[tokio::test]
async fn test_conflict_moves_to_next_external_port() {
    let gateway = FakeGateway::new("http://gw/ctl");
    gateway.occupy(Protocol::TCP, 51413, OTHER_HOST);
    let manager = connected(&gateway).await;

    let status = manager.ensure(torrent_spec()).await.unwrap();

    assert_eq!(status.state, MappingState::Active);
    assert_eq!(status.external_port, 51414);
    assert_eq!(status.internal.port(), 51413, "internal port is never altered");
    assert_eq!(
        gateway.entry(Protocol::TCP, 51413).unwrap().internal_client,
        OTHER_HOST.to_string(),
        "foreign mapping untouched"
    );
    assert!(manager.mapping_status(Protocol::TCP, 51414).await.is_some());
    assert!(manager.mapping_status(Protocol::TCP, 51413).await.is_none());
}

#[tokio::test]
async fn test_exhausted_ports_report_unavailable() {
    let gateway = FakeGateway::new("http://gw/ctl");
    for port in 51413..51421 {
        gateway.occupy(Protocol::TCP, port, OTHER_HOST);
    }
    let fallback = Arc::new(RecordingFallback::default());
    let manager = LeaseManager::new(FakeLocator::with_gateway(gateway.clone()), test_settings())
        .with_fallback(fallback.clone());
    manager.discover().await.unwrap();

    let err = manager.ensure(torrent_spec()).await.unwrap_err();

    assert_eq!(
        err,
        MappingError::MappingUnavailable {
            protocol: Protocol::TCP,
            internal_port: 51413,
            attempts: 8,
        }
    );
    assert_eq!(gateway.add_calls().len(), 8);
    let status = &manager.status().await[0];
    assert_eq!(status.state, MappingState::Unavailable);
    assert!(status.last_error.is_some());
    assert!(fallback.reasons().contains(&FallbackReason::MappingUnavailable {
        protocol: Protocol::TCP,
        internal_port: 51413,
    }));

    // Unavailable mappings are not retried by reconciliation
    let report = manager.reconcile().await;
    assert_eq!(report.created + report.failed, 0);
    assert_eq!(gateway.add_calls().len(), 8);
}

#[tokio::test]
async fn test_local_mappings_never_share_an_external_port() {
    let gateway = FakeGateway::new("http://gw/ctl");
    let manager = connected(&gateway).await;

    let first = manager
        .ensure(MappingSpec::new(Protocol::UDP, HOST, 9000, TWO_HOURS))
        .await
        .unwrap();
    let second = manager
        .ensure(MappingSpec::new(Protocol::UDP, HOST, 9001, TWO_HOURS).with_external_port(9000))
        .await
        .unwrap();

    assert_eq!(first.external_port, 9000);
    assert_eq!(second.external_port, 9001);
    assert_eq!(second.internal.port(), 9001);

    // Same port number on the other protocol is a different key
    let tcp = manager
        .ensure(MappingSpec::new(Protocol::TCP, HOST, 9000, TWO_HOURS))
        .await
        .unwrap();
    assert_eq!(tcp.external_port, 9000);
}

#[tokio::test]
async fn test_renewal_repeats_the_original_request() {
    let gateway = FakeGateway::new("http://gw/ctl");
    let manager = connected(&gateway).await;

    let start = Instant::now();
    manager.ensure(torrent_spec()).await.unwrap();

    let report = manager.reconcile_at(start + Duration::from_secs(1800)).await;
    assert_eq!(report.renewed, 0, "above the threshold nothing happens");
    assert_eq!(gateway.add_calls().len(), 1);

    let report = manager.reconcile_at(start + Duration::from_secs(3601)).await;
    assert_eq!(report.renewed, 1);

    let calls = gateway.add_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].protocol, calls[0].protocol);
    assert_eq!(calls[1].external_port, calls[0].external_port);
    assert_eq!(calls[1].internal, calls[0].internal);
    assert_eq!(calls[1].lease, calls[0].lease);

    let status = manager.mapping_status(Protocol::TCP, 51413).await.unwrap();
    assert_eq!(status.state, MappingState::Active);
}

#[tokio::test]
async fn test_lease_expires_when_gateway_stays_unreachable() {
    let gateway = FakeGateway::new("http://gw/ctl");
    let manager = connected(&gateway).await;

    let start = Instant::now();
    manager.ensure(torrent_spec()).await.unwrap();
    gateway.set_unreachable(true);

    let report = manager.reconcile_at(start + Duration::from_secs(3601)).await;
    assert_eq!(report.unreachable, 1);
    assert!(report.gateway_unreachable());
    let status = manager.mapping_status(Protocol::TCP, 51413).await.unwrap();
    assert_eq!(status.state, MappingState::RenewalDue);

    let report = manager.reconcile_at(start + Duration::from_secs(7201)).await;
    assert_eq!(report.expired, 1);
    let status = manager.mapping_status(Protocol::TCP, 51413).await.unwrap();
    assert_eq!(status.state, MappingState::Expired);

    // Gateway comes back: the expired mapping is re-created
    gateway.set_unreachable(false);
    let report = manager.reconcile_at(start + Duration::from_secs(7300)).await;
    assert_eq!(report.created, 1);
    let status = manager.mapping_status(Protocol::TCP, 51413).await.unwrap();
    assert_eq!(status.state, MappingState::Active);
}

#[tokio::test]
async fn test_unreachable_gateway_keeps_ensure_requested() {
    let gateway = FakeGateway::new("http://gw/ctl");
    gateway.set_unreachable(true);
    let manager = connected(&gateway).await;

    let status = manager.ensure(torrent_spec()).await.unwrap();
    assert_eq!(status.state, MappingState::Requested);
    assert!(status.last_error.is_some());

    gateway.set_unreachable(false);
    let report = manager.reconcile().await;
    assert_eq!(report.created, 1);
}

#[tokio::test]
async fn test_reconcile_without_gateway_skips() {
    let manager = manager_for(FakeLocator::empty());
    manager.ensure(torrent_spec()).await.unwrap();

    let report = manager.reconcile().await;
    assert_eq!(report.examined, 1);
    assert_eq!(report.skipped, 1);
    assert!(!report.gateway_unreachable());
}

#[tokio::test]
async fn test_permanent_grant_is_refreshed_not_expired() {
    let gateway = FakeGateway::new("http://gw/ctl");
    gateway.set_grant_permanent(true);
    let manager = connected(&gateway).await;

    let start = Instant::now();
    let status = manager.ensure(torrent_spec()).await.unwrap();
    assert_eq!(status.granted_lease, Some(Duration::ZERO));
    assert_eq!(status.remaining, None);

    let report = manager.reconcile_at(start + Duration::from_secs(1800)).await;
    assert_eq!(report.renewed + report.expired, 0);

    gateway.set_unreachable(true);
    let report = manager.reconcile_at(start + Duration::from_secs(100_000)).await;
    assert_eq!(report.expired, 0, "permanent grants never expire locally");
    assert_eq!(report.unreachable, 1);
}

#[tokio::test]
async fn test_release_deletes_and_marks_removed() {
    let gateway = FakeGateway::new("http://gw/ctl");
    let manager = connected(&gateway).await;
    manager.ensure(torrent_spec()).await.unwrap();

    manager.release(Protocol::TCP, 51413).await.unwrap();

    assert_eq!(gateway.delete_calls(), vec![MappingKey::new(Protocol::TCP, 51413)]);
    assert!(gateway.entry(Protocol::TCP, 51413).is_none());
    let status = &manager.status().await[0];
    assert_eq!(status.state, MappingState::Removed);
    assert!(manager.mapping_status(Protocol::TCP, 51413).await.is_none());

    // Removed mappings are never renewed
    let report = manager
        .reconcile_at(Instant::now() + Duration::from_secs(7000))
        .await;
    assert_eq!(report.examined, 0);
    assert_eq!(gateway.add_calls().len(), 1);
}

#[tokio::test]
async fn test_release_unknown_mapping() {
    let manager = manager_for(FakeLocator::empty());
    let err = manager.release(Protocol::UDP, 4000).await.unwrap_err();
    assert_eq!(
        err,
        MappingError::UnknownMapping {
            protocol: Protocol::UDP,
            external_port: 4000,
        }
    );
}

#[tokio::test]
async fn test_release_failure_still_removes_locally() {
    let gateway = FakeGateway::new("http://gw/ctl");
    let manager = connected(&gateway).await;
    manager.ensure(torrent_spec()).await.unwrap();
    gateway.set_unreachable(true);

    assert!(manager.release(Protocol::TCP, 51413).await.is_ok());
    assert_eq!(manager.status().await[0].state, MappingState::Removed);
}

#[tokio::test]
async fn test_released_spec_can_be_declared_again() {
    let gateway = FakeGateway::new("http://gw/ctl");
    let manager = connected(&gateway).await;
    let first = manager.ensure(torrent_spec()).await.unwrap();
    manager.release(Protocol::TCP, 51413).await.unwrap();

    let again = manager.ensure(torrent_spec()).await.unwrap();
    assert_ne!(first.id, again.id);
    assert_eq!(again.state, MappingState::Active);
    assert_eq!(again.external_port, 51413);
    assert_eq!(manager.status().await.len(), 1);
}

#[tokio::test]
async fn test_new_gateway_recreates_mappings() {
    let old = FakeGateway::new("http://192.168.1.1:5000/ctl");
    let locator = FakeLocator::with_gateway(old.clone());
    let manager = manager_for(locator.clone());
    manager.discover().await.unwrap();
    manager.ensure(torrent_spec()).await.unwrap();

    let replacement = FakeGateway::new("http://192.168.1.254:49152/upnp/control");
    locator.set_gateway(Some(replacement.clone()));
    manager.discover().await.unwrap();

    let status = manager.mapping_status(Protocol::TCP, 51413).await.unwrap();
    assert_eq!(status.state, MappingState::Requested);

    let report = manager.reconcile().await;
    assert_eq!(report.created, 1);
    assert!(replacement.entry(Protocol::TCP, 51413).is_some());
}

#[tokio::test]
async fn test_same_gateway_rediscovery_keeps_leases() {
    let gateway = FakeGateway::new("http://gw/ctl");
    let manager = connected(&gateway).await;
    manager.ensure(torrent_spec()).await.unwrap();

    manager.discover().await.unwrap();

    let status = manager.mapping_status(Protocol::TCP, 51413).await.unwrap();
    assert_eq!(status.state, MappingState::Active);
    assert_eq!(gateway.add_calls().len(), 1);
}

#[tokio::test]
async fn test_router_reboot_restored_on_renewal() {
    let gateway = FakeGateway::new("http://gw/ctl");
    let manager = connected(&gateway).await;
    let start = Instant::now();
    manager.ensure(torrent_spec()).await.unwrap();

    gateway.restart();
    assert_eq!(gateway.table_len(), 0);

    manager.reconcile_at(start + Duration::from_secs(3601)).await;
    assert!(gateway.entry(Protocol::TCP, 51413).is_some());
}

#[tokio::test]
async fn test_failed_discovery_drops_gateway_and_engages_fallback() {
    let gateway = FakeGateway::new("http://gw/ctl");
    let locator = FakeLocator::with_gateway(gateway);
    let fallback = Arc::new(RecordingFallback::default());
    let manager =
        LeaseManager::new(locator.clone(), test_settings()).with_fallback(fallback.clone());
    manager.discover().await.unwrap();
    assert!(manager.has_gateway().await);

    locator.set_gateway(None);
    assert_eq!(manager.discover().await.unwrap_err(), MappingError::NotFound);

    assert!(!manager.has_gateway().await);
    assert!(manager.gateway().await.is_none());
    assert_eq!(fallback.reasons(), vec![FallbackReason::NoGateway]);
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let gateway = FakeGateway::new("http://gw/ctl");
    let manager = connected(&gateway).await;
    manager.ensure(torrent_spec()).await.unwrap();
    manager
        .ensure(MappingSpec::new(Protocol::UDP, HOST, 51413, TWO_HOURS))
        .await
        .unwrap();

    let report = manager.shutdown(Duration::from_secs(2)).await;

    assert_eq!(report.released, 2);
    assert_eq!(report.failed, 0);
    assert!(!report.timed_out);
    assert_eq!(gateway.table_len(), 0);
    assert!(manager
        .status()
        .await
        .iter()
        .all(|s| s.state == MappingState::Removed));
}

#[tokio::test]
async fn test_shutdown_respects_deadline() {
    let gateway = FakeGateway::new("http://gw/ctl");
    let manager = connected(&gateway).await;
    manager.ensure(torrent_spec()).await.unwrap();
    gateway.set_delay(Duration::from_millis(500));

    let started = Instant::now();
    let report = manager.shutdown(Duration::from_millis(50)).await;

    assert!(report.timed_out);
    assert_eq!(report.failed, 1);
    assert!(started.elapsed() < Duration::from_millis(450));
    assert_eq!(manager.status().await[0].state, MappingState::Removed);
}

#[tokio::test]
async fn test_shutdown_deadline_covers_waiting_for_the_lock() {
    let gateway = FakeGateway::new("http://gw/ctl");
    let manager = connected(&gateway).await;
    gateway.set_delay(Duration::from_millis(800));

    // A slow ensure holds the mapping lock while its add is in flight
    let busy = manager.clone();
    let pending = tokio::spawn(async move { busy.ensure(torrent_spec()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let report = manager.shutdown(Duration::from_millis(100)).await;

    assert!(report.timed_out);
    assert!(started.elapsed() < Duration::from_millis(400));
    let _ = pending.await;
}

#[tokio::test]
async fn test_invalid_spec_rejected() {
    let manager = manager_for(FakeLocator::empty());
    let spec = MappingSpec::new(Protocol::TCP, HOST, 0, TWO_HOURS);
    assert!(matches!(
        manager.ensure(spec).await,
        Err(MappingError::InvalidSpec(_))
    ));
    assert!(manager.status().await.is_empty());
}

#[tokio::test]
async fn test_reachability_direct_with_public_address() {
    let gateway = FakeGateway::new("http://gw/ctl");
    let manager = connected(&gateway).await;

    assert_eq!(
        manager.reachability().await,
        Reachability::Fallback {
            reason: FallbackReason::NoActiveMapping
        }
    );

    manager.ensure(torrent_spec()).await.unwrap();
    match manager.reachability().await {
        Reachability::Direct { external_ip, ports } => {
            assert_eq!(external_ip, IpAddr::V4(PUBLIC_IP));
            assert_eq!(ports, vec![MappingKey::new(Protocol::TCP, 51413)]);
        }
        other => panic!("expected direct reachability, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reachability_without_gateway() {
    let manager = manager_for(FakeLocator::empty());
    assert_eq!(
        manager.reachability().await,
        Reachability::Fallback {
            reason: FallbackReason::NoGateway
        }
    );
}

#[tokio::test]
async fn test_cgnat_external_address_engages_fallback() {
    let gateway = FakeGateway::new("http://gw/ctl");
    let cgnat: IpAddr = "100.64.12.7".parse().unwrap();
    gateway.set_external_ip(cgnat);
    let fallback = Arc::new(RecordingFallback::default());
    let manager = LeaseManager::new(FakeLocator::with_gateway(gateway), test_settings())
        .with_fallback(fallback.clone());
    manager.discover().await.unwrap();
    manager.ensure(torrent_spec()).await.unwrap();

    assert_eq!(manager.current_external_address().await.unwrap(), cgnat);
    assert!(!manager.reachability().await.is_direct());
    assert_eq!(fallback.reasons(), vec![FallbackReason::CarrierGradeNat(cgnat)]);
}

#[tokio::test]
async fn test_external_address_requires_gateway() {
    let manager = manager_for(FakeLocator::empty());
    assert_eq!(
        manager.current_external_address().await.unwrap_err(),
        MappingError::NotFound
    );
}

#[tokio::test]
async fn test_discovery_purges_stale_mappings() {
    let gateway = FakeGateway::new("http://gw/ctl");
    let today = chrono::Utc::now().date_naive();
    let old_day = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();

    let entry = |port: u16, host: std::net::Ipv4Addr, description: String| MappingEntry {
        protocol: Protocol::UDP,
        external_port: port,
        internal_client: host.to_string(),
        internal_port: port,
        description,
        lease: Duration::ZERO,
    };
    // Yesterday's run on another machine
    gateway.insert_entry(entry(6000, OTHER_HOST, stamp_description("portlease", old_day, "old")));
    // Crashed earlier run on this machine
    gateway.insert_entry(entry(6001, HOST, stamp_description("portlease", today, "crash")));
    // Another machine running today
    gateway.insert_entry(entry(6002, OTHER_HOST, stamp_description("portlease", today, "peer")));
    // Not ours at all
    gateway.insert_entry(entry(6003, HOST, "Skype".to_string()));

    let mut settings = test_settings();
    settings.purge_stale_mappings = true;
    let manager = LeaseManager::new(FakeLocator::with_gateway(gateway.clone()), settings);
    manager.discover().await.unwrap();

    let mut deleted = gateway.delete_calls();
    deleted.sort_by_key(|key| key.external_port);
    assert_eq!(
        deleted,
        vec![
            MappingKey::new(Protocol::UDP, 6000),
            MappingKey::new(Protocol::UDP, 6001),
        ]
    );
    assert!(gateway.entry(Protocol::UDP, 6002).is_some());
    assert!(gateway.entry(Protocol::UDP, 6003).is_some());
}

#[test]
fn test_stamp_description_roundtrip() {
    let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
    assert_eq!(
        stamp_description("portlease", day, "game server"),
        "portlease 2024-03-09 game server"
    );
    assert_eq!(stamp_description("portlease", day, ""), "portlease 2024-03-09");
    assert_eq!(parse_stamp("portlease 2024-03-09 game server", "portlease"), Some(day));
    assert_eq!(parse_stamp("portlease 2024-03-09", "portlease"), Some(day));
}

#[test]
fn test_parse_stamp_rejects_foreign_descriptions() {
    assert_eq!(parse_stamp("Skype UDP at 192.168.1.42", "portlease"), None);
    assert_eq!(parse_stamp("portlease2 2024-03-09", "portlease"), None);
    assert_eq!(parse_stamp("portlease yesterday", "portlease"), None);
    assert_eq!(parse_stamp("portlease", "portlease"), None);
}

#[test]
fn test_select_stale_keeps_tracked_mappings() {
    let today = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
    let yesterday = NaiveDate::from_ymd_opt(2024, 3, 8).unwrap();
    let entries = vec![MappingEntry {
        protocol: Protocol::TCP,
        external_port: 51413,
        internal_client: HOST.to_string(),
        internal_port: 51413,
        description: stamp_description("portlease", yesterday, "torrent"),
        lease: Duration::from_secs(600),
    }];
    let hosts: HashSet<_> = [HOST].into_iter().collect();

    let stale = select_stale(&entries, "portlease", today, &hosts, &HashSet::new());
    assert_eq!(stale, vec![MappingKey::new(Protocol::TCP, 51413)]);

    let tracked: HashSet<_> = [MappingKey::new(Protocol::TCP, 51413)].into_iter().collect();
    let stale = select_stale(&entries, "portlease", today, &hosts, &tracked);
    assert!(stale.is_empty());
}
