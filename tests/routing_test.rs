use change_log::{
    BatchStatus, BatchStore, ChangeLog, DataGap, EventType, GapStore, NewDataRow, Node, NodeStore,
    UNROUTED_NODE_ID,
};
use data_router::config::{
    BatchAlgorithm, ChannelConfig, NodeGroupLink, RouterConfig, RoutingConfig, TriggerConfig,
    TriggerRouterConfig,
};
use data_router::error::RouterError;
use data_router::routers::{
    DataMetaData, DataRouter, LoggingConfigurationListener, RecordingConfigurationListener,
    RouteResult, RouterRegistry,
};
use data_router::routing::{ChannelRouterContext, RoutingService, UNROUTED_ROUTER_ID};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

fn corp_config() -> RoutingConfig {
    let mut config = RoutingConfig::new("corp", "corp");
    config.channels.push(ChannelConfig::new("default"));
    config.group_links.push(NodeGroupLink {
        source_node_group_id: "corp".into(),
        target_node_group_id: "store".into(),
    });
    config
}

/// Sends `table` rows on `channel` through `router`.
fn add_route(config: &mut RoutingConfig, table: &str, channel: &str, router: RouterConfig) {
    config.triggers.push(TriggerConfig {
        trigger_id: table.to_string(),
        source_table_name: table.to_string(),
        channel_id: channel.to_string(),
    });
    config.trigger_routers.push(TriggerRouterConfig {
        trigger_id: table.to_string(),
        router_id: router.router_id.clone(),
        enabled: true,
    });
    config.routers.push(router);
}

fn service_with(config: RoutingConfig, registry: RouterRegistry) -> RoutingService {
    RoutingService::new(Arc::new(config), Arc::new(registry)).unwrap()
}

fn service(config: RoutingConfig) -> RoutingService {
    service_with(
        config,
        RouterRegistry::with_builtin(Arc::new(LoggingConfigurationListener)),
    )
}

fn register_stores(log: &ChangeLog, stores: &[&str]) {
    let nodes = NodeStore::new(log.connection());
    nodes.upsert(&Node::new("corp", "corp")).unwrap();
    for store in stores {
        nodes.upsert(&Node::new(store, "store")).unwrap();
    }
}

fn item(txid: &str) -> NewDataRow {
    NewDataRow::new("item", EventType::Insert, "default")
        .with_column("ITEM_ID", Some("1"))
        .with_transaction(txid)
}

/// `(data_id, node_id, router_id)` for every routed event, in routing order.
fn routed_events(log: &ChangeLog, channel: &str) -> Vec<(i64, String, String)> {
    let store = BatchStore::new(log.connection());
    let mut out = Vec::new();
    for batch in store.list_batches(channel).unwrap() {
        for event in store.list_data_events(batch.batch_id).unwrap() {
            out.push((event.data_id, batch.node_id.clone(), event.router_id));
        }
    }
    out.sort();
    out
}

fn gap_ranges(log: &ChangeLog, channel: &str) -> Vec<(i64, i64)> {
    GapStore::new(log.connection())
        .list(channel)
        .unwrap()
        .into_iter()
        .map(|gap| (gap.start_id, gap.end_id))
        .collect()
}

/// Fails the first row it sees, then behaves like the default router.
#[derive(Default)]
struct FlakyRouter {
    calls: AtomicUsize,
}

impl DataRouter for FlakyRouter {
    fn route_to_nodes(
        &self,
        _ctx: &mut ChannelRouterContext<'_>,
        data: &DataMetaData<'_>,
        nodes: &[Node],
        _initial_load: bool,
    ) -> RouteResult {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(RouterError::Failed {
                router_id: data.router.router_id.clone(),
                message: "connection reset".to_string(),
            });
        }
        Ok(Some(nodes.iter().map(|node| node.node_id.clone()).collect()))
    }
}

#[test]
fn routes_new_change_to_every_candidate_and_moves_trailing_gap() {
    let dir = tempdir().unwrap();
    let mut log = ChangeLog::open(dir.path().join("routing.db")).unwrap();
    register_stores(&log, &["A", "B"]);
    let config = corp_config();
    let max_gap_size = config.settings.max_gap_size;

    let gaps = GapStore::new(log.connection());
    gaps.insert("default", &DataGap::new(1, 499)).unwrap();
    gaps.insert("default", &DataGap::new(500, 500 + max_gap_size - 1))
        .unwrap();
    log.append_with_id(
        500,
        &NewDataRow::new("CUSTOMER", EventType::Insert, "default")
            .with_column("CUSTOMER_ID", Some("17"))
            .with_transaction("T9"),
    )
    .unwrap();

    let stats = service(config)
        .route_channel(&mut log, "default", &AtomicBool::new(false))
        .unwrap();
    assert_eq!(stats.rows_read, 1);
    assert_eq!(stats.data_events, 2);
    assert_eq!(stats.batch_ids.len(), 2);

    assert_eq!(
        routed_events(&log, "default"),
        vec![
            (500, "A".to_string(), "default".to_string()),
            (500, "B".to_string(), "default".to_string()),
        ]
    );
    assert_eq!(
        gap_ranges(&log, "default"),
        vec![(1, 499), (501, 501 + max_gap_size - 1)]
    );
}

#[test]
fn events_of_one_transaction_keep_change_order() {
    let dir = tempdir().unwrap();
    let mut log = ChangeLog::open(dir.path().join("routing.db")).unwrap();
    register_stores(&log, &["A"]);
    for id in 100..=102 {
        log.append_with_id(id, &item("T1")).unwrap();
    }

    service(corp_config())
        .route_channel(&mut log, "default", &AtomicBool::new(false))
        .unwrap();

    let store = BatchStore::new(log.connection());
    let batches = store.list_batches("default").unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].node_id, "A");
    assert_eq!(batches[0].data_row_count, 3);
    assert_eq!(batches[0].first_data_id, 100);
    assert_eq!(batches[0].last_data_id, 102);
    let ids: Vec<i64> = store
        .list_data_events(batches[0].batch_id)
        .unwrap()
        .iter()
        .map(|event| event.data_id)
        .collect();
    assert_eq!(ids, vec![100, 101, 102]);
}

#[test]
fn transactional_channel_never_splits_a_source_transaction() {
    let dir = tempdir().unwrap();
    let mut log = ChangeLog::open(dir.path().join("routing.db")).unwrap();
    register_stores(&log, &["A"]);
    for _ in 0..3 {
        log.append(&item("T1")).unwrap();
    }
    for _ in 0..2 {
        log.append(&item("T2")).unwrap();
    }
    let mut config = corp_config();
    config.channels[0].batch_algorithm = BatchAlgorithm::Transactional;

    service(config)
        .route_channel(&mut log, "default", &AtomicBool::new(false))
        .unwrap();

    let batches = BatchStore::new(log.connection())
        .list_batches("default")
        .unwrap();
    let bounds: Vec<(i64, i64, u64)> = batches
        .iter()
        .map(|batch| (batch.first_data_id, batch.last_data_id, batch.data_row_count))
        .collect();
    assert_eq!(bounds, vec![(1, 3, 3), (4, 5, 2)]);
}

#[test]
fn default_channel_closes_full_batches_only_between_transactions() {
    let dir = tempdir().unwrap();
    let mut log = ChangeLog::open(dir.path().join("routing.db")).unwrap();
    register_stores(&log, &["A"]);
    for _ in 0..3 {
        log.append(&item("T1")).unwrap();
    }
    log.append(&item("T2")).unwrap();
    let mut config = corp_config();
    config.channels[0].max_batch_size = 2;

    service(config)
        .route_channel(&mut log, "default", &AtomicBool::new(false))
        .unwrap();

    let counts: Vec<u64> = BatchStore::new(log.connection())
        .list_batches("default")
        .unwrap()
        .iter()
        .map(|batch| batch.data_row_count)
        .collect();
    assert_eq!(counts, vec![3, 1]);
}

#[test]
fn retry_after_router_failure_matches_clean_run() {
    let routed = |fail_first: bool| {
        let dir = tempdir().unwrap();
        let mut log = ChangeLog::open(dir.path().join("routing.db")).unwrap();
        register_stores(&log, &["A", "B"]);
        for txid in ["T1", "T1", "T2"] {
            log.append(&item(txid)).unwrap();
        }

        let mut config = corp_config();
        add_route(
            &mut config,
            "item",
            "default",
            RouterConfig::new("flaky-router", "flaky", "corp", "store"),
        );
        let flaky = Arc::new(FlakyRouter::default());
        if !fail_first {
            flaky.calls.store(1, Ordering::SeqCst);
        }
        let mut registry = RouterRegistry::with_builtin(Arc::new(LoggingConfigurationListener));
        registry.register("flaky", flaky);
        let service = service_with(config, registry);
        let cancel = AtomicBool::new(false);

        if fail_first {
            let err = service
                .route_channel(&mut log, "default", &cancel)
                .unwrap_err();
            assert!(format!("{:#}", err).contains("connection reset"));
            assert!(routed_events(&log, "default").is_empty());
            assert!(gap_ranges(&log, "default").is_empty());
        }
        service.route_channel(&mut log, "default", &cancel).unwrap();
        (routed_events(&log, "default"), gap_ranges(&log, "default"))
    };

    let (retried_events, retried_gaps) = routed(true);
    let (clean_events, clean_gaps) = routed(false);
    assert_eq!(retried_events.len(), 6);
    assert_eq!(retried_events, clean_events);
    assert_eq!(retried_gaps, clean_gaps);
}

#[test]
fn redirect_expression_from_config_file() {
    let config = RoutingConfig::from_toml_str(
        r#"
[identity]
node_id = "corp"
node_group_id = "corp"

[[channel]]
channel_id = "default"

[[group_link]]
source_node_group_id = "corp"
target_node_group_id = "store"

[[router]]
router_id = "store-redirect"
router_type = "column"
expression = "STORE_ID=:REDIRECT_NODE"
source_node_group_id = "corp"
target_node_group_id = "store"

[[trigger]]
trigger_id = "sale"
source_table_name = "sale"
channel_id = "default"

[[trigger_router]]
trigger_id = "sale"
router_id = "store-redirect"

[redirects]
"42" = "nodeB"
"#,
    )
    .unwrap();

    let dir = tempdir().unwrap();
    let mut log = ChangeLog::open(dir.path().join("routing.db")).unwrap();
    register_stores(&log, &["nodeA", "nodeB"]);
    for store_id in ["42", "7"] {
        log.append(
            &NewDataRow::new("SALE", EventType::Insert, "default")
                .with_column("STORE_ID", Some(store_id)),
        )
        .unwrap();
    }

    let stats = service(config)
        .route_channel(&mut log, "default", &AtomicBool::new(false))
        .unwrap();
    assert_eq!(stats.rows_routed, 1);
    assert_eq!(stats.rows_unrouted, 1);

    assert_eq!(
        routed_events(&log, "default"),
        vec![
            (1, "nodeB".to_string(), "store-redirect".to_string()),
            (2, UNROUTED_NODE_ID.to_string(), UNROUTED_ROUTER_ID.to_string()),
        ]
    );
    let unrouted = BatchStore::new(log.connection())
        .list_batches("default")
        .unwrap()
        .into_iter()
        .find(|batch| batch.node_id == UNROUTED_NODE_ID)
        .unwrap();
    assert_eq!(unrouted.status, BatchStatus::Ok);
}

#[test]
fn column_match_routes_by_row_value() {
    let dir = tempdir().unwrap();
    let mut log = ChangeLog::open(dir.path().join("routing.db")).unwrap();
    register_stores(&log, &["N1", "N2"]);
    for status in ["C", "I"] {
        log.append(
            &NewDataRow::new("orders", EventType::Update, "default")
                .with_column("STATUS", Some(status)),
        )
        .unwrap();
    }
    let mut config = corp_config();
    add_route(
        &mut config,
        "orders",
        "default",
        RouterConfig::new("completed", "column", "corp", "store").with_expression("STATUS=C"),
    );

    service(config)
        .route_channel(&mut log, "default", &AtomicBool::new(false))
        .unwrap();

    let nodes_for = |data_id: i64| -> BTreeSet<String> {
        routed_events(&log, "default")
            .into_iter()
            .filter(|(id, _, _)| *id == data_id)
            .map(|(_, node, _)| node)
            .collect()
    };
    assert_eq!(nodes_for(1), BTreeSet::from(["N1".to_string(), "N2".to_string()]));
    assert_eq!(nodes_for(2), BTreeSet::from([UNROUTED_NODE_ID.to_string()]));
}

#[test]
fn invalid_expression_leaves_rows_unrouted_without_failing_the_pass() {
    let dir = tempdir().unwrap();
    let mut log = ChangeLog::open(dir.path().join("routing.db")).unwrap();
    register_stores(&log, &["N1"]);
    for _ in 0..2 {
        log.append(&NewDataRow::new("orders", EventType::Insert, "default"))
            .unwrap();
    }
    let mut config = corp_config();
    add_route(
        &mut config,
        "orders",
        "default",
        RouterConfig::new("broken", "column", "corp", "store").with_expression("STATUS"),
    );

    let stats = service(config)
        .route_channel(&mut log, "default", &AtomicBool::new(false))
        .unwrap();
    assert_eq!(stats.router_errors, 2);
    assert_eq!(stats.rows_unrouted, 2);
}

#[test]
fn late_commit_is_routed_from_its_gap() {
    let dir = tempdir().unwrap();
    let mut log = ChangeLog::open(dir.path().join("routing.db")).unwrap();
    register_stores(&log, &["A"]);
    let config = corp_config();
    let max_gap_size = config.settings.max_gap_size;
    let service = service(config);
    let cancel = AtomicBool::new(false);

    for id in [1, 2, 3, 5] {
        log.append_with_id(id, &item(&format!("T{id}"))).unwrap();
    }
    service.route_channel(&mut log, "default", &cancel).unwrap();
    assert_eq!(
        gap_ranges(&log, "default"),
        vec![(4, 4), (6, 6 + max_gap_size - 1)]
    );

    log.append_with_id(4, &item("T4")).unwrap();
    let stats = service.route_channel(&mut log, "default", &cancel).unwrap();
    assert_eq!(stats.rows_read, 1);
    assert_eq!(gap_ranges(&log, "default"), vec![(6, 6 + max_gap_size - 1)]);

    let ids: Vec<i64> = routed_events(&log, "default")
        .into_iter()
        .map(|(id, _, _)| id)
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
}

#[test]
fn rows_past_the_trailing_gap_are_routed_on_the_next_pass() {
    let dir = tempdir().unwrap();
    let mut log = ChangeLog::open(dir.path().join("routing.db")).unwrap();
    register_stores(&log, &["A"]);
    let mut config = corp_config();
    config.settings.max_gap_size = 10;
    let service = service(config);
    let cancel = AtomicBool::new(false);

    GapStore::new(log.connection())
        .insert("default", &DataGap::new(1, 10))
        .unwrap();
    log.append_with_id(25, &item("T1")).unwrap();

    let first = service.route_channel(&mut log, "default", &cancel).unwrap();
    assert_eq!(first.rows_read, 0);
    assert_eq!(gap_ranges(&log, "default"), vec![(1, 10), (11, 34)]);

    let second = service.route_channel(&mut log, "default", &cancel).unwrap();
    assert_eq!(second.rows_read, 1);
    assert_eq!(
        gap_ranges(&log, "default"),
        vec![(1, 10), (11, 24), (26, 35)]
    );
    assert_eq!(
        routed_events(&log, "default"),
        vec![(25, "A".to_string(), "default".to_string())]
    );
}

#[test]
fn configuration_events_are_delivered_only_after_commit() {
    let dir = tempdir().unwrap();
    let mut log = ChangeLog::open(dir.path().join("routing.db")).unwrap();
    register_stores(&log, &["A"]);
    log.append(
        &NewDataRow::new("sym_channel", EventType::Update, "config")
            .with_column("CHANNEL_ID", Some("sale")),
    )
    .unwrap();
    log.append(&NewDataRow::new("item", EventType::Insert, "config"))
        .unwrap();

    let mut config = corp_config();
    config.channels.push(ChannelConfig::new("config"));
    add_route(
        &mut config,
        "sym_channel",
        "config",
        RouterConfig::new("config-changes", "config", "corp", "store"),
    );
    add_route(
        &mut config,
        "item",
        "config",
        RouterConfig::new("flaky-router", "flaky", "corp", "store"),
    );
    let listener = Arc::new(RecordingConfigurationListener::default());
    let mut registry = RouterRegistry::with_builtin(listener.clone());
    registry.register("flaky", Arc::new(FlakyRouter::default()));
    let service = service_with(config, registry);
    let cancel = AtomicBool::new(false);

    assert!(service.route_channel(&mut log, "config", &cancel).is_err());
    assert_eq!(listener.count("reload_channels"), 0);

    service.route_channel(&mut log, "config", &cancel).unwrap();
    assert_eq!(listener.count("reload_channels"), 1);
    assert_eq!(listener.count("sync_triggers"), 0);
    assert_eq!(listener.count("reload_parameters"), 0);
}

#[test]
fn route_all_reports_each_channel() {
    let dir = tempdir().unwrap();
    let mut log = ChangeLog::open(dir.path().join("routing.db")).unwrap();
    register_stores(&log, &["A"]);
    log.append(&item("T1")).unwrap();
    log.append(&NewDataRow::new("sale", EventType::Insert, "sale"))
        .unwrap();
    let mut config = corp_config();
    config.channels.push(ChannelConfig::new("sale"));
    let mut disabled = ChannelConfig::new("archive");
    disabled.enabled = false;
    config.channels.push(disabled);

    let stats = service(config).route_all(&mut log, &AtomicBool::new(false));
    assert!(stats.is_success());
    let channels: Vec<&str> = stats
        .channels
        .iter()
        .map(|channel| channel.channel_id.as_str())
        .collect();
    assert_eq!(channels, vec!["default", "sale"]);
    assert_eq!(stats.rows_read(), 2);
}

#[test]
fn router_shared_by_two_triggers_routes_each_row_once() {
    let dir = tempdir().unwrap();
    let mut log = ChangeLog::open(dir.path().join("routing.db")).unwrap();
    register_stores(&log, &["A"]);
    log.append(&item("T1")).unwrap();
    log.append(
        &NewDataRow::new("item", EventType::Reload, "default").with_node_list("A,A"),
    )
    .unwrap();

    let mut config = corp_config();
    config
        .routers
        .push(RouterConfig::new("r", "default", "corp", "store"));
    for trigger_id in ["t1", "t2"] {
        config.triggers.push(TriggerConfig {
            trigger_id: trigger_id.to_string(),
            source_table_name: "item".to_string(),
            channel_id: "default".to_string(),
        });
        config.trigger_routers.push(TriggerRouterConfig {
            trigger_id: trigger_id.to_string(),
            router_id: "r".to_string(),
            enabled: true,
        });
    }

    let stats = service(config)
        .route_channel(&mut log, "default", &AtomicBool::new(false))
        .unwrap();
    assert_eq!(stats.rows_routed, 2);
    assert_eq!(
        routed_events(&log, "default"),
        vec![
            (1, "A".to_string(), "r".to_string()),
            (2, "A".to_string(), "reload".to_string()),
        ]
    );
}
