mod common;

use std::sync::Arc;
use std::time::Duration;

use approx::assert_relative_eq;
use common::{vehicle, FakeApi, RecordingSink, SinkCommand};
use nysse_live_map::config::{FilterSet, Selector};
use nysse_live_map::names::{NameCache, NameResolver};
use nysse_live_map::poller::{CycleOutcome, FeedPoller, PollPhase};
use nysse_live_map::selection::SelectionChange;
use nysse_live_map::sink::{VEHICLES_LAYER, VEHICLES_SOURCE};
use serde_json::json;

fn poller(api: &Arc<FakeApi>, sink: &Arc<RecordingSink>) -> Arc<FeedPoller<FakeApi, RecordingSink>> {
    let names = NameCache::new(NameResolver::new(Arc::clone(api)));
    Arc::new(FeedPoller::new(
        Arc::clone(api),
        Arc::clone(sink),
        names,
        Duration::from_millis(5_000),
        FilterSet::default(),
    ))
}

fn committed_ids(sink: &RecordingSink) -> Vec<String> {
    sink.state
        .source(VEHICLES_SOURCE)
        .map(|collection| {
            collection
                .features
                .iter()
                .filter_map(|feature| feature.property("id").and_then(|id| id.as_str()).map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn cycle_commits_positioned_vehicles() {
    let _guard = nysse_live_map::logger::init_test_logger();
    let api = Arc::new(FakeApi::new());
    let sink = Arc::new(RecordingSink::new());
    api.add_stop("0001", "Keskustori", "61.4981,23.7608");
    api.set_feed(vec![json!({
        "monitoredVehicleJourney": {
            "vehicleRef": "X1",
            "lineRef": "3",
            "operatorRef": "TKL",
            "destinationShortName": "0001",
            "delay": "PT6M",
            "bearing": "180.0",
            "vehicleLocation": { "longitude": "23.76", "latitude": "61.49" }
        }
    })]);

    let poller = poller(&api, &sink);
    let outcome = poller.poll_once().await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Committed { sequence: 1, vehicles: 1, selection: SelectionChange::Idle }
    );
    assert_eq!(poller.phase(), PollPhase::Idle);

    let collection = sink.state.source(VEHICLES_SOURCE).unwrap();
    assert_eq!(collection.features.len(), 1);
    let feature = &collection.features[0];
    assert_relative_eq!(feature.property("delay").and_then(|d| d.as_f64()).unwrap(), 6.0);
    assert_eq!(feature.property("destinationName").and_then(|v| v.as_str()), Some("Keskustori"));
    assert_eq!(feature.property("kind").and_then(|v| v.as_str()), Some("tram"));
    assert_eq!(feature.property("bearing").and_then(|v| v.as_i64()), Some(180));

    let features = poller.features();
    assert_eq!(features[0].coordinates, [23.76, 61.49]);
    assert_eq!(sink.layer_ids(), vec![VEHICLES_LAYER]);
}

#[tokio::test]
async fn vehicle_layer_is_added_only_once() {
    let api = Arc::new(FakeApi::new());
    let sink = Arc::new(RecordingSink::new());
    api.set_feed(vec![vehicle("TKL_1", "8", 23.7, 61.5)]);
    let poller = poller(&api, &sink);

    poller.poll_once().await.unwrap();
    poller.poll_once().await.unwrap();

    assert_eq!(sink.count(&SinkCommand::AddLayer(VEHICLES_LAYER.to_string())), 1);
    assert_eq!(sink.count(&SinkCommand::SetSource(VEHICLES_SOURCE.to_string())), 2);
    assert_eq!(poller.last_committed_sequence(), 2);
}

#[tokio::test]
async fn feed_failure_keeps_previous_collection() {
    let api = Arc::new(FakeApi::new());
    let sink = Arc::new(RecordingSink::new());
    api.set_feed(vec![vehicle("TKL_1", "8", 23.7, 61.5)]);
    let poller = poller(&api, &sink);
    poller.poll_once().await.unwrap();
    let before = sink.commands().len();

    api.take_feed_offline();
    assert!(poller.poll_once().await.is_err());

    assert_eq!(sink.commands().len(), before);
    assert_eq!(committed_ids(&sink), vec!["TKL_1"]);
    assert_eq!(poller.features().len(), 1);
    assert_eq!(poller.phase(), PollPhase::Idle);
}

#[tokio::test]
async fn invalid_and_duplicate_records_are_dropped() {
    let api = Arc::new(FakeApi::new());
    let sink = Arc::new(RecordingSink::new());
    let mut broken = vehicle("TKL_2", "8", 23.7, 61.5);
    broken["monitoredVehicleJourney"]["vehicleLocation"]["latitude"] = json!("north");
    api.set_feed(vec![
        vehicle("TKL_1", "8", 23.70, 61.50),
        broken,
        json!("not a record"),
        vehicle("TKL_3", "3", 23.75, 61.45),
        vehicle("TKL_1", "8", 23.71, 61.51),
    ]);

    let poller = poller(&api, &sink);
    poller.poll_once().await.unwrap();

    assert_eq!(committed_ids(&sink), vec!["TKL_3", "TKL_1"]);
    let features = poller.features();
    assert_eq!(features[1].coordinates, [23.71, 61.51]);
}

#[tokio::test]
async fn empty_snapshot_commits_empty_collection() {
    let api = Arc::new(FakeApi::new());
    let sink = Arc::new(RecordingSink::new());
    api.set_feed(vec![vehicle("TKL_1", "8", 23.7, 61.5)]);
    let poller = poller(&api, &sink);
    poller.poll_once().await.unwrap();

    api.set_feed(Vec::new());
    poller.poll_once().await.unwrap();

    assert!(committed_ids(&sink).is_empty());
    assert!(poller.features().is_empty());
}

#[tokio::test(start_paused = true)]
async fn slower_older_cycle_is_discarded() {
    let api = Arc::new(FakeApi::new());
    let sink = Arc::new(RecordingSink::new());
    let poller = poller(&api, &sink);

    api.set_feed(vec![vehicle("OLD", "8", 23.7, 61.5)]);
    api.delay_next_feed(Duration::from_millis(300));

    let (first, second) = tokio::join!(poller.poll_once(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        api.set_feed(vec![vehicle("NEW", "8", 23.8, 61.6)]);
        poller.poll_once().await
    });

    assert_eq!(first.unwrap(), CycleOutcome::Stale { sequence: 1, last_committed: 2 });
    assert!(matches!(second.unwrap(), CycleOutcome::Committed { sequence: 2, .. }));
    assert_eq!(committed_ids(&sink), vec!["NEW"]);
    assert_eq!(sink.count(&SinkCommand::SetSource(VEHICLES_SOURCE.to_string())), 1);
}

#[tokio::test]
async fn popup_follows_selected_vehicle_and_dismisses_once() {
    let api = Arc::new(FakeApi::new());
    let sink = Arc::new(RecordingSink::new());
    api.set_feed(vec![vehicle("TKL_1", "8", 23.7, 61.5), vehicle("TKL_2", "8", 23.6, 61.4)]);
    let poller = poller(&api, &sink);
    poller.poll_once().await.unwrap();

    let selection = poller.select("TKL_1").unwrap();
    assert_eq!(selection.anchor_coordinates, [23.7, 61.5]);

    api.set_feed(vec![vehicle("TKL_1", "8", 23.72, 61.52), vehicle("TKL_2", "8", 23.6, 61.4)]);
    let outcome = poller.poll_once().await.unwrap();
    assert!(matches!(
        outcome,
        CycleOutcome::Committed { selection: SelectionChange::Moved { .. }, .. }
    ));
    assert_eq!(sink.state.popup().unwrap().coordinates, [23.72, 61.52]);

    api.set_feed(vec![vehicle("TKL_2", "8", 23.6, 61.4)]);
    let outcome = poller.poll_once().await.unwrap();
    assert!(matches!(
        outcome,
        CycleOutcome::Committed { selection: SelectionChange::Dismissed { .. }, .. }
    ));

    poller.poll_once().await.unwrap();
    assert_eq!(sink.count(&SinkCommand::RemovePopup), 1);
    assert!(sink.state.popup().is_none());
    assert!(poller.selection().is_none());
}

#[tokio::test]
async fn stopped_poller_never_commits() {
    let api = Arc::new(FakeApi::new());
    let sink = Arc::new(RecordingSink::new());
    api.set_feed(vec![vehicle("TKL_1", "8", 23.7, 61.5)]);
    let poller = poller(&api, &sink);

    poller.stop();
    let outcome = poller.poll_once().await.unwrap();

    assert_eq!(outcome, CycleOutcome::Stopped { sequence: 1 });
    assert!(sink.commands().is_empty());
}

#[tokio::test]
async fn filter_change_applies_to_next_cycle() {
    let api = Arc::new(FakeApi::new());
    let sink = Arc::new(RecordingSink::new());
    api.set_feed(vec![vehicle("TKL_1", "8", 23.7, 61.5), vehicle("TKL_2", "3", 23.6, 61.4)]);
    let poller = poller(&api, &sink);
    poller.poll_once().await.unwrap();
    assert_eq!(committed_ids(&sink).len(), 2);

    poller.set_filters(FilterSet { lines: Selector::only(["3"]), operators: Selector::All });
    poller.poll_once().await.unwrap();

    assert_eq!(committed_ids(&sink), vec!["TKL_2"]);
}

#[tokio::test]
async fn destination_names_are_cached_across_cycles() {
    let api = Arc::new(FakeApi::new());
    let sink = Arc::new(RecordingSink::new());
    api.add_stop("0001", "Keskustori", "61.4981,23.7608");
    api.set_feed(vec![vehicle("TKL_1", "8", 23.7, 61.5), vehicle("TKL_2", "8", 23.6, 61.4)]);
    let poller = poller(&api, &sink);

    poller.poll_once().await.unwrap();
    poller.poll_once().await.unwrap();

    assert_eq!(api.stop_calls("0001"), 1);
    assert!(poller.features().iter().all(|f| f.destination_name == "Keskustori"));
}

#[tokio::test(start_paused = true)]
async fn background_task_polls_on_interval() {
    let api = Arc::new(FakeApi::new());
    let sink = Arc::new(RecordingSink::new());
    api.set_feed(vec![vehicle("TKL_1", "8", 23.7, 61.5)]);
    let poller = poller(&api, &sink);

    let handle = poller.spawn();
    tokio::time::sleep(Duration::from_millis(12_000)).await;
    poller.stop();
    tokio::time::sleep(Duration::from_millis(5_000)).await;

    assert_eq!(api.feed_calls(), 3);
    assert!(handle.is_finished());
}

#[tokio::test(start_paused = true)]
async fn phase_tracks_every_cycle_in_flight() {
    let api = Arc::new(FakeApi::new());
    let sink = Arc::new(RecordingSink::new());
    let poller = poller(&api, &sink);
    api.set_feed(vec![vehicle("TKL_1", "8", 23.7, 61.5)]);
    api.delay_next_feed(Duration::from_millis(300));

    let (first, second_phase) = tokio::join!(poller.poll_once(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(poller.phase(), PollPhase::Fetching);
        poller.poll_once().await.unwrap();
        poller.phase()
    });

    // The slow first cycle was still fetching when the second one finished.
    assert_eq!(second_phase, PollPhase::Fetching);
    assert!(matches!(first.unwrap(), CycleOutcome::Stale { .. }));
    assert_eq!(poller.phase(), PollPhase::Idle);
}

#[tokio::test]
async fn failed_cycle_leaves_no_phase_behind() {
    let api = Arc::new(FakeApi::new());
    let sink = Arc::new(RecordingSink::new());
    let poller = poller(&api, &sink);
    api.take_feed_offline();

    assert!(poller.poll_once().await.is_err());
    assert_eq!(poller.phase(), PollPhase::Idle);
}
