// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{test_config, MockTransport};
use telemetry_writer::correlation::HEARTBEAT_METRIC;
use telemetry_writer::{
    Datapoint, DimensionKey, Event, MetricType, PropertyUpdate, Span, Writer, WriterConfig,
    WriterError, WriterFilters, WriterStatus,
};
use tokio::time::{sleep, Duration};

fn start_writer(config: WriterConfig, transport: &Arc<MockTransport>) -> Writer {
    Writer::new(config, transport.clone(), WriterFilters::default()).expect("valid config")
}

fn gauge(i: i64) -> Datapoint {
    Datapoint::new("cpu.utilization", MetricType::Gauge, i).with_dimension("host", "web-1")
}

fn role(value: &str) -> PropertyUpdate {
    PropertyUpdate::new(DimensionKey::new("host", "web-1")).with_property("role", value)
}

#[tokio::test(start_paused = true)]
async fn datapoints_are_split_into_max_size_batches() {
    let transport = Arc::new(MockTransport::new());
    let writer = start_writer(
        WriterConfig {
            datapoint_max_batch_size: 1000,
            ..test_config()
        },
        &transport,
    );
    writer.add_datapoints((0..1500).map(gauge));
    writer.start().await.expect("starts");

    sleep(Duration::from_secs(2)).await;

    let mut sizes: Vec<usize> = transport.datapoint_batches().iter().map(Vec::len).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![500, 1000]);
    assert_eq!(writer.stats().datapoints.snapshot().sent, 1500);
    writer.stop().await.expect("stops");
}

#[tokio::test(start_paused = true)]
async fn full_batch_wakes_sender_before_interval() {
    let transport = Arc::new(MockTransport::new());
    let writer = start_writer(
        WriterConfig {
            datapoint_max_batch_size: 100,
            event_send_interval_seconds: 600,
            ..test_config()
        },
        &transport,
    );
    writer.start().await.expect("starts");
    sleep(Duration::from_millis(10)).await;

    writer.add_datapoints((0..99).map(gauge));
    sleep(Duration::from_secs(1)).await;
    assert!(transport.datapoints().is_empty());

    writer.add_datapoints([gauge(99)]);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.datapoints().len(), 100);
    writer.stop().await.expect("stops");
}

#[tokio::test(start_paused = true)]
async fn overflowing_buffer_keeps_newest() {
    let transport = Arc::new(MockTransport::new());
    let writer = start_writer(
        WriterConfig {
            max_datapoints_buffered: 10,
            ..test_config()
        },
        &transport,
    );
    writer.add_datapoints((0..25).map(gauge));
    assert_eq!(writer.stats().datapoints.snapshot().dropped, 15);

    writer.start().await.expect("starts");
    sleep(Duration::from_secs(2)).await;

    let values: Vec<_> = transport.datapoints().into_iter().map(|dp| dp.value).collect();
    let expected: Vec<_> = (15..25).map(|i| gauge(i).value).collect();
    assert_eq!(values, expected);
    writer.stop().await.expect("stops");
}

#[tokio::test(start_paused = true)]
async fn property_updates_coalesce_within_send_delay() {
    let transport = Arc::new(MockTransport::new());
    let writer = start_writer(
        WriterConfig {
            properties_send_delay_seconds: 30,
            ..test_config()
        },
        &transport,
    );
    writer.start().await.expect("starts");

    writer.add_property(role("v1"));
    sleep(Duration::from_secs(5)).await;
    writer.add_property(role("v2"));

    sleep(Duration::from_millis(24_500)).await;
    assert!(transport.properties().is_empty(), "sent before the delay elapsed");

    sleep(Duration::from_millis(1_500)).await;
    assert_eq!(transport.properties(), vec![role("v2")]);

    sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.properties().len(), 1);
    writer.stop().await.expect("stops");
}

#[tokio::test(start_paused = true)]
async fn unchanged_properties_are_not_resent() {
    let transport = Arc::new(MockTransport::new());
    let writer = start_writer(
        WriterConfig {
            properties_send_delay_seconds: 10,
            ..test_config()
        },
        &transport,
    );
    writer.start().await.expect("starts");

    writer.add_property(role("db"));
    sleep(Duration::from_secs(15)).await;
    writer.add_property(role("db"));
    sleep(Duration::from_secs(15)).await;

    assert_eq!(transport.properties().len(), 1);
    assert_eq!(writer.stats().properties_deduplicated(), 1);

    writer.add_property(role("cache"));
    sleep(Duration::from_secs(15)).await;
    assert_eq!(transport.properties().len(), 2);
    writer.stop().await.expect("stops");
}

#[tokio::test(start_paused = true)]
async fn failed_property_send_is_retried_by_next_identical_update() {
    let transport = Arc::new(MockTransport::failing());
    let writer = start_writer(
        WriterConfig {
            properties_send_delay_seconds: 10,
            ..test_config()
        },
        &transport,
    );
    writer.start().await.expect("starts");

    writer.add_property(role("db"));
    sleep(Duration::from_secs(15)).await;
    writer.add_property(role("db"));
    sleep(Duration::from_secs(15)).await;

    assert_eq!(transport.properties().len(), 2);
    assert_eq!(writer.stats().properties.snapshot().failed, 2);
    assert_eq!(writer.stats().properties_deduplicated(), 0);
    writer.stop().await.expect("stops");
}

#[tokio::test]
async fn property_cache_drops_new_dimensions_when_full() {
    let transport = Arc::new(MockTransport::new());
    let writer = start_writer(
        WriterConfig {
            properties_max_buffered: 2,
            ..test_config()
        },
        &transport,
    );
    for host in ["a", "b", "c"] {
        writer.add_property(
            PropertyUpdate::new(DimensionKey::new("host", host)).with_property("role", "web"),
        );
    }
    // An already pending dimension still takes updates.
    writer.add_property(
        PropertyUpdate::new(DimensionKey::new("host", "a")).with_property("role", "db"),
    );
    assert_eq!(writer.stats().properties.snapshot().dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn span_tracker_drops_oldest() {
    let transport = Arc::new(MockTransport::new());
    let writer = start_writer(
        WriterConfig {
            max_trace_spans_in_flight: 3,
            ..test_config()
        },
        &transport,
    );
    writer.add_spans(
        ["A", "B", "C", "D"]
            .into_iter()
            .map(|id| Span::new("trace-1", id, "checkout", "GET /cart"))
            .collect(),
    );
    writer.start().await.expect("starts");
    sleep(Duration::from_secs(2)).await;

    let ids: Vec<String> = transport.spans().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec!["B", "C", "D"]);
    assert_eq!(writer.stats().spans.snapshot().dropped, 1);
    writer.stop().await.expect("stops");
}

fn span(id: &str) -> Span {
    Span::new("trace-1", id, "checkout", "GET /cart")
}

#[tokio::test(start_paused = true)]
async fn spans_on_the_wire_are_evicted_before_newer_ones() {
    let transport = Arc::new(MockTransport::with_delay(Duration::from_secs(10)));
    let writer = start_writer(
        WriterConfig {
            max_trace_spans_in_flight: 3,
            trace_span_max_batch_size: 3,
            event_send_interval_seconds: 60,
            ..test_config()
        },
        &transport,
    );
    writer.start().await.expect("starts");
    sleep(Duration::from_millis(100)).await;

    writer.add_spans(vec![span("A"), span("B"), span("C")]);
    sleep(Duration::from_secs(1)).await;
    writer.add_spans(vec![span("D"), span("E"), span("F")]);
    assert_eq!(writer.stats().spans.snapshot().dropped, 3);

    sleep(Duration::from_secs(20)).await;
    let ids: Vec<String> = transport.spans().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec!["A", "B", "C", "D", "E", "F"]);
    writer.stop().await.expect("stops");
}

#[tokio::test(start_paused = true)]
async fn completed_span_batches_free_capacity_before_next_tick() {
    let transport = Arc::new(MockTransport::new());
    let writer = start_writer(
        WriterConfig {
            max_trace_spans_in_flight: 3,
            trace_span_max_batch_size: 3,
            event_send_interval_seconds: 60,
            ..test_config()
        },
        &transport,
    );
    writer.start().await.expect("starts");
    sleep(Duration::from_millis(100)).await;

    writer.add_spans(vec![span("A"), span("B"), span("C")]);
    sleep(Duration::from_secs(1)).await;
    writer.add_spans(vec![span("D"), span("E")]);
    sleep(Duration::from_secs(1)).await;
    writer.add_spans(vec![span("F")]);
    sleep(Duration::from_secs(1)).await;
    writer.add_spans(vec![span("G")]);
    assert_eq!(writer.stats().spans.snapshot().dropped, 0);

    sleep(Duration::from_secs(60)).await;
    let ids: Vec<String> = transport.spans().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec!["A", "B", "C", "D", "E", "F", "G"]);
    writer.stop().await.expect("stops");
}

#[tokio::test(start_paused = true)]
async fn dropping_a_running_writer_stops_its_loops() {
    let transport = Arc::new(MockTransport::new());
    let writer = start_writer(test_config(), &transport);
    writer.start().await.expect("starts");
    sleep(Duration::from_millis(100)).await;
    assert!(Arc::strong_count(&transport) > 2);

    drop(writer);
    sleep(Duration::from_secs(1)).await;
    // Only the test still holds the transport once every loop has exited.
    assert_eq!(Arc::strong_count(&transport), 1);
}

#[tokio::test(start_paused = true)]
async fn correlation_heartbeats_stop_after_stale_timeout() {
    let transport = Arc::new(MockTransport::new());
    let writer = start_writer(
        WriterConfig {
            send_trace_host_correlation_metrics: true,
            trace_host_correlation_metrics_interval: Duration::from_secs(10),
            stale_service_timeout: Duration::from_secs(30),
            host_id_dims: BTreeMap::from([("host".to_string(), "web-1".to_string())]),
            ..test_config()
        },
        &transport,
    );
    writer.start().await.expect("starts");
    writer.add_spans(vec![Span::new("trace-1", "1", "checkout", "GET /cart")]);

    sleep(Duration::from_millis(11_500)).await;
    let heartbeats: Vec<Datapoint> = transport
        .datapoints()
        .into_iter()
        .filter(|dp| dp.metric == HEARTBEAT_METRIC)
        .collect();
    assert_eq!(heartbeats.len(), 1);
    assert_eq!(heartbeats[0].dimensions["host"], "web-1");
    assert_eq!(heartbeats[0].dimensions["sf_hasService"], "checkout");

    // Seen at t=0, still fresh at t=30, stale from t=40 on.
    sleep(Duration::from_secs(60)).await;
    let count = transport
        .datapoints()
        .iter()
        .filter(|dp| dp.metric == HEARTBEAT_METRIC)
        .count();
    assert_eq!(count, 3);

    let span = &transport.spans()[0];
    assert_eq!(span.tags["host"], "web-1");
    writer.stop().await.expect("stops");
}

#[tokio::test(start_paused = true)]
async fn concurrent_sends_never_exceed_max_requests() {
    let transport = Arc::new(MockTransport::with_delay(Duration::from_millis(100)));
    let writer = start_writer(
        WriterConfig {
            datapoint_max_batch_size: 10,
            max_requests: 2,
            ..test_config()
        },
        &transport,
    );
    writer.add_datapoints((0..200).map(gauge));
    writer.start().await.expect("starts");
    sleep(Duration::from_secs(5)).await;

    assert_eq!(transport.datapoints().len(), 200);
    assert_eq!(transport.max_concurrency(), 2);
    assert_eq!(writer.stats().datapoints.snapshot().active_requests, 0);
    writer.stop().await.expect("stops");
}

#[tokio::test(start_paused = true)]
async fn failed_batches_are_dropped_not_retried() {
    let transport = Arc::new(MockTransport::failing());
    let writer = start_writer(test_config(), &transport);
    writer.add_datapoints((0..5).map(gauge));
    writer.start().await.expect("starts");
    sleep(Duration::from_secs(10)).await;

    assert_eq!(transport.datapoint_batches().len(), 1);
    let snapshot = writer.stats().datapoints.snapshot();
    assert_eq!(snapshot.failed, 5);
    assert_eq!(snapshot.sent, 0);
    writer.stop().await.expect("stops");
}

#[tokio::test(start_paused = true)]
async fn handles_ingest_from_many_tasks() {
    let transport = Arc::new(MockTransport::new());
    let writer = start_writer(test_config(), &transport);
    writer.start().await.expect("starts");

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let handle = writer.handle();
            tokio::spawn(async move {
                handle.add_datapoints((0..250).map(|i| gauge(p * 1000 + i)));
                handle.add_events([Event::new("restart")]);
            })
        })
        .collect();
    for producer in producers {
        producer.await.expect("producer finished");
    }
    sleep(Duration::from_secs(2)).await;

    assert_eq!(transport.datapoints().len(), 1000);
    assert_eq!(transport.events().len(), 4);
    writer.stop().await.expect("stops");
}

#[tokio::test(start_paused = true)]
async fn lifecycle_transitions() {
    let transport = Arc::new(MockTransport::new());
    let writer = start_writer(test_config(), &transport);
    assert!(matches!(writer.stop().await, Err(WriterError::NotRunning)));

    writer.start().await.expect("starts");
    assert_eq!(writer.status().await, WriterStatus::Running);
    assert!(matches!(writer.start().await, Err(WriterError::AlreadyStarted)));

    writer.stop().await.expect("stops");
    assert_eq!(writer.status().await, WriterStatus::Stopped);

    writer.add_datapoints([gauge(1)]);
    sleep(Duration::from_secs(5)).await;
    assert!(transport.datapoints().is_empty());
    writer.stop().await.expect("second stop is a no-op");
}

#[test]
fn invalid_config_is_rejected() {
    let transport = Arc::new(MockTransport::new());
    for config in [
        WriterConfig {
            ingest_url: "not a url".to_string(),
            ..test_config()
        },
        WriterConfig {
            datapoint_max_batch_size: 0,
            ..test_config()
        },
        WriterConfig {
            event_send_interval_seconds: 0,
            ..test_config()
        },
    ] {
        let result = Writer::new(config, transport.clone(), WriterFilters::default());
        assert!(matches!(result, Err(WriterError::InvalidConfig(_))));
    }
}

#[test]
fn config_hash_tracks_effective_config() {
    let transport = Arc::new(MockTransport::new());
    let a = start_writer(test_config(), &transport);
    let b = start_writer(test_config(), &transport);
    let c = start_writer(
        WriterConfig {
            max_requests: 3,
            ..test_config()
        },
        &transport,
    );
    assert_eq!(a.config_hash(), b.config_hash());
    assert_ne!(a.config_hash(), c.config_hash());
}
