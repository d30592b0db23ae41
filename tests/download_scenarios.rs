//! End-to-end log downloads against the in-memory gadget.

use std::time::Duration;

use smartgadget_rs::parse::encode_u64;
use smartgadget_rs::prelude::*;
use smartgadget_rs::protocol::Characteristic;

fn id() -> DeviceId {
    "C4:A1:2F:00:9E:31".parse().unwrap()
}

/// Three logged values per stream at 10 000, 20 000 and 30 000 ms.
fn three_values() -> SimConfig {
    SimConfig {
        interval_ms: 10_000,
        newest_ms: 30_000,
        temperatures: vec![20.0, 20.5, 21.0],
        humidities: vec![50.1, 55.5, 50.3],
        ..SimConfig::default()
    }
}

fn client(config: SimConfig) -> (GadgetClient<SimulatedGadget>, SimulatedGadget) {
    let gadget = SimulatedGadget::new(config);
    let config = GadgetClientConfig {
        download: DownloadConfig {
            poll_interval: Duration::from_millis(1),
            ..DownloadConfig::default()
        },
        ..GadgetClientConfig::default()
    };
    (GadgetClient::new(gadget.clone(), config), gadget)
}

fn series(timeline: &Timeline) -> Vec<(u64, Option<f32>)> {
    timeline
        .samples()
        .iter()
        .map(|s| (s.timestamp_ms, s.value))
        .collect()
}

#[tokio::test]
async fn full_single_pass() {
    let (mut client, gadget) = client(three_values());
    let log = client
        .fetch_logged_data(id(), &FetchOptions::default())
        .await
        .unwrap();

    assert_eq!(log.passes, 1);
    assert_eq!(gadget.passes(), 1);
    assert_eq!(
        series(&log.temperatures),
        vec![(10_000, Some(20.0)), (20_000, Some(20.5)), (30_000, Some(21.0))]
    );
    assert_eq!(
        series(&log.humidities),
        vec![(10_000, Some(50.1)), (20_000, Some(55.5)), (30_000, Some(50.3))]
    );
    assert!(log.temperatures.is_complete());
    assert!(log.humidities.is_complete());
    assert!(gadget.sync_time().is_some());
    // Transient connection: closed after the call.
    assert!(!gadget.is_connected());
}

#[tokio::test]
async fn second_pass_fills_the_gap() {
    let (mut client, gadget) = client(SimConfig {
        values_per_chunk: 1,
        loss: LossModel::Scripted(vec![vec![1]]),
        ..three_values()
    });
    let options = FetchOptions {
        num_iterations: 2,
        ..FetchOptions::default()
    };
    let log = client.fetch_logged_data(id(), &options).await.unwrap();

    assert_eq!(log.passes, 2);
    assert_eq!(gadget.passes(), 2);
    assert_eq!(
        series(&log.humidities),
        vec![(10_000, Some(50.1)), (20_000, Some(55.5)), (30_000, Some(50.3))]
    );
    assert!(log.temperatures.is_complete());

    // The second pass asked for [0, 40 000] and left the clock alone.
    assert_eq!(
        gadget.writes_to(Characteristic::NewestTimestamp),
        vec![encode_u64(40_000)]
    );
    assert_eq!(
        gadget.writes_to(Characteristic::OldestTimestamp),
        vec![encode_u64(0), encode_u64(0)]
    );
    assert_eq!(gadget.writes_to(Characteristic::SyncTime).len(), 1);
}

#[tokio::test]
async fn exhausted_iterations_keep_the_gaps() {
    let (mut client, gadget) = client(SimConfig {
        values_per_chunk: 1,
        loss: LossModel::Scripted(vec![vec![2]]),
        ..three_values()
    });
    let log = client
        .fetch_logged_data(id(), &FetchOptions::default())
        .await
        .unwrap();

    assert_eq!(log.passes, 1);
    assert_eq!(gadget.passes(), 1);
    assert_eq!(log.temperatures.missing_timestamps(), vec![10_000]);
    assert_eq!(log.humidities.missing_timestamps(), vec![10_000]);
    assert_eq!(
        series(&log.temperatures)[1..],
        [(20_000, Some(20.5)), (30_000, Some(21.0))]
    );
}

#[tokio::test]
async fn only_selected_streams_are_downloaded() {
    let (mut client, _gadget) = client(three_values());
    let options = FetchOptions {
        selection: StreamSelection {
            temperature: false,
            humidity: true,
        },
        ..FetchOptions::default()
    };
    let log = client.fetch_logged_data(id(), &options).await.unwrap();
    assert!(log.temperatures.is_empty());
    assert!(log.humidities.is_complete());
}

#[tokio::test]
async fn window_hints_narrow_the_download() {
    let (mut client, _gadget) = client(SimConfig {
        newest_ms: 100_000,
        temperatures: (0..10).map(|i| 20.0 + i as f32 * 0.25).collect(),
        humidities: vec![50.0; 10],
        ..SimConfig::default()
    });
    let options = FetchOptions {
        hints: WindowHints {
            sync: SyncTime::Skip,
            oldest_ms: Some(55_000),
            newest_ms: Some(80_000),
        },
        ..FetchOptions::default()
    };
    let log = client.fetch_logged_data(id(), &options).await.unwrap();
    // (50 000, 80 000] on the gadget's grid.
    assert_eq!(
        series(&log.temperatures),
        vec![(60_000, Some(21.25)), (70_000, Some(21.5)), (80_000, Some(21.75))]
    );
}

#[tokio::test]
async fn lossy_radio_converges_over_several_passes() {
    let lossy = || SimConfig {
        loss: LossModel::Hashed { rate: 0.3, seed: 3 },
        ..SimConfig::demo(DeviceFamily::Sht3x, 3_600_000)
    };
    let (mut once, _) = client(lossy());
    let single = once
        .fetch_logged_data(id(), &FetchOptions::default())
        .await
        .unwrap();

    let (mut repeated, gadget) = client(lossy());
    let options = FetchOptions {
        num_iterations: 10,
        ..FetchOptions::default()
    };
    let merged = repeated.fetch_logged_data(id(), &options).await.unwrap();

    assert!((1..=10).contains(&merged.passes));
    assert_eq!(gadget.passes(), merged.passes);
    assert!(merged.temperatures.filled() >= single.temperatures.filled());
    assert!(merged.humidities.filled() >= single.humidities.filled());
    // Later passes only ever add values on the first pass's grid.
    assert_eq!(merged.temperatures.len(), single.temperatures.len());
}
