mod common;

use std::time::Duration;

use tokio::time::sleep;

use common::*;
use ether_engine::metadata::TagSet;
use ether_engine::{ChannelState, EngineEvent, PlaybackController, PlaybackState};

fn controller() -> (FakeBackend, PlaybackController<FakeBackend>) {
    let backend = FakeBackend::new();
    let controller = PlaybackController::new(backend.clone(), timing());
    (backend, controller)
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

#[tokio::test(start_paused = true)]
async fn direct_play_becomes_current_at_full_volume() {
    let (backend, controller) = controller();
    let mut rx = controller.subscribe();

    controller.play_station("Radio A", STATION_A).await;
    assert_eq!(controller.state(), PlaybackState::Connecting);
    assert!(controller.now_playing().is_placeholder());

    assert!(wait_for(&mut rx, secs(2), playing(true)).await.is_some());
    assert_eq!(controller.state(), PlaybackState::Playing);
    assert_eq!(controller.current_url().await.as_deref(), Some(STATION_A));
    assert_eq!(backend.latest(STATION_A).volume(), 0.5);
}

#[tokio::test(start_paused = true)]
async fn rapid_switch_keeps_only_the_last_station() {
    let (backend, controller) = controller();
    let mut rx = controller.subscribe();

    controller.play(STATION_A).await;
    controller.play(STATION_B).await;

    let events = collect_for(&mut rx, secs(3)).await;
    let started = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::PlaybackStateChanged { is_playing: true }))
        .count();
    assert_eq!(started, 1);
    assert_eq!(controller.current_url().await.as_deref(), Some(STATION_B));

    let a = backend.channels(STATION_A);
    assert!(a.iter().all(|c| c.is_closed()));
    assert!(!backend.latest(STATION_B).is_closed());
}

#[tokio::test(start_paused = true)]
async fn repeated_play_of_the_same_url_opens_once() {
    let (backend, controller) = controller();
    let mut rx = controller.subscribe();

    controller.play(STATION_A).await;
    controller.play(STATION_A).await;
    wait_for(&mut rx, secs(2), playing(true)).await;
    controller.play(STATION_A).await;
    sleep(secs(1)).await;

    assert_eq!(backend.open_attempts(STATION_A), 1);
}

#[tokio::test(start_paused = true)]
async fn crossfade_hands_over_to_the_new_station() {
    let (backend, controller) = controller();
    let mut rx = controller.subscribe();

    controller.play(STATION_A).await;
    wait_for(&mut rx, secs(2), playing(true)).await;

    controller.play(STATION_B).await;
    // A keeps playing while B gets ready.
    assert_eq!(controller.current_url().await.as_deref(), Some(STATION_A));
    assert_eq!(controller.state(), PlaybackState::Playing);

    sleep(secs(3)).await;
    assert_eq!(controller.current_url().await.as_deref(), Some(STATION_B));

    let a = backend.latest(STATION_A);
    let b = backend.latest(STATION_B);
    assert!(a.is_closed());
    assert!(!b.is_closed());
    assert_eq!(b.volume(), 0.5);

    // Equal-power midpoint: both near 0.707 of the target.
    let mid = 0.5 * std::f32::consts::FRAC_1_SQRT_2;
    assert!(b.volume_history().iter().any(|v| (v - mid).abs() < 0.02));
    assert!(a.volume_history().iter().any(|v| (v - mid).abs() < 0.02));
}

#[tokio::test(start_paused = true)]
async fn volume_is_queued_during_crossfade() {
    let (backend, controller) = controller();
    let mut rx = controller.subscribe();

    controller.play(STATION_A).await;
    wait_for(&mut rx, secs(2), playing(true)).await;

    controller.play(STATION_B).await;
    // Ready after ~300 ms, then a 1500 ms fade.
    sleep(Duration::from_millis(1000)).await;
    controller.set_volume(0.9).await;
    assert_eq!(controller.volume(), 0.9);

    let a = backend.latest(STATION_A);
    assert!(a.volume_history().iter().all(|v| *v <= 0.5 + f32::EPSILON));

    sleep(secs(2)).await;
    assert_eq!(backend.latest(STATION_B).volume(), 0.9);

    // Outside a fade the change lands at once.
    controller.set_volume(0.2).await;
    assert_eq!(backend.latest(STATION_B).volume(), 0.2);
}

#[tokio::test(start_paused = true)]
async fn frozen_stall_triggers_exactly_one_reconnect() {
    let (backend, controller) = controller();
    let mut rx = controller.subscribe();

    controller.play(STATION_A).await;
    wait_for(&mut rx, secs(2), playing(true)).await;
    let first = backend.latest(STATION_A);
    first.freeze();

    let events = collect_for(&mut rx, secs(40)).await;
    assert_eq!(count_reconnects(&events), 1);
    assert!(events.contains(&EngineEvent::ReconnectRequired {
        url: STATION_A.to_string()
    }));
    assert!(events.contains(&EngineEvent::PlaybackStateChanged { is_playing: false }));

    assert!(first.is_closed());
    assert_eq!(backend.channels(STATION_A).len(), 2);
    assert_eq!(controller.state(), PlaybackState::Playing);
    assert_eq!(controller.current_url().await.as_deref(), Some(STATION_A));
}

#[tokio::test(start_paused = true)]
async fn advancing_stall_is_left_alone() {
    let (backend, controller) = controller();
    let mut rx = controller.subscribe();

    controller.play(STATION_A).await;
    wait_for(&mut rx, secs(2), playing(true)).await;
    backend.latest(STATION_A).rebuffer();

    let events = collect_for(&mut rx, secs(60)).await;
    assert_eq!(count_reconnects(&events), 0);
    assert!(events.contains(&EngineEvent::StateChanged {
        state: PlaybackState::Stalled
    }));
    assert_eq!(backend.channels(STATION_A).len(), 1);

    backend.latest(STATION_A).set_state(ChannelState::Playing);
    wait_for(&mut rx, secs(5), |e| {
        *e == EngineEvent::StateChanged {
            state: PlaybackState::Playing,
        }
    })
    .await
    .expect("recovers to playing");
}

#[tokio::test(start_paused = true)]
async fn reconnects_stop_after_three_failures() {
    let (backend, controller) = controller();
    let mut rx = controller.subscribe();

    controller.play(STATION_A).await;
    wait_for(&mut rx, secs(2), playing(true)).await;
    backend.fail(STATION_A);
    backend.latest(STATION_A).set_state(ChannelState::Stopped);

    let events = collect_for(&mut rx, secs(30)).await;
    assert_eq!(count_reconnects(&events), 3);
    assert_eq!(controller.state(), PlaybackState::Failed);
    // One successful open, then two attempts per reconnect.
    assert_eq!(backend.open_attempts(STATION_A), 7);

    sleep(secs(60)).await;
    assert_eq!(backend.open_attempts(STATION_A), 7);

    // Only an explicit play starts over.
    backend.heal(STATION_A);
    controller.play(STATION_A).await;
    assert!(wait_for(&mut rx, secs(2), playing(true)).await.is_some());
    assert_eq!(controller.state(), PlaybackState::Playing);
}

#[tokio::test(start_paused = true)]
async fn switching_while_the_current_stream_drops_leaves_no_orphans() {
    let (backend, controller) = controller();
    let mut rx = controller.subscribe();

    controller.play(STATION_A).await;
    wait_for(&mut rx, secs(2), playing(true)).await;

    // The next health tick lands while B is still fading in.
    sleep(Duration::from_millis(2600)).await;
    backend.latest(STATION_A).set_state(ChannelState::Stopped);
    controller.play(STATION_B).await;

    let events = collect_for(&mut rx, secs(15)).await;
    assert_eq!(count_reconnects(&events), 0);
    assert_eq!(controller.current_url().await.as_deref(), Some(STATION_B));
    assert_eq!(backend.open_attempts(STATION_A), 1);
    assert!(backend.channels(STATION_A).iter().all(|c| c.is_closed()));

    let b = backend.channels(STATION_B);
    assert_eq!(b.len(), 1);
    assert!(!b[0].is_closed());
}

#[tokio::test(start_paused = true)]
async fn switching_mid_crossfade_fades_out_the_abandoned_stream() {
    let (backend, controller) = controller();
    let mut rx = controller.subscribe();

    controller.play(STATION_A).await;
    wait_for(&mut rx, secs(2), playing(true)).await;

    controller.play(STATION_B).await;
    sleep(Duration::from_millis(1000)).await;
    controller.play(STATION_C).await;

    let b = backend.latest(STATION_B);
    assert!(b.is_closed());
    let history = b.volume_history();
    assert!(history.len() > 10);
    let from = history[history.len() - 11];
    assert!(from > 0.0);
    let tail = &history[history.len() - 10..];
    for (k, level) in tail.iter().enumerate() {
        let expected = from * (9 - k) as f32 / 10.0;
        assert!((level - expected).abs() < 1e-4, "step {}: {} != {}", k, level, expected);
    }
    assert_eq!(tail[9], 0.0);

    // A is restored and keeps playing until C takes over.
    let a = backend.latest(STATION_A);
    assert!(!a.is_closed());
    assert_eq!(a.volume(), 0.5);
    assert_eq!(controller.current_url().await.as_deref(), Some(STATION_A));

    sleep(secs(3)).await;
    assert_eq!(controller.current_url().await.as_deref(), Some(STATION_C));
    assert!(a.is_closed());
}

#[tokio::test(start_paused = true)]
async fn stop_during_reconnect_closes_the_reopened_stream() {
    let (backend, controller) = controller();
    let mut rx = controller.subscribe();

    controller.play(STATION_A).await;
    wait_for(&mut rx, secs(2), playing(true)).await;
    backend.latest(STATION_A).set_state(ChannelState::Stopped);

    let reconnect = wait_for(&mut rx, secs(5), |e| {
        matches!(e, EngineEvent::ReconnectRequired { .. })
    })
    .await;
    assert!(reconnect.is_some());
    // Past the first backoff, while the new stream gets ready.
    sleep(Duration::from_millis(1150)).await;

    controller.stop().await;
    assert_eq!(controller.state(), PlaybackState::Stopped);
    assert_eq!(controller.current_url().await, None);
    let opened = backend.open_attempts(STATION_A);

    sleep(secs(30)).await;
    assert_eq!(backend.open_attempts(STATION_A), opened);
    assert!(backend.channels(STATION_A).iter().all(|c| c.is_closed()));
    assert_eq!(controller.state(), PlaybackState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn stop_during_transition_releases_everything() {
    let (backend, controller) = controller();
    let mut rx = controller.subscribe();

    controller.play(STATION_A).await;
    wait_for(&mut rx, secs(2), playing(true)).await;
    controller.play(STATION_B).await;
    sleep(Duration::from_millis(600)).await;

    controller.stop().await;
    assert_eq!(controller.state(), PlaybackState::Stopped);
    assert_eq!(controller.current_url().await, None);
    assert!(backend.latest(STATION_A).is_closed());
    assert!(backend.latest(STATION_B).is_closed());

    let events = collect_for(&mut rx, secs(30)).await;
    assert!(events.contains(&EngineEvent::PlaybackStateChanged { is_playing: false }));
    assert_eq!(count_reconnects(&events), 0);
    assert!(!events.contains(&EngineEvent::PlaybackStateChanged { is_playing: true }));
}

#[tokio::test(start_paused = true)]
async fn failed_open_without_current_reports_failure() {
    let (backend, controller) = controller();
    backend.fail(STATION_C);

    controller.play(STATION_C).await;
    sleep(secs(1)).await;

    assert_eq!(controller.state(), PlaybackState::Failed);
    assert_eq!(backend.open_attempts(STATION_C), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_switch_keeps_the_current_station() {
    let (backend, controller) = controller();
    let mut rx = controller.subscribe();
    backend.fail(STATION_C);

    controller.play_station("Radio A", STATION_A).await;
    wait_for(&mut rx, secs(2), playing(true)).await;
    controller.play_station("Radio C", STATION_C).await;
    sleep(secs(1)).await;

    assert_eq!(controller.current_url().await.as_deref(), Some(STATION_A));
    assert_eq!(controller.state(), PlaybackState::Playing);
    assert_eq!(controller.now_playing().source_url, STATION_A);
}

#[tokio::test(start_paused = true)]
async fn pause_and_resume() {
    let (backend, controller) = controller();
    let mut rx = controller.subscribe();

    controller.play(STATION_A).await;
    wait_for(&mut rx, secs(2), playing(true)).await;

    controller.pause().await;
    assert_eq!(controller.state(), PlaybackState::Paused);
    assert_eq!(backend.latest(STATION_A).state(), ChannelState::Paused);
    assert!(wait_for(&mut rx, secs(1), playing(false)).await.is_some());

    // Pausing twice changes nothing.
    controller.pause().await;

    // Playing the current URL resumes it.
    controller.play(STATION_A).await;
    assert_eq!(controller.state(), PlaybackState::Playing);
    assert_eq!(backend.latest(STATION_A).state(), ChannelState::Playing);
    assert!(wait_for(&mut rx, secs(1), playing(true)).await.is_some());
    assert_eq!(backend.open_attempts(STATION_A), 1);
}

#[tokio::test(start_paused = true)]
async fn icy_metadata_is_published_after_debounce() {
    let (backend, controller) = controller();
    let mut rx = controller.subscribe();
    backend.seed_tags(STATION_A, icy_title("Don't Stop - Journey"));

    controller.play_station("Radio A", STATION_A).await;
    let event = wait_for(&mut rx, secs(2), |e| {
        matches!(e, EngineEvent::MetadataReceived { .. })
    })
    .await;
    assert_eq!(
        event,
        Some(EngineEvent::MetadataReceived {
            title: "Don't Stop".to_string(),
            artist: "Journey".to_string(),
            source_url: STATION_A.to_string(),
        })
    );

    // A burst of updates collapses into its last value.
    let channel = backend.latest(STATION_A);
    channel.set_tags(icy_title("First - One"));
    sleep(Duration::from_millis(100)).await;
    channel.set_tags(icy_title("Second - Two"));

    let events = collect_for(&mut rx, secs(2)).await;
    let titles: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::MetadataReceived { title, .. } => Some(title.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(titles, vec!["Second"]);
    assert_eq!(controller.now_playing().artist, "Two");
}

#[tokio::test(start_paused = true)]
async fn cyrillic_tags_in_windows_1251_are_decoded() {
    let (backend, controller) = controller();
    let mut rx = controller.subscribe();

    let mut raw = b"StreamTitle='".to_vec();
    raw.extend(
        ether_engine::encoding::Codepage::Windows1251
            .encode("Кино - Группа крови")
            .unwrap(),
    );
    raw.extend(b"';");
    backend.seed_tags(
        STATION_A,
        TagSet {
            meta: Some(raw),
            ..TagSet::default()
        },
    );

    controller.play(STATION_A).await;
    let event = wait_for(&mut rx, secs(2), |e| {
        matches!(e, EngineEvent::MetadataReceived { .. })
    })
    .await;
    assert_eq!(
        event,
        Some(EngineEvent::MetadataReceived {
            title: "Кино".to_string(),
            artist: "Группа крови".to_string(),
            source_url: STATION_A.to_string(),
        })
    );
}

#[tokio::test(start_paused = true)]
async fn silent_station_falls_back_to_its_title() {
    let (_backend, controller) = controller();
    let mut rx = controller.subscribe();

    controller.play_station("Radio A", STATION_A).await;
    // Ready after 300 ms, then one debounce window.
    let event = wait_for(&mut rx, secs(1), |e| {
        matches!(e, EngineEvent::MetadataReceived { .. })
    })
    .await;
    assert_eq!(
        event,
        Some(EngineEvent::MetadataReceived {
            title: "Radio A".to_string(),
            artist: String::new(),
            source_url: STATION_A.to_string(),
        })
    );
}

#[tokio::test(start_paused = true)]
async fn metadata_of_a_replaced_station_is_dropped() {
    let (backend, controller) = controller();
    let mut rx = controller.subscribe();
    backend.seed_tags(STATION_A, icy_title("Old Song - Old Artist"));

    controller.play_station("Radio A", STATION_A).await;
    // A is ready at once on its ICY tags; switch before the debounce fires.
    sleep(Duration::from_millis(50)).await;
    controller.play_station("Radio B", STATION_B).await;

    let events = collect_for(&mut rx, secs(8)).await;
    assert!(!events.iter().any(|e| matches!(
        e,
        EngineEvent::MetadataReceived { title, .. } if title == "Old Song"
    )));
    assert!(events.contains(&EngineEvent::MetadataReceived {
        title: "Radio B".to_string(),
        artist: String::new(),
        source_url: STATION_B.to_string(),
    }));
}
