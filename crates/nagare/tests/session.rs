mod common;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tempfile::tempdir;
use tokio::io::AsyncWriteExt;

use common::{init_segment, media_fragment, read_framed, test_transport, write_media, FramedStream};
use nagare::{
    message::{Message, MessageDebug, MessagePref},
    serve, Media, Session, ShapingState,
};

async fn open_media(dir: &std::path::Path, count: u64) -> Arc<Media> {
    let manifest = write_media(dir, 48000, 96000, count);
    Arc::new(Media::open(&manifest).await.unwrap())
}

/// Collect every stream the session opened, after it finished.
async fn collect_streams(handle: &mut common::TestTransportHandle) -> Vec<FramedStream> {
    let mut streams = Vec::new();
    while let Ok(stream) = handle.opened.try_recv() {
        streams.push(read_framed(stream).await);
    }
    streams
}

fn atom(message: &Message) -> Vec<u8> {
    message.encode().unwrap().to_vec()
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_delivery_and_close() {
    let dir = tempdir().unwrap();
    let media = open_media(dir.path(), 3).await;
    let state = Arc::new(ShapingState::new());

    let (transport, mut handle) = test_transport();
    serve(transport, media, state).await.unwrap();

    assert_eq!(handle.closed(), Some((0, "end of broadcast".to_string())));

    let streams = collect_streams(&mut handle).await;

    // Two init streams at maximum priority, carrying the raw init bytes.
    let inits: Vec<_> = streams.iter().filter(|s| s.message.init.is_some()).collect();
    assert_eq!(inits.len(), 2);
    for init in &inits {
        assert_eq!(init.priority, Some(i64::MAX));
        assert_eq!(init.rest, init_segment(48000));

        let id = &init.message.init.as_ref().unwrap().id;
        assert!(id == "audio" || id == "video");
    }

    // Three segments per track, timestamps 0/2000/4000 ms, priority equal to
    // the timestamp so fresher segments outrank older ones.
    for track in ["audio", "video"] {
        let mut timestamps = Vec::new();
        for stream in &streams {
            let Some(segment) = &stream.message.segment else {
                continue;
            };
            if segment.init != *track {
                continue;
            }

            assert_eq!(stream.priority, Some(segment.timestamp as i64));
            // 48 ticks per millisecond at a 48000 Hz timescale.
            assert_eq!(stream.rest, media_fragment(segment.timestamp * 48, &[0xab; 64]));
            timestamps.push(segment.timestamp);
        }

        timestamps.sort_unstable();
        assert_eq!(timestamps, [0, 2000, 4000], "track {track}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_ping_gets_pong() {
    let dir = tempdir().unwrap();
    let media = open_media(dir.path(), 2).await;
    let state = Arc::new(ShapingState::new());

    let (transport, mut handle) = test_transport();
    let session = Session::new(transport, media, state);
    let run = tokio::spawn(session.run());

    let mut control = handle.open_control();
    control
        .write_all(&[&b"\x00\x00\x00\x15warp"[..], &br#"{"x-ping":{}}"#[..]].concat())
        .await
        .unwrap();
    drop(control);

    run.await.unwrap().unwrap();

    let streams = collect_streams(&mut handle).await;
    let pongs = streams
        .iter()
        .filter(|s| s.message.pong.is_some())
        .count();
    assert_eq!(pongs, 1);
}

#[tokio::test(start_paused = true)]
async fn test_max_bitrate_reported_as_etp() {
    let dir = tempdir().unwrap();
    let media = open_media(dir.path(), 3).await;
    let state = Arc::new(ShapingState::new());

    let (transport, mut handle) = test_transport();
    let session = Session::new(transport, media, state);
    let run = tokio::spawn(session.run());

    let mut control = handle.open_control();
    control
        .write_all(&atom(&Message {
            debug: Some(MessageDebug {
                max_bitrate: Some(125_000),
                ..Default::default()
            }),
            ..Default::default()
        }))
        .await
        .unwrap();
    drop(control);

    run.await.unwrap().unwrap();

    // The cap lands long before the final segment is due.
    let streams = collect_streams(&mut handle).await;
    let last = streams
        .iter()
        .filter_map(|s| s.message.segment.as_ref())
        .find(|s| s.init == "audio" && s.timestamp == 4000)
        .unwrap();
    assert_eq!(last.etp, 122);
}

#[tokio::test(start_paused = true)]
async fn test_pause_shifts_the_broadcast() {
    let dir = tempdir().unwrap();
    let media = open_media(dir.path(), 3).await;
    let state = Arc::new(ShapingState::new());

    let (transport, mut handle) = test_transport();
    let session = Session::new(transport, media, state.clone());

    let started = Instant::now();
    let run = tokio::spawn(session.run());

    let mut control = handle.open_control();
    control
        .write_all(&atom(&Message {
            debug: Some(MessageDebug {
                continue_streaming: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }))
        .await
        .unwrap();

    // Wait for the pause to land, hold it for three seconds, then resume.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!state.is_streaming());
    tokio::time::sleep(Duration::from_secs(3)).await;

    control
        .write_all(&atom(&Message {
            debug: Some(MessageDebug {
                continue_streaming: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }))
        .await
        .unwrap();
    drop(control);

    run.await.unwrap().unwrap();

    // Unpaused, the last segment is due at t=4s; the pause pushes it out.
    assert!(started.elapsed() >= Duration::from_secs(5));

    let streams = collect_streams(&mut handle).await;
    let audio_segments = streams
        .iter()
        .filter(|s| {
            s.message
                .segment
                .as_ref()
                .is_some_and(|segment| segment.init == "audio")
        })
        .count();
    assert_eq!(audio_segments, 3);
}

#[tokio::test(start_paused = true)]
async fn test_tc_reset_requires_true() {
    let dir = tempdir().unwrap();
    let media = open_media(dir.path(), 2).await;
    let state = Arc::new(ShapingState::new());
    state.set_tc_rate(5.0);
    state.set_tc_active(true);

    let (transport, handle) = test_transport();
    let session = Session::new(transport, media, state.clone());
    let run = tokio::spawn(session.run());

    let mut control = handle.open_control();

    // `false` is a no-op.
    control
        .write_all(&atom(&Message {
            debug: Some(MessageDebug {
                tc_reset: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state.tc_rate(), 5.0);
    assert!(state.is_tc_active());

    // `true` requests the reset and forces streaming back on.
    control
        .write_all(&atom(&Message {
            debug: Some(MessageDebug {
                tc_reset: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(state.tc_reset_requested());
    assert!(!state.is_tc_active());
    assert!(state.is_streaming());

    drop(control);
    run.await.unwrap().unwrap();
    drop(handle);
}

#[tokio::test(start_paused = true)]
async fn test_preferences_are_stored() {
    let dir = tempdir().unwrap();
    let media = open_media(dir.path(), 2).await;
    let state = Arc::new(ShapingState::new());

    let (transport, handle) = test_transport();
    let session = Session::new(transport, media, state);
    let prefs = session.preferences();
    let run = tokio::spawn(session.run());

    let mut control = handle.open_control();
    control
        .write_all(&atom(&Message {
            pref: Some(MessagePref {
                name: "player".into(),
                value: "auto".into(),
            }),
            ..Default::default()
        }))
        .await
        .unwrap();
    drop(control);

    run.await.unwrap().unwrap();

    assert_eq!(prefs.lock().unwrap().get("player"), Some(&"auto".to_string()));
    drop(handle);
}

/// A malformed atom cancels that control stream; the session keeps serving.
#[tokio::test(start_paused = true)]
async fn test_malformed_atom_does_not_kill_session() {
    let dir = tempdir().unwrap();
    let media = open_media(dir.path(), 2).await;
    let state = Arc::new(ShapingState::new());

    let (transport, mut handle) = test_transport();
    let session = Session::new(transport, media, state);
    let run = tokio::spawn(session.run());

    let mut bad = handle.open_control();
    bad.write_all(b"\x00\x00\x00\x10mdatgarbage!").await.unwrap();
    drop(bad);

    // A later control stream still works.
    let mut good = handle.open_control();
    good.write_all(&atom(&Message {
        ping: Some(Default::default()),
        ..Default::default()
    }))
    .await
    .unwrap();
    drop(good);

    run.await.unwrap().unwrap();

    let streams = collect_streams(&mut handle).await;
    assert!(streams.iter().any(|s| s.message.pong.is_some()));
}
