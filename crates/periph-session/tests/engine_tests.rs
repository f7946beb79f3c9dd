#[cfg(test)]
mod tests {
    use periph_config::PeriphConfig;
    use periph_core::{DeviceClass, EngineEvent, PeriphError, SessionState};
    use periph_session::mock::MockBackend;
    use periph_session::{
        AudioRecordOptions, BackendEvent, BackendOutcome, BackendSet, PlaybackOptions,
        SessionEngine, StartParams, VideoOptions,
    };
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn config() -> PeriphConfig {
        let mut config = PeriphConfig::default();
        config.sessions.start_timeout_secs = 2;
        config.sessions.stop_timeout_secs = 2;
        config
    }

    fn engine_with(config: PeriphConfig, camera: &Arc<MockBackend>) -> Arc<SessionEngine> {
        let backends = BackendSet::new()
            .with_camera(camera.clone())
            .with_audio(Arc::new(MockBackend::audio()));
        Arc::new(SessionEngine::new(config, backends))
    }

    fn video(duration_secs: Option<u64>) -> StartParams {
        StartParams::Video(VideoOptions {
            duration_secs,
            ..Default::default()
        })
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    // ── Exclusivity ────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_exactly_one_wins() {
        let camera = Arc::new(MockBackend::camera());
        let engine = engine_with(config(), &camera);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                engine.start_session("cam0", video(None)).await
            }));
        }

        let mut ok = 0;
        let mut busy = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(PeriphError::DeviceBusy { .. }) => busy += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(busy, 7);
        assert_eq!(camera.start_count(), 1);
    }

    #[tokio::test]
    async fn test_disabled_class_never_touches_registry() {
        let camera = Arc::new(MockBackend::camera());
        let mut config = config();
        config.devices.camera = false;
        let engine = engine_with(config, &camera);

        let err = engine.start_session("cam0", video(None)).await.unwrap_err();
        assert!(matches!(err, PeriphError::FeatureDisabled(DeviceClass::Camera)));
        assert!(engine.registry().is_empty());
        assert_eq!(engine.registry().revision(), 0);
        assert_eq!(camera.start_count(), 0);

        let err = engine
            .capture(DeviceClass::Camera, "cam0", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "feature_disabled");
    }

    #[tokio::test]
    async fn test_unknown_device_not_found() {
        let camera = Arc::new(MockBackend::camera());
        let engine = engine_with(config(), &camera);
        let err = engine.start_session("cam9", video(None)).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_capability_mismatch_rejected() {
        let camera = Arc::new(MockBackend::camera());
        let engine = engine_with(config(), &camera);
        let err = engine
            .start_session("speaker0", StartParams::AudioRecord(AudioRecordOptions::default()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        let id = engine
            .start_session(
                "speaker0",
                StartParams::Playback(PlaybackOptions {
                    file: PathBuf::from("/tmp/song.wav"),
                }),
            )
            .await
            .unwrap();
        let session = engine.registry().get(id).unwrap();
        assert_eq!(session.output, PathBuf::from("/tmp/song.wav"));
    }

    // ── The cam0 scenario ──────────────────────────────────────

    #[tokio::test]
    async fn test_recording_busy_then_natural_completion() {
        let camera = Arc::new(MockBackend::camera());
        let engine = engine_with(config(), &camera);

        let s = engine.start_session("cam0", video(Some(10))).await.unwrap();
        assert_eq!(engine.status(s).unwrap().state, SessionState::Running);

        let err = engine.start_session("cam0", video(None)).await.unwrap_err();
        assert_eq!(err.kind(), "device_busy");

        assert!(camera.complete(s));
        assert_eq!(engine.drain_events(), 1);
        assert_eq!(engine.status(s).unwrap().state, SessionState::Completed);

        assert!(engine.start_session("cam0", video(None)).await.is_ok());
    }

    // ── Stop ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_stop_running_completes() {
        let camera = Arc::new(MockBackend::camera());
        let engine = engine_with(config(), &camera);
        let id = engine.start_session("cam0", video(None)).await.unwrap();

        let session = engine.stop_session(id).await.unwrap();
        assert_eq!(session.state, SessionState::Completed);
        assert!(session.ended_at.is_some());
        assert_eq!(camera.stop_count(), 1);
        assert_eq!(engine.registry().active_session("cam0"), None);
    }

    #[tokio::test]
    async fn test_stop_terminal_is_idempotent() {
        let camera = Arc::new(MockBackend::camera());
        let engine = engine_with(config(), &camera);
        let id = engine.start_session("cam0", video(None)).await.unwrap();

        let first = engine.stop_session(id).await.unwrap();
        let revision = engine.registry().revision();
        let second = engine.stop_session(id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(engine.registry().revision(), revision);
        assert_eq!(camera.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_failure_leaves_failed() {
        let camera = Arc::new(MockBackend::camera());
        let engine = engine_with(config(), &camera);
        let id = engine.start_session("cam0", video(None)).await.unwrap();

        camera.fail_next_stop("device unplugged");
        match engine.stop_session(id).await.unwrap_err() {
            PeriphError::Backend {
                message,
                session_id,
            } => {
                assert_eq!(message, "device unplugged");
                assert_eq!(session_id, Some(id.to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
        let session = engine.registry().get(id).unwrap();
        assert_eq!(session.state, SessionState::Failed);
        assert!(engine.start_session("cam0", video(None)).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_races_backend_completion() {
        let camera = Arc::new(MockBackend::camera());
        let engine = engine_with(config(), &camera);

        for _ in 0..25 {
            let id = engine.start_session("cam0", video(None)).await.unwrap();

            let stopper = {
                let engine = engine.clone();
                tokio::spawn(async move { engine.stop_session(id).await })
            };
            let reporter = {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine.report_backend_event(BackendEvent {
                        session_id: id,
                        outcome: BackendOutcome::Completed,
                    })
                })
            };

            let stopped = stopper.await.unwrap().unwrap();
            if let Err(e) = reporter.await.unwrap() {
                assert!(e.is_invalid_transition(), "unexpected error: {e}");
            }
            assert!(matches!(
                stopped.state,
                SessionState::Completed | SessionState::Failed
            ));
            let settled = engine.registry().get(id).unwrap().state;
            assert!(matches!(settled, SessionState::Completed | SessionState::Failed));
        }
    }

    #[tokio::test]
    async fn test_stop_while_stopping_waits() {
        let camera = Arc::new(MockBackend::camera());
        camera.set_stop_delay(Duration::from_millis(100));
        let engine = engine_with(config(), &camera);
        let id = engine.start_session("cam0", video(None)).await.unwrap();

        let (a, b) = tokio::join!(engine.stop_session(id), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            engine.stop_session(id).await
        });
        assert_eq!(a.unwrap().state, SessionState::Completed);
        assert_eq!(b.unwrap().state, SessionState::Completed);
        assert_eq!(camera.stop_count(), 1);
    }

    // ── Cancel ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_cancel_completed_has_no_effect() {
        let camera = Arc::new(MockBackend::camera());
        let engine = engine_with(config(), &camera);
        let id = engine.start_session("cam0", video(None)).await.unwrap();
        camera.complete(id);
        engine.drain_events();

        let before = engine.registry().get(id).unwrap();
        let after = engine.cancel_session(id).await.unwrap();
        assert_eq!(after.state, SessionState::Completed);
        assert_eq!(before, after);
        assert_eq!(engine.registry().revision(), before.revision);
    }

    #[tokio::test]
    async fn test_cancel_running_releases_handle() {
        let camera = Arc::new(MockBackend::camera());
        let engine = engine_with(config(), &camera);
        let id = engine.start_session("cam0", video(None)).await.unwrap();

        let session = engine.cancel_session(id).await.unwrap();
        assert_eq!(session.state, SessionState::Cancelled);
        wait_for(|| camera.stop_count() == 1).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_while_starting_swallows_late_ack() {
        let camera = Arc::new(MockBackend::camera());
        let gate = camera.gate_starts();
        let engine = engine_with(config(), &camera);

        let mut revisions = engine.registry().subscribe();
        let start = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.start_session("cam0", video(None)).await })
        };
        revisions.changed().await.unwrap();
        let id = engine.registry().active_session("cam0").unwrap();
        assert_eq!(engine.registry().get(id).unwrap().state, SessionState::Starting);

        let cancelled = engine.cancel_session(id).await.unwrap();
        assert_eq!(cancelled.state, SessionState::Cancelled);

        gate.notify_one();
        assert_eq!(start.await.unwrap().unwrap(), id);
        assert_eq!(engine.registry().get(id).unwrap().state, SessionState::Cancelled);
        // The late handle is released in the background.
        wait_for(|| camera.stop_count() == 1).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_completion_before_ack_is_deferred() {
        let camera = Arc::new(MockBackend::camera());
        let gate = camera.gate_starts();
        let engine = engine_with(config(), &camera);

        let mut revisions = engine.registry().subscribe();
        let start = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.start_session("cam0", video(Some(1))).await })
        };
        revisions.changed().await.unwrap();
        let id = engine.registry().active_session("cam0").unwrap();

        assert!(camera.complete(id));
        engine.drain_events();
        assert_eq!(engine.registry().get(id).unwrap().state, SessionState::Starting);

        gate.notify_one();
        start.await.unwrap().unwrap();
        assert_eq!(engine.registry().get(id).unwrap().state, SessionState::Completed);
    }

    // ── Start failures ─────────────────────────────────────────

    #[tokio::test]
    async fn test_failed_start_is_queryable() {
        let camera = Arc::new(MockBackend::camera());
        camera.fail_next_start("ffmpeg not found");
        let engine = engine_with(config(), &camera);

        let err = engine.start_session("cam0", video(None)).await.unwrap_err();
        let PeriphError::Backend {
            message,
            session_id: Some(session_id),
        } = err
        else {
            panic!("expected a backend error carrying the session id");
        };
        assert_eq!(message, "ffmpeg not found");

        let status = engine.status(session_id.parse().unwrap()).unwrap();
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(status.error.as_deref(), Some("ffmpeg not found"));
        assert_eq!(engine.registry().active_session("cam0"), None);
    }

    #[tokio::test]
    async fn test_start_timeout_fails_session() {
        let camera = Arc::new(MockBackend::camera());
        let _gate = camera.gate_starts();
        let mut config = config();
        config.sessions.start_timeout_secs = 1;
        let engine = engine_with(config, &camera);

        let err = engine.start_session("cam0", video(None)).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        let session = &engine.registry().list(Some("cam0"))[0];
        assert_eq!(session.state, SessionState::Failed);
        assert!(session.last_error.as_deref().unwrap().contains("1s"));
    }

    // ── Poll / capture ─────────────────────────────────────────

    #[tokio::test]
    async fn test_poll_detects_silent_exit() {
        let camera = Arc::new(MockBackend::camera());
        let engine = engine_with(config(), &camera);
        let id = engine.start_session("cam0", video(None)).await.unwrap();

        assert_eq!(engine.poll_session(id).await.unwrap().state, SessionState::Running);
        camera.exit_silently(id, false);
        let session = engine.poll_session(id).await.unwrap();
        assert_eq!(session.state, SessionState::Failed);
        assert_eq!(session.last_error.as_deref(), Some("exit status 1"));
    }

    #[tokio::test]
    async fn test_capture_creates_no_session() {
        let camera = Arc::new(MockBackend::camera());
        let engine = engine_with(config(), &camera);
        let _recording = engine.start_session("cam0", video(None)).await.unwrap();
        let revision = engine.registry().revision();

        let target = PathBuf::from("/tmp/still.jpg");
        let path = engine
            .capture(DeviceClass::Camera, "cam0", Some(target.clone()))
            .await
            .unwrap();
        assert_eq!(path, target);
        assert_eq!(camera.capture_count(), 1);
        assert_eq!(engine.registry().len(), 1);
        assert_eq!(engine.registry().revision(), revision);
    }

    // ── Sweep / background ─────────────────────────────────────

    #[tokio::test]
    async fn test_sweep_evicts_after_retention() {
        let camera = Arc::new(MockBackend::camera());
        let mut config = config();
        config.sessions.retention_secs = 0;
        config.sessions.reported_retention_secs = 0;
        let engine = engine_with(config, &camera);
        let id = engine.start_session("cam0", video(None)).await.unwrap();

        assert!(engine.sweep().is_empty());
        engine.stop_session(id).await.unwrap();
        let report = engine.sweep();
        assert_eq!(report.evicted, vec![id]);
        assert_eq!(engine.status(id).unwrap_err().kind(), "not_found");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sweep_fails_abandoned_start() {
        let camera = Arc::new(MockBackend::camera());
        let _gate = camera.gate_starts();
        let mut config = config();
        config.sessions.start_timeout_secs = 1;
        let engine = engine_with(config, &camera);

        let mut revisions = engine.registry().subscribe();
        let start = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.start_session("cam0", video(None)).await })
        };
        revisions.changed().await.unwrap();
        let id = engine.registry().active_session("cam0").unwrap();

        // The caller goes away before the backend acknowledges.
        start.abort();
        assert!(start.await.unwrap_err().is_cancelled());
        assert_eq!(engine.registry().get(id).unwrap().state, SessionState::Starting);
        assert!(engine.sweep().timed_out.is_empty());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let report = engine.sweep();
        assert_eq!(report.timed_out, vec![id]);

        let session = engine.registry().get(id).unwrap();
        assert_eq!(session.state, SessionState::Failed);
        assert!(session.last_error.as_deref().unwrap().contains("within 1s"));
        assert_eq!(engine.registry().active_session("cam0"), None);
    }

    #[tokio::test]
    async fn test_poll_running_finds_silent_exits() {
        let camera = Arc::new(MockBackend::camera());
        let engine = engine_with(config(), &camera);
        let quiet = engine.start_session("cam0", video(None)).await.unwrap();
        let mic = engine
            .start_session("mic0", StartParams::AudioRecord(AudioRecordOptions::default()))
            .await
            .unwrap();

        assert!(engine.poll_running().await.is_empty());
        camera.exit_silently(quiet, true);
        assert_eq!(engine.poll_running().await, vec![quiet]);
        assert_eq!(engine.registry().get(quiet).unwrap().state, SessionState::Completed);
        assert_eq!(engine.registry().get(mic).unwrap().state, SessionState::Running);
        assert_eq!(engine.registry().active_session("cam0"), None);
    }

    #[tokio::test]
    async fn test_background_polls_silent_exits() {
        let camera = Arc::new(MockBackend::camera());
        let mut config = config();
        config.sessions.sweep_interval_secs = 1;
        let engine = engine_with(config, &camera);
        let token = CancellationToken::new();
        let background = engine.spawn_background(token.clone());

        let id = engine.start_session("cam0", video(None)).await.unwrap();
        camera.exit_silently(id, false);
        let session = engine
            .wait_terminal(id, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(session.state, SessionState::Failed);
        assert_eq!(session.last_error.as_deref(), Some("exit status 1"));

        token.cancel();
        background.await.unwrap();
    }

    #[tokio::test]
    async fn test_background_pump_applies_backend_events() {
        let camera = Arc::new(MockBackend::camera());
        camera.auto_complete_after(Duration::from_millis(30));
        let engine = engine_with(config(), &camera);
        let token = CancellationToken::new();
        let background = engine.spawn_background(token.clone());

        let id = engine.start_session("cam0", video(Some(1))).await.unwrap();
        let session = engine
            .wait_terminal(id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(session.state, SessionState::Completed);

        token.cancel();
        background.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_active_sessions() {
        let camera = Arc::new(MockBackend::camera());
        let engine = engine_with(config(), &camera);
        let mut events = engine.bus().subscribe();
        let token = CancellationToken::new();
        let background = engine.spawn_background(token.clone());

        let id = engine.start_session("cam0", video(None)).await.unwrap();
        token.cancel();
        background.await.unwrap();

        assert_eq!(engine.registry().get(id).unwrap().state, SessionState::Completed);
        let mut saw_shutdown = false;
        while let Ok(event) = events.try_recv() {
            saw_shutdown |= matches!(event, EngineEvent::Shutdown);
        }
        assert!(saw_shutdown);
    }

    #[tokio::test]
    async fn test_list_sessions_renders_status() {
        let camera = Arc::new(MockBackend::camera());
        let engine = engine_with(config(), &camera);
        engine.start_session("cam0", video(None)).await.unwrap();
        engine
            .start_session("mic0", StartParams::AudioRecord(AudioRecordOptions::default()))
            .await
            .unwrap();

        assert_eq!(engine.list_sessions(None).len(), 2);
        let mic = engine.list_sessions(Some("mic0"));
        assert_eq!(mic.len(), 1);
        assert!(mic[0].summary().contains("audio_recording"));
    }
}
