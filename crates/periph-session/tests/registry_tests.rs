#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use periph_core::{EngineEvent, EventBus, SessionKind, SessionState};
    use periph_session::{BackendHandle, BackendOutcome, SessionRegistry};
    use std::path::PathBuf;
    use std::time::Duration;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(EventBus::default())
    }

    fn create_cam(reg: &SessionRegistry) -> periph_core::SessionId {
        reg.create("cam0", SessionKind::VideoRecording, PathBuf::from("/tmp/a.mp4"))
            .unwrap()
    }

    // ── Creation / exclusivity ─────────────────────────────────

    #[test]
    fn test_create_starts_in_starting() {
        let reg = registry();
        let id = create_cam(&reg);
        let session = reg.get(id).unwrap();
        assert_eq!(session.state, SessionState::Starting);
        assert_eq!(session.device_id, "cam0");
        assert_eq!(reg.active_session("cam0"), Some(id));
        assert_eq!(reg.revision(), 1);
    }

    #[test]
    fn test_second_create_is_device_busy() {
        let reg = registry();
        let first = create_cam(&reg);
        let err = reg
            .create("cam0", SessionKind::VideoRecording, PathBuf::new())
            .unwrap_err();
        assert_eq!(err.kind(), "device_busy");
        assert!(err.to_string().contains(&first.to_string()));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_other_device_not_blocked() {
        let reg = registry();
        create_cam(&reg);
        assert!(
            reg.create("mic0", SessionKind::AudioRecording, PathBuf::new())
                .is_ok()
        );
    }

    #[test]
    fn test_terminal_state_releases_slot() {
        let reg = registry();
        let id = create_cam(&reg);
        reg.transition(id, SessionState::Failed, Some("boom".into()))
            .unwrap();
        assert_eq!(reg.active_session("cam0"), None);
        let session = reg.get(id).unwrap();
        assert_eq!(session.last_error.as_deref(), Some("boom"));
        assert!(session.ended_at.is_some());
        assert!(create_cam(&reg) != id);
    }

    // ── Transitions ────────────────────────────────────────────

    #[test]
    fn test_invalid_transition_leaves_state() {
        let reg = registry();
        let id = create_cam(&reg);
        let before = reg.revision();
        let err = reg
            .transition(id, SessionState::Stopping, None)
            .unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(reg.get(id).unwrap().state, SessionState::Starting);
        assert_eq!(reg.revision(), before);
    }

    #[test]
    fn test_terminal_is_final() {
        let reg = registry();
        let id = create_cam(&reg);
        reg.transition(id, SessionState::Cancelled, None).unwrap();
        for next in [
            SessionState::Running,
            SessionState::Completed,
            SessionState::Failed,
        ] {
            assert!(reg.transition(id, next, None).unwrap_err().is_invalid_transition());
        }
    }

    #[test]
    fn test_failed_without_detail_gets_default_error() {
        let reg = registry();
        let id = create_cam(&reg);
        let session = reg.transition(id, SessionState::Failed, None).unwrap();
        assert_eq!(session.last_error.as_deref(), Some("backend reported failure"));
    }

    #[test]
    fn test_unknown_session_not_found() {
        let reg = registry();
        let err = reg.get(periph_core::SessionId::new()).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    // ── Start acknowledgment ───────────────────────────────────

    #[test]
    fn test_commit_running_attaches_handle() {
        let reg = registry();
        let id = create_cam(&reg);
        let handle = BackendHandle::new("test");
        let handle_id = handle.id();
        let session = reg.commit_running(id, handle).unwrap();
        assert_eq!(session.state, SessionState::Running);
        assert_eq!(reg.handle_id(id), Some(handle_id));
        assert_eq!(reg.take_handle(id).map(|h| h.id()), Some(handle_id));
        assert!(reg.take_handle(id).is_none());
    }

    #[test]
    fn test_commit_after_cancel_hands_back_handle() {
        let reg = registry();
        let id = create_cam(&reg);
        reg.transition(id, SessionState::Cancelled, None).unwrap();

        let handle = BackendHandle::new("late");
        let handle_id = handle.id();
        let (err, returned) = reg.commit_running(id, handle).unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(returned.id(), handle_id);
        assert_eq!(reg.get(id).unwrap().state, SessionState::Cancelled);
    }

    #[test]
    fn test_deferred_outcome_applied_on_commit() {
        let reg = registry();
        let id = create_cam(&reg);
        reg.defer_outcome(id, BackendOutcome::Failed("device unplugged".into()))
            .unwrap();
        assert_eq!(reg.get(id).unwrap().state, SessionState::Starting);

        let session = reg.commit_running(id, BackendHandle::new("h")).unwrap();
        assert_eq!(session.state, SessionState::Failed);
        assert_eq!(session.last_error.as_deref(), Some("device unplugged"));
        assert_eq!(reg.active_session("cam0"), None);
    }

    #[test]
    fn test_defer_outside_starting_rejected() {
        let reg = registry();
        let id = create_cam(&reg);
        reg.commit_running(id, BackendHandle::new("h")).unwrap();
        let err = reg.defer_outcome(id, BackendOutcome::Completed).unwrap_err();
        assert!(err.is_invalid_transition());
    }

    // ── Listing / revision ─────────────────────────────────────

    #[test]
    fn test_list_filters_by_device() {
        let reg = registry();
        let cam = create_cam(&reg);
        reg.create("mic0", SessionKind::AudioRecording, PathBuf::new())
            .unwrap();
        let sessions = reg.list(Some("cam0"));
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, cam);
        assert_eq!(reg.list(None).len(), 2);
    }

    #[tokio::test]
    async fn test_revision_watch_fires_on_transition() {
        let reg = registry();
        let id = create_cam(&reg);
        let mut rx = reg.subscribe();
        reg.transition(id, SessionState::Running, None).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 2);
        assert_eq!(reg.get(id).unwrap().revision, 2);
    }

    #[test]
    fn test_transitions_published_on_bus() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let reg = SessionRegistry::new(bus);
        let id = create_cam(&reg);
        reg.transition(id, SessionState::Running, None).unwrap();

        assert!(matches!(rx.try_recv().unwrap(), EngineEvent::SessionCreated { .. }));
        match rx.try_recv().unwrap() {
            EngineEvent::SessionTransitioned { from, to, revision, .. } => {
                assert_eq!(from, SessionState::Starting);
                assert_eq!(to, SessionState::Running);
                assert_eq!(revision, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    // ── Timeouts / eviction ────────────────────────────────────

    #[test]
    fn test_stale_starting() {
        let reg = registry();
        let stale = create_cam(&reg);
        let running = reg
            .create("mic0", SessionKind::AudioRecording, PathBuf::new())
            .unwrap();
        reg.transition(running, SessionState::Running, None).unwrap();

        let later = Utc::now() + ChronoDuration::seconds(30);
        assert_eq!(reg.stale_starting(later, Duration::from_secs(10)), vec![stale]);
        assert!(reg.stale_starting(Utc::now(), Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_eviction_respects_reported_retention() {
        let reg = registry();
        let id = create_cam(&reg);
        reg.transition(id, SessionState::Completed, None).unwrap();

        let later = Utc::now() + ChronoDuration::seconds(60);
        let retention = Duration::from_secs(300);
        let reported = Duration::from_secs(30);

        assert!(reg.evict_expired(later, retention, reported).is_empty());
        reg.mark_reported(id);
        assert_eq!(reg.evict_expired(later, retention, reported), vec![id]);
        assert_eq!(reg.get(id).unwrap_err().kind(), "not_found");
    }

    #[test]
    fn test_active_sessions_never_evicted() {
        let reg = registry();
        let id = create_cam(&reg);
        reg.mark_reported(id);
        let much_later = Utc::now() + ChronoDuration::days(1);
        assert!(
            reg.evict_expired(much_later, Duration::ZERO, Duration::ZERO)
                .is_empty()
        );
        assert!(reg.get(id).is_ok());
    }
}
