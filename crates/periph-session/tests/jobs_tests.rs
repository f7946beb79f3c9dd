#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use periph_config::PeriphConfig;
    use periph_core::{EngineEvent, EventBus, JobState, PeriphError};
    use periph_session::mock::MockSpooler;
    use periph_session::{
        BackendSet, DeviceCatalog, JobPoller, PrintFormat, PrintOptions, SpoolerJobState,
    };
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        poller: JobPoller,
        spooler: Arc<MockSpooler>,
        doc: PathBuf,
        _dir: TempDir,
    }

    fn fixture_with(config: PeriphConfig) -> Fixture {
        let spooler = Arc::new(MockSpooler::new());
        let backends = BackendSet::new().with_printer(spooler.clone());
        let catalog = DeviceCatalog::new(config.devices.clone(), backends);
        let poller = JobPoller::new(catalog, config.printer.clone(), EventBus::default());

        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("doc.pdf");
        std::fs::write(&doc, b"%PDF-1.4\n").unwrap();
        Fixture {
            poller,
            spooler,
            doc,
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(PeriphConfig::default())
    }

    // ── Submission ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_print_then_refresh_to_completed() {
        let f = fixture();
        let job_id = f
            .poller
            .submit("printer1", &f.doc, PrintOptions::default())
            .await
            .unwrap();
        assert_eq!(f.poller.get(&job_id).unwrap().state, JobState::Queued);

        f.spooler.set_state(&job_id, SpoolerJobState::Completed);
        let job = f.poller.refresh(&job_id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let f = fixture();
        let err = f
            .poller
            .submit("printer1", &PathBuf::from("/no/such/doc.pdf"), PrintOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PeriphError::NotFound { entity: "file", .. }));
        assert!(f.spooler.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_printer_not_found() {
        let f = fixture();
        let err = f
            .poller
            .submit("printer9", &f.doc, PrintOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_zero_copies_rejected() {
        let f = fixture();
        let options = PrintOptions {
            copies: 0,
            ..Default::default()
        };
        let err = f.poller.submit("printer1", &f.doc, options).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[tokio::test]
    async fn test_print_as_pdf_sets_format() {
        let f = fixture();
        f.poller
            .print_as_pdf("printer1", &f.doc, PrintOptions::default())
            .await
            .unwrap();
        let submissions = f.spooler.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].0, "printer1");
        assert_eq!(submissions[0].2.format, PrintFormat::Pdf);
    }

    #[tokio::test]
    async fn test_spooler_submit_failure_records_nothing() {
        let f = fixture();
        f.spooler.fail_next_submit("printer offline");
        let err = f
            .poller
            .submit("printer1", &f.doc, PrintOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "backend_error");
        assert!(f.poller.list(None).is_empty());
    }

    #[tokio::test]
    async fn test_disabled_printer_feature_disabled() {
        let mut config = PeriphConfig::default();
        config.devices.printer = false;
        let f = fixture_with(config);
        let err = f
            .poller
            .submit("printer1", &f.doc, PrintOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PeriphError::FeatureDisabled(_)));
        assert_eq!(f.poller.get("printer1-1").unwrap_err().kind(), "feature_disabled");
    }

    // ── Refresh ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_refresh_maps_spooler_states() {
        let f = fixture();
        let job_id = f
            .poller
            .submit("printer1", &f.doc, PrintOptions::default())
            .await
            .unwrap();

        f.spooler.set_state(&job_id, SpoolerJobState::Processing);
        assert_eq!(f.poller.refresh(&job_id).await.unwrap().state, JobState::Printing);

        f.spooler
            .set_state(&job_id, SpoolerJobState::Aborted("paper jam".into()));
        let job = f.poller.refresh(&job_id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("paper jam"));

        let status = f.poller.status(&job_id).await.unwrap();
        assert_eq!(status.error.as_deref(), Some("paper jam"));
    }

    #[tokio::test]
    async fn test_refresh_all_counts_changes() {
        let f = fixture();
        let a = f
            .poller
            .submit("printer1", &f.doc, PrintOptions::default())
            .await
            .unwrap();
        let _b = f
            .poller
            .submit("printer1", &f.doc, PrintOptions::default())
            .await
            .unwrap();

        f.spooler.set_state(&a, SpoolerJobState::Processing);
        assert_eq!(f.poller.refresh_all().await, 1);
        assert_eq!(f.poller.refresh_all().await, 0);

        let status = f.poller.printer_status("printer1").await.unwrap();
        assert_eq!(status.printing, 1);
        assert_eq!(status.queued, 1);
    }

    #[tokio::test]
    async fn test_transitions_published() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let spooler = Arc::new(MockSpooler::new());
        let config = PeriphConfig::default();
        let catalog = DeviceCatalog::new(
            config.devices.clone(),
            BackendSet::new().with_printer(spooler.clone()),
        );
        let poller = JobPoller::new(catalog, config.printer.clone(), bus);
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("a.txt");
        std::fs::write(&doc, "hello").unwrap();

        let job_id = poller
            .submit("printer1", &doc, PrintOptions::default())
            .await
            .unwrap();
        spooler.set_state(&job_id, SpoolerJobState::Completed);
        poller.refresh(&job_id).await.unwrap();

        assert!(matches!(rx.try_recv().unwrap(), EngineEvent::JobSubmitted { .. }));
        match rx.try_recv().unwrap() {
            EngineEvent::JobUpdated { from, to, .. } => {
                assert_eq!(from, JobState::Queued);
                assert_eq!(to, JobState::Completed);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    // ── Cancel ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_cancel_accepted() {
        let f = fixture();
        let job_id = f
            .poller
            .submit("printer1", &f.doc, PrintOptions::default())
            .await
            .unwrap();
        let job = f.poller.cancel(&job_id).await.unwrap();
        assert_eq!(job.state, JobState::Cancelled);

        // A terminal local state is not reopened by the spooler.
        f.spooler.set_state(&job_id, SpoolerJobState::Processing);
        assert_eq!(f.poller.refresh(&job_id).await.unwrap().state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_refused() {
        let f = fixture();
        let job_id = f
            .poller
            .submit("printer1", &f.doc, PrintOptions::default())
            .await
            .unwrap();
        f.spooler.refuse_cancel("job is held by another user");

        match f.poller.cancel(&job_id).await.unwrap_err() {
            PeriphError::CancelRejected { job_id: id, reason } => {
                assert_eq!(id, job_id);
                assert_eq!(reason, "job is held by another user");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(f.poller.get(&job_id).unwrap().state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_cancel_terminal_is_noop() {
        let f = fixture();
        let job_id = f
            .poller
            .submit("printer1", &f.doc, PrintOptions::default())
            .await
            .unwrap();
        f.spooler.set_state(&job_id, SpoolerJobState::Completed);
        f.poller.refresh(&job_id).await.unwrap();
        f.spooler.refuse_cancel("never asked");

        let job = f.poller.cancel(&job_id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_unknown_job_not_found() {
        let f = fixture();
        assert_eq!(f.poller.refresh("nope").await.unwrap_err().kind(), "not_found");
        assert_eq!(f.poller.cancel("nope").await.unwrap_err().kind(), "not_found");
    }

    // ── Retention ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_evict_expired_terminal_jobs() {
        let f = fixture();
        let done = f
            .poller
            .submit("printer1", &f.doc, PrintOptions::default())
            .await
            .unwrap();
        let pending = f
            .poller
            .submit("printer1", &f.doc, PrintOptions::default())
            .await
            .unwrap();
        f.spooler.set_state(&done, SpoolerJobState::Completed);
        f.poller.refresh(&done).await.unwrap();

        assert!(f.poller.evict_expired(Utc::now()).is_empty());
        let later = Utc::now() + ChronoDuration::hours(2);
        assert_eq!(f.poller.evict_expired(later), vec![done]);
        assert!(f.poller.get(&pending).is_ok());
    }
}
