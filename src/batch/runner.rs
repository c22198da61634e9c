use chrono::Utc;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::report::{BatchReport, BatchStatus, TargetOutcome, TargetReport};
use crate::config::{FailurePolicy, MAX_RETRIES, RunConfig};
use crate::engine::{DiagnosticEngine, ProbeConfig};
use crate::lookup::{GeoConnector, GeoSession};
use crate::output::{ModeSinks, SinkFactory, TargetHeader};
use crate::probe::select_source_address;
use crate::targets::TargetDescriptor;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("no targets to trace")]
    NoTargets,
    #[error("failed to open geolocation session: {0:#}")]
    Geo(anyhow::Error),
}

/// Runs a fixed list of targets through the engine, one at a time.
///
/// Method, family, output mode, failure policy and retries come from the
/// [`RunConfig`] and stay fixed for every batch this runner executes.
pub struct BatchRunner {
    config: RunConfig,
    engine: Arc<dyn DiagnosticEngine>,
    geo: Arc<dyn GeoConnector>,
    sinks: Arc<dyn SinkFactory>,
}

impl BatchRunner {
    pub fn new(
        mut config: RunConfig,
        engine: Arc<dyn DiagnosticEngine>,
        geo: Arc<dyn GeoConnector>,
    ) -> Self {
        if config.retries > MAX_RETRIES {
            tracing::warn!(requested = config.retries, max = MAX_RETRIES, "clamping retries");
            config.retries = MAX_RETRIES;
        }
        let sinks = Arc::new(ModeSinks::from_config(&config));
        Self {
            config,
            engine,
            geo,
            sinks,
        }
    }

    /// Replace the sinks picked from the run mode
    pub fn with_sinks(mut self, sinks: Arc<dyn SinkFactory>) -> Self {
        self.sinks = sinks;
        self
    }

    /// Trace every target in order.
    ///
    /// The geolocation session is opened once before the first target and
    /// released exactly once however the loop ends. Cancelling `cancel`
    /// stops the in-flight invocation and leaves the rest `NotRun`.
    pub async fn run(
        &self,
        targets: &[TargetDescriptor],
        cancel: CancellationToken,
    ) -> Result<BatchReport, BatchError> {
        if targets.is_empty() {
            return Err(BatchError::NoTargets);
        }

        let started_at = Utc::now();
        let session = self.geo.connect().map_err(BatchError::Geo)?;
        let session = scopeguard::guard(session, |session| {
            session.release();
            tracing::debug!("geolocation session released");
        });

        tracing::info!(
            targets = targets.len(),
            method = self.config.method.label(),
            policy = ?self.config.policy,
            "starting batch"
        );

        let mut reports = Vec::with_capacity(targets.len());
        let mut status = BatchStatus::Completed;

        for (idx, target) in targets.iter().enumerate() {
            if cancel.is_cancelled() {
                status = BatchStatus::Interrupted;
                break;
            }
            if idx > 0
                && let Err(e) = self.sinks.separator()
            {
                tracing::warn!(error = %e, "failed to write separator");
            }

            let report = self.run_target(target, (*session).clone(), &cancel).await;
            let outcome = report.outcome.clone();
            reports.push(report);

            match outcome {
                TargetOutcome::Interrupted => {
                    status = BatchStatus::Interrupted;
                    break;
                }
                TargetOutcome::Failed { .. } if self.config.policy == FailurePolicy::AbortOnError => {
                    tracing::error!(dst = %target, "aborting batch after failure");
                    status = BatchStatus::AbortedOnError;
                    break;
                }
                _ => {}
            }
        }

        for target in &targets[reports.len()..] {
            reports.push(TargetReport::not_run(target));
        }

        drop(session);
        Ok(BatchReport {
            status,
            started_at,
            finished_at: Utc::now(),
            targets: reports,
            skipped: Vec::new(),
        })
    }

    fn source_for(&self, target: &TargetDescriptor) -> Option<IpAddr> {
        match self.config.source_interface.as_deref() {
            Some(iface) => select_source_address(Some(iface), target.family()),
            // Mismatched families are dropped by ProbeConfig::for_target
            None => self.config.source_address,
        }
    }

    async fn run_target(
        &self,
        target: &TargetDescriptor,
        geo: Arc<dyn GeoSession>,
        cancel: &CancellationToken,
    ) -> TargetReport {
        let source = self.source_for(target);
        let probe = ProbeConfig::for_target(&self.config, target, source, geo);
        tracing::info!(dst = %target, source = ?probe.source_address, "tracing");

        let mut sink = self.sinks.open(target);
        if let Err(e) = sink.begin(&TargetHeader::new(target, &self.config)) {
            tracing::warn!(dst = %target, error = %e, "failed to write header");
        }

        let mut attempts: u8 = 0;
        let outcome = loop {
            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = self.engine.run_probe(&probe, sink.as_mut()) => Some(r),
            };

            match result {
                None => {
                    tracing::info!(dst = %target, "interrupted");
                    break TargetOutcome::Interrupted;
                }
                Some(Ok(summary)) => {
                    break TargetOutcome::Succeeded {
                        hops: summary.hops,
                        reached: summary.reached,
                        attempts,
                    };
                }
                Some(Err(e)) if e.is_retryable() && attempts <= self.config.retries => {
                    tracing::warn!(dst = %target, attempt = attempts, error = %e, "retrying");
                    if let Err(err) = sink.retry(attempts + 1, &e) {
                        tracing::warn!(dst = %target, error = %err, "failed to mark retry");
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(dst = %target, error = %e, "trace failed");
                    break TargetOutcome::Failed {
                        kind: e.kind,
                        message: e.message,
                        attempts,
                    };
                }
            }
        };

        if let Err(e) = sink.finish() {
            tracing::warn!(dst = %target, error = %e, "failed to close output");
        }

        TargetReport {
            label: target.label().to_string(),
            destination: target.address(),
            source_address: probe.source_address,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, EngineErrorKind, HopProbe, HopRecord, TraceSummary};
    use crate::lookup::{GeoInfo, NoGeo};
    use crate::output::OutputSink;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Engine that replays scripted results and records every call
    #[derive(Default)]
    struct ScriptedEngine {
        script: Mutex<VecDeque<Result<(), EngineErrorKind>>>,
        calls: Mutex<Vec<ProbeConfig>>,
    }

    impl ScriptedEngine {
        fn new(script: Vec<Result<(), EngineErrorKind>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl DiagnosticEngine for ScriptedEngine {
        async fn run_probe(
            &self,
            config: &ProbeConfig,
            sink: &mut dyn OutputSink,
        ) -> Result<TraceSummary, EngineError> {
            self.calls.lock().push(config.clone());
            let step = self.script.lock().pop_front().unwrap_or(Ok(()));
            match step {
                Ok(()) => {
                    let hop = HopRecord {
                        ttl: 1,
                        probes: vec![HopProbe::reply(config.destination, Duration::from_millis(3))],
                    };
                    sink.render(&hop).map_err(|e| EngineError::new(EngineErrorKind::Output, e.to_string()))?;
                    let mut summary = TraceSummary::default();
                    summary.record(&hop, config.destination);
                    Ok(summary)
                }
                Err(kind) => Err(EngineError::new(kind, "scripted")),
            }
        }
    }

    /// Engine that never finishes on its own
    struct HangingEngine;

    #[async_trait]
    impl DiagnosticEngine for HangingEngine {
        async fn run_probe(
            &self,
            _config: &ProbeConfig,
            _sink: &mut dyn OutputSink,
        ) -> Result<TraceSummary, EngineError> {
            std::future::pending().await
        }
    }

    #[derive(Default)]
    struct CountingGeo {
        connects: AtomicUsize,
        releases: Arc<AtomicUsize>,
    }

    struct CountingSession(Arc<AtomicUsize>);

    impl GeoSession for CountingSession {
        fn lookup(&self, _ip: IpAddr, _lang: &str) -> Option<GeoInfo> {
            None
        }

        fn release(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl GeoConnector for CountingGeo {
        fn connect(&self) -> anyhow::Result<Arc<dyn GeoSession>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingSession(self.releases.clone())))
        }
    }

    /// Discards output but counts what it was given
    #[derive(Default)]
    struct NullSinks {
        opened: AtomicUsize,
        separators: AtomicUsize,
    }

    struct NullSink;

    impl OutputSink for NullSink {
        fn begin(&mut self, _header: &TargetHeader) -> io::Result<()> {
            Ok(())
        }
        fn render(&mut self, _hop: &HopRecord) -> io::Result<()> {
            Ok(())
        }
        fn retry(&mut self, _attempt: u8, _error: &EngineError) -> io::Result<()> {
            Ok(())
        }
        fn finish(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SinkFactory for NullSinks {
        fn open(&self, _target: &TargetDescriptor) -> Box<dyn OutputSink> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Box::new(NullSink)
        }
        fn separator(&self) -> io::Result<()> {
            self.separators.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Keeps every line a target's sink was given, in order
    #[derive(Default)]
    struct RecordingSinks {
        lines: Arc<Mutex<Vec<String>>>,
    }

    struct RecordingSink(Arc<Mutex<Vec<String>>>);

    impl OutputSink for RecordingSink {
        fn begin(&mut self, header: &TargetHeader) -> io::Result<()> {
            self.0.lock().push(format!("begin {}", header.label));
            Ok(())
        }
        fn render(&mut self, hop: &HopRecord) -> io::Result<()> {
            self.0.lock().push(crate::output::format_hop(hop));
            Ok(())
        }
        fn retry(&mut self, attempt: u8, error: &EngineError) -> io::Result<()> {
            self.0.lock().push(crate::output::format_retry(attempt, error));
            Ok(())
        }
        fn finish(&mut self) -> io::Result<()> {
            self.0.lock().push("end".to_string());
            Ok(())
        }
    }

    impl SinkFactory for RecordingSinks {
        fn open(&self, _target: &TargetDescriptor) -> Box<dyn OutputSink> {
            Box::new(RecordingSink(self.lines.clone()))
        }
        fn separator(&self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Renders the first hop, then times out until `failures` runs out
    struct FlakyEngine {
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakyEngine {
        fn new(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DiagnosticEngine for FlakyEngine {
        async fn run_probe(
            &self,
            config: &ProbeConfig,
            sink: &mut dyn OutputSink,
        ) -> Result<TraceSummary, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let gateway: IpAddr = "198.51.100.1".parse().unwrap();
            let hop = HopRecord {
                ttl: 1,
                probes: vec![HopProbe::reply(gateway, Duration::from_millis(1))],
            };
            sink.render(&hop).map_err(|e| EngineError::new(EngineErrorKind::Output, e.to_string()))?;

            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(EngineError::new(EngineErrorKind::Timeout, "no reply"));
            }
            let mut summary = TraceSummary::default();
            summary.record(&hop, config.destination);
            Ok(summary)
        }
    }

    fn targets(n: usize) -> Vec<TargetDescriptor> {
        (1..=n)
            .map(|i| TargetDescriptor::new(format!("192.0.2.{}", i).parse().unwrap(), format!("t{}", i)))
            .collect()
    }

    struct Harness {
        runner: BatchRunner,
        engine: Arc<ScriptedEngine>,
        geo: Arc<CountingGeo>,
        sinks: Arc<NullSinks>,
    }

    fn harness(config: RunConfig, script: Vec<Result<(), EngineErrorKind>>) -> Harness {
        let engine = Arc::new(ScriptedEngine::new(script));
        let geo = Arc::new(CountingGeo::default());
        let sinks = Arc::new(NullSinks::default());
        let runner = BatchRunner::new(config, engine.clone(), geo.clone()).with_sinks(sinks.clone());
        Harness {
            runner,
            engine,
            geo,
            sinks,
        }
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected_without_session() {
        let h = harness(RunConfig::default(), vec![]);
        let err = h.runner.run(&[], CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BatchError::NoTargets));
        assert_eq!(h.geo.connects.load(Ordering::SeqCst), 0);
        assert_eq!(h.geo.releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_targets_run_in_order() {
        let h = harness(RunConfig::default(), vec![]);
        let list = targets(3);
        let report = h.runner.run(&list, CancellationToken::new()).await.unwrap();

        assert_eq!(report.status, BatchStatus::Completed);
        assert!(report.is_success());
        let called: Vec<_> = h.engine.calls.lock().iter().map(|c| c.destination).collect();
        let expected: Vec<_> = list.iter().map(|t| t.address()).collect();
        assert_eq!(called, expected);
        assert_eq!(h.sinks.opened.load(Ordering::SeqCst), 3);
        assert_eq!(h.sinks.separators.load(Ordering::SeqCst), 2);
        assert_eq!(h.geo.connects.load(Ordering::SeqCst), 1);
        assert_eq!(h.geo.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_continue_on_error_runs_everything() {
        let h = harness(
            RunConfig::default(),
            vec![Ok(()), Err(EngineErrorKind::InvalidDestination), Ok(())],
        );
        let report = h.runner.run(&targets(3), CancellationToken::new()).await.unwrap();

        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(h.engine.calls.lock().len(), 3);
        assert!(report.targets[1].outcome.is_failure());
        assert!(matches!(report.targets[2].outcome, TargetOutcome::Succeeded { .. }));
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_abort_on_error_stops_loop() {
        let config = RunConfig {
            policy: FailurePolicy::AbortOnError,
            ..RunConfig::default()
        };
        let h = harness(config, vec![Ok(()), Err(EngineErrorKind::PermissionDenied)]);
        let report = h.runner.run(&targets(4), CancellationToken::new()).await.unwrap();

        assert_eq!(report.status, BatchStatus::AbortedOnError);
        assert_eq!(h.engine.calls.lock().len(), 2);
        assert_eq!(report.targets.len(), 4);
        assert_eq!(report.targets[2].outcome, TargetOutcome::NotRun);
        assert_eq!(report.targets[3].outcome, TargetOutcome::NotRun);
        assert_eq!(h.geo.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried() {
        let config = RunConfig {
            retries: 2,
            ..RunConfig::default()
        };
        let h = harness(
            config,
            vec![Err(EngineErrorKind::Timeout), Err(EngineErrorKind::Transient), Ok(())],
        );
        let report = h.runner.run(&targets(1), CancellationToken::new()).await.unwrap();

        assert_eq!(h.engine.calls.lock().len(), 3);
        assert_eq!(
            report.targets[0].outcome,
            TargetOutcome::Succeeded {
                hops: 1,
                reached: true,
                attempts: 3
            }
        );
    }

    #[tokio::test]
    async fn test_retries_are_bounded_and_skip_fatal_errors() {
        let config = RunConfig {
            retries: 1,
            ..RunConfig::default()
        };
        let h = harness(
            config,
            vec![
                Err(EngineErrorKind::Timeout),
                Err(EngineErrorKind::Timeout),
                Err(EngineErrorKind::PermissionDenied),
            ],
        );
        let report = h.runner.run(&targets(2), CancellationToken::new()).await.unwrap();

        // Two attempts on the first target, one on the second
        assert_eq!(h.engine.calls.lock().len(), 3);
        assert!(matches!(
            report.targets[0].outcome,
            TargetOutcome::Failed { kind: EngineErrorKind::Timeout, attempts: 2, .. }
        ));
        assert!(matches!(
            report.targets[1].outcome,
            TargetOutcome::Failed { kind: EngineErrorKind::PermissionDenied, attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_retried_attempts_are_marked_in_output() {
        let config = RunConfig {
            retries: 2,
            ..RunConfig::default()
        };
        let sinks = Arc::new(RecordingSinks::default());
        let runner = BatchRunner::new(config, Arc::new(FlakyEngine::new(2)), Arc::new(CountingGeo::default()))
            .with_sinks(sinks.clone());
        let report = runner.run(&targets(1), CancellationToken::new()).await.unwrap();

        assert!(matches!(
            report.targets[0].outcome,
            TargetOutcome::Succeeded { attempts: 3, .. }
        ));
        assert_eq!(
            *sinks.lines.lock(),
            [
                "begin t1",
                " 1  198.51.100.1  1.00 ms",
                "-- attempt 2 after timeout: no reply",
                " 1  198.51.100.1  1.00 ms",
                "-- attempt 3 after timeout: no reply",
                " 1  198.51.100.1  1.00 ms",
                "end",
            ]
        );
    }

    #[tokio::test]
    async fn test_oversized_retry_count_is_clamped() {
        let config = RunConfig {
            retries: u8::MAX,
            ..RunConfig::default()
        };
        let engine = Arc::new(FlakyEngine::new(usize::MAX));
        let runner = BatchRunner::new(config, engine.clone(), Arc::new(CountingGeo::default()))
            .with_sinks(Arc::new(NullSinks::default()));
        let report = runner.run(&targets(1), CancellationToken::new()).await.unwrap();

        let expected = MAX_RETRIES + 1;
        assert_eq!(engine.calls.load(Ordering::SeqCst), usize::from(expected));
        assert!(matches!(
            report.targets[0].outcome,
            TargetOutcome::Failed { kind: EngineErrorKind::Timeout, attempts, .. } if attempts == expected
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let h = harness(RunConfig::default(), vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = h.runner.run(&targets(2), cancel).await.unwrap();

        assert_eq!(report.status, BatchStatus::Interrupted);
        assert!(h.engine.calls.lock().is_empty());
        assert_eq!(report.not_run(), 2);
        assert_eq!(h.geo.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_in_flight_engine() {
        let geo = Arc::new(CountingGeo::default());
        let runner = BatchRunner::new(RunConfig::default(), Arc::new(HangingEngine), geo.clone())
            .with_sinks(Arc::new(NullSinks::default()));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = runner.run(&targets(3), cancel).await.unwrap();
        assert_eq!(report.status, BatchStatus::Interrupted);
        assert_eq!(report.targets[0].outcome, TargetOutcome::Interrupted);
        assert_eq!(report.targets[1].outcome, TargetOutcome::NotRun);
        assert_eq!(geo.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_source_override_follows_target_family() {
        let config = RunConfig {
            source_address: Some("203.0.113.5".parse().unwrap()),
            ..RunConfig::default()
        };
        let h = harness(config, vec![]);
        let list = vec![
            TargetDescriptor::new("192.0.2.1".parse().unwrap(), "v4"),
            TargetDescriptor::new("2001:db8::1".parse().unwrap(), "v6"),
        ];
        let report = h.runner.run(&list, CancellationToken::new()).await.unwrap();

        assert_eq!(report.targets[0].source_address, Some("203.0.113.5".parse().unwrap()));
        assert_eq!(report.targets[1].source_address, None);
    }

    #[tokio::test]
    async fn test_geo_connect_failure_is_reported() {
        struct Broken;
        impl GeoConnector for Broken {
            fn connect(&self) -> anyhow::Result<Arc<dyn GeoSession>> {
                anyhow::bail!("database missing")
            }
        }

        let runner = BatchRunner::new(
            RunConfig::default(),
            Arc::new(ScriptedEngine::default()),
            Arc::new(Broken),
        )
        .with_sinks(Arc::new(NullSinks::default()));
        let err = runner.run(&targets(1), CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("database missing"));
    }

    #[test]
    fn test_no_geo_session_is_inert() {
        let session: Arc<dyn GeoSession> = Arc::new(NoGeo);
        assert!(session.lookup("192.0.2.1".parse().unwrap(), "en").is_none());
        session.release();
    }
}
