//! Polling state machine for downloads performed by an on-device store.
//!
//! The waiter issues a trigger, then lists marker files with exponential
//! backoff until a `download-complete` marker appears with no download still in
//! progress. A run of `stall_threshold` incomplete polls re-issues the trigger
//! and restarts the backoff; the whole wait is bounded by a wall-clock budget.

use std::{
    collections::BTreeSet,
    sync::{Arc, OnceLock},
    time::Duration,
};

use apkm_util::Clock;
use async_trait::async_trait;
use regex::Regex;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::cancel::cancel_requested;
use crate::config::WaiterConfig;
use crate::error::{AcquireError, AcquireResult};

const IN_PROGRESS: &str = "download-in-progress";
const COMPLETE: &str = "download-complete";

/// Where the waiter sends triggers and reads progress markers from.
#[async_trait]
pub trait MarkerSource: Send + Sync {
    async fn trigger(&self) -> AcquireResult<()>;
    /// Marker paths, newest first.
    async fn list_markers(&self) -> AcquireResult<Vec<String>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitPhase {
    Idle,
    Triggered,
    Polling,
    Stalled,
    Completed,
    Failed,
}

#[derive(Clone, Debug)]
pub struct DownloadWaitState {
    pub phase: WaitPhase,
    pub polls: u32,
    pub polls_since_trigger: u32,
    pub triggers: u32,
    pub last_markers: BTreeSet<String>,
    pub elapsed: Duration,
}

impl Default for DownloadWaitState {
    fn default() -> Self {
        Self {
            phase: WaitPhase::Idle,
            polls: 0,
            polls_since_trigger: 0,
            triggers: 0,
            last_markers: BTreeSet::new(),
            elapsed: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaitOutcome {
    pub version_code: i64,
    pub polls: u32,
    pub retriggers: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MarkerObservation {
    pub complete: Option<i64>,
    pub in_progress: bool,
}

/// Delay before poll `polls_since_trigger` (zero-based) after a trigger.
pub fn backoff_delay(config: &WaiterConfig, polls_since_trigger: u32) -> Duration {
    let exponent = config
        .min_exponent
        .saturating_add(polls_since_trigger)
        .min(config.max_exponent)
        .min(63);
    Duration::from_secs(1u64 << exponent)
}

/// `{package}.{versionCode}.download-complete`; group 1 is the version code.
fn complete_marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\.(\d+)\.download-complete").expect("valid marker pattern")
    })
}

pub(crate) fn observe_markers(
    package: &str,
    markers: &[String],
) -> AcquireResult<MarkerObservation> {
    let version_re = complete_marker_pattern();
    let mut observation = MarkerObservation {
        complete: None,
        in_progress: false,
    };
    for marker in markers {
        let name = marker.rsplit('/').next().unwrap_or(marker);
        if name.contains(IN_PROGRESS) {
            observation.in_progress = true;
        } else if name.contains(COMPLETE) && observation.complete.is_none() {
            let version = version_re
                .captures(name)
                .and_then(|caps| caps[1].parse::<i64>().ok())
                .ok_or_else(|| AcquireError::MarkerParse {
                    package: package.to_string(),
                    marker: marker.clone(),
                })?;
            observation.complete = Some(version);
        }
    }
    Ok(observation)
}

pub struct DownloadWaiter {
    package: String,
    source: Arc<dyn MarkerSource>,
    clock: Arc<dyn Clock>,
    config: WaiterConfig,
    cancel_rx: Option<watch::Receiver<bool>>,
    state: DownloadWaitState,
}

impl DownloadWaiter {
    pub fn new(
        package: &str,
        source: Arc<dyn MarkerSource>,
        clock: Arc<dyn Clock>,
        config: WaiterConfig,
        cancel_rx: Option<watch::Receiver<bool>>,
    ) -> Self {
        Self {
            package: package.to_string(),
            source,
            clock,
            config,
            cancel_rx,
            state: DownloadWaitState::default(),
        }
    }

    pub fn state(&self) -> &DownloadWaitState {
        &self.state
    }

    /// Runs the waiter on its own task.
    pub fn spawn(self) -> JoinHandle<AcquireResult<WaitOutcome>> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> AcquireResult<WaitOutcome> {
        let result = self.drive().await;
        if result.is_err() {
            self.transition(WaitPhase::Failed);
        }
        result
    }

    fn transition(&mut self, phase: WaitPhase) {
        if self.state.phase != phase {
            debug!("{}: {:?} -> {:?}", self.package, self.state.phase, phase);
            self.state.phase = phase;
        }
    }

    fn check_cancel(&self) -> AcquireResult<()> {
        if cancel_requested(self.cancel_rx.as_ref()) {
            info!("{}: download wait cancelled", self.package);
            return Err(AcquireError::Cancelled {
                package: self.package.clone(),
            });
        }
        Ok(())
    }

    async fn fire_trigger(&mut self) -> AcquireResult<()> {
        self.source.trigger().await?;
        self.state.triggers += 1;
        self.state.polls_since_trigger = 0;
        self.transition(WaitPhase::Triggered);
        Ok(())
    }

    fn record_markers(&mut self, markers: Vec<String>) {
        let markers: BTreeSet<String> = markers.into_iter().collect();
        if markers != self.state.last_markers {
            debug!("{}: markers now {:?}", self.package, markers);
            self.state.last_markers = markers;
        }
    }

    async fn drive(&mut self) -> AcquireResult<WaitOutcome> {
        let started = self.clock.elapsed();
        info!("{}: requested download", self.package);
        self.fire_trigger().await?;

        loop {
            self.transition(WaitPhase::Polling);
            self.check_cancel()?;

            let remaining = self.config.budget.saturating_sub(self.state.elapsed);
            let delay = backoff_delay(&self.config, self.state.polls_since_trigger).min(remaining);
            self.clock.sleep(delay).await;
            self.check_cancel()?;

            let markers = self.source.list_markers().await?;
            self.state.polls += 1;
            let observation = observe_markers(&self.package, &markers)?;
            self.record_markers(markers);
            self.state.elapsed = self.clock.elapsed().saturating_sub(started);

            if let (Some(version_code), false) = (observation.complete, observation.in_progress) {
                self.transition(WaitPhase::Completed);
                info!(
                    "{}: downloaded version {version_code} after {} polls",
                    self.package, self.state.polls
                );
                return Ok(WaitOutcome {
                    version_code,
                    polls: self.state.polls,
                    retriggers: self.state.triggers.saturating_sub(1),
                });
            }

            self.state.polls_since_trigger += 1;
            if self.state.elapsed >= self.config.budget {
                return Err(AcquireError::DownloadTimeout {
                    package: self.package.clone(),
                    elapsed: self.state.elapsed,
                    triggers: self.state.triggers,
                });
            }
            if self.state.polls_since_trigger >= self.config.stall_threshold.max(1) {
                self.transition(WaitPhase::Stalled);
                warn!(
                    "{}: no completed download after {} polls, requesting again",
                    self.package, self.state.polls_since_trigger
                );
                self.fire_trigger().await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicU32, Ordering},
            Mutex,
        },
    };

    use apkm_util::ManualClock;

    use super::*;

    /// Marker listings replayed in order; the last one repeats.
    #[derive(Default)]
    pub(crate) struct ScriptedMarkers {
        script: Mutex<VecDeque<Vec<String>>>,
        last: Mutex<Vec<String>>,
        triggers: AtomicU32,
    }

    impl ScriptedMarkers {
        pub(crate) fn new(script: Vec<Vec<&str>>) -> Self {
            let script = script
                .into_iter()
                .map(|listing| listing.into_iter().map(str::to_string).collect())
                .collect();
            Self {
                script: Mutex::new(script),
                ..Self::default()
            }
        }

        pub(crate) fn triggers(&self) -> u32 {
            self.triggers.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MarkerSource for ScriptedMarkers {
        async fn trigger(&self) -> AcquireResult<()> {
            self.triggers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn list_markers(&self) -> AcquireResult<Vec<String>> {
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.script.lock().unwrap().pop_front() {
                *last = next;
            }
            Ok(last.clone())
        }
    }

    const IN_PROGRESS_MARKER: &str = "sdcard/Aurora/Store/Downloads/org.example/.42.download-in-progress";
    const COMPLETE_MARKER: &str = "sdcard/Aurora/Store/Downloads/org.example/.42.download-complete";

    fn config(stall_threshold: u32, budget_secs: u64) -> WaiterConfig {
        WaiterConfig {
            stall_threshold,
            budget: Duration::from_secs(budget_secs),
            ..WaiterConfig::default()
        }
    }

    async fn wait(
        markers: Arc<ScriptedMarkers>,
        clock: Arc<ManualClock>,
        config: WaiterConfig,
    ) -> AcquireResult<WaitOutcome> {
        DownloadWaiter::new("org.example", markers, clock, config, None)
            .spawn()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn retriggers_once_per_stall_threshold() {
        for (in_progress_polls, threshold) in [(0, 3), (2, 3), (3, 3), (7, 3), (13, 6)] {
            let mut script = vec![vec![IN_PROGRESS_MARKER]; in_progress_polls];
            script.push(vec![COMPLETE_MARKER]);
            let markers = Arc::new(ScriptedMarkers::new(script));
            let clock = Arc::new(ManualClock::new());

            let outcome = wait(markers.clone(), clock, config(threshold, 1800))
                .await
                .unwrap();

            let expected = in_progress_polls as u32 / threshold;
            assert_eq!(outcome.version_code, 42);
            assert_eq!(outcome.polls, in_progress_polls as u32 + 1);
            assert_eq!(outcome.retriggers, expected, "N={in_progress_polls} T={threshold}");
            assert_eq!(markers.triggers(), expected + 1);
        }
    }

    #[tokio::test]
    async fn backoff_restarts_after_retrigger() {
        let mut script = vec![vec![IN_PROGRESS_MARKER]; 4];
        script.push(vec![COMPLETE_MARKER]);
        let markers = Arc::new(ScriptedMarkers::new(script));
        let clock = Arc::new(ManualClock::new());

        wait(markers, clock.clone(), config(3, 1800)).await.unwrap();

        let secs: Vec<u64> = clock.sleeps().iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![1, 2, 4, 1, 2]);
    }

    #[test]
    fn backoff_is_capped() {
        let config = WaiterConfig {
            min_exponent: 2,
            ..WaiterConfig::default()
        };
        assert_eq!(backoff_delay(&config, 0), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 4), Duration::from_secs(64));
        assert_eq!(backoff_delay(&config, 40), Duration::from_secs(64));
    }

    #[tokio::test]
    async fn never_completing_times_out_after_retriggering() {
        let markers = Arc::new(ScriptedMarkers::new(vec![vec![IN_PROGRESS_MARKER]]));
        let clock = Arc::new(ManualClock::new());

        let err = wait(markers.clone(), clock.clone(), config(3, 120))
            .await
            .unwrap_err();

        match err {
            AcquireError::DownloadTimeout { elapsed, triggers, .. } => {
                assert!(elapsed >= Duration::from_secs(120));
                assert!(triggers >= 2);
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(markers.triggers() >= 2);
        assert_eq!(clock.elapsed(), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn complete_with_download_still_running_keeps_polling() {
        let markers = Arc::new(ScriptedMarkers::new(vec![
            vec![
                ".43.download-in-progress",
                "sdcard/Aurora/Store/Downloads/org.example/.42.download-complete",
            ],
            vec![".43.download-complete", ".42.download-complete"],
        ]));
        let outcome = wait(markers, Arc::new(ManualClock::new()), config(6, 1800))
            .await
            .unwrap();
        assert_eq!(outcome.version_code, 43);
        assert_eq!(outcome.polls, 2);
    }

    #[tokio::test]
    async fn malformed_complete_marker_is_a_parse_error() {
        let markers = Arc::new(ScriptedMarkers::new(vec![vec![".latest.download-complete"]]));
        let err = wait(markers, Arc::new(ManualClock::new()), config(6, 1800))
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::MarkerParse { .. }));
    }

    #[test]
    fn complete_marker_reports_its_version_code() {
        let markers = vec![COMPLETE_MARKER.to_string()];
        let first = observe_markers("org.example", &markers).unwrap();
        let second = observe_markers("org.example", &markers).unwrap();
        assert_eq!(first.complete, Some(42));
        assert_eq!(second.complete, Some(42));
        assert!(std::ptr::eq(complete_marker_pattern(), complete_marker_pattern()));
    }

    #[tokio::test]
    async fn cancellation_stops_before_polling() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let markers = Arc::new(ScriptedMarkers::new(vec![vec![COMPLETE_MARKER]]));
        let clock = Arc::new(ManualClock::new());

        let err = DownloadWaiter::new(
            "org.example",
            markers.clone(),
            clock.clone(),
            config(6, 1800),
            Some(rx),
        )
        .run()
        .await
        .unwrap_err();

        assert!(matches!(err, AcquireError::Cancelled { .. }));
        assert_eq!(markers.triggers(), 1);
        assert!(clock.sleeps().is_empty());
    }
}
