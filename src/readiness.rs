use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffState;
use crate::config::PollerConfig;
use crate::error::QueryError;

/// The part of the backend's environment resource the poller cares about.
///
/// A missing `is_creating` field means the environment is not being created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct EnvironmentStatus {
    #[serde(default)]
    pub is_creating: bool,
}

/// Answers "is environment X still being created".
#[async_trait]
pub trait EnvironmentStatusSource: Send + Sync {
    async fn environment_status(&self, environment_id: &str)
        -> Result<EnvironmentStatus, QueryError>;
}

/// What a view gated on environment readiness should show.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadinessView {
    /// No answer yet for the first query.
    Loading,
    /// The environment is still being provisioned.
    Preparing,
    /// Render the environment-dependent content.
    Ready,
}

/// Per-view polling state. Never shared between views.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvironmentReadinessState {
    pub environment_id: Option<String>,
    /// `None` until a query has succeeded.
    pub is_creating: Option<bool>,
    /// Latched once a non-creating answer is seen.
    pub settled: bool,
    pub queries: u32,
    pub consecutive_failures: u32,
}

impl EnvironmentReadinessState {
    fn for_environment(environment_id: Option<String>) -> Self {
        Self {
            environment_id,
            ..Self::default()
        }
    }

    pub fn view(&self) -> ReadinessView {
        if self.environment_id.is_none() || self.settled {
            return ReadinessView::Ready;
        }
        match self.is_creating {
            None => ReadinessView::Loading,
            Some(true) => ReadinessView::Preparing,
            Some(false) => ReadinessView::Ready,
        }
    }
}

/// Starts readiness polls. Cheap to clone; every [ReadinessHandle] it creates is independent.
#[derive(Clone)]
pub struct ReadinessPoller {
    source: Arc<dyn EnvironmentStatusSource>,
    config: PollerConfig,
}

impl ReadinessPoller {
    pub fn new(source: Arc<dyn EnvironmentStatusSource>, config: PollerConfig) -> Self {
        Self { source, config }
    }

    /// Begin polling `environment_id`.
    ///
    /// Without an id there is nothing to wait for: the handle is `Ready` at once and no query is
    /// made. Otherwise the first query starts immediately on the current tokio runtime. Outside a
    /// runtime nothing can poll, so the handle comes back already cancelled.
    pub fn watch(&self, environment_id: Option<String>) -> ReadinessHandle {
        let (changes, _) =
            watch::channel(EnvironmentReadinessState::for_environment(environment_id.clone()));
        let shared = Arc::new(Shared {
            changes,
            cancel: CancellationToken::new(),
        });

        let id = match environment_id {
            Some(id) => id,
            None => return ReadinessHandle { shared, task: None },
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(
                    "cannot poll readiness of environment {} outside a tokio runtime",
                    id
                );
                shared.cancel();
                return ReadinessHandle { shared, task: None };
            }
        };

        debug!("polling readiness of environment {}", id);
        let task = runtime.spawn(poll(
            Arc::clone(&self.source),
            self.config.clone(),
            id,
            Arc::clone(&shared),
        ));
        ReadinessHandle {
            shared,
            task: Some(task),
        }
    }
}

struct Shared {
    changes: watch::Sender<EnvironmentReadinessState>,
    cancel: CancellationToken,
}

impl Shared {
    /// Applies `update` unless the handle has been cancelled. The cancellation check and the
    /// update happen under the same lock that [Shared::cancel] takes.
    fn apply(&self, update: impl FnOnce(&mut EnvironmentReadinessState)) -> bool {
        self.changes.send_if_modified(|state| {
            if self.cancel.is_cancelled() {
                return false;
            }
            update(state);
            true
        })
    }

    fn cancel(&self) {
        self.changes.send_if_modified(|_| {
            self.cancel.cancel();
            false
        });
    }
}

async fn poll(
    source: Arc<dyn EnvironmentStatusSource>,
    config: PollerConfig,
    environment_id: String,
    shared: Arc<Shared>,
) {
    let mut backoff = BackoffState::new(config.backoff.clone());
    loop {
        let result = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return,
            result = source.environment_status(&environment_id) => result,
        };

        let delay = match result {
            Ok(status) => {
                backoff.register_success();
                let applied = shared.apply(|state| {
                    state.queries += 1;
                    state.consecutive_failures = 0;
                    state.is_creating = Some(status.is_creating);
                    if !status.is_creating {
                        state.settled = true;
                    }
                });
                if !applied {
                    return;
                }
                if !status.is_creating {
                    info!("environment {} is ready", environment_id);
                    return;
                }
                debug!("environment {} is still being created", environment_id);
                config.interval
            }
            Err(e) => {
                let retry_in = config.interval.max(backoff.register_error());
                warn!(
                    "readiness query for environment {} failed, retrying in {:?}: {}",
                    environment_id, retry_in, e
                );
                let applied = shared.apply(|state| {
                    state.queries += 1;
                    state.consecutive_failures += 1;
                });
                if !applied {
                    return;
                }
                retry_in
            }
        };

        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }
    }
}

/// One view's readiness poll. Dropping the handle cancels it.
pub struct ReadinessHandle {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl ReadinessHandle {
    pub fn environment_id(&self) -> Option<String> {
        self.shared.changes.borrow().environment_id.clone()
    }

    pub fn view(&self) -> ReadinessView {
        self.shared.changes.borrow().view()
    }

    pub fn state(&self) -> EnvironmentReadinessState {
        self.shared.changes.borrow().clone()
    }

    pub fn changes(&self) -> watch::Receiver<EnvironmentReadinessState> {
        self.shared.changes.subscribe()
    }

    /// Waits until the view is `Ready`. Returns false if the handle is cancelled first.
    pub async fn ready(&self) -> bool {
        let mut changes = self.changes();
        tokio::select! {
            result = changes.wait_for(|state| state.view() == ReadinessView::Ready) => result.is_ok(),
            _ = self.shared.cancel.cancelled() => self.view() == ReadinessView::Ready,
        }
    }

    /// Stop polling. Once this returns, no in-flight or scheduled query can change the state.
    pub fn cancel(&self) {
        if !self.shared.cancel.is_cancelled() {
            debug!("cancelling readiness poll for {:?}", self.environment_id());
        }
        self.shared.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// True once no more queries will be made, either because the poll settled or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(JoinHandle::is_finished).unwrap_or(true)
    }
}

impl Drop for ReadinessHandle {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}

impl std::fmt::Debug for ReadinessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessHandle")
            .field("state", &*self.shared.changes.borrow())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Owns the readiness poll of a single view and follows its environment id.
///
/// Switching to a different id cancels the old poll and starts a new one; setting the same id
/// again keeps the existing poll, so a settled environment stays settled. A poll that was
/// cancelled through [ReadinessGate::handle] is restarted by the next `set_environment`.
pub struct ReadinessGate {
    poller: ReadinessPoller,
    current: ReadinessHandle,
}

impl ReadinessGate {
    pub fn new(poller: ReadinessPoller, environment_id: Option<String>) -> Self {
        let current = poller.watch(environment_id);
        Self { poller, current }
    }

    pub fn set_environment(&mut self, environment_id: Option<String>) -> &ReadinessHandle {
        if self.current.is_cancelled() || self.current.environment_id() != environment_id {
            self.current.cancel();
            self.current = self.poller.watch(environment_id);
        }
        &self.current
    }

    pub fn handle(&self) -> &ReadinessHandle {
        &self.current
    }

    pub fn view(&self) -> ReadinessView {
        self.current.view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_common::ScriptedStatusSource;
    use spectral::prelude::*;
    use std::time::Duration;
    use test_case::test_case;
    use tokio::time::Instant;

    fn creating(is_creating: bool) -> Result<EnvironmentStatus, QueryError> {
        Ok(EnvironmentStatus { is_creating })
    }

    fn poller_for(source: &Arc<ScriptedStatusSource>) -> ReadinessPoller {
        ReadinessPoller::new(source.clone(), PollerConfig::default())
    }

    fn env(id: &str) -> Option<String> {
        Some(id.to_string())
    }

    #[test_case(None, None, false, ReadinessView::Ready)]
    #[test_case(Some("e"), None, false, ReadinessView::Loading)]
    #[test_case(Some("e"), Some(true), false, ReadinessView::Preparing)]
    #[test_case(Some("e"), Some(false), false, ReadinessView::Ready)]
    #[test_case(Some("e"), Some(true), true, ReadinessView::Ready)]
    fn view_from_state(
        id: Option<&str>,
        is_creating: Option<bool>,
        settled: bool,
        expected: ReadinessView,
    ) {
        let state = EnvironmentReadinessState {
            environment_id: id.map(str::to_string),
            is_creating,
            settled,
            ..EnvironmentReadinessState::default()
        };
        assert_that!(state.view()).is_equal_to(expected);
    }

    #[test]
    fn environment_status_reads_backend_resource() {
        let status: EnvironmentStatus = serde_json::from_str(
            r#"{"id": 12, "name": "Staging", "api_key": "abc", "is_creating": true}"#,
        )
        .expect("should parse");
        assert_that!(status.is_creating).is_true();

        let status: EnvironmentStatus =
            serde_json::from_str(r#"{"id": 12}"#).expect("should parse");
        assert_that!(status.is_creating).is_false();
    }

    #[tokio::test(start_paused = true)]
    async fn no_environment_means_ready_without_queries() {
        let source = Arc::new(ScriptedStatusSource::new(vec![creating(true)]));
        let handle = poller_for(&source).watch(None);

        assert_that!(handle.view()).is_equal_to(ReadinessView::Ready);
        assert_that!(handle.ready().await).is_true();
        assert_that!(handle.is_finished()).is_true();
        sleep(Duration::from_secs(10)).await;
        assert_that!(source.call_count()).is_equal_to(0);
        assert_that!(handle.state().queries).is_equal_to(0);
    }

    #[tokio::test(start_paused = true)]
    async fn settles_after_single_ready_response() {
        let source = Arc::new(ScriptedStatusSource::new(vec![creating(false)]));
        let handle = poller_for(&source).watch(env("env_1"));
        assert_that!(handle.view()).is_equal_to(ReadinessView::Loading);

        assert_that!(handle.ready().await).is_true();
        sleep(Duration::from_secs(10)).await;

        assert_that!(source.call_count()).is_equal_to(1);
        let state = handle.state();
        assert_that!(state.settled).is_true();
        assert_that!(state.queries).is_equal_to(1);
        assert_that!(handle.is_finished()).is_true();
    }

    #[tokio::test(start_paused = true)]
    async fn polls_every_second_while_creating() {
        let source = Arc::new(ScriptedStatusSource::new(vec![
            creating(true),
            creating(true),
            creating(false),
        ]));
        let started = Instant::now();
        let handle = poller_for(&source).watch(env("env_1"));
        assert_that!(handle.view()).is_equal_to(ReadinessView::Loading);

        sleep(Duration::from_millis(500)).await;
        assert_that!(handle.view()).is_equal_to(ReadinessView::Preparing);
        sleep(Duration::from_millis(1000)).await;
        assert_that!(handle.view()).is_equal_to(ReadinessView::Preparing);
        sleep(Duration::from_millis(1000)).await;
        assert_that!(handle.view()).is_equal_to(ReadinessView::Ready);

        sleep(Duration::from_secs(10)).await;
        let offsets: Vec<Duration> = source
            .calls()
            .into_iter()
            .map(|(id, at)| {
                assert_that!(id.as_str()).is_equal_to("env_1");
                at - started
            })
            .collect();
        assert_that!(offsets).is_equal_to(vec![
            Duration::ZERO,
            Duration::from_millis(1000),
            Duration::from_millis(2000),
        ]);
        assert_that!(handle.state().settled).is_true();
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_polling_while_creating() {
        let source = Arc::new(ScriptedStatusSource::new(vec![creating(true)]));
        let handle = poller_for(&source).watch(env("env_1"));

        sleep(Duration::from_millis(9500)).await;
        assert_that!(source.call_count()).is_equal_to(10);
        assert_that!(handle.view()).is_equal_to(ReadinessView::Preparing);
        assert_that!(handle.is_finished()).is_false();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_queries_back_off_and_keep_polling() {
        let source = Arc::new(ScriptedStatusSource::new(vec![
            Err(QueryError::Network("connection refused".into())),
            Err(QueryError::Status(502)),
            creating(false),
        ]));
        let started = Instant::now();
        let handle = poller_for(&source).watch(env("env_1"));

        sleep(Duration::from_millis(1500)).await;
        assert_that!(handle.view()).is_equal_to(ReadinessView::Loading);
        assert_that!(handle.state().consecutive_failures).is_equal_to(2);

        assert_that!(handle.ready().await).is_true();
        let offsets: Vec<Duration> = source.calls().into_iter().map(|(_, at)| at - started).collect();
        assert_that!(offsets).is_equal_to(vec![
            Duration::ZERO,
            Duration::from_millis(1000),
            Duration::from_millis(3000),
        ]);
        let state = handle.state();
        assert_that!(state.consecutive_failures).is_equal_to(0);
        assert_that!(state.queries).is_equal_to(3);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_preparing_keeps_preparing() {
        let source = Arc::new(ScriptedStatusSource::new(vec![
            creating(true),
            Err(QueryError::Decode("unexpected end of input".into())),
        ]));
        let handle = poller_for(&source).watch(env("env_1"));

        sleep(Duration::from_millis(1500)).await;
        assert_that!(handle.view()).is_equal_to(ReadinessView::Preparing);
        assert_that!(handle.state().is_creating).contains_value(true);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_in_flight_query_discards_response() {
        let source = Arc::new(
            ScriptedStatusSource::new(vec![creating(false)]).with_latency(Duration::from_millis(300)),
        );
        let handle = poller_for(&source).watch(env("env_1"));

        sleep(Duration::from_millis(100)).await;
        handle.cancel();
        let before = handle.state();
        sleep(Duration::from_secs(5)).await;

        assert_that!(handle.state()).is_equal_to(before.clone());
        assert_that!(before.queries).is_equal_to(0);
        assert_that!(handle.view()).is_equal_to(ReadinessView::Loading);
        assert_that!(source.call_count()).is_equal_to(1);
        assert_that!(handle.is_finished()).is_true();
        assert_that!(handle.ready().await).is_false();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_between_polls_stops_schedule() {
        let source = Arc::new(ScriptedStatusSource::new(vec![creating(true), creating(false)]));
        let handle = poller_for(&source).watch(env("env_1"));

        sleep(Duration::from_millis(500)).await;
        handle.cancel();
        sleep(Duration::from_secs(5)).await;

        assert_that!(source.call_count()).is_equal_to(1);
        assert_that!(handle.view()).is_equal_to(ReadinessView::Preparing);
        assert_that!(handle.is_cancelled()).is_true();
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_stops_polling() {
        let source = Arc::new(ScriptedStatusSource::new(vec![creating(true)]));
        let handle = poller_for(&source).watch(env("env_1"));
        let mut changes = handle.changes();

        sleep(Duration::from_millis(500)).await;
        drop(handle);
        changes.borrow_and_update();
        sleep(Duration::from_secs(5)).await;

        assert_that!(source.call_count()).is_equal_to(1);
        assert_that!(changes.has_changed().unwrap_or(false)).is_false();
    }

    #[tokio::test(start_paused = true)]
    async fn gate_follows_environment_changes() {
        let source = Arc::new(ScriptedStatusSource::new(vec![creating(false)]));
        let mut gate = ReadinessGate::new(poller_for(&source), env("a"));
        assert_that!(gate.handle().ready().await).is_true();

        gate.set_environment(env("a"));
        sleep(Duration::from_secs(2)).await;
        assert_that!(source.call_count()).is_equal_to(1);
        assert_that!(gate.view()).is_equal_to(ReadinessView::Ready);

        let handle = gate.set_environment(env("b"));
        assert_that!(handle.view()).is_equal_to(ReadinessView::Loading);
        assert_that!(gate.handle().ready().await).is_true();
        assert_that!(source.calls().last().map(|(id, _)| id.clone())).contains_value("b".to_string());

        gate.set_environment(None);
        assert_that!(gate.view()).is_equal_to(ReadinessView::Ready);
        sleep(Duration::from_secs(2)).await;
        assert_that!(source.call_count()).is_equal_to(2);
    }

    #[test]
    fn watching_outside_runtime_returns_cancelled_handle() {
        let source = Arc::new(ScriptedStatusSource::new(vec![creating(false)]));
        let poller = poller_for(&source);

        let handle = poller.watch(env("env_1"));
        assert_that!(handle.is_cancelled()).is_true();
        assert_that!(handle.is_finished()).is_true();
        assert_that!(handle.view()).is_equal_to(ReadinessView::Loading);
        assert_that!(source.call_count()).is_equal_to(0);

        let handle = poller.watch(None);
        assert_that!(handle.view()).is_equal_to(ReadinessView::Ready);
        assert_that!(handle.is_cancelled()).is_false();
    }

    #[tokio::test(start_paused = true)]
    async fn gate_restarts_poll_cancelled_through_its_handle() {
        let source = Arc::new(ScriptedStatusSource::new(vec![creating(true), creating(false)]));
        let mut gate = ReadinessGate::new(poller_for(&source), env("env_1"));

        sleep(Duration::from_millis(500)).await;
        gate.handle().cancel();
        assert_that!(gate.view()).is_equal_to(ReadinessView::Preparing);

        let handle = gate.set_environment(env("env_1"));
        assert_that!(handle.is_cancelled()).is_false();
        assert_that!(gate.handle().ready().await).is_true();
        assert_that!(source.call_count()).is_equal_to(2);
    }

    #[tokio::test(start_paused = true)]
    async fn retargeting_discards_old_environment_response() {
        let source = Arc::new(
            ScriptedStatusSource::new(vec![creating(false), creating(true)])
                .with_latency(Duration::from_millis(300)),
        );
        let mut gate = ReadinessGate::new(poller_for(&source), env("old"));
        let mut old_changes = gate.handle().changes();
        old_changes.borrow_and_update();

        sleep(Duration::from_millis(100)).await;
        gate.set_environment(env("new"));
        sleep(Duration::from_millis(700)).await;

        assert_that!(old_changes.has_changed().unwrap_or(false)).is_false();
        assert_that!(old_changes.borrow().queries).is_equal_to(0);
        assert_that!(gate.view()).is_equal_to(ReadinessView::Preparing);
    }
}
