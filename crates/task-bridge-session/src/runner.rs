//! Task runner: drives one `TaskRun` at a time over a shared controller.

use std::sync::{Arc, Mutex, PoisonError};

use task_bridge_core::{
    BridgeError, Command, FailureReason, HistoryStore, RunFeed, RunId, RunStatus, RunUpdate,
    TaskRequest, TaskRun, Transition,
};
use tokio::sync::{oneshot, watch};

use crate::controller::SessionController;
use crate::demux::{BridgeEvent, CloseCause, SessionClosed, Subscription};

struct RunnerInner {
    controller: SessionController,
    history: Option<Arc<dyn HistoryStore>>,
    run: watch::Sender<TaskRun>,
    /// Id of the last run whose teardown is complete.
    settled: watch::Sender<Option<RunId>>,
    feed: RunFeed,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl RunnerInner {
    /// Apply `f` to the run and publish the resulting transition.
    fn update(&self, f: impl FnOnce(&mut TaskRun) -> Transition) -> Transition {
        let mut transition = Transition::Ignored;
        self.run.send_if_modified(|run| {
            transition = f(run);
            transition.is_change()
        });
        self.publish(&transition);
        transition
    }

    fn publish(&self, transition: &Transition) {
        match transition {
            Transition::Ignored => {}
            Transition::Accepted(task_id) => {
                tracing::info!("Task accepted as {task_id}");
                self.feed.push(RunUpdate::Status {
                    status: self.run.borrow().status,
                });
            }
            Transition::Logged(line) => self.feed.push(RunUpdate::Log(line.clone())),
            Transition::OtpRequested(prompt) => {
                tracing::info!("Worker requested a one-time passcode");
                self.feed.push(RunUpdate::Status {
                    status: RunStatus::AwaitingOtp,
                });
                self.feed.push(RunUpdate::OtpRequired {
                    prompt: prompt.clone(),
                });
            }
            Transition::Status(status) => self.feed.push(RunUpdate::Status { status: *status }),
            Transition::Succeeded | Transition::Failed(_) => {
                let run = self.run.borrow().clone();
                match &run.failure {
                    Some(reason) => tracing::warn!("Run {} failed: {reason}", run.id),
                    None => tracing::info!("Run {} succeeded", run.id),
                }
                self.feed.push(RunUpdate::Finished {
                    status: run.status,
                    failure: run.failure.clone(),
                    url: run.result_url().map(str::to_string),
                });
            }
        }
    }

    fn settle(&self) {
        let id = self.run.borrow().id;
        self.stop.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.settled.send_replace(Some(id));
    }

    /// Teardown after a terminal event: close the run's session, persist
    /// history.
    async fn finish(&self, session: Option<u64>) {
        match session {
            // A newer session on a shared controller belongs to someone else.
            Some(session) => {
                self.controller.disconnect_session(session);
            }
            None => self.controller.disconnect(),
        }
        let record = self.run.borrow().history_record();
        if let (Some(record), Some(store)) = (record, &self.history) {
            if let Err(e) = store.append(record).await {
                tracing::error!("Failed to persist history record: {e}");
            }
        }
        self.settle();
    }
}

/// Runs dispatched jobs one at a time.
///
/// Cheap to clone; clones drive the same run.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

impl TaskRunner {
    /// Create a runner without history persistence.
    #[must_use]
    pub fn new(controller: SessionController) -> Self {
        Self::build(controller, None)
    }

    /// Create a runner that appends a record for every successful run.
    #[must_use]
    pub fn with_history(controller: SessionController, history: Arc<dyn HistoryStore>) -> Self {
        Self::build(controller, Some(history))
    }

    fn build(controller: SessionController, history: Option<Arc<dyn HistoryStore>>) -> Self {
        let (run, _) = watch::channel(TaskRun::default());
        let (settled, _) = watch::channel(None);
        Self {
            inner: Arc::new(RunnerInner {
                controller,
                history,
                run,
                settled,
                feed: RunFeed::new(),
                stop: Mutex::new(None),
            }),
        }
    }

    /// Validate, connect on demand, and send a `TASK_EXECUTION`.
    ///
    /// Returns once the command is on the wire; progress arrives through
    /// [`watch`](Self::watch) and [`feed`](Self::feed).
    ///
    /// # Errors
    /// Returns `Validation` before anything is sent, `RunInProgress` if a
    /// run is active, or the connect/send error. Connect and send failures
    /// also fail the run with the matching reason.
    pub async fn dispatch(&self, request: TaskRequest) -> Result<RunId, BridgeError> {
        let command = request.to_command()?;
        let fresh = TaskRun::dispatching(&request);
        let id = fresh.id;

        let mut started = false;
        self.inner.run.send_if_modified(|run| {
            // The previous run must also be torn down.
            let unsettled =
                run.status.is_terminal() && *self.inner.settled.borrow() != Some(run.id);
            if run.status.is_active() || unsettled {
                return false;
            }
            *run = fresh;
            started = true;
            true
        });
        if !started {
            return Err(BridgeError::RunInProgress);
        }

        self.inner.feed.reset();
        self.inner.feed.push(RunUpdate::Status {
            status: RunStatus::Dispatching,
        });
        tracing::info!("Dispatching {} as run {id}", request.task());

        // Subscribe before connecting so no early frame is missed.
        let events = self.inner.controller.subscribe();
        if let Err(e) = self.inner.controller.connect().await {
            self.inner.update(|run| run.fail(FailureReason::from(&e)));
            self.inner.settle();
            return Err(e);
        }
        if let Err(e) = self.inner.controller.send_command(&command) {
            self.inner.update(|run| run.fail(FailureReason::from(&e)));
            self.inner.controller.disconnect();
            self.inner.settle();
            return Err(e);
        }
        self.inner.update(TaskRun::mark_sent);
        let session = self.inner.controller.session();

        let (stop_tx, stop_rx) = oneshot::channel();
        *self.inner.stop.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop_tx);
        tokio::spawn(drive(Arc::clone(&self.inner), session, events, stop_rx));
        Ok(id)
    }

    /// Answer the pending `OTP_REQUIRED` prompt.
    ///
    /// # Errors
    /// Returns `Validation` for a blank code, `NoOtpPending` if the run is not
    /// waiting for one, or `NotConnected` if the session is gone.
    pub fn submit_otp(&self, code: &str) -> Result<(), BridgeError> {
        let command = Command::otp_response(code)?;
        if self.inner.run.borrow().status != RunStatus::AwaitingOtp {
            return Err(BridgeError::NoOtpPending);
        }
        self.inner.controller.send_command(&command)?;
        self.inner.update(TaskRun::otp_submitted);
        Ok(())
    }

    /// Stop the active run locally and close the session.
    ///
    /// No cancel frame is sent upstream. Returns `false` if nothing was
    /// active.
    pub fn cancel(&self) -> bool {
        if !self.inner.update(TaskRun::cancel).is_terminal() {
            return false;
        }
        tracing::info!("Run cancelled");
        if let Some(stop) = self
            .inner
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = stop.send(());
        }
        self.inner.controller.disconnect();
        self.inner.settle();
        true
    }

    /// Current run.
    #[must_use]
    pub fn snapshot(&self) -> TaskRun {
        self.inner.run.borrow().clone()
    }

    /// Watch run changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<TaskRun> {
        self.inner.run.subscribe()
    }

    /// Status changes, log lines, prompts, and the finish notice.
    #[must_use]
    pub fn feed(&self) -> &RunFeed {
        &self.inner.feed
    }

    #[must_use]
    pub fn controller(&self) -> &SessionController {
        &self.inner.controller
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.run.borrow().status.is_active()
    }

    /// Wait until the current run is terminal and torn down.
    pub async fn wait_finished(&self) -> TaskRun {
        let id = {
            let run = self.inner.run.borrow();
            if run.status == RunStatus::Idle {
                return run.clone();
            }
            run.id
        };
        let mut settled = self.inner.settled.subscribe();
        let _ = settled.wait_for(|done| *done == Some(id)).await;
        self.snapshot()
    }
}

fn close_reason(closed: &SessionClosed) -> FailureReason {
    match closed.cause {
        CloseCause::Manual => FailureReason::Disconnected,
        CloseCause::Peer | CloseCause::Unexpected => FailureReason::UnexpectedClose {
            code: closed.code,
            reason: closed.reason.clone(),
        },
    }
}

/// Feed bridge events into the run until it is terminal or stopped.
async fn drive(
    inner: Arc<RunnerInner>,
    session: Option<u64>,
    mut events: Subscription,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        if inner.run.borrow().status.is_terminal() {
            return;
        }
        let event = tokio::select! {
            _ = &mut stop => return,
            event = events.recv() => event,
        };

        let transition = match event {
            Some(BridgeEvent::Inbound(event)) => inner.update(|run| run.apply(&event)),
            // Closes of an earlier session do not concern this run.
            Some(BridgeEvent::Closed(closed)) if session.is_some_and(|s| s != closed.session) => {
                continue;
            }
            Some(BridgeEvent::Closed(closed)) => inner.update(|run| run.fail(close_reason(&closed))),
            Some(BridgeEvent::Connected) => continue,
            None => inner.update(|run| run.fail(FailureReason::Disconnected)),
        };

        if transition.is_terminal() {
            inner.finish(session).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use task_bridge_core::{BridgeConfig, HistoryFilter, TaskKind, ValidationError};
    use task_bridge_transport::{
        CloseInfo, LoopbackConnector, LoopbackListener, RemotePeer, TransportSignal,
    };

    use super::*;
    use crate::controller::SessionState;
    use crate::storage::MemoryHistory;

    struct Harness {
        runner: TaskRunner,
        connector: LoopbackConnector,
        listener: LoopbackListener,
        history: Arc<MemoryHistory>,
    }

    fn harness() -> Harness {
        let (connector, listener) = LoopbackConnector::new();
        let config = BridgeConfig::with_endpoint("ws://loop/ws").unwrap();
        let controller = SessionController::new(Arc::new(connector.clone()), config);
        let history = Arc::new(MemoryHistory::new());
        let runner = TaskRunner::with_history(controller, history.clone());
        Harness {
            runner,
            connector,
            listener,
            history,
        }
    }

    async fn accept_dispatch(listener: &mut LoopbackListener) -> (RemotePeer, serde_json::Value) {
        let mut peer = listener.accept().await.unwrap();
        let frame = peer.recv_json().await.unwrap();
        (peer, frame)
    }

    async fn wait_for_status(runner: &TaskRunner, status: RunStatus) {
        let mut rx = runner.watch();
        rx.wait_for(|run| run.status == status).await.unwrap();
    }

    #[tokio::test]
    async fn test_video_generation_success() {
        let mut h = harness();
        let request = TaskRequest::new(TaskKind::VIDEO_GENERATION)
            .param("prompt", "a cat")
            .param("steps", 40)
            .with_token("jwt");
        h.runner.dispatch(request).await.unwrap();
        assert_eq!(h.runner.snapshot().status, RunStatus::Running);

        let (peer, frame) = accept_dispatch(&mut h.listener).await;
        assert_eq!(frame["type"], "TASK_EXECUTION");
        assert_eq!(frame["task"], "VIDEO_GENERATION");
        assert_eq!(frame["token"], "jwt");

        for line in ["loading model", "sampling", "encoding"] {
            peer.send_json(&json!({"type": "TASK_LOG", "stream": "stdout", "line": line}));
        }
        peer.send_json(&json!({
            "type": "task_finished",
            "status": "success",
            "output": {"public_url": "https://cdn.example.com/v.mp4"}
        }));

        let run = h.runner.wait_finished().await;
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.log.len(), 3);
        assert_eq!(run.result_url(), Some("https://cdn.example.com/v.mp4"));
        assert_eq!(h.runner.controller().state(), SessionState::Idle);

        let records = h.history.list(HistoryFilter::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url, "https://cdn.example.com/v.mp4");
        assert_eq!(records[0].prompt, "a cat");
        assert_eq!(records[0].kind, "video");
        assert_eq!(records[0].params["steps"], 40);

        let updates = h.runner.feed().history();
        assert!(matches!(
            updates.last(),
            Some(RunUpdate::Finished {
                status: RunStatus::Succeeded,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_otp_round_trip() {
        let mut h = harness();
        let request = TaskRequest::new(TaskKind::AMAZON_POLLUTION)
            .param("username", "alice")
            .param("password", "hunter2")
            .require(["username", "password"]);
        h.runner.dispatch(request).await.unwrap();
        let (mut peer, _) = accept_dispatch(&mut h.listener).await;

        assert_eq!(h.runner.submit_otp("123"), Err(BridgeError::NoOtpPending));

        peer.send_json(&json!({"type": "OTP_REQUIRED", "prompt": "Enter the code"}));
        wait_for_status(&h.runner, RunStatus::AwaitingOtp).await;
        assert_eq!(
            h.runner.snapshot().otp_prompt.as_deref(),
            Some("Enter the code")
        );

        assert_eq!(
            h.runner.submit_otp("  "),
            Err(BridgeError::Validation(ValidationError::EmptyOtp))
        );
        h.runner.submit_otp(" 424242 ").unwrap();
        assert_eq!(
            peer.recv_json().await.unwrap(),
            json!({"type": "OTP_RESPONSE", "otp": "424242"})
        );
        assert_eq!(h.runner.snapshot().status, RunStatus::Running);

        peer.send_json(&json!({
            "type": "task_finished",
            "status": "success",
            "output": {"public_url": "https://cdn.example.com/report.csv"}
        }));
        let run = h.runner.wait_finished().await;
        assert_eq!(run.status, RunStatus::Succeeded);
        let records = h.history.list(HistoryFilter::default()).await.unwrap();
        assert_eq!(records[0].kind, "amazon_pollution");
    }

    async fn awaiting_otp(h: &mut Harness) -> RemotePeer {
        h.runner
            .dispatch(TaskRequest::new(TaskKind::AMAZON_POLLUTION))
            .await
            .unwrap();
        let (peer, _) = accept_dispatch(&mut h.listener).await;
        peer.send_json(&json!({"type": "OTP_REQUIRED", "prompt": "Enter the code"}));
        wait_for_status(&h.runner, RunStatus::AwaitingOtp).await;
        peer
    }

    #[tokio::test]
    async fn test_failure_while_awaiting_otp() {
        let mut h = harness();
        let peer = awaiting_otp(&mut h).await;

        peer.send_json(&json!({"type": "task_finished", "status": "failure", "error": "locked out"}));
        let run = h.runner.wait_finished().await;
        assert_eq!(
            run.failure,
            Some(FailureReason::RemoteFailure {
                message: "locked out".into()
            })
        );
        assert_eq!(run.otp_prompt, None);
        assert_eq!(h.runner.submit_otp("424242"), Err(BridgeError::NoOtpPending));
    }

    #[tokio::test]
    async fn test_close_while_awaiting_otp() {
        let mut h = harness();
        let peer = awaiting_otp(&mut h).await;

        peer.close(1006, "");
        let run = h.runner.wait_finished().await;
        assert_eq!(
            run.failure,
            Some(FailureReason::UnexpectedClose {
                code: 1006,
                reason: String::new()
            })
        );
        assert_eq!(run.otp_prompt, None);
        assert_eq!(h.runner.submit_otp("424242"), Err(BridgeError::NoOtpPending));
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_otp() {
        let mut h = harness();
        let _peer = awaiting_otp(&mut h).await;

        assert!(h.runner.cancel());
        let run = h.runner.wait_finished().await;
        assert_eq!(run.failure, Some(FailureReason::Cancelled));
        assert_eq!(run.otp_prompt, None);
        assert_eq!(h.runner.submit_otp("424242"), Err(BridgeError::NoOtpPending));
        assert_eq!(h.runner.controller().state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_history_keeps_original_prompt_and_url() {
        let mut h = harness();
        let request = TaskRequest::new(TaskKind::VIDEO_GENERATION).param("prompt", "  a cat\n");
        h.runner.dispatch(request).await.unwrap();
        let (peer, _) = accept_dispatch(&mut h.listener).await;

        peer.send_json(&json!({
            "type": "task_finished",
            "status": "success",
            "output": {"public_url": " https://x/y.mp4 "}
        }));
        h.runner.wait_finished().await;

        let records = h.history.list(HistoryFilter::default()).await.unwrap();
        assert_eq!(records[0].prompt, "  a cat\n");
        assert_eq!(records[0].url, " https://x/y.mp4 ");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_endpoint_times_out() {
        let h = harness();
        h.connector.unreachable();

        let started = tokio::time::Instant::now();
        let err = h
            .runner
            .dispatch(TaskRequest::new(TaskKind::VIDEO_GENERATION))
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::ConnectionTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_secs(10));
        let run = h.runner.wait_finished().await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure, Some(FailureReason::ConnectionTimeout));
    }

    #[tokio::test]
    async fn test_abnormal_close_is_unexpected_not_remote() {
        let mut h = harness();
        h.runner
            .dispatch(TaskRequest::new(TaskKind::VIDEO_GENERATION))
            .await
            .unwrap();
        let (peer, _) = accept_dispatch(&mut h.listener).await;

        peer.close(1006, "");
        let run = h.runner.wait_finished().await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(
            run.failure,
            Some(FailureReason::UnexpectedClose {
                code: 1006,
                reason: String::new()
            })
        );
        assert!(h.history.list(HistoryFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_failure() {
        let mut h = harness();
        h.runner.dispatch(TaskRequest::new("SCRAPE")).await.unwrap();
        let (peer, _) = accept_dispatch(&mut h.listener).await;

        peer.send_json(&json!({"status": "error", "message": "No idle GPU available"}));
        let run = h.runner.wait_finished().await;
        assert_eq!(
            run.failure,
            Some(FailureReason::RemoteFailure {
                message: "No idle GPU available".into()
            })
        );
    }

    #[tokio::test]
    async fn test_validation_rejects_before_connecting() {
        let h = harness();
        let request = TaskRequest::new(TaskKind::AMAZON_POLLUTION).require(["username"]);

        let err = h.runner.dispatch(request).await.unwrap_err();
        assert_eq!(
            err,
            BridgeError::Validation(ValidationError::MissingField("username".into()))
        );
        assert_eq!(h.connector.attempts(), 0);
        assert_eq!(h.runner.snapshot().status, RunStatus::Idle);
    }

    #[tokio::test]
    async fn test_second_dispatch_while_active() {
        let mut h = harness();
        h.runner.dispatch(TaskRequest::new("SCRAPE")).await.unwrap();
        let _peer = accept_dispatch(&mut h.listener).await;

        assert_eq!(
            h.runner.dispatch(TaskRequest::new("SCRAPE")).await,
            Err(BridgeError::RunInProgress)
        );
    }

    #[tokio::test]
    async fn test_cancel_is_local_and_final() {
        let mut h = harness();
        h.runner.dispatch(TaskRequest::new("SCRAPE")).await.unwrap();
        let (mut peer, _) = accept_dispatch(&mut h.listener).await;

        assert!(h.runner.cancel());
        assert!(!h.runner.cancel());
        let run = h.runner.wait_finished().await;
        assert_eq!(run.failure, Some(FailureReason::Cancelled));

        // Only the close reaches the peer, no cancel frame.
        assert_eq!(peer.recv().await, None);
        assert_eq!(h.runner.controller().state(), SessionState::Idle);

        peer.send_json(&json!({"type": "task_finished", "status": "success",
            "output": {"public_url": "https://x"}}));
        tokio::task::yield_now().await;
        assert_eq!(h.runner.snapshot().status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_late_events_after_finish_are_ignored() {
        let mut h = harness();
        h.runner.dispatch(TaskRequest::new("SCRAPE")).await.unwrap();
        let (peer, _) = accept_dispatch(&mut h.listener).await;

        peer.send_json(&json!({"type": "task_finished", "status": "failure", "error": "boom"}));
        peer.send_json(&json!({"type": "TASK_LOG", "line": "late"}));
        let run = h.runner.wait_finished().await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.log.is_empty());
    }

    #[tokio::test]
    async fn test_shared_controller_reconnect_fails_only_stale_run() {
        let connector = Arc::new(crate::testing::ManualConnector::default());
        let config = BridgeConfig::with_endpoint("ws://loop/ws").unwrap();
        let controller = SessionController::new(connector.clone(), config);
        let first = TaskRunner::new(controller.clone());
        let second = TaskRunner::new(controller.clone());

        first.dispatch(TaskRequest::new("SCRAPE")).await.unwrap();
        let (outbound_rx, signals_tx) = connector.take(0);
        signals_tx
            .send(TransportSignal::Closed(CloseInfo::abnormal("")))
            .unwrap();
        drop(outbound_rx);

        // The second runner reconnects before the dead link's close is read.
        second.dispatch(TaskRequest::new("SCRAPE")).await.unwrap();

        let run = first.wait_finished().await;
        assert_eq!(
            run.failure,
            Some(FailureReason::UnexpectedClose {
                code: 1006,
                reason: String::new()
            })
        );
        tokio::task::yield_now().await;
        assert_eq!(second.snapshot().status, RunStatus::Running);
        assert_eq!(controller.state(), SessionState::Open);
        assert_eq!(connector.open_links(), 1);
    }

    #[tokio::test]
    async fn test_runner_can_dispatch_again_after_finish() {
        let mut h = harness();
        h.runner.dispatch(TaskRequest::new("SCRAPE")).await.unwrap();
        let (peer, _) = accept_dispatch(&mut h.listener).await;
        peer.send_json(&json!({"type": "task_finished", "status": "failure"}));
        h.runner.wait_finished().await;

        h.runner.dispatch(TaskRequest::new("SCRAPE")).await.unwrap();
        assert_eq!(h.connector.attempts(), 2);
        assert!(h.runner.is_active());
    }
}
