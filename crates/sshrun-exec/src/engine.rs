//! Sequential command execution over a single session
//!
//! [`Engine`] is a synchronous state machine fed with [`SessionEvent`]s; it
//! decides what to submit next and when to stop. [`CommandRunner`] drives it
//! against a live [`Transport`].

use std::collections::VecDeque;

use serde_json::Value;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::ExecError;
use crate::result::{CommandList, CommandResult, ExecutionSummary};
use crate::traits::{ParameterSource, SessionEvent, Transport};

/// Lifecycle of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Ready,
    Executing,
    Draining,
    Closed,
    Failed,
}

/// What the driver must do next
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Await the next transport event
    Wait,
    /// Submit this command and report the ready-for-next flag back
    Submit(String),
    /// Terminate the session, then collect the summary
    Close,
    /// Terminate the session and fail the run
    Abort(ExecError),
}

/// Deferred action run on the next continue notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    Advance,
}

#[derive(Debug)]
struct InFlight {
    command: String,
    ready_for_next: bool,
    /// Index into `results` once the start callback succeeded
    result_idx: Option<usize>,
}

/// Command loop state machine
#[derive(Debug)]
pub struct Engine {
    phase: Phase,
    command_count: usize,
    worklist: VecDeque<String>,
    results: Vec<CommandResult>,
    in_flight: Option<InFlight>,
    resume: Option<Resume>,
    aborted: bool,
}

impl Engine {
    #[must_use]
    pub fn new(commands: CommandList) -> Self {
        let worklist: VecDeque<String> = commands.into_iter().collect();
        Self {
            phase: Phase::Idle,
            command_count: worklist.len(),
            worklist,
            results: Vec::new(),
            in_flight: None,
            resume: None,
            aborted: false,
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Results recorded so far
    #[must_use]
    pub fn results(&self) -> &[CommandResult] {
        &self.results
    }

    /// Whether a continue notification is awaited
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.resume.is_some()
    }

    /// Idle -> Connecting
    pub fn begin(&mut self) {
        if self.phase == Phase::Idle {
            self.phase = Phase::Connecting;
        }
    }

    /// Record the ready-for-next flag returned for the last submission
    pub fn on_submitted(&mut self, ready_for_next: bool) {
        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.ready_for_next = ready_for_next;
        }
    }

    /// Feed one transport event
    pub fn on_event(&mut self, event: SessionEvent) -> Step {
        match (self.phase, event) {
            (Phase::Connecting, SessionEvent::Ready) => {
                self.phase = Phase::Ready;
                self.advance()
            }
            (Phase::Connecting, SessionEvent::Error(reason)) => {
                self.phase = Phase::Failed;
                Step::Abort(ExecError::ConnectionFailed(reason))
            }
            (Phase::Executing, SessionEvent::Started { command, outcome }) => {
                self.on_started(&command, outcome)
            }
            (Phase::Executing, SessionEvent::Stdout(chunk)) => {
                if let Some(result) = self.current_result() {
                    result.append_stdout(&chunk);
                }
                Step::Wait
            }
            (Phase::Executing, SessionEvent::Stderr(chunk)) => {
                if let Some(result) = self.current_result() {
                    result.append_stderr(&chunk);
                }
                Step::Wait
            }
            (Phase::Executing, SessionEvent::Closed { exit_code }) => self.on_closed(exit_code),
            (Phase::Executing, SessionEvent::Continue) => match self.resume.take() {
                Some(Resume::Advance) => {
                    debug!("backpressure cleared, resuming");
                    self.advance()
                }
                None => {
                    trace!("continue with nothing to resume");
                    Step::Wait
                }
            },
            (Phase::Executing, SessionEvent::Error(reason)) => self.lose_session(reason),
            (phase, event) => {
                trace!(?phase, ?event, "ignoring event");
                Step::Wait
            }
        }
    }

    /// The event source ended without an explicit error
    pub fn on_disconnect(&mut self) -> Step {
        match self.phase {
            Phase::Idle | Phase::Connecting => {
                self.phase = Phase::Failed;
                Step::Abort(ExecError::ConnectionFailed(
                    "session closed before becoming ready".to_string(),
                ))
            }
            Phase::Executing => self.lose_session("session closed unexpectedly".to_string()),
            Phase::Ready | Phase::Draining => {
                self.phase = Phase::Draining;
                Step::Close
            }
            Phase::Closed | Phase::Failed => Step::Wait,
        }
    }

    /// Draining -> Closed, after the session has been terminated
    pub fn finish(&mut self) -> ExecutionSummary {
        self.phase = Phase::Closed;
        ExecutionSummary::from_results(self.command_count, std::mem::take(&mut self.results))
    }

    fn current_result(&mut self) -> Option<&mut CommandResult> {
        let idx = self.in_flight.as_ref()?.result_idx?;
        self.results.get_mut(idx)
    }

    fn advance(&mut self) -> Step {
        if self.aborted {
            return self.drain();
        }
        match self.worklist.pop_front() {
            Some(command) => {
                self.phase = Phase::Executing;
                self.in_flight = Some(InFlight {
                    command: command.clone(),
                    ready_for_next: true,
                    result_idx: None,
                });
                Step::Submit(command)
            }
            None => self.drain(),
        }
    }

    fn drain(&mut self) -> Step {
        self.phase = Phase::Draining;
        self.in_flight = None;
        self.resume = None;
        Step::Close
    }

    fn abort(&mut self) -> Step {
        self.aborted = true;
        self.drain()
    }

    fn on_started(&mut self, command: &str, outcome: Result<(), String>) -> Step {
        let Some(in_flight) = self.in_flight.as_mut() else {
            warn!(%command, "start callback with no command in flight");
            return Step::Wait;
        };
        if in_flight.command != command {
            warn!(
                %command,
                in_flight = %in_flight.command,
                "start callback for another command"
            );
            return Step::Wait;
        }
        if in_flight.result_idx.is_some() {
            warn!(command = %in_flight.command, "duplicate start callback");
            return Step::Wait;
        }

        match outcome {
            Ok(()) => {
                in_flight.result_idx = Some(self.results.len());
                self.results
                    .push(CommandResult::started(in_flight.command.clone()));
                Step::Wait
            }
            Err(reason) => {
                warn!(command = %in_flight.command, %reason, "command failed to start");
                self.results
                    .push(CommandResult::start_failed(in_flight.command.clone(), reason));
                self.abort()
            }
        }
    }

    fn on_closed(&mut self, exit_code: Option<i32>) -> Step {
        let Some(in_flight) = self.in_flight.take() else {
            trace!("close with no command in flight");
            return Step::Wait;
        };

        let idx = match in_flight.result_idx {
            Some(idx) => idx,
            None => {
                self.results
                    .push(CommandResult::started(in_flight.command.clone()));
                self.results.len() - 1
            }
        };
        let result = &mut self.results[idx];

        if !result.finish(exit_code) {
            warn!(command = %result.command, ?exit_code, "command failed");
            return self.abort();
        }
        debug!(command = %result.command, duration = ?result.duration, "command completed");

        if in_flight.ready_for_next {
            self.advance()
        } else {
            debug!("transport asked to wait, pausing until continue");
            self.resume = Some(Resume::Advance);
            Step::Wait
        }
    }

    fn lose_session(&mut self, reason: String) -> Step {
        warn!(%reason, "session lost during execution");
        if let Some(in_flight) = self.in_flight.take() {
            match in_flight.result_idx {
                Some(idx) => self.results[idx].lose_session(reason),
                None => {
                    let mut result = CommandResult::started(in_flight.command);
                    result.lose_session(reason);
                    self.results.push(result);
                }
            }
        }
        self.abort()
    }
}

/// Runs command lists against sessions created by a factory
///
/// Each `run` resolves parameters, opens a fresh session, executes the
/// commands strictly in order and ends the session exactly once.
pub struct CommandRunner<P, F> {
    source: P,
    factory: F,
}

impl<P, F> std::fmt::Debug for CommandRunner<P, F>
where
    P: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRunner")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl<P, F, T> CommandRunner<P, F>
where
    P: ParameterSource,
    F: Fn() -> T + Send + Sync,
    T: Transport,
{
    pub fn new(source: P, factory: F) -> Self {
        Self { source, factory }
    }

    /// Run commands given as untyped JSON
    ///
    /// # Errors
    /// Returns `ExecError::InvalidCommands` before any I/O if `commands` is
    /// not a string or an array of strings, otherwise as [`Self::run`]
    pub async fn run_value(&self, commands: &Value) -> Result<ExecutionSummary, ExecError> {
        let commands = CommandList::from_value(commands)?;
        self.run(commands).await
    }

    /// Run commands in order, stopping at the first failure
    ///
    /// # Errors
    /// Fails only on connection-level errors; command failures are reported
    /// in the returned summary
    #[instrument(skip_all, fields(commands = tracing::field::Empty))]
    pub async fn run(
        &self,
        commands: impl Into<CommandList>,
    ) -> Result<ExecutionSummary, ExecError> {
        let commands = commands.into();
        tracing::Span::current().record("commands", commands.len());

        let mut engine = Engine::new(commands);
        engine.begin();

        let params = self.source.resolve().await?;
        info!(
            host = %params.host,
            port = params.port,
            user = %params.username,
            "connecting"
        );

        let mut transport = (self.factory)();
        transport.connect(&params).await;

        let outcome = drive(&mut engine, &mut transport).await;
        transport.end().await;

        match outcome {
            Ok(()) => {
                let summary = engine.finish();
                info!(
                    transport = transport.transport_type(),
                    succeeded = summary.success_count,
                    failed = summary.failure_count,
                    total = summary.command_count,
                    "run finished"
                );
                Ok(summary)
            }
            Err(err) => {
                warn!(error = %err, "run aborted");
                Err(err)
            }
        }
    }
}

/// Pump events into the engine until it asks to close or abort
async fn drive<T: Transport>(engine: &mut Engine, transport: &mut T) -> Result<(), ExecError> {
    let mut step = Step::Wait;
    loop {
        step = match step {
            Step::Wait => match transport.next_event().await {
                Some(event) => engine.on_event(event),
                None => engine.on_disconnect(),
            },
            Step::Submit(command) => {
                debug!(command = %command, "submitting command");
                let ready_for_next = transport.exec(&command);
                engine.on_submitted(ready_for_next);
                Step::Wait
            }
            Step::Close => return Ok(()),
            Step::Abort(err) => return Err(err),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommandFailure;

    fn ready_engine(commands: &[&str]) -> (Engine, Step) {
        let mut engine = Engine::new(CommandList::from(commands));
        engine.begin();
        let step = engine.on_event(SessionEvent::Ready);
        (engine, step)
    }

    fn started(command: &str) -> SessionEvent {
        SessionEvent::Started {
            command: command.to_string(),
            outcome: Ok(()),
        }
    }

    fn run_ok(engine: &mut Engine, command: &str, stdout: &str) -> Step {
        engine.on_event(started(command));
        engine.on_event(SessionEvent::Stdout(stdout.as_bytes().to_vec()));
        engine.on_event(SessionEvent::Closed { exit_code: Some(0) })
    }

    #[test]
    fn test_starts_idle_and_connects() {
        let mut engine = Engine::new(CommandList::from("ls"));
        assert_eq!(engine.phase(), Phase::Idle);
        engine.begin();
        assert_eq!(engine.phase(), Phase::Connecting);
    }

    #[test]
    fn test_ready_submits_first_command() {
        let (engine, step) = ready_engine(&["ls", "pwd"]);
        assert_eq!(step, Step::Submit("ls".to_string()));
        assert_eq!(engine.phase(), Phase::Executing);
    }

    #[test]
    fn test_empty_worklist_drains_immediately() {
        let (engine, step) = ready_engine(&[]);
        assert_eq!(step, Step::Close);
        assert_eq!(engine.phase(), Phase::Draining);
    }

    #[test]
    fn test_connect_error_fails() {
        let mut engine = Engine::new(CommandList::from("ls"));
        engine.begin();
        let step = engine.on_event(SessionEvent::Error("refused".into()));
        assert!(matches!(step, Step::Abort(ExecError::ConnectionFailed(_))));
        assert_eq!(engine.phase(), Phase::Failed);
    }

    #[test]
    fn test_sequential_success() {
        let (mut engine, _) = ready_engine(&["ls", "pwd"]);
        engine.on_submitted(true);
        assert_eq!(run_ok(&mut engine, "ls", "a"), Step::Submit("pwd".to_string()));
        assert_eq!(engine.results().len(), 1);
        assert!(engine.results()[0].success);
        engine.on_submitted(true);
        assert_eq!(run_ok(&mut engine, "pwd", "b"), Step::Close);

        let summary = engine.finish();
        assert_eq!(engine.phase(), Phase::Closed);
        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.results[1].stdout, "b");
    }

    #[test]
    fn test_start_error_aborts() {
        let (mut engine, _) = ready_engine(&["ls", "pwd"]);
        engine.on_submitted(true);
        let step = engine.on_event(SessionEvent::Started {
            command: "ls".into(),
            outcome: Err("no channel".into()),
        });
        assert_eq!(step, Step::Close);

        let summary = engine.finish();
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.failure_count, 1);
        assert!(summary.results[0].exit_code.is_none());
    }

    #[test]
    fn test_non_zero_exit_aborts_even_when_paused() {
        let (mut engine, _) = ready_engine(&["false", "pwd"]);
        engine.on_submitted(false);
        engine.on_event(started("false"));
        let step = engine.on_event(SessionEvent::Closed { exit_code: Some(3) });
        assert_eq!(step, Step::Close);
        assert!(!engine.is_paused());

        let summary = engine.finish();
        assert_eq!(
            summary.results[0].error,
            Some(CommandFailure::NonZeroExit { code: Some(3) })
        );
    }

    #[test]
    fn test_backpressure_waits_for_continue() {
        let (mut engine, _) = ready_engine(&["a", "b"]);
        engine.on_submitted(false);
        assert_eq!(run_ok(&mut engine, "a", ""), Step::Wait);
        assert!(engine.is_paused());

        assert_eq!(
            engine.on_event(SessionEvent::Continue),
            Step::Submit("b".to_string())
        );
        assert!(!engine.is_paused());
    }

    #[test]
    fn test_stray_continue_is_noop() {
        let (mut engine, _) = ready_engine(&["a", "b"]);
        engine.on_submitted(false);
        // before the command closes
        assert_eq!(engine.on_event(SessionEvent::Continue), Step::Wait);
        assert_eq!(run_ok(&mut engine, "a", ""), Step::Wait);
        assert_eq!(
            engine.on_event(SessionEvent::Continue),
            Step::Submit("b".to_string())
        );
        engine.on_submitted(true);
        // second continue while "b" runs must not skip anything
        assert_eq!(engine.on_event(SessionEvent::Continue), Step::Wait);
        assert_eq!(run_ok(&mut engine, "b", ""), Step::Close);
        assert_eq!(engine.finish().results.len(), 2);
    }

    #[test]
    fn test_session_error_records_in_flight_failure() {
        let (mut engine, _) = ready_engine(&["sleep 10", "ls"]);
        engine.on_submitted(true);
        engine.on_event(started("sleep 10"));
        engine.on_event(SessionEvent::Stdout(b"partial".to_vec()));
        assert_eq!(engine.results()[0].stdout, "partial");
        assert_eq!(engine.on_event(SessionEvent::Error("reset".into())), Step::Close);

        let summary = engine.finish();
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].stdout, "partial");
        assert!(matches!(
            summary.results[0].error,
            Some(CommandFailure::SessionLost { .. })
        ));
    }

    #[test]
    fn test_disconnect_while_connecting_fails() {
        let mut engine = Engine::new(CommandList::from("ls"));
        engine.begin();
        assert!(matches!(engine.on_disconnect(), Step::Abort(_)));
    }

    #[test]
    fn test_disconnect_while_paused_drains() {
        let (mut engine, _) = ready_engine(&["a", "b"]);
        engine.on_submitted(false);
        run_ok(&mut engine, "a", "");
        assert_eq!(engine.on_disconnect(), Step::Close);
        let summary = engine.finish();
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.failure_count, 0);
    }

    #[test]
    fn test_events_after_drain_are_ignored() {
        let (mut engine, _) = ready_engine(&["a"]);
        engine.on_submitted(true);
        run_ok(&mut engine, "a", "x");
        assert_eq!(engine.on_event(SessionEvent::Stdout(b"late".to_vec())), Step::Wait);
        assert_eq!(engine.finish().results[0].stdout, "x");
    }

    #[test]
    fn test_late_start_of_previous_command_is_ignored() {
        let (mut engine, _) = ready_engine(&["a", "b"]);
        engine.on_submitted(true);
        // "a" closes before its start callback arrives
        let step = engine.on_event(SessionEvent::Closed { exit_code: Some(0) });
        assert_eq!(step, Step::Submit("b".to_string()));
        engine.on_submitted(true);

        assert_eq!(engine.on_event(started("a")), Step::Wait);
        assert_eq!(engine.results().len(), 1);

        engine.on_event(started("b"));
        engine.on_event(SessionEvent::Stdout(b"from b".to_vec()));
        assert_eq!(engine.results().len(), 2);
        assert_eq!(engine.results()[1].command, "b");
        assert_eq!(engine.results()[1].stdout, "from b");

        assert_eq!(
            engine.on_event(SessionEvent::Closed { exit_code: Some(0) }),
            Step::Close
        );
        let summary = engine.finish();
        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.results[0].command, "a");
    }

    #[test]
    fn test_late_start_error_does_not_fail_next_command() {
        let (mut engine, _) = ready_engine(&["a", "b"]);
        engine.on_submitted(true);
        engine.on_event(SessionEvent::Closed { exit_code: Some(0) });
        engine.on_submitted(true);

        let step = engine.on_event(SessionEvent::Started {
            command: "a".into(),
            outcome: Err("no channel".into()),
        });
        assert_eq!(step, Step::Wait);
        assert_eq!(engine.phase(), Phase::Executing);
        assert_eq!(run_ok(&mut engine, "b", ""), Step::Close);
        assert_eq!(engine.finish().failure_count, 0);
    }
}
