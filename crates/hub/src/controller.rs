//! The hub's main loop.
//!
//! One task owns the device state, the scheduler and the command sink. It is
//! woken by the tick interval, by telemetry events from the channel adapter,
//! and by operator requests from the web layer. Nothing else mutates state;
//! readers get [`StatusSnapshot`]s from a watch channel.

use std::time::Duration as StdDuration;

use time::{Duration, OffsetDateTime, UtcOffset};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::now_local;
use crate::emitter::{Command, CommandSink, EmitError};
use crate::schedule::{ScheduleError, SlotTime};
use crate::scheduler::{join_slots, FiredSlot, Scheduler, TickError, TickOutcome};
use crate::state::{StatusSnapshot, SystemState};
use crate::telemetry::TelemetryEvent;

/// Operator actions. These bypass the scheduler's tick but still funnel
/// through the controller so the schedule keeps a single writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Command(Command),
    SetEnabled(bool),
    SetSlots(Vec<SlotTime>),
    ResetHistory,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Emit(#[from] EmitError),

    #[error("controller is not running")]
    Unavailable,
}

pub struct Envelope {
    request: Request,
    reply: oneshot::Sender<Result<(), RequestError>>,
}

/// Cheap, cloneable access to the controller for other tasks.
#[derive(Clone)]
pub struct ControllerHandle {
    requests: mpsc::Sender<Envelope>,
    snapshots: watch::Receiver<StatusSnapshot>,
}

impl ControllerHandle {
    pub fn new(requests: mpsc::Sender<Envelope>, snapshots: watch::Receiver<StatusSnapshot>) -> Self {
        Self {
            requests,
            snapshots,
        }
    }

    /// Latest published status.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Submit a request and wait for the controller to apply it. The snapshot
    /// is already updated when this returns.
    pub async fn request(&self, request: Request) -> Result<(), RequestError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Envelope { request, reply })
            .await
            .map_err(|_| RequestError::Unavailable)?;
        rx.await.map_err(|_| RequestError::Unavailable)?
    }
}

pub struct Controller<S> {
    state: SystemState,
    scheduler: Scheduler,
    sink: S,
    offset: UtcOffset,
    offline_timeout: Duration,
    snapshots: watch::Sender<StatusSnapshot>,
}

impl<S: CommandSink> Controller<S> {
    pub fn new(
        scheduler: Scheduler,
        sink: S,
        offset: UtcOffset,
        offline_timeout: Duration,
    ) -> (Self, watch::Receiver<StatusSnapshot>) {
        let mut state = SystemState::new();
        state.record_system("hub started".to_string());

        let initial = state.to_status(now_local(offset), offline_timeout, scheduler.config());
        let (snapshots, rx) = watch::channel(initial);

        (
            Self {
                state,
                scheduler,
                sink,
                offset,
                offline_timeout,
                snapshots,
            },
            rx,
        )
    }

    /// Drive ticks, telemetry and requests for the life of the process.
    pub async fn run(
        mut self,
        tick_interval: StdDuration,
        mut telemetry: mpsc::Receiver<TelemetryEvent>,
        mut requests: mpsc::Receiver<Envelope>,
    ) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_ms = tick_interval.as_millis() as u64,
            grace_min = self.scheduler.grace_window().whole_minutes(),
            offline_timeout_sec = self.offline_timeout.whole_seconds(),
            offset = %self.offset,
            "controller started"
        );

        loop {
            tokio::select! {
                // Ticks first so a telemetry burst cannot starve them; inbound
                // state is applied before operator requests.
                biased;
                _ = ticker.tick() => {
                    self.on_tick(now_local(self.offset));
                }
                Some(event) = telemetry.recv() => {
                    self.handle_telemetry(event);
                    self.publish(now_local(self.offset));
                }
                Some(Envelope { request, reply }) = requests.recv() => {
                    let result = self.handle_request(request);
                    self.publish(now_local(self.offset));
                    let _ = reply.send(result);
                }
            }
        }
    }

    pub fn handle_telemetry(&mut self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::Connected => self.state.set_connected(true),
            TelemetryEvent::ConnectFailed => {
                self.state.set_connected(false);
                self.state.record_error("broker refused connection".to_string());
            }
            TelemetryEvent::Disconnected => self.state.set_connected(false),
            TelemetryEvent::Status { update, at } => {
                debug!(?update, "status merged");
                self.state.record_status(&update, at);
            }
            TelemetryEvent::Malformed { at } => self.state.record_malformed(at),
        }
    }

    pub fn handle_request(&mut self, request: Request) -> Result<(), RequestError> {
        let result = match &request {
            Request::Command(command) => self
                .sink
                .send(*command)
                .map(|()| self.state.record_command(format!("manual {command}")))
                .map_err(RequestError::from),
            Request::SetEnabled(enabled) => self
                .scheduler
                .set_enabled(*enabled)
                .map(|()| {
                    let verb = if *enabled { "enabled" } else { "disabled" };
                    self.state.record_scheduler(format!("auto feed {verb}"));
                })
                .map_err(RequestError::from),
            Request::SetSlots(slots) => self
                .scheduler
                .set_slots(slots.clone())
                .map(|changed| {
                    if changed {
                        self.state
                            .record_scheduler(format!("feed slots set to {}", join_slots(slots)));
                    }
                })
                .map_err(RequestError::from),
            Request::ResetHistory => self
                .scheduler
                .reset_daily_history()
                .map(|()| self.state.record_scheduler("daily history cleared".to_string()))
                .map_err(RequestError::from),
        };

        if let Err(e) = &result {
            warn!(?request, "request failed: {}", error_chain(e));
            self.state.record_error(format!("{request:?}: {}", error_chain(e)));
        }
        result
    }

    pub fn on_tick(&mut self, now: OffsetDateTime) {
        let online = self.state.is_online(now, self.offline_timeout);
        let (fired, failure) = match self.scheduler.tick(now, online, &self.sink) {
            Ok(TickOutcome::Fired(fired)) => (fired, None),
            Ok(TickOutcome::Idle | TickOutcome::Armed) => (Vec::new(), None),
            Err(TickError { fired, cause }) => (fired, Some(cause)),
        };

        for FiredSlot { slot, emit } in fired {
            self.state
                .record_scheduler(format!("auto feed triggered for {slot}"));
            if let Err(e) = emit {
                self.state
                    .record_error(format!("FEED_AUTO for {slot} not delivered: {}", error_chain(&e)));
            }
        }
        if let Some(e) = failure {
            let chain = error_chain(&e);
            error!("scheduler tick failed: {chain}");
            self.state.record_error(format!("scheduler: {chain}"));
        }
        self.publish(now);
    }

    fn publish(&self, now: OffsetDateTime) {
        let snapshot = self
            .state
            .to_status(now, self.offline_timeout, self.scheduler.config());
        self.snapshots.send_replace(snapshot);
    }
}

/// `outer: inner: root` rendering of an error and its sources.
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        out.push_str(": ");
        out.push_str(&s.to_string());
        source = s.source();
    }
    out
}

// ===========================================================================
// Tests
// ===========================================================================
