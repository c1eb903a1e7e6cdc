//! Idle Periods
//!
//! Idle tasks only run inside an idle period: either the short gap between
//! committing a frame and the next expected frame, or a long period granted
//! while no frames are expected at all. The deadline handed to an idle task is
//! advisory; nothing preempts a task that overruns it.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::config::SchedulerConfig;

/// Idle period state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePeriodState {
    NotInIdlePeriod,
    /// Between a frame commit and the next expected frame
    InShortIdlePeriod,
    /// No frames expected; capped at `max_idle_period`
    InLongIdlePeriod,
}

impl IdlePeriodState {
    pub fn is_idle(&self) -> bool {
        !matches!(self, Self::NotInIdlePeriod)
    }
}

/// Begin-frame signal from the compositor
#[derive(Debug, Clone, Copy)]
pub struct BeginFrameArgs {
    /// When the frame started
    pub frame_time: Instant,
    /// Expected frame interval
    pub interval: Duration,
}

impl BeginFrameArgs {
    pub fn new(frame_time: Instant, interval: Duration) -> Self {
        Self { frame_time, interval }
    }

    /// Budget for 60 FPS (16.67ms per frame)
    pub fn at_60fps(frame_time: Instant) -> Self {
        Self::new(frame_time, Duration::from_micros(16_667))
    }

    /// When the following frame is expected to begin
    pub fn next_frame_time(&self) -> Instant {
        self.frame_time + self.interval
    }
}

/// Remaining idle budget handed to one idle task
#[derive(Clone)]
pub struct IdleDeadline {
    deadline: Instant,
    granted: Duration,
    clock: Arc<dyn Clock>,
}

impl IdleDeadline {
    pub(crate) fn new(deadline: Instant, granted: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { deadline, granted, clock }
    }

    /// Point in time the task should be finished by
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Budget at dispatch time
    pub fn granted(&self) -> Duration {
        self.granted
    }

    /// Time left before the deadline, zero once it has passed
    pub fn time_remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(self.clock.now())
    }

    /// Has the deadline passed?
    pub fn did_timeout(&self) -> bool {
        self.time_remaining().is_zero()
    }
}

impl fmt::Debug for IdleDeadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleDeadline")
            .field("deadline", &self.deadline)
            .field("granted", &self.granted)
            .finish()
    }
}

/// Idle period bookkeeping for one scheduler
#[derive(Debug)]
pub(crate) struct IdleHelper {
    config: SchedulerConfig,
    state: IdlePeriodState,
    period_end: Option<Instant>,
    next_frame: Option<Instant>,
    frames_expected: bool,
    last_input: Option<Instant>,
}

impl IdleHelper {
    pub(crate) fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: IdlePeriodState::NotInIdlePeriod,
            period_end: None,
            next_frame: None,
            frames_expected: false,
            last_input: None,
        }
    }

    pub(crate) fn state(&self) -> IdlePeriodState {
        self.state
    }

    fn start_idle_period(&mut self, state: IdlePeriodState, end: Instant) {
        tracing::trace!("Starting {:?} until {:?}", state, end);
        self.state = state;
        self.period_end = Some(end);
    }

    pub(crate) fn end_idle_period(&mut self) {
        if self.state.is_idle() {
            tracing::trace!("Ending {:?}", self.state);
        }
        self.state = IdlePeriodState::NotInIdlePeriod;
        self.period_end = None;
    }

    pub(crate) fn will_begin_frame(&mut self, args: BeginFrameArgs) {
        self.end_idle_period();
        self.frames_expected = true;
        self.next_frame = Some(args.next_frame_time());
    }

    /// Open a short idle period lasting until the next expected frame
    pub(crate) fn did_commit_frame(&mut self, now: Instant) {
        match self.next_frame {
            Some(next) if now < next => self.start_idle_period(IdlePeriodState::InShortIdlePeriod, next),
            _ => tracing::trace!("Frame committed with no time left before the next frame"),
        }
    }

    pub(crate) fn begin_frame_not_expected_soon(&mut self) {
        self.frames_expected = false;
        self.next_frame = None;
    }

    pub(crate) fn did_handle_input(&mut self, now: Instant) {
        self.last_input = Some(now);
        if self.state == IdlePeriodState::InLongIdlePeriod {
            self.end_idle_period();
        }
    }

    fn input_quiet_at(&self) -> Option<Instant> {
        self.last_input.map(|input| input + self.config.input_quiescence)
    }

    fn try_start_long_idle_period(&mut self, now: Instant, next_work: Option<Instant>) {
        if !self.config.long_idle_periods || self.frames_expected {
            return;
        }
        if self.input_quiet_at().is_some_and(|quiet| now < quiet) {
            return;
        }

        let mut end = now + self.config.max_idle_period;
        if let Some(work) = next_work {
            end = end.min(work);
        }
        if end > now {
            self.start_idle_period(IdlePeriodState::InLongIdlePeriod, end);
        }
    }

    /// Deadline for the next idle task, or `None` when no idle time is available.
    ///
    /// `next_work` is the eligibility time of the earliest delayed control or
    /// default task; the budget never reaches past it.
    pub(crate) fn idle_deadline(
        &mut self,
        now: Instant,
        next_work: Option<Instant>,
        clock: &Arc<dyn Clock>,
    ) -> Option<IdleDeadline> {
        if self.period_end.is_some_and(|end| end <= now) {
            self.end_idle_period();
        }
        if !self.state.is_idle() {
            self.try_start_long_idle_period(now, next_work);
        }

        let period_end = self.period_end?;
        let end = next_work.map_or(period_end, |work| work.min(period_end));
        let remaining = end.saturating_duration_since(now);
        if remaining.is_zero() {
            return None;
        }
        Some(IdleDeadline::new(end, remaining, Arc::clone(clock)))
    }

    /// Earliest time an idle period could open or close without new input
    pub(crate) fn next_transition(&self, now: Instant) -> Option<Instant> {
        match self.period_end {
            Some(end) => Some(end),
            None => self.input_quiet_at().filter(|quiet| *quiet > now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn setup() -> (Arc<ManualClock>, Arc<dyn Clock>, IdleHelper) {
        let manual = Arc::new(ManualClock::new());
        let clock: Arc<dyn Clock> = manual.clone();
        (manual, clock, IdleHelper::new(SchedulerConfig::default()))
    }

    #[test]
    fn test_long_idle_period_capped() {
        let (_manual, clock, mut helper) = setup();
        let now = clock.now();

        let deadline = helper.idle_deadline(now, None, &clock).unwrap();
        assert_eq!(helper.state(), IdlePeriodState::InLongIdlePeriod);
        assert_eq!(deadline.granted(), Duration::from_millis(50));
    }

    #[test]
    fn test_deadline_bounded_by_next_work() {
        let (_manual, clock, mut helper) = setup();
        let now = clock.now();

        let deadline = helper
            .idle_deadline(now, Some(now + Duration::from_millis(8)), &clock)
            .unwrap();
        assert_eq!(deadline.granted(), Duration::from_millis(8));
        assert_eq!(deadline.deadline(), now + Duration::from_millis(8));
    }

    #[test]
    fn test_no_idle_when_work_due_now() {
        let (_manual, clock, mut helper) = setup();
        let now = clock.now();
        assert!(helper.idle_deadline(now, Some(now), &clock).is_none());
    }

    #[test]
    fn test_short_idle_period_after_commit() {
        let (manual, clock, mut helper) = setup();
        let frame_time = clock.now();
        helper.will_begin_frame(BeginFrameArgs::new(frame_time, Duration::from_millis(16)));

        // Frames expected but none committed: no idle time
        assert!(helper.idle_deadline(clock.now(), None, &clock).is_none());

        manual.advance_ms(10);
        helper.did_commit_frame(clock.now());
        let deadline = helper.idle_deadline(clock.now(), None, &clock).unwrap();
        assert_eq!(helper.state(), IdlePeriodState::InShortIdlePeriod);
        assert_eq!(deadline.granted(), Duration::from_millis(6));

        manual.advance_ms(6);
        assert!(helper.idle_deadline(clock.now(), None, &clock).is_none());
        assert_eq!(helper.state(), IdlePeriodState::NotInIdlePeriod);
    }

    #[test]
    fn test_commit_after_frame_deadline_grants_nothing() {
        let (manual, clock, mut helper) = setup();
        helper.will_begin_frame(BeginFrameArgs::new(clock.now(), Duration::from_millis(16)));
        manual.advance_ms(20);
        helper.did_commit_frame(clock.now());
        assert!(helper.idle_deadline(clock.now(), None, &clock).is_none());
    }

    #[test]
    fn test_input_suppresses_long_idle() {
        let (manual, clock, mut helper) = setup();
        helper.did_handle_input(clock.now());
        assert!(helper.idle_deadline(clock.now(), None, &clock).is_none());
        assert!(helper.next_transition(clock.now()).is_some());

        manual.advance_ms(100);
        assert!(helper.idle_deadline(clock.now(), None, &clock).is_some());
    }

    #[test]
    fn test_frames_not_expected_restores_long_idle() {
        let (_manual, clock, mut helper) = setup();
        helper.will_begin_frame(BeginFrameArgs::at_60fps(clock.now()));
        assert!(helper.idle_deadline(clock.now(), None, &clock).is_none());

        helper.begin_frame_not_expected_soon();
        assert!(helper.idle_deadline(clock.now(), None, &clock).is_some());
    }

    #[test]
    fn test_deadline_time_remaining_tracks_clock() {
        let (manual, clock, mut helper) = setup();
        let deadline = helper.idle_deadline(clock.now(), None, &clock).unwrap();

        manual.advance_ms(20);
        assert_eq!(deadline.time_remaining(), Duration::from_millis(30));
        assert!(!deadline.did_timeout());

        manual.advance_ms(40);
        assert!(deadline.did_timeout());
    }
}
