//! Idle/activity scheduler
//!
//! Decides when an observer should nudge the agent forward on its own. After
//! a turn that used tools the nudge comes almost immediately; after a quiet
//! turn it waits for the idle delay. Any prompt reaching the observer
//! suspends the schedule until the queue drains, and the user can pause it.
//!
//! [`ActivityScheduler`] is the pure state machine, driven with explicit
//! instants. [`SchedulerDriver`] runs it on the tokio clock.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Delay after a turn with tool activity
    pub immediate_delay: Duration,
    /// Delay after a quiet turn
    pub idle_delay: Duration,
    pub start_paused: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            immediate_delay: Duration::from_millis(750),
            idle_delay: Duration::from_secs(60),
            start_paused: false,
        }
    }
}

/// How the last agent turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnActivity {
    Tools,
    Quiet,
}

impl TurnActivity {
    pub fn from_tool_activity(tool_activity: bool) -> Self {
        if tool_activity {
            TurnActivity::Tools
        } else {
            TurnActivity::Quiet
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    ArmedImmediate { deadline: Instant },
    ArmedDelayed { deadline: Instant },
    /// A prompt is waiting on the human
    Suspended,
}

/// Emitted when an armed timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nudge {
    pub after: TurnActivity,
}

#[derive(Debug)]
pub struct ActivityScheduler {
    config: SchedulerConfig,
    state: SchedulerState,
    paused: bool,
    /// Rule used to re-arm when the queue drains
    last_turn: Option<TurnActivity>,
    /// Armed turn interrupted by a pause, restored on resume
    held: Option<TurnActivity>,
}

impl ActivityScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: SchedulerState::Idle,
            paused: config.start_paused,
            last_turn: None,
            held: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// When the armed timer fires, if armed
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            SchedulerState::ArmedImmediate { deadline }
            | SchedulerState::ArmedDelayed { deadline } => Some(deadline),
            SchedulerState::Idle | SchedulerState::Suspended => None,
        }
    }

    pub fn turn_completed(&mut self, activity: TurnActivity, now: Instant) {
        self.last_turn = Some(activity);
        match self.state {
            SchedulerState::Suspended => {}
            _ if self.paused => {
                self.state = SchedulerState::Idle;
                self.held = Some(activity);
            }
            _ => self.arm(activity, now),
        }
    }

    /// A prompt reached the observer queue
    pub fn request_enqueued(&mut self) {
        if self.state != SchedulerState::Suspended {
            debug!(from = ?self.state, "scheduler suspended by pending prompt");
        }
        self.state = SchedulerState::Suspended;
    }

    /// The observer queue emptied
    pub fn drained(&mut self, now: Instant) {
        if self.state != SchedulerState::Suspended {
            return;
        }
        self.state = SchedulerState::Idle;
        match self.last_turn {
            Some(activity) if self.paused => self.held = Some(activity),
            Some(activity) => self.arm(activity, now),
            None => {}
        }
    }

    pub fn pause(&mut self) {
        self.paused = true;
        match self.state {
            SchedulerState::ArmedImmediate { .. } => {
                self.held = Some(TurnActivity::Tools);
                self.state = SchedulerState::Idle;
            }
            SchedulerState::ArmedDelayed { .. } => {
                self.held = Some(TurnActivity::Quiet);
                self.state = SchedulerState::Idle;
            }
            SchedulerState::Idle | SchedulerState::Suspended => {}
        }
    }

    pub fn resume(&mut self, now: Instant) {
        self.paused = false;
        if self.state != SchedulerState::Idle {
            return;
        }
        if let Some(activity) = self.held.take() {
            self.arm(activity, now);
        }
    }

    /// Fire the armed timer if its deadline has passed
    pub fn poll(&mut self, now: Instant) -> Option<Nudge> {
        let (deadline, after) = match self.state {
            SchedulerState::ArmedImmediate { deadline } => (deadline, TurnActivity::Tools),
            SchedulerState::ArmedDelayed { deadline } => (deadline, TurnActivity::Quiet),
            SchedulerState::Idle | SchedulerState::Suspended => return None,
        };
        if now < deadline {
            return None;
        }
        self.state = SchedulerState::Idle;
        Some(Nudge { after })
    }

    fn arm(&mut self, activity: TurnActivity, now: Instant) {
        self.held = None;
        self.state = match activity {
            TurnActivity::Tools => SchedulerState::ArmedImmediate {
                deadline: now + self.config.immediate_delay,
            },
            TurnActivity::Quiet => SchedulerState::ArmedDelayed {
                deadline: now + self.config.idle_delay,
            },
        };
    }
}

/// Inputs accepted by a running [`SchedulerDriver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerInput {
    TurnCompleted(TurnActivity),
    RequestEnqueued,
    Drained,
    Pause,
    Resume,
}

/// Cheap handle for feeding a running driver
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerInput>,
}

impl SchedulerHandle {
    pub fn send(&self, input: SchedulerInput) {
        let _ = self.tx.send(input);
    }

    pub fn turn_completed(&self, activity: TurnActivity) {
        self.send(SchedulerInput::TurnCompleted(activity));
    }

    pub fn request_enqueued(&self) {
        self.send(SchedulerInput::RequestEnqueued);
    }

    pub fn drained(&self) {
        self.send(SchedulerInput::Drained);
    }

    pub fn pause(&self) {
        self.send(SchedulerInput::Pause);
    }

    pub fn resume(&self) {
        self.send(SchedulerInput::Resume);
    }
}

pub struct SchedulerDriver {
    fsm: ActivityScheduler,
    inputs: mpsc::UnboundedReceiver<SchedulerInput>,
    nudges: mpsc::UnboundedSender<Nudge>,
}

impl SchedulerDriver {
    /// Start the driver; nudges are delivered on the returned receiver.
    pub fn spawn(
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> (SchedulerHandle, mpsc::UnboundedReceiver<Nudge>, JoinHandle<()>) {
        let (tx, inputs) = mpsc::unbounded_channel();
        let (nudges, nudge_rx) = mpsc::unbounded_channel();
        let driver = Self {
            fsm: ActivityScheduler::new(config),
            inputs,
            nudges,
        };
        let task = tokio::spawn(driver.run(cancel));
        (SchedulerHandle { tx }, nudge_rx, task)
    }

    async fn run(mut self, cancel: CancellationToken) {
        loop {
            let deadline = self.fsm.deadline();
            tokio::select! {
                _ = cancel.cancelled() => break,
                input = self.inputs.recv() => match input {
                    Some(input) => self.apply(input),
                    None => break,
                },
                _ = wait_until(deadline) => {
                    if let Some(nudge) = self.fsm.poll(Instant::now()) {
                        debug!(after = ?nudge.after, "scheduler fired");
                        if self.nudges.send(nudge).is_err() {
                            break;
                        }
                    }
                }
            }
        }
        debug!("scheduler stopped");
    }

    fn apply(&mut self, input: SchedulerInput) {
        let now = Instant::now();
        match input {
            SchedulerInput::TurnCompleted(activity) => self.fsm.turn_completed(activity, now),
            SchedulerInput::RequestEnqueued => self.fsm.request_enqueued(),
            SchedulerInput::Drained => self.fsm.drained(now),
            SchedulerInput::Pause => self.fsm.pause(),
            SchedulerInput::Resume => self.fsm.resume(now),
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> ActivityScheduler {
        ActivityScheduler::new(SchedulerConfig::default())
    }

    #[test]
    fn test_tool_turn_fires_quickly() {
        let mut fsm = scheduler();
        let now = Instant::now();
        fsm.turn_completed(TurnActivity::Tools, now);
        assert!(matches!(fsm.state(), SchedulerState::ArmedImmediate { .. }));

        assert_eq!(fsm.poll(now + Duration::from_millis(700)), None);
        assert_eq!(
            fsm.poll(now + Duration::from_millis(750)),
            Some(Nudge {
                after: TurnActivity::Tools
            })
        );
        assert_eq!(fsm.state(), SchedulerState::Idle);
        assert_eq!(fsm.poll(now + Duration::from_secs(120)), None);
    }

    #[test]
    fn test_quiet_turn_waits_for_idle_delay() {
        let mut fsm = scheduler();
        let now = Instant::now();
        fsm.turn_completed(TurnActivity::Quiet, now);
        assert_eq!(fsm.poll(now + Duration::from_secs(59)), None);
        assert!(fsm.poll(now + Duration::from_secs(60)).is_some());
    }

    #[test]
    fn test_prompt_suspends_until_drained() {
        let mut fsm = scheduler();
        let now = Instant::now();
        fsm.turn_completed(TurnActivity::Tools, now);
        fsm.request_enqueued();
        assert_eq!(fsm.state(), SchedulerState::Suspended);
        assert_eq!(fsm.poll(now + Duration::from_secs(5)), None);

        // A turn finishing while the human is busy does not arm
        fsm.turn_completed(TurnActivity::Quiet, now);
        assert_eq!(fsm.state(), SchedulerState::Suspended);

        let later = now + Duration::from_secs(10);
        fsm.drained(later);
        assert_eq!(
            fsm.deadline(),
            Some(later + Duration::from_secs(60)),
            "re-armed by the last completed turn"
        );
    }

    #[test]
    fn test_drain_without_prompt_is_ignored() {
        let mut fsm = scheduler();
        let now = Instant::now();
        fsm.turn_completed(TurnActivity::Quiet, now);
        let deadline = fsm.deadline();
        fsm.drained(now + Duration::from_secs(30));
        assert_eq!(fsm.deadline(), deadline);
    }

    #[test]
    fn test_pause_and_resume() {
        let mut fsm = scheduler();
        let now = Instant::now();
        fsm.turn_completed(TurnActivity::Tools, now);
        fsm.pause();
        assert_eq!(fsm.state(), SchedulerState::Idle);
        assert_eq!(fsm.poll(now + Duration::from_secs(5)), None);

        let later = now + Duration::from_secs(5);
        fsm.resume(later);
        assert_eq!(fsm.deadline(), Some(later + Duration::from_millis(750)));
    }

    #[test]
    fn test_pause_does_not_lift_suspension() {
        let mut fsm = ActivityScheduler::new(SchedulerConfig {
            start_paused: true,
            ..SchedulerConfig::default()
        });
        let now = Instant::now();
        assert!(fsm.is_paused());

        fsm.turn_completed(TurnActivity::Tools, now);
        assert_eq!(fsm.state(), SchedulerState::Idle);

        fsm.request_enqueued();
        fsm.resume(now);
        assert_eq!(fsm.state(), SchedulerState::Suspended);

        fsm.pause();
        fsm.drained(now);
        assert_eq!(fsm.state(), SchedulerState::Idle);
        fsm.resume(now);
        assert!(matches!(fsm.state(), SchedulerState::ArmedImmediate { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_emits_nudge() {
        let cancel = CancellationToken::new();
        let (handle, mut nudges, task) =
            SchedulerDriver::spawn(SchedulerConfig::default(), cancel.clone());

        handle.turn_completed(TurnActivity::Tools);
        let nudge = tokio::time::timeout(Duration::from_secs(5), nudges.recv())
            .await
            .expect("scheduler never fired")
            .unwrap();
        assert_eq!(nudge.after, TurnActivity::Tools);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_suspended_by_prompt() {
        let cancel = CancellationToken::new();
        let (handle, mut nudges, _task) =
            SchedulerDriver::spawn(SchedulerConfig::default(), cancel.clone());

        handle.turn_completed(TurnActivity::Tools);
        handle.request_enqueued();
        assert!(
            tokio::time::timeout(Duration::from_secs(120), nudges.recv())
                .await
                .is_err(),
            "no nudge while a prompt is pending"
        );

        handle.drained();
        assert!(tokio::time::timeout(Duration::from_secs(5), nudges.recv())
            .await
            .is_ok());
        cancel.cancel();
    }
}
