//! Synchronization orchestrator.
//!
//! Couples one projector session with an optional illuminator session
//! and runs sequence plans in one of four modes:
//!
//! - **Cycling**: the whole plan is uploaded once and the device paces
//!   it; the first descriptor's LED assignment holds for the entire run.
//! - **Hold**: a single pattern held continuously (cycling, one entry).
//! - **Pulsing**: the host paces; each descriptor is made resident on
//!   demand, its LED applied, held, then extinguished before advancing.
//! - **ExternalTrigger**: an outside collaborator starts, stops and
//!   advances via the entry points below.
//!
//! The invariant every path preserves: illumination is switched off
//! before the projector stops, on every exit, including error exits and
//! cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::protocols::dlp6500::ProjectorSession;
use crate::protocols::pe4000::IlluminatorSession;
use crate::trigger::{EdgeDetector, TriggerEvent};
use crate::types::{RunOutcome, RunState, SequencePlan, SyncMode};

/// Granularity of cancellable waits.
const WAIT_SLICE: Duration = Duration::from_millis(5);

// ============================================================================
// Cancellation and observation
// ============================================================================

/// Clonable cancellation flag. Cancelling takes effect at the next wait
/// slice or pattern boundary.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Clonable read handle onto the orchestrator's run state, for UIs and
/// monitors polling from another thread.
#[derive(Clone)]
pub struct RunWatch {
    state: Arc<Mutex<RunState>>,
}

impl RunWatch {
    pub fn get(&self) -> RunState {
        *self.state.lock().unwrap()
    }
}

// ============================================================================
// Upload strategies
// ============================================================================

/// Strategy for making one descriptor of a plan the resident
/// single-pattern sequence on the device.
pub trait Uploader: Send {
    /// Ensure descriptor `index` is the defined sequence, stopping the
    /// projector first if a sequence is running.
    fn activate(
        &mut self,
        projector: &mut ProjectorSession,
        plan: &SequencePlan,
        index: usize,
    ) -> Result<()>;

    /// Forget any residency assumption (call between plans).
    fn invalidate(&mut self);
}

fn define_single(
    projector: &mut ProjectorSession,
    plan: &SequencePlan,
    index: usize,
) -> Result<()> {
    let descriptor = plan
        .descriptors
        .get(index)
        .cloned()
        .ok_or_else(|| Error::config(format!("descriptor index {} out of range", index)))?;
    projector.stop()?;
    // Repeat forever; the host decides when the hold ends.
    let single = SequencePlan::new(vec![descriptor], 0, SyncMode::Hold);
    projector.define_sequence(&single)
}

/// Re-uploads on every activation. Predictable, slow.
#[derive(Default)]
pub struct EagerUploader;

impl Uploader for EagerUploader {
    fn activate(
        &mut self,
        projector: &mut ProjectorSession,
        plan: &SequencePlan,
        index: usize,
    ) -> Result<()> {
        define_single(projector, plan, index)
    }

    fn invalidate(&mut self) {}
}

/// Skips the upload when the requested descriptor is already resident.
/// Uploads cost seconds at full resolution, so repeated activation of
/// one pattern (common under external pacing) should not pay twice.
#[derive(Default)]
pub struct LazyUploader {
    resident: Option<usize>,
}

impl Uploader for LazyUploader {
    fn activate(
        &mut self,
        projector: &mut ProjectorSession,
        plan: &SequencePlan,
        index: usize,
    ) -> Result<()> {
        if self.resident == Some(index) {
            projector.stop()?;
            return Ok(());
        }
        self.resident = None;
        define_single(projector, plan, index)?;
        self.resident = Some(index);
        Ok(())
    }

    fn invalidate(&mut self) {
        self.resident = None;
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

struct ExternalRun {
    plan: Arc<SequencePlan>,
    /// Current descriptor, `None` until the first advance.
    index: Option<usize>,
    running: bool,
    detector: EdgeDetector,
}

/// Owns the device sessions and runs plans against them.
pub struct Orchestrator {
    projector: ProjectorSession,
    illuminator: Option<IlluminatorSession>,
    uploader: Box<dyn Uploader>,
    cancel: CancelToken,
    state: Arc<Mutex<RunState>>,
    external: Option<ExternalRun>,
}

impl Orchestrator {
    /// Create an orchestrator with the default (lazy) upload strategy.
    pub fn new(projector: ProjectorSession, illuminator: Option<IlluminatorSession>) -> Self {
        Self::with_uploader(projector, illuminator, Box::new(LazyUploader::default()))
    }

    pub fn with_uploader(
        projector: ProjectorSession,
        illuminator: Option<IlluminatorSession>,
        uploader: Box<dyn Uploader>,
    ) -> Self {
        Orchestrator {
            projector,
            illuminator,
            uploader,
            cancel: CancelToken::new(),
            state: Arc::new(Mutex::new(RunState::default())),
            external: None,
        }
    }

    /// Token that cancels the current (or next) blocking run.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Read handle onto the run state.
    pub fn watch(&self) -> RunWatch {
        RunWatch {
            state: Arc::clone(&self.state),
        }
    }

    // ------------------------------------------------------------------------
    // Blocking runs (Cycling / Hold / Pulsing)
    // ------------------------------------------------------------------------

    /// Run a plan to completion or cancellation.
    ///
    /// Blocks the calling thread. Whatever happens inside, illumination
    /// is extinguished and the projector stopped before this returns.
    pub fn run(&mut self, plan: &SequencePlan) -> Result<RunOutcome> {
        if plan.mode == SyncMode::ExternalTrigger {
            return Err(Error::config(
                "externally triggered plans run via begin_external",
            ));
        }
        plan.validate()?;
        self.require_illuminator(plan)?;
        if self.external.is_some() {
            return Err(Error::state("an external run is active"));
        }

        self.cancel.reset();
        let result = match plan.mode {
            SyncMode::Cycling | SyncMode::Hold => self.run_device_timed(plan),
            SyncMode::Pulsing => self.run_pulsing(plan),
            SyncMode::ExternalTrigger => unreachable!("rejected above"),
        };
        let shutdown = self.shutdown();
        self.set_state(false, None);

        match (result, shutdown) {
            (Err(e), Err(s)) => {
                warn!("shutdown after failed run also failed: {}", s);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(s)) => Err(s),
            (Ok(outcome), Ok(())) => {
                info!("run finished: {:?}", outcome);
                Ok(outcome)
            }
        }
    }

    /// Cycling and Hold: upload once, let the device pace, wait out the
    /// planned duration host-side.
    fn run_device_timed(&mut self, plan: &SequencePlan) -> Result<RunOutcome> {
        self.uploader.invalidate();
        self.projector.define_sequence(plan)?;
        self.apply_led(plan, 0)?;
        self.projector.start()?;
        self.set_state(true, Some(0));

        if plan.repeat == 0 {
            Ok(self.wait_until_cancelled())
        } else {
            let total = mul_duration(plan.cycle_duration(), plan.repeat);
            if self.wait(total) {
                Ok(RunOutcome::Cancelled)
            } else {
                Ok(RunOutcome::Completed)
            }
        }
    }

    /// Pulsing: host-paced walk over the descriptors, LED switched per
    /// pattern and always off before the projector moves on.
    fn run_pulsing(&mut self, plan: &SequencePlan) -> Result<RunOutcome> {
        self.uploader.invalidate();
        let mut cycle = 0u32;
        loop {
            if plan.repeat != 0 && cycle >= plan.repeat {
                return Ok(RunOutcome::Completed);
            }
            for index in 0..plan.len() {
                if self.cancel.is_cancelled() {
                    return Ok(RunOutcome::Cancelled);
                }
                let hold = plan.descriptors[index].hold();
                self.uploader.activate(&mut self.projector, plan, index)?;
                self.apply_led(plan, index)?;
                self.projector.start()?;
                self.set_state(true, Some(index));

                let cancelled = self.wait(hold);

                self.extinguish_led(plan, index)?;
                self.projector.stop()?;
                if cancelled {
                    return Ok(RunOutcome::Cancelled);
                }
            }
            cycle = cycle.saturating_add(1);
        }
    }

    // ------------------------------------------------------------------------
    // Externally triggered runs
    // ------------------------------------------------------------------------

    /// Arm an externally triggered plan. Nothing is displayed until the
    /// collaborator raises the run flag and asks for the first advance,
    /// which activates the first descriptor.
    pub fn begin_external(&mut self, plan: &SequencePlan) -> Result<()> {
        if plan.mode != SyncMode::ExternalTrigger {
            return Err(Error::config(format!(
                "begin_external takes an externally triggered plan, got {:?}",
                plan.mode
            )));
        }
        plan.validate()?;
        self.require_illuminator(plan)?;
        if self.external.is_some() {
            return Err(Error::state("an external run is already armed"));
        }
        self.cancel.reset();
        self.uploader.invalidate();
        self.external = Some(ExternalRun {
            plan: Arc::new(plan.clone()),
            index: None,
            running: false,
            detector: EdgeDetector::new(),
        });
        Ok(())
    }

    /// Collaborator raised or dropped the run flag. Raising it only arms
    /// pacing; dropping it extinguishes the current pattern and rewinds
    /// to the pre-first position.
    pub fn on_run_toggle(&mut self, run: bool) -> Result<()> {
        let (plan, index, running) = self.external_snapshot()?;
        if run {
            if !running {
                self.set_external_running(true);
                self.set_state(true, None);
            }
            Ok(())
        } else {
            if !running {
                return Err(Error::state("external run is not running"));
            }
            self.external_step(|this| {
                if let Some(i) = index {
                    this.extinguish_led(&plan, i)?;
                }
                this.projector.stop()
            })?;
            self.set_external_running(false);
            self.set_external_index(None);
            self.set_state(false, None);
            Ok(())
        }
    }

    /// Collaborator asked for the next pattern. The first advance
    /// activates the first descriptor; later ones wrap around at the end
    /// of the plan.
    pub fn on_advance(&mut self) -> Result<()> {
        let (plan, index, running) = self.external_snapshot()?;
        if !running {
            return Err(Error::state("cannot advance: external run is not running"));
        }
        let next = match index {
            Some(i) => (i + 1) % plan.len(),
            None => 0,
        };

        self.external_step(|this| {
            if let Some(i) = index {
                this.extinguish_led(&plan, i)?;
                this.projector.stop()?;
            }
            this.uploader.activate(&mut this.projector, &plan, next)?;
            this.apply_led(&plan, next)?;
            this.projector.start()
        })?;

        self.set_external_index(Some(next));
        self.set_state(true, Some(next));
        Ok(())
    }

    /// Run one external device step. A failure anywhere in the step takes
    /// the same exit every other path takes: illumination off, projector
    /// stopped, run no longer running, then the error re-raised.
    fn external_step<F>(&mut self, step: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        match step(self) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(s) = self.shutdown() {
                    warn!("shutdown after failed external step also failed: {}", s);
                }
                self.set_external_running(false);
                self.set_external_index(None);
                self.set_state(false, None);
                Err(e)
            }
        }
    }

    /// Feed one poll of the collaborator's {run flag, advance counter}
    /// signals through the edge detector. Advance events that arrive
    /// while stopped are dropped with a warning rather than treated as
    /// commands.
    pub fn poll_external(&mut self, run: bool, counter: u64) -> Result<()> {
        let events = match self.external.as_mut() {
            Some(ext) => ext.detector.observe(run, counter),
            None => return Err(Error::state("no external run is armed")),
        };
        for event in events {
            match event {
                TriggerEvent::RunStarted => self.on_run_toggle(true)?,
                TriggerEvent::RunStopped => self.on_run_toggle(false)?,
                TriggerEvent::Advance => {
                    let running = self.external.as_ref().map(|e| e.running).unwrap_or(false);
                    if running {
                        self.on_advance()?;
                    } else {
                        warn!("dropping advance event observed while stopped");
                    }
                }
            }
        }
        Ok(())
    }

    /// Disarm the external run, extinguishing and stopping if it is
    /// still running.
    pub fn end_external(&mut self) -> Result<()> {
        let was_running = self.external.as_ref().map(|e| e.running).unwrap_or(false);
        self.external = None;
        if was_running {
            let shutdown = self.shutdown();
            self.set_state(false, None);
            shutdown?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------------

    /// Extinguish illumination, then stop the projector. The LED goes
    /// first: a stray exposure of a dark sample is recoverable, a lit
    /// sample under a stopped-but-lit LED is not.
    fn shutdown(&mut self) -> Result<()> {
        if let Some(ill) = self.illuminator.as_mut() {
            if let Err(e) = ill.all_off() {
                warn!("failed to extinguish illuminator during shutdown: {}", e);
            }
        }
        self.projector.stop()
    }

    fn require_illuminator(&self, plan: &SequencePlan) -> Result<()> {
        let needs_led = plan.descriptors.iter().any(|d| d.led.is_some());
        if needs_led && self.illuminator.is_none() {
            return Err(Error::config(
                "plan assigns LEDs but no illuminator is connected",
            ));
        }
        Ok(())
    }

    fn apply_led(&mut self, plan: &SequencePlan, index: usize) -> Result<()> {
        if let (Some(led), Some(ill)) = (plan.governing_led(index), self.illuminator.as_mut()) {
            ill.apply(led)?;
        }
        Ok(())
    }

    fn extinguish_led(&mut self, plan: &SequencePlan, index: usize) -> Result<()> {
        if let (Some(led), Some(ill)) = (plan.governing_led(index), self.illuminator.as_mut()) {
            ill.turn_off(led.channel())?;
        }
        Ok(())
    }

    fn external_snapshot(&self) -> Result<(Arc<SequencePlan>, Option<usize>, bool)> {
        match self.external.as_ref() {
            Some(ext) => Ok((Arc::clone(&ext.plan), ext.index, ext.running)),
            None => Err(Error::state("no external run is armed")),
        }
    }

    fn set_external_running(&mut self, running: bool) {
        if let Some(ext) = self.external.as_mut() {
            ext.running = running;
        }
    }

    fn set_external_index(&mut self, index: Option<usize>) {
        if let Some(ext) = self.external.as_mut() {
            ext.index = index;
        }
    }

    fn set_state(&self, running: bool, current_index: Option<usize>) {
        let mut state = self.state.lock().unwrap();
        state.running = running;
        state.current_index = current_index;
    }

    /// Sleep for `duration` in cancellable slices. Returns true if the
    /// wait was cancelled.
    fn wait(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            if self.cancel.is_cancelled() {
                return true;
            }
            let slice = remaining.min(WAIT_SLICE);
            thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        self.cancel.is_cancelled()
    }

    fn wait_until_cancelled(&self) -> RunOutcome {
        while !self.cancel.is_cancelled() {
            thread::sleep(WAIT_SLICE);
        }
        RunOutcome::Cancelled
    }
}

fn mul_duration(d: Duration, times: u32) -> Duration {
    d.checked_mul(times).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockIlluminator, MockProjector};
    use crate::protocols::dlp6500::session::{ProjectorConfig, SessionState};
    use crate::types::{Channel, Frame, LedAssignment, PatternDescriptor};

    const W: usize = 8;
    const H: usize = 4;

    fn projector() -> (ProjectorSession, crate::mock::ProjectorHandle) {
        let (transport, handle) = MockProjector::new();
        let config = ProjectorConfig {
            width: W,
            height: H,
            mode_settle: Duration::ZERO,
            stop_settle: Duration::ZERO,
            reset_settle: Duration::ZERO,
            upload_settle: Duration::ZERO,
            ..ProjectorConfig::default()
        };
        (
            ProjectorSession::with_config(Box::new(transport), config),
            handle,
        )
    }

    fn descriptor(wavelength: u16, channel: Channel) -> PatternDescriptor {
        let frame = Arc::new(Frame::binary(W, H, vec![1; W * H]).unwrap());
        PatternDescriptor::new(frame, 1000, 0)
            .with_led(LedAssignment::new(channel, wavelength, 40).unwrap())
    }

    #[test]
    fn test_run_rejects_external_plans() {
        let (p, _ph) = projector();
        let mut orch = Orchestrator::new(p, None);
        let plan = SequencePlan::new(
            vec![PatternDescriptor::new(
                Arc::new(Frame::binary(W, H, vec![0; W * H]).unwrap()),
                1000,
                0,
            )],
            1,
            SyncMode::ExternalTrigger,
        );
        assert!(orch.run(&plan).unwrap_err().is_config());
    }

    #[test]
    fn test_led_plan_without_illuminator_rejected() {
        let (p, _ph) = projector();
        let mut orch = Orchestrator::new(p, None);
        let plan = SequencePlan::new(vec![descriptor(470, Channel::B)], 1, SyncMode::Pulsing);
        assert!(orch.run(&plan).unwrap_err().is_config());
    }

    #[test]
    fn test_external_entry_points_require_arming() {
        let (p, _ph) = projector();
        let mut orch = Orchestrator::new(p, None);
        assert!(orch.on_run_toggle(true).unwrap_err().is_state());
        assert!(orch.on_advance().unwrap_err().is_state());
        assert!(orch.poll_external(true, 0).unwrap_err().is_state());
    }

    #[test]
    fn test_advance_while_stopped_is_a_state_error() {
        let (p, _ph) = projector();
        let (lt, _lh) = MockIlluminator::new();
        let mut orch = Orchestrator::new(p, Some(IlluminatorSession::new(Box::new(lt))));
        let plan = SequencePlan::new(
            vec![descriptor(470, Channel::B)],
            0,
            SyncMode::ExternalTrigger,
        );
        orch.begin_external(&plan).unwrap();
        assert!(orch.on_advance().unwrap_err().is_state());
        assert!(orch.on_run_toggle(false).unwrap_err().is_state());
    }

    #[test]
    fn test_watch_reflects_idle_state() {
        let (p, _ph) = projector();
        let orch = Orchestrator::new(p, None);
        let watch = orch.watch();
        assert!(!watch.get().running);
        assert_eq!(watch.get().current_index, None);
    }

    #[test]
    fn test_lazy_uploader_skips_resident_index() {
        let (mut p, handle) = projector();
        let plan = SequencePlan::new(
            vec![PatternDescriptor::new(
                Arc::new(Frame::binary(W, H, vec![0; W * H]).unwrap()),
                1000,
                0,
            )],
            1,
            SyncMode::Pulsing,
        );
        let mut lazy = LazyUploader::default();
        lazy.activate(&mut p, &plan, 0).unwrap();
        let uploads_after_first = handle
            .opcodes()
            .iter()
            .filter(|&&op| op == crate::protocols::dlp6500::protocol::OP_IMAGE_LOAD_INIT)
            .count();
        lazy.activate(&mut p, &plan, 0).unwrap();
        let uploads_after_second = handle
            .opcodes()
            .iter()
            .filter(|&&op| op == crate::protocols::dlp6500::protocol::OP_IMAGE_LOAD_INIT)
            .count();
        assert_eq!(uploads_after_first, 1);
        assert_eq!(uploads_after_second, 1);
        assert_eq!(p.state(), SessionState::SequenceDefined);
    }

    #[test]
    fn test_eager_uploader_always_uploads() {
        let (mut p, handle) = projector();
        let plan = SequencePlan::new(
            vec![PatternDescriptor::new(
                Arc::new(Frame::binary(W, H, vec![0; W * H]).unwrap()),
                1000,
                0,
            )],
            1,
            SyncMode::Pulsing,
        );
        let mut eager = EagerUploader;
        eager.activate(&mut p, &plan, 0).unwrap();
        eager.activate(&mut p, &plan, 0).unwrap();
        let uploads = handle
            .opcodes()
            .iter()
            .filter(|&&op| op == crate::protocols::dlp6500::protocol::OP_IMAGE_LOAD_INIT)
            .count();
        assert_eq!(uploads, 2);
    }
}
