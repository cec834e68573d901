//! End-to-end orchestrator scenarios against the in-memory device
//! doubles: full sequence plans pushed through real sessions, with the
//! wire journals and the shared event log as ground truth.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lumisync::mock::{
    event_log, EventLog, IlluminatorHandle, MockIlluminator, MockProjector, ProjectorHandle,
};
use lumisync::orchestrator::Orchestrator;
use lumisync::protocols::dlp6500::protocol::{
    PatternControl, OP_IMAGE_LOAD_INIT, OP_INPUT_SOURCE, OP_PATTERN_CONTROL,
};
use lumisync::protocols::dlp6500::session::ProjectorConfig;
use lumisync::types::{
    Channel, Frame, LedAssignment, PatternDescriptor, RunOutcome, SequencePlan, SyncMode,
};
use lumisync::{IlluminatorSession, ProjectorSession};

const W: usize = 8;
const H: usize = 4;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn projector_with_log(log: EventLog) -> (ProjectorSession, ProjectorHandle) {
    let (transport, handle) = MockProjector::with_log(log);
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

fn illuminator_with_log(log: EventLog) -> (IlluminatorSession, IlluminatorHandle) {
    let (transport, handle) = MockIlluminator::with_log(log);
    (IlluminatorSession::new(Box::new(transport)), handle)
}

fn lit_descriptor(seed: u8, wavelength: u16, hold_us: u32) -> PatternDescriptor {
    let data: Vec<u8> = (0..W * H).map(|i| ((i as u8).wrapping_add(seed)) & 1).collect();
    let frame = Arc::new(Frame::binary(W, H, data).unwrap());
    let channel = Channel::owning(wavelength).unwrap();
    PatternDescriptor::new(frame, hold_us, 0)
        .with_led(LedAssignment::new(channel, wavelength, 50).unwrap())
}

fn dark_descriptor(seed: u8, hold_us: u32) -> PatternDescriptor {
    let data: Vec<u8> = (0..W * H).map(|i| ((i as u8).wrapping_mul(seed)) & 1).collect();
    PatternDescriptor::new(Arc::new(Frame::binary(W, H, data).unwrap()), hold_us, 0)
}

fn start_count(handle: &ProjectorHandle) -> usize {
    handle
        .commands()
        .iter()
        .filter(|c| {
            c.opcode == OP_PATTERN_CONTROL && c.payload.first() == Some(&(PatternControl::Start as u8))
        })
        .count()
}

#[test]
fn test_pulsing_walks_every_pattern_in_order() {
    init_logging();
    let log = event_log();
    let (projector, phandle) = projector_with_log(Arc::clone(&log));
    let (illuminator, lhandle) = illuminator_with_log(Arc::clone(&log));
    let mut orch = Orchestrator::new(projector, Some(illuminator));

    let plan = SequencePlan::new(
        vec![
            lit_descriptor(0, 405, 1000),
            lit_descriptor(1, 470, 1000),
            lit_descriptor(2, 550, 1000),
        ],
        2,
        SyncMode::Pulsing,
    );
    assert_eq!(orch.run(&plan).unwrap(), RunOutcome::Completed);

    // Two cycles over three patterns: six starts.
    assert_eq!(start_count(&phandle), 6);

    // The illuminator saw each wavelength loaded in playback order, twice.
    let loads: Vec<String> = lhandle
        .lines()
        .into_iter()
        .filter(|l| l.starts_with("LOAD:"))
        .collect();
    assert_eq!(
        loads,
        vec![
            "LOAD:405", "LOAD:470", "LOAD:550", "LOAD:405", "LOAD:470", "LOAD:550"
        ]
    );

    // Every pattern's channel went off before the next load.
    let lines = lhandle.lines();
    let first_off = lines.iter().position(|l| l == "CSSASF").unwrap();
    let second_load = lines.iter().position(|l| l == "LOAD:470").unwrap();
    assert!(first_off < second_load);

    // Run-level shutdown still extinguished everything at the end.
    assert_eq!(lines.last().map(String::as_str), Some("CSF"));
}

#[test]
fn test_upload_failure_extinguishes_before_reporting() {
    init_logging();
    let log = event_log();
    let (projector, phandle) = projector_with_log(Arc::clone(&log));
    let (illuminator, _lhandle) = illuminator_with_log(Arc::clone(&log));
    let mut orch = Orchestrator::new(projector, Some(illuminator));

    // Second single-pattern upload dies mid-run.
    phandle.fail_on_opcode(OP_IMAGE_LOAD_INIT, 2);

    let plan = SequencePlan::new(
        vec![lit_descriptor(0, 405, 1000), lit_descriptor(1, 470, 1000)],
        1,
        SyncMode::Pulsing,
    );
    let err = orch.run(&plan).unwrap_err();
    assert!(err.is_io());

    // The shutdown path ran after the failure: everything the wire saw
    // ends with the illuminator being extinguished. (The projector needs
    // no stop bytes; the failed define left it without a running
    // sequence.)
    let events = log.lock().unwrap().clone();
    assert_eq!(events.last().map(String::as_str), Some("led CSF"));
    let last_dmd = events.iter().rposition(|e| e.starts_with("dmd")).unwrap();
    let last_led = events.iter().rposition(|e| e == "led CSF").unwrap();
    assert!(last_dmd < last_led, "events: {:?}", events);
}

#[test]
fn test_external_trigger_advances_with_wraparound() {
    init_logging();
    let log = event_log();
    let (projector, _phandle) = projector_with_log(Arc::clone(&log));
    let (illuminator, lhandle) = illuminator_with_log(Arc::clone(&log));
    let mut orch = Orchestrator::new(projector, Some(illuminator));

    let plan = SequencePlan::new(
        vec![
            lit_descriptor(0, 405, 1000),
            lit_descriptor(1, 470, 1000),
            lit_descriptor(2, 550, 1000),
        ],
        0,
        SyncMode::ExternalTrigger,
    );
    orch.begin_external(&plan).unwrap();

    // Raising the run flag arms pacing but displays nothing yet.
    orch.poll_external(true, 0).unwrap();
    assert!(lhandle.lines().is_empty());

    for counter in 1..=5 {
        orch.poll_external(true, counter).unwrap();
    }
    orch.poll_external(false, 5).unwrap();
    orch.end_external().unwrap();

    // Five advances: the first activates pattern 0, then wrap past the end.
    let loads: Vec<String> = lhandle
        .lines()
        .into_iter()
        .filter(|l| l.starts_with("LOAD:"))
        .collect();
    assert_eq!(
        loads,
        vec!["LOAD:405", "LOAD:470", "LOAD:550", "LOAD:405", "LOAD:470"]
    );

    // Each advance switched the previous channel off before loading the
    // next wavelength.
    let lines = lhandle.lines();
    let off_a = lines.iter().position(|l| l == "CSSASF").unwrap();
    let load_b = lines.iter().position(|l| l == "LOAD:470").unwrap();
    assert!(off_a < load_b);
}

#[test]
fn test_external_start_failure_extinguishes_led() {
    init_logging();
    let log = event_log();
    let (projector, phandle) = projector_with_log(Arc::clone(&log));
    let (illuminator, lhandle) = illuminator_with_log(Arc::clone(&log));
    let mut orch = Orchestrator::new(projector, Some(illuminator));

    let plan = SequencePlan::new(
        vec![lit_descriptor(0, 405, 1000)],
        0,
        SyncMode::ExternalTrigger,
    );
    orch.begin_external(&plan).unwrap();
    orch.poll_external(true, 0).unwrap();

    // The start command dies after the LED is already lit.
    phandle.fail_on_opcode(OP_INPUT_SOURCE, 1);
    let err = orch.poll_external(true, 1).unwrap_err();
    assert!(err.is_io());

    // The advance lit channel A, then the failure exit extinguished it
    // before the error surfaced.
    assert_eq!(
        lhandle.lines(),
        vec!["LOAD:405", "CSSASN050", "CSF"]
    );
}

#[test]
fn test_oversized_plan_rejected_before_any_upload() {
    init_logging();
    let (projector, phandle) = projector_with_log(event_log());
    let mut orch = Orchestrator::new(projector, None);

    let descriptors: Vec<PatternDescriptor> =
        (0..401).map(|i| dark_descriptor(i as u8, 1000)).collect();
    let plan = SequencePlan::new(descriptors, 1, SyncMode::Cycling);

    let err = orch.run(&plan).unwrap_err();
    assert!(err.is_limit_exceeded());
    assert!(!phandle
        .opcodes()
        .iter()
        .any(|&op| op == OP_IMAGE_LOAD_INIT));

    // The orchestrator is still usable afterwards.
    let small = SequencePlan::new(vec![dark_descriptor(1, 1000)], 1, SyncMode::Cycling);
    assert_eq!(orch.run(&small).unwrap(), RunOutcome::Completed);
}

#[test]
fn test_cancellation_mid_hold() {
    init_logging();
    let log = event_log();
    let (projector, phandle) = projector_with_log(Arc::clone(&log));
    let (illuminator, lhandle) = illuminator_with_log(Arc::clone(&log));
    let mut orch = Orchestrator::new(projector, Some(illuminator));
    let token = orch.cancel_token();

    // Infinite hold; only cancellation can end it.
    let plan = SequencePlan::new(vec![lit_descriptor(0, 405, 2000)], 0, SyncMode::Hold);

    let worker = thread::spawn(move || {
        let outcome = orch.run(&plan).unwrap();
        (orch, outcome)
    });
    thread::sleep(Duration::from_millis(30));
    token.cancel();
    let (mut orch, outcome) = worker.join().unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);

    // Shutdown ordering held under cancellation too.
    let events = log.lock().unwrap().clone();
    let last_led = events.iter().rposition(|e| e == "led CSF").unwrap();
    let last_dmd = events.iter().rposition(|e| e.starts_with("dmd")).unwrap();
    assert!(last_led < last_dmd, "events: {:?}", events);
    assert_eq!(lhandle.lines().last().map(String::as_str), Some("CSF"));
    assert!(start_count(&phandle) >= 1);

    // The cancel flag resets on the next run.
    let again = SequencePlan::new(vec![lit_descriptor(0, 405, 1000)], 1, SyncMode::Hold);
    assert_eq!(orch.run(&again).unwrap(), RunOutcome::Completed);
}

#[test]
fn test_cycling_holds_first_descriptor_led() {
    init_logging();
    let log = event_log();
    let (projector, _phandle) = projector_with_log(Arc::clone(&log));
    let (illuminator, lhandle) = illuminator_with_log(Arc::clone(&log));
    let mut orch = Orchestrator::new(projector, Some(illuminator));

    // Second descriptor carries its own assignment, but cycling runs
    // under the first descriptor's light.
    let plan = SequencePlan::new(
        vec![lit_descriptor(0, 405, 1000), lit_descriptor(1, 470, 1000)],
        1,
        SyncMode::Cycling,
    );
    assert_eq!(orch.run(&plan).unwrap(), RunOutcome::Completed);

    let loads: Vec<String> = lhandle
        .lines()
        .into_iter()
        .filter(|l| l.starts_with("LOAD:"))
        .collect();
    assert_eq!(loads, vec!["LOAD:405"]);
}
