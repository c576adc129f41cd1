//! End-to-end provisioning runs against fake hardware, backend and operator.

use std::{
    cell::RefCell,
    collections::VecDeque,
    fs, io,
    path::{Path, PathBuf},
    rc::Rc,
    time::Duration,
};

use aes::Aes128;
use cbc::cipher::{generic_array::GenericArray, BlockEncryptMut, KeyIvInit};
use tempfile::TempDir;

use provcom::{
    error::FlashOperation, provision::provision, BackendApi, ByteSource, CapturedReport,
    Collaborators, DeviceManager, FlashPlan, FlashTool, ImageKey, LabelJob, LabelPrinter,
    MonitorConnector, MonitorSettings, Operator, PortLocator, ProvisionError, ProvisioningRun,
    Settings, SettingsBuilder, Severity, Stage, Station, Submission, Verdict, REQUIRED_CHECKS,
};

const KEY: &[u8; 16] = b"0123456789abcdef";
const IV: &[u8; 16] = b"fedcba9876543210";
const PORT: &str = "/dev/ttyUSB0";
const MAC: &str = "24:6F:28:AA:BB:CC";
const LINK: &str = "https://example.com/devices/42";

type Journal = Rc<RefCell<Vec<String>>>;

fn log(journal: &Journal, entry: String) {
    journal.borrow_mut().push(entry);
}

// ===== Fakes =====

struct FakeTool {
    journal: Journal,
    boards: Vec<String>,
    fail_erase: bool,
    fail_factory: bool,
    final_failures: usize,
}
impl FlashTool for FakeTool {
    fn detect(&mut self, port: &str) -> provcom::Result<()> {
        log(&self.journal, format!("detect {}", port));
        if self.boards.iter().any(|b| b == port) {
            Ok(())
        } else {
            Err(ProvisionError::FlashToolError {
                operation: FlashOperation::Detect,
                baud: None,
                message: "no serial data received".into(),
            })
        }
    }

    fn erase(&mut self, port: &str, chip: &str) -> provcom::Result<()> {
        log(&self.journal, format!("erase {} {}", chip, port));
        if self.fail_erase {
            return Err(ProvisionError::FlashToolError {
                operation: FlashOperation::Erase,
                baud: None,
                message: "exit status: 2".into(),
            });
        }
        Ok(())
    }

    fn write(&mut self, _port: &str, _chip: &str, plan: &FlashPlan, baud: u32) -> provcom::Result<()> {
        log(&self.journal, format!("write {} {}", plan.name, baud));
        let failing = if plan.name == "final" {
            let image = fs::read(&plan.segments[0].path).unwrap();
            log(&self.journal, format!("magic {:#x}", image[0x1000]));
            if self.final_failures > 0 {
                self.final_failures -= 1;
                true
            } else {
                false
            }
        } else {
            self.fail_factory
        };
        if failing {
            return Err(ProvisionError::FlashToolError {
                operation: FlashOperation::Write,
                baud: Some(baud),
                message: "timed out waiting for packet header".into(),
            });
        }
        Ok(())
    }

    fn reset(&mut self, _port: &str) -> provcom::Result<()> {
        log(&self.journal, "reset".into());
        Ok(())
    }
}

/// Replays a serial session, then fails like an unplugged cable.
struct Session {
    journal: Journal,
    reads: VecDeque<Vec<u8>>,
}
impl ByteSource for Session {
    fn bytes_available(&mut self) -> io::Result<u32> {
        match self.reads.front() {
            Some(r) => Ok(r.len() as u32),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected")),
        }
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let r = self.reads.pop_front().unwrap_or_default();
        buf[..r.len()].copy_from_slice(&r);
        Ok(r.len())
    }
}
impl Drop for Session {
    fn drop(&mut self) {
        log(&self.journal, "close".into());
    }
}

struct FakeMonitor {
    journal: Journal,
    reads: Vec<Vec<u8>>,
}
impl MonitorConnector for FakeMonitor {
    fn open(&mut self, path: &str, settings: &MonitorSettings) -> provcom::Result<Box<dyn ByteSource>> {
        log(&self.journal, format!("open {} {}", path, settings.baud_rate));
        Ok(Box::new(Session {
            journal: self.journal.clone(),
            reads: self.reads.iter().cloned().collect(),
        }))
    }
}

struct FakeBackend {
    journal: Journal,
    fail: bool,
}
impl BackendApi for FakeBackend {
    fn submit(&mut self, report: &CapturedReport) -> provcom::Result<Submission> {
        log(
            &self.journal,
            format!("submit {}", report.mac_address().unwrap_or("?")),
        );
        if self.fail {
            return Err(ProvisionError::SubmissionError("HTTP 503".into()));
        }
        Ok(Submission {
            link: Some(LINK.into()),
        })
    }
}

struct FakePrinter {
    journal: Journal,
    fail: bool,
}
impl LabelPrinter for FakePrinter {
    fn print(&mut self, job: &LabelJob) -> provcom::Result<()> {
        log(&self.journal, format!("label [{}]", job.qr_payload));
        if self.fail {
            return Err(ProvisionError::LabelPrintError("out of labels".into()));
        }
        Ok(())
    }
}

struct FakePorts {
    journal: Journal,
    ready: bool,
    candidates: Vec<String>,
}
impl PortLocator for FakePorts {
    fn wait_for(&mut self, path: &str) -> bool {
        log(&self.journal, format!("wait {}", path));
        self.ready
    }

    fn candidates(&mut self) -> Vec<String> {
        self.candidates.clone()
    }
}

/// What the operator saw at the end of a run.
#[derive(Debug)]
struct Summary {
    port: String,
    stages: Vec<Stage>,
    verdict: Option<Verdict>,
    errors: Vec<(Stage, String)>,
    committed: bool,
}

struct FakeOperator {
    journal: Journal,
    next: VecDeque<bool>,
    retry: VecDeque<bool>,
    seen: Rc<RefCell<Vec<Summary>>>,
}
impl Operator for FakeOperator {
    fn next_device(&mut self, run: &ProvisioningRun) -> bool {
        log(&self.journal, "next?".into());
        self.seen.borrow_mut().push(Summary {
            port: run.port().to_owned(),
            stages: run.stages().to_vec(),
            verdict: run.verdict().cloned(),
            errors: run
                .errors()
                .iter()
                .map(|e| (e.stage, e.error.to_string()))
                .collect(),
            committed: run.committed(),
        });
        self.next.pop_front().unwrap_or(false)
    }

    fn retry_detection(&mut self) -> bool {
        log(&self.journal, "retry?".into());
        self.retry.pop_front().unwrap_or(false)
    }
}

// ===== Fixtures =====

/// A scratch production line: diagnostic build, encrypted final image and
/// configurable fakes.
struct Line {
    dir: TempDir,
    journal: Journal,
    seen: Rc<RefCell<Vec<Summary>>>,
    reads: Vec<Vec<u8>>,
    boards: Vec<String>,
    candidates: Vec<String>,
    port_ready: bool,
    fail_erase: bool,
    fail_factory: bool,
    final_failures: usize,
    fail_submit: bool,
    fail_label: bool,
    next: Vec<bool>,
    retry: Vec<bool>,
}
impl Line {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for segment in FlashPlan::factory(dir.path().join("build")).segments {
            fs::create_dir_all(segment.path.parent().unwrap()).unwrap();
            fs::write(&segment.path, b"diagnostic firmware").unwrap();
        }
        fs::write(
            dir.path().join("final.bin.enc"),
            encrypt(&plaintext(0xE9)),
        )
        .unwrap();

        Line {
            dir,
            journal: Rc::new(RefCell::new(Vec::new())),
            seen: Rc::new(RefCell::new(Vec::new())),
            reads: session(&report_json(&[])),
            boards: vec![PORT.to_owned()],
            candidates: vec![PORT.to_owned()],
            port_ready: true,
            fail_erase: false,
            fail_factory: false,
            final_failures: 0,
            fail_submit: false,
            fail_label: false,
            next: Vec::new(),
            retry: Vec::new(),
        }
    }

    fn builder(&self) -> SettingsBuilder {
        SettingsBuilder::new()
            .path(PORT)
            .factory_dir(self.dir.path().join("build"))
            .encrypted_image(self.dir.path().join("final.bin.enc"))
            .work_dir(self.work_dir())
            .image_key(ImageKey::new(KEY, IV).unwrap())
            .settle_delay(Duration::from_millis(0))
            .poll_interval(Duration::from_millis(1))
            .api_url("http://backend.invalid/save")
            .batch_number("B-1")
    }

    fn settings(&self) -> Settings {
        self.builder().finalize()
    }

    fn work_dir(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    fn plaintext_path(&self) -> PathBuf {
        self.work_dir().join("firmware-combined-decrypted.bin")
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            ports: Box::new(FakePorts {
                journal: self.journal.clone(),
                ready: self.port_ready,
                candidates: self.candidates.clone(),
            }),
            flash_tool: Box::new(FakeTool {
                journal: self.journal.clone(),
                boards: self.boards.clone(),
                fail_erase: self.fail_erase,
                fail_factory: self.fail_factory,
                final_failures: self.final_failures,
            }),
            monitor: Box::new(FakeMonitor {
                journal: self.journal.clone(),
                reads: self.reads.clone(),
            }),
            backend: Box::new(FakeBackend {
                journal: self.journal.clone(),
                fail: self.fail_submit,
            }),
            printer: Box::new(FakePrinter {
                journal: self.journal.clone(),
                fail: self.fail_label,
            }),
            operator: Box::new(FakeOperator {
                journal: self.journal.clone(),
                next: self.next.iter().cloned().collect(),
                retry: self.retry.iter().cloned().collect(),
                seen: self.seen.clone(),
            }),
        }
    }

    fn provision_with(&self, settings: &Settings) -> ProvisioningRun {
        provision(PORT, settings, &mut self.collaborators())
    }

    fn provision(&self) -> ProvisioningRun {
        self.provision_with(&self.settings())
    }

    fn logged(&self, entry: &str) -> bool {
        self.journal.borrow().iter().any(|e| e == entry)
    }

    fn count(&self, prefix: &str) -> usize {
        self.journal
            .borrow()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

fn plaintext(magic: u8) -> Vec<u8> {
    let mut plain: Vec<u8> = (0..0x3000).map(|i| (i % 253) as u8).collect();
    plain[0x1000] = magic;
    plain
}

fn encrypt(plain: &[u8]) -> Vec<u8> {
    let mut data = plain.to_vec();
    let mut enc = cbc::Encryptor::<Aes128>::new_from_slices(KEY, IV).unwrap();
    for block in data.chunks_exact_mut(16) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
    data
}

/// A report with every required check passing, except the `missing` ones.
fn report_json(missing: &[&str]) -> String {
    let mut fields = vec![format!("\"mac_address\":\"{}\"", MAC)];
    for key in REQUIRED_CHECKS.iter().skip(1) {
        if !missing.contains(key) {
            fields.push(format!("\"{}\":true", key));
        }
    }
    format!("{{{}}}", fields.join(","))
}

/// The console output of the diagnostic firmware, in several reads.
fn session(report: &str) -> Vec<Vec<u8>> {
    vec![
        b"ets Jun  8 2016 00:22:57\r\nrst:0x1 (POWERON_RESET)\r\n".to_vec(),
        b"I (29) boot: ESP-IDF v4.4\r\nI (512) test: running self-tests\r\n".to_vec(),
        report.as_bytes().to_vec(),
        b"\r\nI (9000) test: done\r\n".to_vec(),
    ]
}

fn error_stages(run: &ProvisioningRun) -> Vec<Stage> {
    run.errors().iter().map(|e| e.stage).collect()
}

fn assert_absent(path: &Path) {
    assert!(!path.exists(), "{} was left on disk", path.display());
}

// ===== Scenarios =====

#[test]
fn passing_board_gets_the_final_firmware() {
    let line = Line::new();
    let run = line.provision();

    assert_eq!(run.verdict(), Some(&Verdict::Pass));
    assert!(run.errors().is_empty(), "{:?}", run.errors());
    assert_eq!(
        run.stages(),
        &[
            Stage::Erase,
            Stage::FlashFactory,
            Stage::ResetDevice,
            Stage::CaptureReport,
            Stage::Validate,
            Stage::Submit,
            Stage::Label,
            Stage::Decide,
            Stage::DecryptFinal,
            Stage::FlashFinal,
            Stage::ResetFinal,
        ][..]
    );
    assert!(run.committed());
    assert_eq!(run.report().and_then(|r| r.mac_address()), Some(MAC));
    assert_eq!(run.link(), Some(LINK));

    assert!(line.logged("write factory 460800"));
    assert!(line.logged("open /dev/ttyUSB0 115200"));
    assert!(line.logged("close"));
    assert!(line.logged(&format!("label [{}]", LINK)));
    assert!(line.logged("write final 460800"));
    assert!(line.logged("magic 0xe9"));
    assert_absent(&line.plaintext_path());
}

#[test]
fn missing_wifi_check_withholds_the_final_firmware() {
    let mut line = Line::new();
    line.reads = session(&report_json(&["wifi_passed"]));
    let run = line.provision();

    assert_eq!(
        run.verdict(),
        Some(&Verdict::Fail(vec!["wifi_passed".to_owned()]))
    );
    assert_eq!(run.failures(), &["wifi_passed".to_owned()][..]);
    assert!(!run.visited(Stage::DecryptFinal));
    assert!(!run.visited(Stage::FlashFinal));
    assert!(!run.committed());

    // The rejected board is still reported and labelled.
    assert!(line.logged(&format!("submit {}", MAC)));
    assert!(line.logged(&format!("label [{}]", LINK)));
    assert_eq!(line.count("write final"), 0);
    assert_absent(&line.plaintext_path());
}

#[test]
fn disconnect_during_capture_goes_straight_to_idle() {
    let mut line = Line::new();
    line.reads = vec![b"I (29) boot: ESP-IDF v4.4\r\n{\"nvs_passed\":tr".to_vec()];
    line.next = vec![false];
    let mut station = Station::new(line.settings(), line.collaborators());

    assert_eq!(station.run(), 0);

    let seen = line.seen.borrow();
    assert_eq!(seen.len(), 1);
    let summary = &seen[0];
    assert_eq!(summary.stages.last(), Some(&Stage::Idle));
    assert!(!summary.stages.contains(&Stage::Validate));
    assert_eq!(summary.verdict, None);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].0, Stage::CaptureReport);
    assert!(
        summary.errors[0].1.starts_with("serial transport error"),
        "{}",
        summary.errors[0].1
    );

    assert!(line.logged("close"));
    assert_eq!(line.count("submit"), 0);
    assert_eq!(line.count("label"), 0);
}

#[test]
fn brace_in_rom_noise_does_not_hide_the_report() {
    let mut line = Line::new();
    let mut reads = vec![b"\x13\x7b\x9c\xe0 garbage\r\n".to_vec()];
    reads.extend(session(&report_json(&[])));
    line.reads = reads;
    let run = line.provision();

    assert!(run.errors().is_empty(), "{:?}", run.errors());
    assert_eq!(run.verdict(), Some(&Verdict::Pass));
    assert!(run.committed());
}

#[test]
fn erase_failure_ends_the_run() {
    let mut line = Line::new();
    line.fail_erase = true;
    let run = line.provision();

    assert_eq!(run.stages(), &[Stage::Erase][..]);
    assert_eq!(error_stages(&run), vec![Stage::Erase]);
    assert_eq!(run.errors()[0].severity(), Severity::FatalToRun);
    assert!(run.aborted());
    assert_eq!(line.count("write"), 0);
    assert_eq!(line.count("open"), 0);
}

#[test]
fn factory_flash_failure_is_not_retried() {
    let mut line = Line::new();
    line.fail_factory = true;
    let run = line.provision();

    assert_eq!(run.stage(), Some(Stage::FlashFactory));
    assert_eq!(error_stages(&run), vec![Stage::FlashFactory]);
    assert_eq!(line.count("write factory"), 1);
    assert_eq!(line.count("open"), 0);
    assert_eq!(line.count("submit"), 0);
}

#[test]
fn malformed_report_ends_the_run_before_submission() {
    let mut line = Line::new();
    line.reads = session("{\"nvs_passed\": yes}");
    let run = line.provision();

    assert_eq!(error_stages(&run), vec![Stage::CaptureReport]);
    match &run.errors()[0].error {
        ProvisionError::MalformedReport(_) => {}
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(run.verdict().is_none());
    assert!(line.logged("close"));
    assert_eq!(line.count("submit"), 0);
}

#[test]
fn submission_failure_still_prints_the_label() {
    let mut line = Line::new();
    line.fail_submit = true;
    let run = line.provision();

    assert_eq!(error_stages(&run), vec![Stage::Submit]);
    assert_eq!(run.errors()[0].severity(), Severity::Recoverable);
    assert_eq!(run.link(), None);
    assert!(line.logged("label []"));
    // The verdict still decides the commit.
    assert!(run.committed());
}

#[test]
fn label_failure_keeps_the_submission_result() {
    let mut line = Line::new();
    line.fail_label = true;
    let run = line.provision();

    assert_eq!(error_stages(&run), vec![Stage::Label]);
    assert_eq!(run.link(), Some(LINK));
    assert!(line.logged(&format!("submit {}", MAC)));
    assert!(run.committed());
}

#[test]
fn final_flash_falls_back_once_then_succeeds() {
    let mut line = Line::new();
    line.final_failures = 1;
    let run = line.provision();

    assert!(run.errors().is_empty(), "{:?}", run.errors());
    assert!(run.committed());
    let writes: Vec<String> = line
        .journal
        .borrow()
        .iter()
        .filter(|e| e.starts_with("write final"))
        .cloned()
        .collect();
    assert_eq!(writes, vec!["write final 460800", "write final 115200"]);
    assert_absent(&line.plaintext_path());
}

#[test]
fn final_flash_failure_aborts_only_the_commit() {
    let mut line = Line::new();
    line.final_failures = 5;
    let run = line.provision();

    assert_eq!(line.count("write final"), 2);
    assert_eq!(error_stages(&run), vec![Stage::FlashFinal]);
    assert_eq!(run.errors()[0].severity(), Severity::CommitAborted);
    assert!(!run.aborted());
    assert!(!run.committed());
    assert!(!run.visited(Stage::ResetFinal));
    assert_eq!(run.verdict(), Some(&Verdict::Pass));
    assert_absent(&line.plaintext_path());
}

#[test]
fn image_without_magic_is_never_flashed() {
    let line = Line::new();
    fs::write(
        line.dir.path().join("final.bin.enc"),
        encrypt(&plaintext(0x00)),
    )
    .unwrap();
    let run = line.provision();

    assert_eq!(error_stages(&run), vec![Stage::DecryptFinal]);
    match &run.errors()[0].error {
        ProvisionError::InvalidImageMagic { offset, .. } => assert_eq!(*offset, 0x1000),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(line.count("write final"), 0);
    assert_absent(&line.plaintext_path());
}

#[test]
fn unaligned_image_is_never_decrypted() {
    let line = Line::new();
    fs::write(line.dir.path().join("final.bin.enc"), vec![0u8; 1000]).unwrap();
    let run = line.provision();

    match &run.errors()[0].error {
        ProvisionError::InvalidCiphertextSize(n) => assert_eq!(*n, 1000),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(line.count("write final"), 0);
    assert_absent(&line.plaintext_path());
}

#[test]
fn stale_plaintext_is_removed_before_decryption() {
    let line = Line::new();
    fs::create_dir_all(line.work_dir()).unwrap();
    fs::write(line.plaintext_path(), plaintext(0xE9)).unwrap();
    let mut settings = line.settings();
    settings.final_image.key = None;
    let run = line.provision_with(&settings);

    assert_eq!(error_stages(&run), vec![Stage::DecryptFinal]);
    assert_absent(&line.plaintext_path());
}

#[test]
fn missing_key_aborts_the_commit() {
    let line = Line::new();
    let mut settings = line.settings();
    settings.final_image.key = None;
    let run = line.provision_with(&settings);

    assert_eq!(error_stages(&run), vec![Stage::DecryptFinal]);
    assert!(!run.committed());
    assert_eq!(line.count("write final"), 0);
}

// ===== Station loop =====

#[test]
fn every_device_starts_from_a_clean_run() {
    let mut line = Line::new();
    line.next = vec![true, false];
    let mut station = Station::new(line.settings(), line.collaborators());

    assert_eq!(station.run(), 0);
    assert_eq!(station.tally().committed, 2);
    assert_eq!(station.tally().devices(), 2);

    let seen = line.seen.borrow();
    assert_eq!(seen.len(), 2);
    for summary in seen.iter() {
        assert_eq!(summary.stages.first(), Some(&Stage::Erase));
        assert!(summary.errors.is_empty());
        assert!(summary.committed);
    }
    assert_eq!(line.count("next?"), 2);
    assert_eq!(line.count("erase"), 2);
}

#[test]
fn stale_plaintext_is_removed_when_the_station_starts() {
    let mut line = Line::new();
    line.reads = session(&report_json(&["rtc_passed"]));
    fs::create_dir_all(line.work_dir()).unwrap();
    fs::write(line.plaintext_path(), plaintext(0xE9)).unwrap();
    let mut station = Station::new(line.settings(), line.collaborators());

    assert_eq!(station.run(), 0);
    assert_eq!(station.tally().rejected, 1);
    assert_absent(&line.plaintext_path());
}

#[test]
fn rejected_devices_are_tallied() {
    let mut line = Line::new();
    line.reads = session(&report_json(&["buzzer_passed"]));
    let mut station = Station::new(line.settings(), line.collaborators());

    assert_eq!(station.run(), 0);
    assert_eq!(station.tally().rejected, 1);
    assert_eq!(station.tally().committed, 0);
}

#[test]
fn board_is_found_by_scanning_when_no_port_is_configured() {
    let mut line = Line::new();
    line.candidates = vec!["/dev/ttyS0".to_owned(), PORT.to_owned()];
    let mut settings = line.settings();
    settings.path = None;
    let mut station = Station::new(settings, line.collaborators());

    assert_eq!(station.run(), 0);
    assert!(line.logged("detect /dev/ttyS0"));
    assert!(line.logged("detect /dev/ttyUSB0"));
    assert_eq!(line.count("wait"), 0);
    assert_eq!(line.seen.borrow()[0].port, PORT);
}

#[test]
fn cancelled_wait_falls_back_to_scanning() {
    let mut line = Line::new();
    line.port_ready = false;
    let mut station = Station::new(line.settings(), line.collaborators());

    assert_eq!(station.run(), 0);
    assert!(line.logged("wait /dev/ttyUSB0"));
    assert!(line.logged("detect /dev/ttyUSB0"));
    assert_eq!(line.seen.borrow().len(), 1);
}

#[test]
fn no_device_prompts_the_operator_to_retry() {
    let mut line = Line::new();
    line.port_ready = false;
    line.boards = Vec::new();
    line.retry = vec![true, false];
    let mut station = Station::new(line.settings(), line.collaborators());

    assert_eq!(station.run(), 1);
    assert_eq!(line.count("retry?"), 2);
    assert_eq!(line.count("wait"), 2);
    assert_eq!(line.count("erase"), 0);
    assert!(line.seen.borrow().is_empty());
}
