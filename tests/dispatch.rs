use srsave::dispatch::AttachmentResult;
use srsave::fs::Filesystem;
use srsave::path::{FixedClock, ensure_folder_exists};
use srsave::{Attachment, Config, DispatchEngine, DispatchError, DispatchOutcome, IncomingMail};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::{Arc, Mutex};

const RULES: &str = "\
Subject,MatchType,DestinationFolder,BackupFolder,DestinationFileName
# finance
Daily Sales Report,EXACT,C:\\Reports\\Sales\\,C:\\Backup\\Sales\\,daily_{date}.xlsx
Invoice,STARTS_WITH,C:\\Invoices\\,C:\\Backup\\Invoices\\,
";

/// Records directories and files in memory. Writes below `fail_below` and
/// folder creation below `fail_mkdir_below` fail.
#[derive(Default)]
struct MemoryFs {
    dirs: RefCell<BTreeSet<String>>,
    files: RefCell<BTreeMap<String, Vec<u8>>>,
    fail_below: Option<String>,
    fail_mkdir_below: Option<String>,
}

impl Filesystem for MemoryFs {
    fn exists(&self, path: &str) -> bool {
        self.dirs.borrow().contains(path) || self.files.borrow().contains_key(path)
    }

    fn create_directory(&self, path: &str) -> io::Result<()> {
        if let Some(prefix) = &self.fail_mkdir_below {
            if path.starts_with(prefix.as_str()) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
            }
        }
        self.dirs.borrow_mut().insert(path.to_string());
        Ok(())
    }

    fn write_bytes(&self, path: &str, contents: &[u8]) -> io::Result<()> {
        if let Some(prefix) = &self.fail_below {
            if path.starts_with(prefix.as_str()) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
            }
        }
        self.files
            .borrow_mut()
            .insert(path.to_string(), contents.to_vec());
        Ok(())
    }
}

#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn clock() -> FixedClock {
    FixedClock(
        chrono::NaiveDate::from_ymd_opt(2025, 9, 6)
            .and_then(|d| d.and_hms_opt(6, 0, 0))
            .unwrap(),
    )
}

fn setup(rules: &str) -> (tempfile::TempDir, Config) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("Config")).unwrap();
    std::fs::write(dir.path().join("Config/subject_rules.csv"), rules).unwrap();
    let config = Config::from_base_dir(dir.path());
    (dir, config)
}

fn mail<'a>(subject: &str, attachments: Vec<Attachment<'a>>) -> IncomingMail<'a> {
    IncomingMail {
        id: "4Q1Lk81xyz".to_string(),
        subject: subject.to_string(),
        recipients: vec!["sales@example.org".to_string()],
        attachments,
        ..Default::default()
    }
}

#[test]
fn test_dispatch_writes_primary_and_backup() {
    let (_dir, config) = setup(RULES);
    let fs = MemoryFs::default();
    let clock = clock();
    let engine = DispatchEngine::new(&config, &fs, &clock);

    let outcome = engine.dispatch(&mail(
        "Daily Sales Report",
        vec![Attachment::new("x.xlsx", b"figures")],
    ));

    assert!(outcome.attachment_saved());
    let files = fs.files.borrow();
    assert_eq!(
        files.keys().collect::<Vec<_>>(),
        [
            r"C:\Backup\Sales\daily_20250906.xlsx",
            r"C:\Reports\Sales\daily_20250906.xlsx"
        ]
    );
    assert!(files.values().all(|v| v == b"figures"));
    assert!(fs.dirs.borrow().contains(r"C:\Reports\Sales"));
    assert!(fs.dirs.borrow().contains(r"C:\Backup\Sales"));
}

#[test]
fn test_dispatch_blank_template_keeps_attachment_name() {
    let (_dir, config) = setup(RULES);
    let fs = MemoryFs::default();
    let clock = clock();
    let engine = DispatchEngine::new(&config, &fs, &clock);

    let outcome = engine.dispatch(&mail(
        "invoice 2025-117",
        vec![Attachment::new("INV 117.pdf", b"%PDF")],
    ));

    assert!(outcome.attachment_saved());
    assert!(fs.files.borrow().contains_key(r"C:\Invoices\INV 117.pdf"));
    assert!(fs.files.borrow().contains_key(r"C:\Backup\Invoices\INV 117.pdf"));
}

#[test]
fn test_dispatch_no_match() {
    let (_dir, config) = setup(RULES);
    let fs = MemoryFs::default();
    let clock = clock();
    let engine = DispatchEngine::new(&config, &fs, &clock);

    let outcome = engine.dispatch(&mail(
        "Weekly Sales Report",
        vec![Attachment::new("x.xlsx", b"figures")],
    ));

    assert!(matches!(
        outcome,
        DispatchOutcome::Aborted(DispatchError::NoMatch)
    ));
    assert!(!outcome.attachment_saved());
    assert!(fs.files.borrow().is_empty());
    assert!(fs.dirs.borrow().is_empty());
}

#[test]
fn test_dispatch_no_match_is_logged() {
    let (_dir, config) = setup(RULES);
    let fs = MemoryFs::default();
    let clock = clock();
    let engine = DispatchEngine::new(&config, &fs, &clock);
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        engine.dispatch(&mail("Weekly Sales Report", vec![]));
    });

    let log = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
    assert!(log.contains("=== dispatch started"), "{log}");
    assert!(log.contains("No matching subject configuration found."), "{log}");
    assert!(log.contains("dispatch{id=4Q1Lk81xyz}"), "{log}");
    assert!(log.contains("attachment_saved=false"), "{log}");
}

#[test]
fn test_dispatch_backup_failure_still_saved() {
    let (_dir, config) = setup(RULES);
    let fs = MemoryFs {
        fail_below: Some(r"C:\Backup".to_string()),
        ..Default::default()
    };
    let clock = clock();
    let engine = DispatchEngine::new(&config, &fs, &clock);

    let outcome = engine.dispatch(&mail(
        "Daily Sales Report",
        vec![Attachment::new("x.xlsx", b"figures")],
    ));

    assert!(outcome.attachment_saved());
    let DispatchOutcome::Completed(report) = outcome else {
        panic!("dispatch aborted");
    };
    let AttachmentResult::Written { primary, backup } = &report.attachments[0].result else {
        panic!("attachment skipped");
    };
    assert_eq!(
        primary.as_ref().unwrap().as_str(),
        r"C:\Reports\Sales\daily_20250906.xlsx"
    );
    assert!(matches!(backup, Err(DispatchError::WriteFailed { .. })));
    assert_eq!(fs.files.borrow().len(), 1);
}

#[test]
fn test_dispatch_both_writes_fail() {
    let (_dir, config) = setup(RULES);
    let fs = MemoryFs {
        fail_below: Some("C:".to_string()),
        ..Default::default()
    };
    let clock = clock();
    let engine = DispatchEngine::new(&config, &fs, &clock);

    let outcome = engine.dispatch(&mail(
        "Daily Sales Report",
        vec![Attachment::new("x.xlsx", b"figures")],
    ));

    assert!(matches!(outcome, DispatchOutcome::Completed(_)));
    assert!(!outcome.attachment_saved());
}

#[test]
fn test_dispatch_skips_invalid_attachment() {
    let (_dir, config) = setup(RULES);
    let config = Config::builder()
        .base_dir(&config.base_dir)
        .max_attachment_size(4)
        .build();
    let fs = MemoryFs::default();
    let clock = clock();
    let engine = DispatchEngine::new(&config, &fs, &clock);

    let outcome = engine.dispatch(&mail(
        "Invoice 9",
        vec![
            Attachment::new("", b"x"),
            Attachment::new("big.pdf", b"too large"),
            Attachment::new("ok.pdf", b"fine"),
        ],
    ));

    let DispatchOutcome::Completed(report) = &outcome else {
        panic!("dispatch aborted");
    };
    let skipped: Vec<bool> = report
        .attachments
        .iter()
        .map(|a| matches!(a.result, AttachmentResult::Skipped(_)))
        .collect();
    assert_eq!(skipped, [true, true, false]);
    assert!(outcome.attachment_saved());
    assert_eq!(
        fs.files.borrow().keys().collect::<Vec<_>>(),
        [r"C:\Backup\Invoices\ok.pdf", r"C:\Invoices\ok.pdf"]
    );
}

#[test]
fn test_dispatch_traversal_in_attachment_name_is_neutralized() {
    let (_dir, config) = setup(RULES);
    let fs = MemoryFs::default();
    let clock = clock();
    let engine = DispatchEngine::new(&config, &fs, &clock);

    let outcome = engine.dispatch(&mail(
        "Invoice 10",
        vec![Attachment::new(r"..\..\Windows\evil.pdf", b"x")],
    ));

    // the separators are replaced, the remaining ".." fails the path check
    assert!(!outcome.attachment_saved());
    assert!(fs.files.borrow().is_empty());
}

#[test]
fn test_dispatch_missing_rule_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::from_base_dir(dir.path());
    let fs = MemoryFs::default();
    let clock = clock();
    let engine = DispatchEngine::new(&config, &fs, &clock);

    let outcome = engine.dispatch(&mail(
        "Daily Sales Report",
        vec![Attachment::new("x.xlsx", b"figures")],
    ));

    let DispatchOutcome::Aborted(e) = outcome else {
        panic!("dispatch should abort");
    };
    assert!(matches!(e, DispatchError::ConfigUnreadable { .. }));
    assert!(e.is_fatal());
}

#[test]
fn test_dispatch_missing_base_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::from_base_dir(dir.path().join("gone"));
    let fs = MemoryFs::default();
    let clock = clock();
    let engine = DispatchEngine::new(&config, &fs, &clock);

    let outcome = engine.dispatch(&mail("Daily Sales Report", vec![]));

    assert!(matches!(
        outcome,
        DispatchOutcome::Aborted(DispatchError::BaseDirUnreadable(_))
    ));
}

#[test]
fn test_dispatch_invalid_subject() {
    let (_dir, config) = setup(RULES);
    let fs = MemoryFs::default();
    let clock = clock();
    let engine = DispatchEngine::new(&config, &fs, &clock);

    let outcome = engine.dispatch(&mail(" \r\n ", vec![Attachment::new("x.xlsx", b"x")]));

    assert!(matches!(
        outcome,
        DispatchOutcome::Aborted(DispatchError::InvalidSubject(_))
    ));
    assert!(fs.files.borrow().is_empty());
}

#[test]
fn test_dispatch_without_attachments() {
    let (_dir, config) = setup(RULES);
    let fs = MemoryFs::default();
    let clock = clock();
    let engine = DispatchEngine::new(&config, &fs, &clock);

    let outcome = engine.dispatch(&mail("Daily Sales Report", vec![]));

    let DispatchOutcome::Completed(report) = &outcome else {
        panic!("dispatch aborted");
    };
    assert!(report.attachments.is_empty());
    assert!(!outcome.attachment_saved());
}

#[test]
fn test_dispatch_local_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let rules = format!(
        "Subject,MatchType,DestinationFolder,BackupFolder,DestinationFileName\n\
         report,CONTAINS,{0}/primary/,{0}/backup/,{{timestamp}}_r.csv\n",
        out.display()
    );
    std::fs::create_dir(dir.path().join("Config")).unwrap();
    std::fs::write(dir.path().join("Config/subject_rules.csv"), rules).unwrap();
    let config = Config::from_base_dir(dir.path());
    let clock = clock();
    let engine = DispatchEngine::new(&config, &srsave::fs::LocalFilesystem, &clock);

    let outcome = engine.dispatch(&mail("Monthly REPORT", vec![Attachment::new("r.csv", b"a,b")]));

    assert!(outcome.attachment_saved());
    for sub in ["primary", "backup"] {
        let written = out.join(sub).join("20250906_060000_r.csv");
        assert_eq!(std::fs::read(written).unwrap(), b"a,b");
    }
}

#[test]
fn test_dispatch_folder_create_failure_skips_attachments() {
    let (_dir, config) = setup(RULES);
    let fs = MemoryFs {
        fail_mkdir_below: Some(r"C:\Backup".to_string()),
        ..Default::default()
    };
    let clock = clock();
    let engine = DispatchEngine::new(&config, &fs, &clock);

    let outcome = engine.dispatch(&mail(
        "Invoice 11",
        vec![Attachment::new("a.pdf", b"a"), Attachment::new("b.pdf", b"b")],
    ));

    let DispatchOutcome::Completed(report) = &outcome else {
        panic!("dispatch aborted");
    };
    assert_eq!(report.attachments.len(), 2);
    for attachment in &report.attachments {
        assert!(matches!(
            attachment.result,
            AttachmentResult::Skipped(DispatchError::FolderCreateFailed(_))
        ));
    }
    assert!(!outcome.attachment_saved());
    assert!(fs.files.borrow().is_empty());
}

#[test]
fn test_dispatch_overlong_path_skips_only_that_attachment() {
    let folder = format!("/{}/", "d".repeat(150));
    let rules = format!(
        "Subject,MatchType,DestinationFolder,BackupFolder,DestinationFileName\n\
         Scan,STARTS_WITH,{folder},/srv/backup/,\n"
    );
    let (_dir, config) = setup(&rules);
    let fs = MemoryFs::default();
    let clock = clock();
    let engine = DispatchEngine::new(&config, &fs, &clock);
    let long_name = format!("{}.pdf", "n".repeat(120));

    let outcome = engine.dispatch(&mail(
        "Scan 0815",
        vec![
            Attachment::new(long_name.as_str(), b"long"),
            Attachment::new("ok.pdf", b"short"),
        ],
    ));

    let DispatchOutcome::Completed(report) = &outcome else {
        panic!("dispatch aborted");
    };
    assert!(matches!(
        report.attachments[0].result,
        AttachmentResult::Skipped(DispatchError::InvalidPath(_))
    ));
    assert!(report.attachments[1].saved());
    assert!(outcome.attachment_saved());
    let expected = [format!("{folder}ok.pdf"), "/srv/backup/ok.pdf".to_string()];
    assert_eq!(fs.files.borrow().keys().cloned().collect::<Vec<_>>(), expected);
}

#[test]
fn test_folder_log_lines_are_sanitized() {
    let fs = MemoryFs::default();
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        assert!(ensure_folder_exists(&fs, "/srv/in\nbox"));
    });

    let log = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
    assert!(fs.dirs.borrow().contains("/srv/in\nbox"));
    assert!(log.contains("path=/srv/in box"), "{log}");
    assert!(!log.contains("in\nbox"), "{log}");
}
