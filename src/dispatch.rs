//! One message in, attachments saved twice out.
//!
//! A run walks `Init → ConfigLoaded → Validated → Matched`, then for every
//! attachment `Validating → Resolving → Writing`, and always ends in `Done`.
//! Failures before `Matched` abort the run. Failures after it only skip the
//! attachment, or with write failures only the one destination.

use crate::config::Config;
use crate::fs::Filesystem;
use crate::matcher::find_match;
use crate::message::{Attachment, IncomingMail};
use crate::path::{Clock, ResolvedPath, ensure_folder_exists, expand_placeholders, resolve};
use crate::rules::{Rule, RuleStore};
use crate::sanitize::{MAX_PATH_LEN, is_valid_file_name_syntax, is_valid_path_syntax, sanitize_text};
use crate::{DispatchError, SECURITY_TARGET};

pub const MAX_SUBJECT_LEN: usize = 255;
pub const MAX_DISPLAY_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    ConfigLoaded,
    Validated,
    Matched,
    Validating,
    Resolving,
    Writing,
    Done,
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Aborted(DispatchError),
    Completed(Report),
}

impl DispatchOutcome {
    pub fn attachment_saved(&self) -> bool {
        match self {
            DispatchOutcome::Aborted(_) => false,
            DispatchOutcome::Completed(report) => report.attachment_saved(),
        }
    }
}

#[derive(Debug)]
pub struct Report {
    pub rule: Rule,
    pub attachments: Vec<AttachmentReport>,
}

impl Report {
    /// True as soon as one copy of one attachment made it to disk.
    pub fn attachment_saved(&self) -> bool {
        self.attachments.iter().any(AttachmentReport::saved)
    }
}

#[derive(Debug)]
pub struct AttachmentReport {
    pub name: String,
    pub result: AttachmentResult,
}

#[derive(Debug)]
pub enum AttachmentResult {
    Skipped(DispatchError),
    Written {
        primary: Result<ResolvedPath, DispatchError>,
        backup: Result<ResolvedPath, DispatchError>,
    },
}

impl AttachmentReport {
    pub fn saved(&self) -> bool {
        match &self.result {
            AttachmentResult::Skipped(_) => false,
            AttachmentResult::Written { primary, backup } => primary.is_ok() || backup.is_ok(),
        }
    }
}

/// Primary and backup, each succeeding or failing on its own.
type WriteResults = (
    Result<ResolvedPath, DispatchError>,
    Result<ResolvedPath, DispatchError>,
);

pub struct DispatchEngine<'a> {
    config: &'a Config,
    fs: &'a dyn Filesystem,
    clock: &'a dyn Clock,
}

impl<'a> DispatchEngine<'a> {
    pub fn new(config: &'a Config, fs: &'a dyn Filesystem, clock: &'a dyn Clock) -> Self {
        DispatchEngine { config, fs, clock }
    }

    /// Process one message. Never fails; everything worth knowing ends up in
    /// the log and in the returned outcome.
    pub fn dispatch(&self, mail: &IncomingMail) -> DispatchOutcome {
        let span = tracing::info_span!("dispatch", id = %sanitize_text(&mail.id, 64));
        let _enter = span.enter();
        tracing::info!("=== dispatch started");
        tracing::info!(
            subject = %sanitize_text(&mail.subject, MAX_SUBJECT_LEN),
            received = %mail
                .received
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            recipients = %sanitize_text(&mail.recipients.join(";"), 1000),
            attachments = mail.attachments.len(),
            "message"
        );
        self.enter(State::Init);

        let outcome = match self.run(mail) {
            Ok(report) => DispatchOutcome::Completed(report),
            Err(DispatchError::NoMatch) => {
                tracing::info!("{}", DispatchError::NoMatch);
                DispatchOutcome::Aborted(DispatchError::NoMatch)
            }
            Err(e) => {
                tracing::error!("aborted: {e}");
                DispatchOutcome::Aborted(e)
            }
        };

        self.enter(State::Done);
        tracing::info!(
            attachment_saved = outcome.attachment_saved(),
            "=== dispatch finished"
        );
        outcome
    }

    fn enter(&self, state: State) {
        tracing::debug!(state = ?state, "state");
    }

    fn run(&self, mail: &IncomingMail) -> Result<Report, DispatchError> {
        let rules = self.load_rules()?;
        self.enter(State::ConfigLoaded);

        let subject = validate_subject(&mail.subject)?;
        self.enter(State::Validated);

        let rule = find_match(&subject, &rules).ok_or(DispatchError::NoMatch)?;
        tracing::info!(rule = %rule, "subject matched");
        self.enter(State::Matched);

        if mail.attachments.is_empty() {
            tracing::info!("no attachments to save");
        }
        let attachments = mail
            .attachments
            .iter()
            .map(|attachment| self.process_attachment(rule, attachment))
            .collect();
        Ok(Report {
            rule: rule.clone(),
            attachments,
        })
    }

    fn load_rules(&self) -> Result<RuleStore, DispatchError> {
        let base = self.config.base_dir.to_string_lossy();
        if !is_valid_path_syntax(&base) || !self.config.base_dir.is_dir() {
            let shown = sanitize_text(&base, MAX_PATH_LEN);
            tracing::warn!(
                target: SECURITY_TARGET,
                path = %shown,
                "base directory failed path resolution"
            );
            return Err(DispatchError::BaseDirUnreadable(shown));
        }
        let rules = RuleStore::load(&self.config.rules_file)?;
        tracing::info!(rules = rules.len(), "configuration loaded");
        Ok(rules)
    }

    fn process_attachment(&self, rule: &Rule, attachment: &Attachment) -> AttachmentReport {
        let name = sanitize_text(&attachment.display_name, MAX_DISPLAY_NAME_LEN);
        let result = match self.save_attachment(rule, attachment, &name) {
            Ok((primary, backup)) => AttachmentResult::Written { primary, backup },
            Err(e) => {
                tracing::warn!(attachment = %name, "skipped: {e}");
                AttachmentResult::Skipped(e)
            }
        };
        AttachmentReport { name, result }
    }

    fn save_attachment(
        &self,
        rule: &Rule,
        attachment: &Attachment,
        name: &str,
    ) -> Result<WriteResults, DispatchError> {
        self.enter(State::Validating);
        validate_attachment(attachment, self.config.max_attachment_size)?;

        self.enter(State::Resolving);
        let file_name = expand_placeholders(&rule.file_name_template, name, self.clock.now());
        if !is_valid_file_name_syntax(&file_name) {
            return Err(DispatchError::InvalidFileName(file_name));
        }
        for folder in [&rule.destination_folder, &rule.backup_folder] {
            if !ensure_folder_exists(self.fs, folder) {
                return Err(DispatchError::FolderCreateFailed(folder.clone()));
            }
        }
        let primary = resolve(&rule.destination_folder, &file_name)?;
        let backup = resolve(&rule.backup_folder, &file_name)?;

        self.enter(State::Writing);
        let primary = self.write("primary", primary, attachment.contents);
        let backup = self.write("backup", backup, attachment.contents);
        Ok((primary, backup))
    }

    fn write(
        &self,
        destination: &str,
        path: ResolvedPath,
        contents: &[u8],
    ) -> Result<ResolvedPath, DispatchError> {
        let shown = sanitize_text(path.as_str(), MAX_PATH_LEN);
        match self.fs.write_bytes(path.as_str(), contents) {
            Ok(()) => {
                tracing::info!(destination, path = %shown, bytes = contents.len(), "saved");
                Ok(path)
            }
            Err(source) => {
                tracing::error!(destination, path = %shown, "write failed: {source}");
                Err(DispatchError::WriteFailed {
                    path: path.to_string(),
                    source,
                })
            }
        }
    }
}

pub fn validate_subject(subject: &str) -> Result<String, DispatchError> {
    let subject = sanitize_text(subject, MAX_SUBJECT_LEN);
    if subject.is_empty() {
        return Err(DispatchError::InvalidSubject("empty subject".into()));
    }
    Ok(subject)
}

pub fn validate_attachment(attachment: &Attachment, max_size: u64) -> Result<(), DispatchError> {
    let raw = &attachment.display_name;
    let invalid = |reason: String| DispatchError::InvalidAttachment {
        name: sanitize_text(raw, MAX_DISPLAY_NAME_LEN),
        reason,
    };
    let len = raw.chars().count();
    if !(1..=MAX_DISPLAY_NAME_LEN).contains(&len) {
        return Err(invalid(format!("name length {len} not in 1..={MAX_DISPLAY_NAME_LEN}")));
    }
    if attachment.size > max_size {
        return Err(invalid(format!(
            "size {} exceeds limit {max_size}",
            attachment.size
        )));
    }
    if raw.contains("../") || raw.contains("..\\") || raw.starts_with(['/', '\\']) {
        // Not fatal: the name is sanitized before use. Recorded for the audit trail.
        tracing::warn!(
            target: SECURITY_TARGET,
            "{}",
            DispatchError::SecurityViolation(format!(
                "attachment name {:?} contains path elements",
                sanitize_text(raw, MAX_DISPLAY_NAME_LEN)
            ))
        );
    }
    Ok(())
}

#[test]
fn test_validate_subject() {
    assert_eq!(validate_subject("  Daily\r\nReport ").unwrap(), "Daily  Report");
    assert!(matches!(
        validate_subject(" \t\0 "),
        Err(DispatchError::InvalidSubject(_))
    ));
}

#[test]
fn test_validate_attachment() {
    let data = [0u8; 16];
    validate_attachment(&Attachment::new("a.pdf", &data), 16).unwrap();
    assert!(matches!(
        validate_attachment(&Attachment::new("a.pdf", &data), 15),
        Err(DispatchError::InvalidAttachment { .. })
    ));
    assert!(matches!(
        validate_attachment(&Attachment::new("", &data), 16),
        Err(DispatchError::InvalidAttachment { .. })
    ));
    assert!(matches!(
        validate_attachment(&Attachment::new("n".repeat(256), &data), 16),
        Err(DispatchError::InvalidAttachment { .. })
    ));
    validate_attachment(&Attachment::new("../../x.pdf", &data), 16).unwrap();
}
