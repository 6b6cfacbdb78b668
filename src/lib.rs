pub mod cli;
pub mod config;
mod daemon;
pub mod dispatch;
pub mod error;
pub mod fs;
pub mod lock;
pub mod logging;
pub mod matcher;
pub mod message;
mod milter;
pub mod path;
pub mod rules;
pub mod sanitize;

pub use config::Config;
pub use dispatch::{DispatchEngine, DispatchOutcome, Report};
pub use error::DispatchError;
pub use message::{Attachment, IncomingMail};
pub use rules::{MatchType, Rule, RuleStore};

use crate::fs::LocalFilesystem;
use crate::lock::ProcessingLock;
use crate::path::SystemClock;
use chrono::{DateTime, Local};
use mail_parser::{HeaderName, MessageParser, MimeHeaders};
use std::collections::HashMap;

/// `tracing` target of the security event stream.
pub const SECURITY_TARGET: &str = "security";

/// Raw material of one message, as collected by the milter or read from a file.
#[derive(Default)]
pub struct MailInfoStorage {
    pub sender: String,
    pub recipients: Vec<String>,
    pub macros: HashMap<String, String>,
    pub id: String, // postfix queue ident
    pub mail_buffer: Vec<u8>,
}

pub struct MailInfo<'a> {
    pub storage: &'a MailInfoStorage,
    /// `None` if the buffer did not parse into a message with at least one part.
    pub msg: Option<mail_parser::Message<'a>>,
}

impl<'a> MailInfo<'a> {
    pub fn parse(storage: &'a MailInfoStorage) -> MailInfo<'a> {
        let msg = MessageParser::default()
            .parse(&storage.mail_buffer)
            .filter(|msg| !msg.parts.is_empty());
        if msg.is_none() {
            tracing::warn!(id = %storage.id, "message could not be parsed");
        }
        MailInfo { storage, msg }
    }

    pub fn get_subject(&self) -> &str {
        self.msg.as_ref().and_then(|m| m.subject()).unwrap_or("")
    }
    pub fn get_sender(&self) -> &str {
        &self.storage.sender
    }
    pub fn get_id(&self) -> &str {
        &self.storage.id
    }
    pub fn get_received(&self) -> Option<DateTime<Local>> {
        self.msg
            .as_ref()
            .and_then(|m| m.date())
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
            .map(|d| d.with_timezone(&Local))
    }
    pub fn get_to_addresses(&self) -> Vec<&str> {
        self.msg
            .as_ref()
            .and_then(|m| m.header(HeaderName::To))
            .and_then(|v| v.as_address())
            .and_then(|v| v.as_list())
            .map(|list| list.iter().filter_map(|a| a.address()).collect())
            .unwrap_or_default()
    }
    /// Envelope recipients followed by any `To:` address not already listed.
    pub fn get_recipients(&self) -> Vec<String> {
        let mut out = self.storage.recipients.clone();
        for address in self.get_to_addresses() {
            if !out.iter().any(|r| r.eq_ignore_ascii_case(address)) {
                out.push(address.to_string());
            }
        }
        out
    }
    pub fn get_attachments(&self) -> Vec<Attachment<'_>> {
        let Some(msg) = &self.msg else {
            return Vec::new();
        };
        msg.attachments()
            .map(|part| Attachment::new(part.attachment_name().unwrap_or(""), part.contents()))
            .collect()
    }
    pub fn incoming(&self) -> IncomingMail<'_> {
        IncomingMail {
            id: self.get_id().to_string(),
            subject: self.get_subject().to_string(),
            received: self.get_received(),
            recipients: self.get_recipients(),
            attachments: self.get_attachments(),
        }
    }
}

/// Parse and dispatch one collected message under the processing lock.
///
/// Returns `None` when the lock cannot be taken; the message is then logged
/// and left alone.
pub fn process_mail(config: &Config, storage: &MailInfoStorage) -> Option<DispatchOutcome> {
    let _lock = match ProcessingLock::acquire(&config.lock_file) {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!(id = %sanitize::sanitize_text(&storage.id, 64), "not dispatched: {e}");
            return None;
        }
    };
    let mail_info = MailInfo::parse(storage);
    let engine = DispatchEngine::new(config, &LocalFilesystem, &SystemClock);
    Some(engine.dispatch(&mail_info.incoming()))
}

#[test]
fn test_process_mail_without_lock() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::builder()
        .base_dir(dir.path())
        .lock_file(dir.path().join("missing").join(".srsave.lock"))
        .build();
    assert!(process_mail(&config, &MailInfoStorage::default()).is_none());
}

#[test]
fn test_process_mail_empty_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::from_base_dir(dir.path());
    let outcome = process_mail(&config, &MailInfoStorage::default()).unwrap();
    assert!(matches!(
        outcome,
        DispatchOutcome::Aborted(DispatchError::ConfigUnreadable { .. })
    ));
}
