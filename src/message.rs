//! The read-only view of a message that the dispatcher works on.

use chrono::{DateTime, Local};

/// One attachment as delivered by the mail side.
#[derive(Debug, Clone)]
pub struct Attachment<'a> {
    pub display_name: String,
    pub size: u64,
    pub contents: &'a [u8],
}

impl<'a> Attachment<'a> {
    pub fn new(display_name: impl Into<String>, contents: &'a [u8]) -> Attachment<'a> {
        Attachment {
            display_name: display_name.into(),
            size: contents.len() as u64,
            contents,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IncomingMail<'a> {
    pub id: String,
    pub subject: String,
    pub received: Option<DateTime<Local>>,
    pub recipients: Vec<String>,
    pub attachments: Vec<Attachment<'a>>,
}
