//! The subject rule table.
//!
//! The rule file is plain comma separated text:
//!
//! ```text
//! Subject,MatchType,DestinationFolder,BackupFolder,DestinationFileName
//! # comment
//! Daily Sales Report,EXACT,C:\Reports\Sales\,C:\Backup\Sales\,daily_{date}.xlsx
//! ```
//!
//! The first non-comment line is a header and is always skipped. There is no
//! quoting; a field cannot contain a comma.

use crate::DispatchError;
use crate::sanitize::{
    MAX_FILE_NAME_LEN, is_absolute_path_syntax, is_valid_path_syntax, sanitize_path_component,
    sanitize_text,
};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

pub const MAX_RULE_LINES: usize = 1000;
pub const MAX_PATTERN_LEN: usize = 255;
const MAX_MATCH_TYPE_LEN: usize = 20;
const MIN_FIELDS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchType {
    Exact,
    Contains,
    StartsWith,
    EndsWith,
    /// Anything else. Kept so it can be reported; it never matches.
    Unknown(String),
}

impl MatchType {
    pub fn from_token(token: &str) -> MatchType {
        match token.to_uppercase().as_str() {
            "EXACT" => MatchType::Exact,
            "CONTAINS" => MatchType::Contains,
            "STARTS_WITH" => MatchType::StartsWith,
            "ENDS_WITH" => MatchType::EndsWith,
            other => MatchType::Unknown(other.to_string()),
        }
    }
}

impl FromStr for MatchType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(MatchType::from_token(s))
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchType::Exact => f.write_str("EXACT"),
            MatchType::Contains => f.write_str("CONTAINS"),
            MatchType::StartsWith => f.write_str("STARTS_WITH"),
            MatchType::EndsWith => f.write_str("ENDS_WITH"),
            MatchType::Unknown(token) => f.write_str(token),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub subject_pattern: String,
    pub match_type: MatchType,
    pub destination_folder: String,
    pub backup_folder: String,
    /// May be blank, in which case the attachment keeps its own name.
    pub file_name_template: String,
}

impl Rule {
    fn from_fields(fields: &[&str]) -> Rule {
        Rule {
            subject_pattern: sanitize_text(fields[0], MAX_PATTERN_LEN),
            match_type: MatchType::from_token(&sanitize_text(fields[1], MAX_MATCH_TYPE_LEN)),
            destination_folder: sanitize_path_component(fields[2]),
            backup_folder: sanitize_path_component(fields[3]),
            file_name_template: sanitize_text(fields[4], MAX_FILE_NAME_LEN),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} -> {:?} / {:?} as {:?}",
            self.subject_pattern,
            self.match_type,
            self.destination_folder,
            self.backup_folder,
            self.file_name_template
        )
    }
}

/// Rules in file order. The order is the match priority.
#[derive(Debug, Default, Clone)]
pub struct RuleStore {
    rules: Vec<Rule>,
}

impl RuleStore {
    pub fn new(rules: Vec<Rule>) -> RuleStore {
        RuleStore { rules }
    }

    pub fn load(path: &Path) -> Result<RuleStore, DispatchError> {
        let shown = path.to_string_lossy();
        if !is_valid_path_syntax(&shown) {
            return Err(DispatchError::config_unreadable(&shown, "invalid path"));
        }
        if !path.exists() {
            return Err(DispatchError::config_unreadable(&shown, "does not exist"));
        }
        let file =
            File::open(path).map_err(|e| DispatchError::config_unreadable(&shown, e))?;
        // The file is closed when the reader drops, on error returns too.
        let store = RuleStore::from_reader(BufReader::new(file))
            .map_err(|e| DispatchError::config_unreadable(&shown, e))?;
        tracing::debug!(path = %shown, rules = store.len(), "rules loaded");
        Ok(store)
    }

    pub fn from_reader(mut reader: impl BufRead) -> std::io::Result<RuleStore> {
        let mut rules = Vec::new();
        let mut buffer = Vec::new();
        let mut header_seen = false;
        let mut data_lines = 0;
        let mut line_no = 0;

        loop {
            buffer.clear();
            if reader.read_until(b'\n', &mut buffer)? == 0 {
                break;
            }
            line_no += 1;
            let line = String::from_utf8_lossy(&buffer);
            let mut line = line.trim();
            if line_no == 1 {
                line = line.trim_start_matches('\u{feff}').trim_start();
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if !header_seen {
                header_seen = true;
                continue;
            }
            if data_lines == MAX_RULE_LINES {
                tracing::warn!(max = MAX_RULE_LINES, "rule file truncated");
                break;
            }
            data_lines += 1;

            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() < MIN_FIELDS {
                tracing::warn!(
                    line = line_no,
                    fields = fields.len(),
                    "rule dropped: too few fields"
                );
                continue;
            }
            let rule = Rule::from_fields(&fields);
            if rule.destination_folder.is_empty() || rule.backup_folder.is_empty() {
                tracing::warn!(
                    line = line_no,
                    "rule dropped: destination or backup folder unusable"
                );
                continue;
            }
            if !is_absolute_path_syntax(&rule.destination_folder)
                || !is_absolute_path_syntax(&rule.backup_folder)
            {
                tracing::warn!(line = line_no, "rule dropped: folder is not an absolute path");
                continue;
            }
            rules.push(rule);
        }
        Ok(RuleStore { rules })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[test]
fn test_match_type_parse() {
    assert_eq!("exact".parse::<MatchType>().unwrap(), MatchType::Exact);
    assert_eq!("Starts_With".parse::<MatchType>().unwrap(), MatchType::StartsWith);
    assert_eq!(
        "REGEX".parse::<MatchType>().unwrap(),
        MatchType::Unknown("REGEX".to_string())
    );
    assert_eq!("".parse::<MatchType>().unwrap(), MatchType::Unknown(String::new()));
}

#[test]
fn test_from_reader() {
    let input = b"\n# rules\nSubject,MatchType,DestinationFolder,BackupFolder,DestinationFileName\n\
        Daily,exact,/srv/a/,/srv/b/,d_{date}.xlsx,extra\n\
        \n  # indented comment\n\
        Short,CONTAINS,/srv/a/\n\
        Weekly,contains,/srv/w/,/srv/wb/,\n";
    let store = RuleStore::from_reader(&input[..]).unwrap();
    assert_eq!(store.len(), 2);
    let daily = &store.rules()[0];
    assert_eq!(daily.subject_pattern, "Daily");
    assert_eq!(daily.match_type, MatchType::Exact);
    assert_eq!(daily.destination_folder, "/srv/a/");
    assert_eq!(daily.backup_folder, "/srv/b/");
    assert_eq!(daily.file_name_template, "d_{date}.xlsx");
    assert_eq!(store.rules()[1].file_name_template, "");
}

#[test]
fn test_header_only() {
    let store = RuleStore::from_reader(&b"Daily,EXACT,/a/,/b/,x\n"[..]).unwrap();
    assert!(store.is_empty());
}

#[test]
fn test_traversal_drops_rule() {
    let input = b"h\nA,EXACT,/srv/../etc/,/srv/b/,x\nB,EXACT,/srv/a/,/srv/b/,y\n";
    let store = RuleStore::from_reader(&input[..]).unwrap();
    assert_eq!(store.len(), 1);
    assert_eq!(store.rules()[0].subject_pattern, "B");
}

#[test]
fn test_line_cap() {
    let mut input = String::from("header\n");
    for i in 0..MAX_RULE_LINES + 5 {
        input.push_str(&format!("S{i},EXACT,/a/,/b/,f\n"));
    }
    let store = RuleStore::from_reader(input.as_bytes()).unwrap();
    assert_eq!(store.len(), MAX_RULE_LINES);
    assert_eq!(store.rules().last().unwrap().subject_pattern, "S999");
}

#[test]
fn test_relative_folder_drops_rule() {
    let input = b"h\nA,EXACT,reports/a,/srv/b/,x\nB,EXACT,/srv/a/,C:backup,y\n\
        C,EXACT,C:\\Reports\\,/srv/c/,z\n";
    let store = RuleStore::from_reader(&input[..]).unwrap();
    assert_eq!(store.len(), 1);
    assert_eq!(store.rules()[0].subject_pattern, "C");
}

#[test]
fn test_byte_order_mark() {
    let input = "\u{feff}# exported\nSubject,MatchType,DestinationFolder,BackupFolder,DestinationFileName\n\
        Daily,EXACT,/srv/a/,/srv/b/,d.xlsx\n";
    let store = RuleStore::from_reader(input.as_bytes()).unwrap();
    assert_eq!(store.len(), 1);
    assert_eq!(store.rules()[0].subject_pattern, "Daily");
}
