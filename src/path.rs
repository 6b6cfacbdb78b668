//! Turning a matched rule plus an attachment name into the two paths that get
//! written.

use crate::DispatchError;
use crate::SECURITY_TARGET;
use crate::fs::Filesystem;
use crate::sanitize::{
    MAX_PATH_LEN, is_valid_path_syntax, replace_illegal_file_name_chars,
    sanitize_file_name_component_at, sanitize_text,
};
use chrono::{Local, NaiveDateTime};
use std::fmt;

const SEPARATORS: [char; 2] = ['/', '\\'];

pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

/// Build the target file name from a rule template.
///
/// `{timestamp}`, `{date}` and `{time}` are replaced literally, everything else
/// in braces is left alone. A blank template falls back to the attachment's
/// own (sanitized) name, which is not expanded.
pub fn expand_placeholders(template: &str, fallback_name: &str, now: NaiveDateTime) -> String {
    let cleaned = replace_illegal_file_name_chars(template);
    if cleaned.trim().is_empty() {
        return sanitize_file_name_component_at(fallback_name, now);
    }
    let expanded = cleaned
        .replace("{timestamp}", &now.format("%Y%m%d_%H%M%S").to_string())
        .replace("{date}", &now.format("%Y%m%d").to_string())
        .replace("{time}", &now.format("%H%M%S").to_string());
    sanitize_file_name_component_at(&expanded, now)
}

/// A folder plus file name that passed the final path check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath(String);

impl ResolvedPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResolvedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The separator style a folder already uses; `/` unless it only has `\`.
fn separator_of(folder: &str) -> char {
    if folder.contains('\\') && !folder.contains('/') {
        '\\'
    } else {
        '/'
    }
}

/// `folder` with exactly one trailing separator.
pub fn with_trailing_separator(folder: &str) -> String {
    let sep = separator_of(folder);
    let mut out = folder.trim_end_matches(SEPARATORS).to_string();
    out.push(sep);
    out
}

/// Join folder and file name and run the final syntax check on the result.
///
/// This check runs regardless of how the parts were cleaned before, so that
/// a traversal sequence assembled from harmless-looking pieces is still
/// caught.
pub fn resolve(folder: &str, file_name: &str) -> Result<ResolvedPath, DispatchError> {
    let mut joined = with_trailing_separator(folder);
    joined.push_str(file_name);
    if !is_valid_path_syntax(&joined) {
        let shown = sanitize_text(&joined, MAX_PATH_LEN);
        if joined.contains("..") {
            tracing::warn!(
                target: SECURITY_TARGET,
                path = %shown,
                "{}",
                DispatchError::SecurityViolation("traversal sequence in resolved path".into())
            );
        }
        return Err(DispatchError::InvalidPath(shown));
    }
    Ok(ResolvedPath(joined))
}

/// Create `folder` and any missing parents, top down.
///
/// Every prefix is checked before it is created. Stops at the first failure
/// and leaves whatever was already created in place.
pub fn ensure_folder_exists(fs: &dyn Filesystem, folder: &str) -> bool {
    let sep = separator_of(folder);
    let root_len = folder.len() - folder.trim_start_matches(SEPARATORS).len();
    let mut prefix = folder[..root_len].to_string();

    for segment in folder[root_len..].split(SEPARATORS).filter(|s| !s.is_empty()) {
        if !prefix.is_empty() && !prefix.ends_with(SEPARATORS) {
            prefix.push(sep);
        }
        prefix.push_str(segment);
        let shown = sanitize_text(&prefix, MAX_PATH_LEN);
        if !is_valid_path_syntax(&prefix) {
            tracing::warn!(path = %shown, "folder rejected");
            return false;
        }
        if fs.exists(&prefix) {
            continue;
        }
        if let Err(e) = fs.create_directory(&prefix) {
            tracing::warn!(path = %shown, "cannot create folder: {e}");
            return false;
        }
        tracing::info!(path = %shown, "folder created");
    }
    true
}

#[cfg(test)]
fn sept_6() -> NaiveDateTime {
    chrono::NaiveDate::from_ymd_opt(2025, 9, 6)
        .and_then(|d| d.and_hms_opt(7, 5, 3))
        .unwrap()
}

#[test]
fn test_expand_placeholders() {
    let now = sept_6();
    assert_eq!(
        expand_placeholders("report_{date}.pdf", "x.pdf", now),
        "report_20250906.pdf"
    );
    assert_eq!(
        expand_placeholders("{date}-{time}-{timestamp}-{date}", "x", now),
        "20250906-070503-20250906_070503-20250906"
    );
    assert_eq!(
        expand_placeholders("keep_{unknown}_{DATE}.txt", "x", now),
        "keep_{unknown}_{DATE}.txt"
    );
    assert_eq!(expand_placeholders("a/b:{date}", "x", now), "a_b_20250906");
}

#[test]
fn test_expand_placeholders_fallback() {
    let now = sept_6();
    assert_eq!(expand_placeholders("", "Quarterly Q3.xlsx", now), "Quarterly Q3.xlsx");
    assert_eq!(expand_placeholders("   ", "a/b?.pdf", now), "a_b_.pdf");
    assert_eq!(expand_placeholders("", "{date}.pdf", now), "{date}.pdf");
    assert_eq!(expand_placeholders("", "", now), "attachment_20250906_070503");
}

#[test]
fn test_resolve() {
    assert_eq!(
        resolve(r"C:\Reports\Sales\", "daily.xlsx").unwrap().as_str(),
        r"C:\Reports\Sales\daily.xlsx"
    );
    assert_eq!(
        resolve(r"C:\Reports\Sales", "daily.xlsx").unwrap().as_str(),
        r"C:\Reports\Sales\daily.xlsx"
    );
    assert_eq!(
        resolve("/srv/reports///", "daily.xlsx").unwrap().as_str(),
        "/srv/reports/daily.xlsx"
    );
    assert!(matches!(
        resolve("/srv/reports", "..hidden"),
        Err(DispatchError::InvalidPath(_))
    ));
    assert!(matches!(
        resolve("/srv", &"f".repeat(260)),
        Err(DispatchError::InvalidPath(_))
    ));
}

#[test]
fn test_ensure_folder_exists() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("a").join("b").join("c");
    let target = target.to_str().unwrap();
    assert!(ensure_folder_exists(&crate::fs::LocalFilesystem, target));
    assert!(std::path::Path::new(target).is_dir());
    assert!(ensure_folder_exists(&crate::fs::LocalFilesystem, target));
}

#[test]
fn test_ensure_folder_exists_stops_on_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("blocker"), b"").unwrap();
    let target = dir.path().join("blocker").join("sub");
    assert!(!ensure_folder_exists(
        &crate::fs::LocalFilesystem,
        target.to_str().unwrap()
    ));
}
