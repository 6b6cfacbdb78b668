//! String primitives applied to every untrusted value before it reaches the
//! filesystem or the log.

use chrono::{Local, NaiveDateTime};

use crate::SECURITY_TARGET;

pub const MAX_FILE_NAME_LEN: usize = 200;
pub const MAX_PATH_COMPONENT_LEN: usize = 200;
pub const MAX_PATH_LEN: usize = 260;

const ILLEGAL_FILE_NAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];
const ILLEGAL_PATH_CHARS: &[char] = &['*', '?', '"', '<', '>', '|'];

fn truncate_chars(s: &str, max_len: usize) -> &str {
    match s.char_indices().nth(max_len) {
        Some((pos, _)) => &s[..pos],
        None => s,
    }
}

/// Delete NUL, turn tab/CR/LF into spaces, trim and cap at `max_len` characters.
pub fn sanitize_text(s: &str, max_len: usize) -> String {
    let cleaned: String = s
        .chars()
        .filter(|&c| c != '\0')
        .map(|c| match c {
            '\t' | '\r' | '\n' => ' ',
            c => c,
        })
        .collect();
    truncate_chars(cleaned.trim(), max_len).to_string()
}

/// Replace reserved characters without substituting a name for blank input.
pub(crate) fn replace_illegal_file_name_chars(s: &str) -> String {
    let replaced: String = s
        .chars()
        .map(|c| {
            if ILLEGAL_FILE_NAME_CHARS.contains(&c) || (c as u32) < 32 {
                '_'
            } else {
                c
            }
        })
        .collect();
    truncate_chars(&replaced, MAX_FILE_NAME_LEN).to_string()
}

pub fn generated_file_name(now: NaiveDateTime) -> String {
    format!("attachment_{}", now.format("%Y%m%d_%H%M%S"))
}

pub fn sanitize_file_name_component(s: &str) -> String {
    sanitize_file_name_component_at(s, Local::now().naive_local())
}

/// As [`sanitize_file_name_component`], with the clock for the generated
/// fallback name supplied by the caller.
pub fn sanitize_file_name_component_at(s: &str, now: NaiveDateTime) -> String {
    let replaced = replace_illegal_file_name_chars(s);
    if replaced.trim().is_empty() {
        generated_file_name(now)
    } else {
        replaced
    }
}

/// Clean a folder path taken from the rule file.
///
/// Anything containing `..` is refused outright and reported on the security
/// channel. An empty return value means "unusable".
pub fn sanitize_path_component(s: &str) -> String {
    if s.contains("..") {
        tracing::warn!(
            target: SECURITY_TARGET,
            input = %sanitize_text(s, MAX_PATH_LEN),
            "path traversal attempt rejected"
        );
        return String::new();
    }
    let stripped: String = s
        .chars()
        .filter(|c| *c != '\0' && !ILLEGAL_PATH_CHARS.contains(c))
        .collect();
    let stripped = stripped.trim();
    if stripped.chars().count() > MAX_PATH_COMPONENT_LEN {
        tracing::warn!(
            len = stripped.chars().count(),
            max = MAX_PATH_COMPONENT_LEN,
            "path rejected: too long"
        );
        return String::new();
    }
    stripped.to_string()
}

pub fn is_valid_file_name_syntax(s: &str) -> bool {
    let len = s.chars().count();
    (1..=MAX_FILE_NAME_LEN).contains(&len)
        && !s
            .chars()
            .any(|c| ILLEGAL_FILE_NAME_CHARS.contains(&c) || (c as u32) < 32)
}

pub fn is_valid_path_syntax(s: &str) -> bool {
    let len = s.chars().count();
    (1..=MAX_PATH_LEN).contains(&len) && !s.contains("..")
}

/// `/x`, `\x`, `C:\x` or `C:/x`. Checked on the text alone, independent of
/// the host.
pub fn is_absolute_path_syntax(s: &str) -> bool {
    let mut chars = s.chars();
    match (chars.next(), chars.next(), chars.next()) {
        (Some('/' | '\\'), _, _) => true,
        (Some(drive), Some(':'), Some('/' | '\\')) => drive.is_ascii_alphabetic(),
        _ => false,
    }
}

#[cfg(test)]
fn fixed_now() -> NaiveDateTime {
    chrono::NaiveDate::from_ymd_opt(2025, 9, 6)
        .and_then(|d| d.and_hms_opt(14, 3, 9))
        .unwrap()
}

#[test]
fn test_sanitize_text() {
    assert_eq!(sanitize_text("  a\tb\r\nc\0d  ", 100), "a b  cd");
    assert_eq!(sanitize_text("abcdef", 3), "abc");
    assert_eq!(sanitize_text("äöüß", 2), "äö");
    assert_eq!(sanitize_text("\0\0", 10), "");
}

#[test]
fn test_sanitize_file_name_component() {
    let now = fixed_now();
    assert_eq!(
        sanitize_file_name_component_at(r#"a\b/c:d*e?f"g<h>i|j"#, now),
        "a_b_c_d_e_f_g_h_i_j"
    );
    assert_eq!(sanitize_file_name_component_at("x\u{1}y.pdf", now), "x_y.pdf");
    assert_eq!(
        sanitize_file_name_component_at("   ", now),
        "attachment_20250906_140309"
    );
    assert_eq!(
        sanitize_file_name_component_at(&"n".repeat(250), now)
            .chars()
            .count(),
        MAX_FILE_NAME_LEN
    );
}

#[test]
fn test_sanitize_file_name_component_idempotent() {
    let now = fixed_now();
    let long = "z".repeat(300);
    for input in [
        "report.pdf",
        "../../etc/passwd",
        "C:\\temp\\x?.txt",
        "",
        " \t ",
        "a\u{0}b\u{1f}c",
        "ümlaut  name .xlsx",
        long.as_str(),
    ] {
        let once = sanitize_file_name_component_at(input, now);
        let twice = sanitize_file_name_component_at(&once, now);
        assert_eq!(once, twice, "input {input:?}");
    }
}

#[test]
fn test_sanitize_path_component() {
    assert_eq!(sanitize_path_component(r"C:\..\secret\"), "");
    assert_eq!(sanitize_path_component("/srv/../etc"), "");
    assert_eq!(sanitize_path_component("..."), "");
    assert_eq!(
        sanitize_path_component(r#"C:\Reports\Sa*l?e"s<>|\"#),
        r"C:\Reports\Sales\"
    );
    assert_eq!(sanitize_path_component(" /srv/in\0box "), "/srv/inbox");
    assert_eq!(sanitize_path_component(&format!("/{}", "d".repeat(200))), "");
}

#[test]
fn test_is_valid_file_name_syntax() {
    assert!(is_valid_file_name_syntax("daily_20250906.xlsx"));
    assert!(!is_valid_file_name_syntax(""));
    assert!(!is_valid_file_name_syntax("a/b"));
    assert!(!is_valid_file_name_syntax("a:b"));
    assert!(!is_valid_file_name_syntax("a\nb"));
    assert!(!is_valid_file_name_syntax(&"x".repeat(201)));
}

#[test]
fn test_is_valid_path_syntax() {
    assert!(is_valid_path_syntax(r"C:\Reports\Sales\daily.xlsx"));
    assert!(!is_valid_path_syntax(""));
    assert!(!is_valid_path_syntax("/srv/../etc/passwd"));
    assert!(is_valid_path_syntax(&"p".repeat(260)));
    assert!(!is_valid_path_syntax(&"p".repeat(261)));
}

#[test]
fn test_is_absolute_path_syntax() {
    assert!(is_absolute_path_syntax("/srv/reports"));
    assert!(is_absolute_path_syntax(r"\\server\share"));
    assert!(is_absolute_path_syntax(r"C:\Reports\"));
    assert!(is_absolute_path_syntax("d:/reports"));
    assert!(!is_absolute_path_syntax("reports/x"));
    assert!(!is_absolute_path_syntax("C:reports"));
    assert!(!is_absolute_path_syntax("1:/x"));
    assert!(!is_absolute_path_syntax(""));
}
