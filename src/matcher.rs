use crate::rules::{MatchType, Rule, RuleStore};

/// Does `rule` accept `subject`? Both sides are compared upper-cased.
pub fn is_match(subject: &str, rule: &Rule) -> bool {
    if subject.is_empty() || rule.subject_pattern.is_empty() {
        return false;
    }
    let subject = subject.to_uppercase();
    let pattern = rule.subject_pattern.to_uppercase();
    match &rule.match_type {
        MatchType::Exact => subject == pattern,
        MatchType::Contains => subject.contains(&pattern),
        MatchType::StartsWith => subject.starts_with(&pattern),
        MatchType::EndsWith => subject.ends_with(&pattern),
        MatchType::Unknown(_) => false,
    }
}

/// First rule in store order that accepts `subject`.
///
/// Rule order is the only priority: a later, more specific rule never wins
/// over an earlier one.
pub fn find_match<'a>(subject: &str, rules: &'a RuleStore) -> Option<&'a Rule> {
    rules.rules().iter().find(|rule| is_match(subject, rule))
}

#[cfg(test)]
fn rule(pattern: &str, match_type: &str, folder: &str) -> Rule {
    Rule {
        subject_pattern: pattern.to_string(),
        match_type: MatchType::from_token(match_type),
        destination_folder: folder.to_string(),
        backup_folder: format!("{folder}backup/"),
        file_name_template: String::new(),
    }
}

#[test]
fn test_exact() {
    let r = rule("daily report", "EXACT", "/a/");
    assert!(is_match("Daily Report", &r));
    assert!(!is_match("Daily Report X", &r));
    assert!(!is_match("Daily", &r));
}

#[test]
fn test_contains() {
    let r = rule("invoice", "CONTAINS", "/a/");
    assert!(is_match("Your INVOICE for May", &r));
    assert!(is_match("invoice", &r));
    assert!(!is_match("invoic", &r));
}

#[test]
fn test_starts_and_ends_with() {
    assert!(is_match("RE: hello", &rule("re:", "STARTS_WITH", "/a/")));
    assert!(!is_match("FW: RE: hello", &rule("re:", "STARTS_WITH", "/a/")));
    assert!(!is_match("re", &rule("re:", "STARTS_WITH", "/a/")));
    assert!(is_match("Report Q3 [final]", &rule("[FINAL]", "ENDS_WITH", "/a/")));
    assert!(!is_match("[final] Report", &rule("[FINAL]", "ENDS_WITH", "/a/")));
}

#[test]
fn test_unknown_and_empty_never_match() {
    assert!(!is_match("anything", &rule("anything", "REGEX", "/a/")));
    assert!(!is_match("anything", &rule("anything", "", "/a/")));
    assert!(!is_match("", &rule("x", "CONTAINS", "/a/")));
    assert!(!is_match("x", &rule("", "CONTAINS", "/a/")));
}

#[test]
fn test_first_match_wins() {
    let store = RuleStore::new(vec![
        rule("weekly", "EXACT", "/first/"),
        rule("sales", "CONTAINS", "/second/"),
        rule("daily sales report", "EXACT", "/third/"),
        rule("daily", "STARTS_WITH", "/fourth/"),
    ]);
    let hit = find_match("Daily Sales Report", &store).unwrap();
    assert_eq!(hit.destination_folder, "/second/");
    let hit = find_match("Daily figures", &store).unwrap();
    assert_eq!(hit.destination_folder, "/fourth/");
    assert!(find_match("Monthly", &store).is_none());
}
