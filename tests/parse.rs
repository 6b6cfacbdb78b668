use srsave::{MailInfo, MailInfoStorage};

fn storage(path: &str) -> MailInfoStorage {
    MailInfoStorage {
        sender: "reports@example.org".to_string(),
        recipients: vec!["archive@example.org".to_string()],
        id: "test".to_string(),
        mail_buffer: std::fs::read(path).unwrap(),
        ..Default::default()
    }
}

#[test]
fn parse_001() {
    let storage = storage("tests/parse_001.eml");
    let mail_info = MailInfo::parse(&storage);
    assert_eq!(mail_info.get_sender(), "reports@example.org");
    assert_eq!(mail_info.get_id(), "test");
    assert_eq!(mail_info.get_subject(), "Daily Sales Report");
    assert_eq!(
        mail_info.get_to_addresses(),
        ["sales@example.org", "archive@example.org"]
    );
    assert_eq!(
        mail_info.get_recipients(),
        ["archive@example.org", "sales@example.org"]
    );
    assert_eq!(
        mail_info.get_received().map(|t| t.timestamp()),
        Some(1757143800)
    );

    let attachments = mail_info.get_attachments();
    assert_eq!(attachments.len(), 2);
    assert_eq!(attachments[0].display_name, "x.xlsx");
    assert_eq!(attachments[0].contents, b"hello world");
    assert_eq!(attachments[0].size, 11);
    assert_eq!(attachments[1].display_name, "../../totals.csv");
    assert_eq!(attachments[1].contents, b"a,b\n1,2\n");
}

#[test]
fn parse_001_incoming() {
    let storage = storage("tests/parse_001.eml");
    let mail_info = MailInfo::parse(&storage);
    let mail = mail_info.incoming();
    assert_eq!(mail.id, "test");
    assert_eq!(mail.subject, "Daily Sales Report");
    assert_eq!(mail.recipients.len(), 2);
    assert_eq!(mail.attachments.len(), 2);
    assert!(mail.received.is_some());
}

#[test]
fn parse_garbage() {
    let storage = MailInfoStorage {
        mail_buffer: b"\0\0\0".to_vec(),
        ..Default::default()
    };
    let mail_info = MailInfo::parse(&storage);
    assert_eq!(mail_info.get_subject(), "");
    assert!(mail_info.get_received().is_none());
    assert!(mail_info.get_attachments().is_empty());
    assert!(mail_info.get_recipients().is_empty());
}

#[test]
fn test_recipients_without_message() {
    let mut storage = MailInfoStorage::default();
    storage.recipients.push("a@example.org".to_string());
    storage.recipients.push("b@example.org".to_string());
    let mail_info = MailInfo {
        storage: &storage,
        msg: None,
    };
    assert_eq!(mail_info.get_recipients(), ["a@example.org", "b@example.org"]);
    assert!(mail_info.get_to_addresses().is_empty());
}

#[test]
fn parse_empty_and_blank() {
    for buffer in [&b""[..], &b"   "[..], &b"\r\n"[..]] {
        let storage = MailInfoStorage {
            id: "empty".to_string(),
            recipients: vec!["a@example.org".to_string()],
            mail_buffer: buffer.to_vec(),
            ..Default::default()
        };
        let mail_info = MailInfo::parse(&storage);
        let mail = mail_info.incoming();
        assert_eq!(mail.subject, "", "{buffer:?}");
        assert!(mail.received.is_none());
        assert!(mail.attachments.is_empty());
        assert_eq!(mail.recipients, ["a@example.org"]);
    }
}
