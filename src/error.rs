//! Failure kinds of a dispatch run.

/// Everything that can go wrong while dispatching one message.
///
/// The first group aborts the whole run; see [`DispatchError::is_fatal`].
/// The rest only cost the affected attachment or destination.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("base directory unusable: {0}")]
    BaseDirUnreadable(String),

    #[error("configuration file unreadable: {path}: {reason}")]
    ConfigUnreadable { path: String, reason: String },

    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    #[error("No matching subject configuration found.")]
    NoMatch,

    #[error("invalid attachment {name:?}: {reason}")]
    InvalidAttachment { name: String, reason: String },

    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    #[error("could not create folder {0:?}")]
    FolderCreateFailed(String),

    #[error("write to {path:?} failed: {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("security violation: {0}")]
    SecurityViolation(String),
}

impl DispatchError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DispatchError::BaseDirUnreadable(_)
                | DispatchError::ConfigUnreadable { .. }
                | DispatchError::InvalidSubject(_)
                | DispatchError::NoMatch
        )
    }

    pub(crate) fn config_unreadable(path: &str, reason: impl ToString) -> Self {
        DispatchError::ConfigUnreadable {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[test]
fn test_fatal_kinds() {
    assert!(DispatchError::NoMatch.is_fatal());
    assert!(DispatchError::InvalidSubject("empty".into()).is_fatal());
    assert!(DispatchError::config_unreadable("/x", "missing").is_fatal());
    assert!(!DispatchError::InvalidPath("/a/../b".into()).is_fatal());
    assert!(!DispatchError::FolderCreateFailed("/a".into()).is_fatal());
    assert_eq!(
        DispatchError::NoMatch.to_string(),
        "No matching subject configuration found."
    );
}
