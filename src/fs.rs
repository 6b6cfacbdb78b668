use std::io;
use std::path::Path;

/// The three filesystem primitives a dispatch needs.
///
/// Paths are passed as the validated strings the resolver produced, never
/// re-derived.
pub trait Filesystem {
    fn exists(&self, path: &str) -> bool;
    fn create_directory(&self, path: &str) -> io::Result<()>;
    fn write_bytes(&self, path: &str, contents: &[u8]) -> io::Result<()>;
}

/// Folders from the rule file may use another host's syntax (`C:\x` on Unix).
/// Those must not turn into paths below the working directory.
fn require_absolute(path: &str) -> io::Result<()> {
    if Path::new(path).is_absolute() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{path}: not an absolute path on this host"),
        ))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFilesystem;

impl Filesystem for LocalFilesystem {
    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn create_directory(&self, path: &str) -> io::Result<()> {
        require_absolute(path)?;
        match std::fs::create_dir(path) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && Path::new(path).is_dir() => {
                Ok(())
            }
            r => r,
        }
    }

    fn write_bytes(&self, path: &str, contents: &[u8]) -> io::Result<()> {
        require_absolute(path)?;
        std::fs::write(path, contents)
    }
}

#[test]
fn test_local_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let fs = LocalFilesystem;
    let sub = dir.path().join("sub");
    let sub = sub.to_str().unwrap();
    assert!(!fs.exists(sub));
    fs.create_directory(sub).unwrap();
    fs.create_directory(sub).unwrap();
    assert!(fs.exists(sub));
    let file = format!("{sub}/f.bin");
    fs.write_bytes(&file, b"abc").unwrap();
    assert_eq!(std::fs::read(&file).unwrap(), b"abc");
    fs.create_directory(&file).unwrap_err();
}

#[cfg(unix)]
#[test]
fn test_local_filesystem_refuses_relative_paths() {
    let fs = LocalFilesystem;
    assert_eq!(
        fs.create_directory(r"C:\Reports").unwrap_err().kind(),
        io::ErrorKind::InvalidInput
    );
    fs.create_directory("reports").unwrap_err();
    fs.write_bytes("reports/x.pdf", b"x").unwrap_err();
    assert!(!Path::new(r"C:\Reports").exists());
}
