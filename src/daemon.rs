use crate::milter::*;
use crate::{Config, MailInfoStorage, process_mail};
use nix::libc::c_int;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::error::Error;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::{SocketAddr, TcpStream};
#[cfg(feature = "systemd")]
use std::os::fd::FromRawFd as _;
use std::sync::atomic::{AtomicBool, Ordering};

// https://www.postfix.org/MILTER_README.html
// https://github.com/emersion/go-milter/blob/master/milter-protocol.txt

static FLAG_SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// One milter connection. Postfix may send several messages over it.
struct Session<'a> {
    config: &'a Config,
    connect_macros: HashMap<String, String>,
    storage: MailInfoStorage,
    oversized: bool,
}

impl<'a> Session<'a> {
    fn new(config: &'a Config) -> Self {
        Session {
            config,
            connect_macros: HashMap::new(),
            storage: MailInfoStorage::default(),
            oversized: false,
        }
    }

    fn reset(&mut self) {
        self.storage = MailInfoStorage::default();
        self.oversized = false;
    }

    fn append(&mut self, data: &[u8]) {
        if self.storage.mail_buffer.len() + data.len() > self.config.max_message_size {
            self.oversized = true;
        } else if !self.oversized {
            self.storage.mail_buffer.extend_from_slice(data);
        }
    }

    /// Handle one command. Returns `false` when the connection should close.
    fn handle(
        &mut self,
        cmd: u8,
        payload: &[u8],
        writer: &mut impl Write,
    ) -> Result<bool, Box<dyn Error>> {
        match cmd {
            b'O' => {
                let protocol = SMFIP_NOCONNECT
                    | SMFIP_NOHELO
                    | SMFIP_NR_HDR
                    | SMFIP_NOUNKNOWN
                    | SMFIP_NODATA
                    | SMFIP_NR_CONN
                    | SMFIP_NR_MAIL
                    | SMFIP_NR_RCPT
                    | SMFIP_NR_EOH
                    | SMFIP_NR_BODY;
                let mut reply = Vec::with_capacity(12);
                reply.extend_from_slice(&SMFIF_VERSION.to_be_bytes());
                reply.extend_from_slice(&SMFIF_NONE.to_be_bytes());
                reply.extend_from_slice(&protocol.to_be_bytes());
                write_packet(writer, b'O', &reply)?;
            }
            b'D' => {
                let Some((&for_cmd, rest)) = payload.split_first() else {
                    return Err("empty macro packet".into());
                };
                let macros = match for_cmd {
                    b'C' => &mut self.connect_macros,
                    _ => &mut self.storage.macros,
                };
                let mut strings = zstrings(rest);
                while let Some(name) = strings.next() {
                    if name.is_empty() {
                        break;
                    }
                    let value = strings.next().unwrap_or_default();
                    macros.insert(lossy(name), lossy(value));
                }
            }
            b'M' => {
                // possibly followed by more strings (ESMTP arguments)
                if let Some(sender) = zstrings(payload).next() {
                    self.storage.sender = lossy(anglestrip(sender));
                }
            }
            b'R' => {
                if let Some(rcpt) = zstrings(payload).next() {
                    self.storage.recipients.push(lossy(anglestrip(rcpt)));
                }
            }
            b'L' => {
                let mut strings = zstrings(payload);
                let name = strings.next().unwrap_or_default();
                let value = strings.next().unwrap_or_default();
                self.append(&[name, &b": "[..], value, &b"\r\n"[..]].concat());
            }
            b'N' => self.append(b"\r\n"),
            b'B' => self.append(payload),
            b'E' => {
                self.end_of_message();
                write_packet(writer, b'a', &[])?; // SMFIR_ACCEPT
                self.reset();
            }
            b'A' => self.reset(), // no reply to SMFIC_ABORT
            b'Q' => return Ok(false),
            _ => {
                return Err(format!(
                    "unimplemented milter command {:?} rest {}",
                    cmd as char,
                    String::from_utf8_lossy(payload)
                )
                .into());
            }
        }
        Ok(true)
    }

    fn end_of_message(&mut self) {
        for (key, value) in &self.connect_macros {
            self.storage
                .macros
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self.storage.id = self
            .storage
            .macros
            .get("i")
            .map(AsRef::as_ref)
            .unwrap_or("-")
            .to_string();
        if self.oversized {
            tracing::warn!(
                id = %self.storage.id,
                max = self.config.max_message_size,
                "message too large, not dispatched"
            );
            return;
        }
        process_mail(self.config, &self.storage);
    }
}

fn process_client(
    config: &Config,
    mut reader: impl BufRead,
    mut writer: impl Write,
) -> Result<(), Box<dyn Error>> {
    let mut session = Session::new(config);
    let mut buffer = Vec::with_capacity(4096);
    while let Some(cmd) = read_packet(&mut reader, &mut buffer)? {
        if !session.handle(cmd, &buffer, &mut writer)? {
            break;
        }
    }
    Ok(())
}

extern "C" fn handlerfunc(signum: c_int) {
    eprintln!("received signal {signum}");
    FLAG_SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handler() -> Result<(), Box<dyn Error>> {
    let action = SigAction::new(
        SigHandler::Handler(handlerfunc),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGTERM, &action)?;
        sigaction(Signal::SIGINT, &action)?;
    }
    Ok(())
}

fn bind(address: &str) -> Result<Socket, Box<dyn Error>> {
    let address: SocketAddr = address.parse()?;
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&address.into())?;
    socket.listen(16)?;
    Ok(socket)
}

/// Serve milter connections one at a time until SIGTERM or SIGINT.
pub fn daemon(config: &Config, address: &str) -> Result<(), Box<dyn Error>> {
    #[cfg(feature = "systemd")]
    let listen_socket = match systemd::daemon::listen_fds(false)?.iter().next() {
        Some(fd) => unsafe { Socket::from_raw_fd(fd) },
        None => bind(address)?,
    };
    #[cfg(not(feature = "systemd"))]
    let listen_socket = bind(address)?;

    install_signal_handler()?;
    tracing::info!(address, "milter listening");
    while !FLAG_SHUTDOWN.load(Ordering::Relaxed) {
        match listen_socket.accept() {
            Ok((socket, _addr)) => {
                let stream: TcpStream = socket.into();
                let reader = BufReader::new(&stream);
                let writer = BufWriter::new(&stream);
                if let Err(e) = process_client(config, reader, writer) {
                    tracing::error!("milter connection: {e}");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => (),
            Err(e) => tracing::error!("accept: {e}"),
        }
    }
    tracing::info!("milter stopped");
    Ok(())
}

#[cfg(test)]
fn milter_packets(packets: &[(u8, &str)]) -> Vec<u8> {
    let mut wire = Vec::new();
    for (cmd, payload) in packets {
        write_packet(&mut wire, *cmd, payload.as_bytes()).unwrap();
    }
    wire
}

#[test]
fn test_session_collects_message() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::from_base_dir(dir.path());
    let wire = milter_packets(&[
        (b'O', "\0\0\0\x06\0\0\0\0\0\0\0\0"),
        (b'D', "Cj\0mx.example.org\0"),
        (b'M', "<sender@example.org>\0"),
        (b'R', "<rcpt@example.org>\0"),
        (b'L', "Subject\0Hello\0"),
        (b'N', ""),
        (b'B', "body\r\n"),
    ]);
    let mut session = Session::new(&config);
    let mut reader = &wire[..];
    let mut out = Vec::new();
    let mut buffer = Vec::new();
    while let Some(cmd) = read_packet(&mut reader, &mut buffer).unwrap() {
        assert!(session.handle(cmd, &buffer, &mut out).unwrap());
    }
    assert_eq!(session.storage.sender, "sender@example.org");
    assert_eq!(session.storage.recipients, ["rcpt@example.org"]);
    assert_eq!(session.storage.mail_buffer, b"Subject: Hello\r\n\r\nbody\r\n");
    assert_eq!(session.connect_macros["j"], "mx.example.org");
    // option negotiation is the only command answered so far
    assert_eq!(&out[..5], &[0, 0, 0, 13, b'O']);
    assert_eq!(out.len(), 17);
}

#[test]
fn test_session_end_of_message_accepts() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::from_base_dir(dir.path());
    let mut session = Session::new(&config);
    let mut out = Vec::new();
    session.handle(b'D', b"Ei\0QUEUE1\0", &mut out).unwrap();
    session.handle(b'L', b"Subject\0Nothing configured\0", &mut out).unwrap();
    session.handle(b'N', b"", &mut out).unwrap();
    session.handle(b'E', b"", &mut out).unwrap();
    // No rule file: the dispatch aborts, the message is accepted anyway.
    assert_eq!(out, [0, 0, 0, 1, b'a']);
    assert!(session.storage.mail_buffer.is_empty());
    assert!(!session.handle(b'Q', b"", &mut out).unwrap());
}

#[test]
fn test_session_oversized_message() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::builder()
        .base_dir(dir.path())
        .max_message_size(8)
        .build();
    let mut session = Session::new(&config);
    let mut out = Vec::new();
    session.handle(b'B', b"0123456789", &mut out).unwrap();
    session.handle(b'B', b"0", &mut out).unwrap();
    assert!(session.oversized);
    assert!(session.storage.mail_buffer.is_empty());
    session.handle(b'X', b"", &mut out).unwrap_err();
}

#[test]
fn test_session_accepts_when_lock_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::builder()
        .base_dir(dir.path())
        .lock_file(dir.path().join("missing").join(".srsave.lock"))
        .build();
    let mut session = Session::new(&config);
    let mut out = Vec::new();
    session.handle(b'L', b"Subject\0Daily\0", &mut out).unwrap();
    assert!(session.handle(b'E', b"", &mut out).unwrap());
    assert_eq!(out, [0, 0, 0, 1, b'a']);
}

#[test]
fn test_session_accepts_empty_message() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::from_base_dir(dir.path());
    let mut session = Session::new(&config);
    let mut out = Vec::new();
    assert!(session.handle(b'E', b"", &mut out).unwrap());
    assert_eq!(out, [0, 0, 0, 1, b'a']);
}
