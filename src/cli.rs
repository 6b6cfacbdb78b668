use crate::config::resolve_base_dir;
use crate::daemon::daemon;
use crate::dispatch::{AttachmentResult, DispatchOutcome};
use crate::matcher::find_match;
use crate::{
    Config, DispatchError, MailInfo, MailInfoStorage, RuleStore, logging, process_mail,
};
use clap::Parser;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

fn cmd_process(
    config: &Config,
    filename: &Path,
    sender: String,
    recipients: Vec<String>,
) -> Result<(), Box<dyn Error>> {
    let storage = MailInfoStorage {
        sender,
        recipients,
        mail_buffer: fs::read(filename)?,
        id: filename
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string()),
        ..Default::default()
    };
    match process_mail(config, &storage) {
        None => println!("not saved: processing lock unavailable"),
        Some(DispatchOutcome::Aborted(e)) => println!("not saved: {e}"),
        Some(DispatchOutcome::Completed(report)) => {
            for attachment in &report.attachments {
                match &attachment.result {
                    AttachmentResult::Skipped(e) => {
                        println!("{}: skipped: {e}", attachment.name)
                    }
                    AttachmentResult::Written { primary, backup } => {
                        for (label, result) in [("primary", primary), ("backup", backup)] {
                            match result {
                                Ok(path) => println!("{}: {label}: {path}", attachment.name),
                                Err(e) => println!("{}: {label}: {e}", attachment.name),
                            }
                        }
                    }
                }
            }
            println!("attachment saved: {}", report.attachment_saved());
        }
    }
    Ok(())
}

fn cmd_dump(filename: &Path) -> Result<(), Box<dyn Error>> {
    let storage = MailInfoStorage {
        mail_buffer: fs::read(filename)?,
        ..Default::default()
    };
    let mail_info = MailInfo::parse(&storage);
    let mail = mail_info.incoming();
    println!("Subject: {}", mail.subject);
    match mail.received {
        Some(received) => println!("Received: {}", received.format("%Y-%m-%d %H:%M:%S %z")),
        None => println!("Received: -"),
    }
    for recipient in &mail.recipients {
        println!("Recipient: {recipient}");
    }
    for attachment in &mail.attachments {
        println!(
            "Attachment: {:?} ({} bytes)",
            attachment.display_name, attachment.size
        );
    }
    Ok(())
}

fn cmd_rules(config: &Config) -> Result<(), Box<dyn Error>> {
    let rules = RuleStore::load(&config.rules_file)?;
    println!("{}: {} rules", config.rules_file.display(), rules.len());
    for (i, rule) in rules.rules().iter().enumerate() {
        println!("{:4} {rule}", i + 1);
    }
    Ok(())
}

fn cmd_match(config: &Config, subject: &str) -> Result<(), Box<dyn Error>> {
    let rules = RuleStore::load(&config.rules_file)?;
    let subject = crate::dispatch::validate_subject(subject)?;
    match find_match(&subject, &rules) {
        Some(rule) => println!("{rule}"),
        None => println!("{}", DispatchError::NoMatch),
    }
    Ok(())
}

#[derive(clap::Parser)]
#[command(version, about)]
struct Cli {
    /// Base directory holding Config/, Logs/ and the lock file [env: SRSAVE_BASE_DIR]
    #[arg(long)]
    base_dir: Option<PathBuf>,
    /// Rule file, if not <base-dir>/Config/subject_rules.csv
    #[arg(long)]
    rules: Option<PathBuf>,
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Dispatch one message file as if it had just arrived
    Process {
        filename: PathBuf,
        #[arg(long)]
        sender: Option<String>,
        #[arg(long, num_args = 1..)]
        recipients: Option<Vec<String>>,
    },
    /// Run as a Postfix milter
    Daemon { address: Option<String> },
    /// Show what the dispatcher sees of a message file
    Dump { filename: PathBuf },
    /// List the rules that survive loading
    Rules,
    /// Show which rule a subject would select
    Match { subject: String },
}

impl Cli {
    fn config(&self) -> Result<Config, Box<dyn Error>> {
        let base_dir = resolve_base_dir(self.base_dir.as_deref(), |key| std::env::var(key).ok())?;
        let mut builder = Config::builder().base_dir(base_dir);
        if let Some(rules) = &self.rules {
            builder = builder.rules_file(rules);
        }
        Ok(builder.build())
    }
}

pub fn xmain() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match &cli.command {
        Command::Process {
            filename,
            sender,
            recipients,
        } => {
            let config = cli.config()?;
            logging::init(&config.log_dir, cli.verbose)?;
            cmd_process(
                &config,
                filename,
                sender.clone().unwrap_or_default(),
                recipients.clone().unwrap_or_default(),
            )
        }
        Command::Daemon { address } => {
            let config = cli.config()?;
            logging::init(&config.log_dir, cli.verbose)?;
            daemon(&config, address.as_deref().unwrap_or("127.0.0.1:7045"))
        }
        Command::Dump { filename } => {
            logging::init_stderr(cli.verbose);
            cmd_dump(filename)
        }
        Command::Rules => {
            logging::init_stderr(cli.verbose);
            cmd_rules(&cli.config()?)
        }
        Command::Match { subject } => {
            logging::init_stderr(cli.verbose);
            cmd_match(&cli.config()?, subject)
        }
    }
}
