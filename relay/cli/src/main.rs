//! Relay - Command-line front end for the generation engine
//!
//! Sends one turn to a hosted model and prints the answer as it streams in.
//!
//! # Usage
//!
//! ```bash
//! # Ask a question (keys from RELAY_API_KEYS or the config file)
//! relay ask "What is a monad?"
//!
//! # Attach files
//! relay ask "Describe this" --file photo.png
//!
//! # Another model, no streaming
//! relay --model gemini-2.5-pro --no-stream ask "Hello"
//!
//! # Count tokens without generating
//! relay count-tokens "How long is this prompt?"
//!
//! # Verbose logging (written to stderr)
//! RUST_LOG=debug relay ask "Hello"
//! ```
//!
//! # Signals
//!
//! - `SIGINT`: Cancel the running generation

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use relay_core::backend::encode_inline;
use relay_core::config::{load_config_from_path, ConfigOverrides, RelayConfig};
use relay_core::{
    default_config_path, DispatchOutcome, Dispatcher, EngineOptions, EntryId, EntryRole, FileRef,
    FileSettingsStore, GeminiTransport, GenerationKey, JobPhase, LogNotifier,
    MemorySettingsStore, NoopNotifier, Notifier, Session, SessionId, SessionStore, SettingsStore,
    Turn,
};

/// Relay - generation client for hosted models
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Model to use
    #[arg(short = 'm', long)]
    model: Option<String>,

    /// Wait for the whole answer instead of streaming
    #[arg(long)]
    no_stream: bool,

    /// Comma-separated API keys
    #[arg(long, value_name = "KEYS")]
    keys: Option<String>,

    /// Where rotation state is kept
    #[arg(long, value_name = "PATH")]
    state_path: Option<PathBuf>,

    /// Notify when the answer is ready
    #[arg(long)]
    notify: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a prompt and print the answer
    Ask {
        /// Prompt text
        prompt: String,

        /// Files to attach
        #[arg(short = 'f', long = "file", value_name = "PATH")]
        files: Vec<PathBuf>,

        /// Print the final session as JSON
        #[arg(long)]
        json: bool,
    },
    /// Count the tokens a prompt would use
    CountTokens {
        /// Prompt text
        prompt: String,
    },
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration and apply command-line overrides
fn resolve_config(args: &Args) -> Result<RelayConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(model) = &args.model {
        overrides = overrides.with_default_model(model.clone());
    }
    if args.no_stream {
        overrides = overrides.with_stream(false);
    }
    if let Some(keys) = &args.keys {
        overrides = overrides.with_keys(keys.clone());
    }
    if let Some(path) = &args.state_path {
        overrides = overrides.with_state_path(path.clone());
    }
    overrides.apply(&mut config);
    if args.notify {
        config.notify_on_completion = true;
    }

    config.validate()?;
    info!(source = %config.source(), model = %config.default_model, "Configuration loaded");
    Ok(config)
}

/// Open persistent state, falling back to memory when no location exists
fn open_settings(config: &RelayConfig) -> Result<Arc<dyn SettingsStore>> {
    match config.state_path.clone().or_else(FileSettingsStore::default_path) {
        Some(path) => {
            let store = FileSettingsStore::open(&path)
                .with_context(|| format!("Failed to open state file: {}", path.display()))?;
            debug!(path = %path.display(), "State file opened");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No state directory available, rotation will not persist");
            Ok(Arc::new(MemorySettingsStore::new()))
        }
    }
}

/// Notifier matching the resolved configuration
fn notifier_for(config: &RelayConfig) -> Arc<dyn Notifier> {
    if config.notify_on_completion {
        Arc::new(LogNotifier)
    } else {
        Arc::new(NoopNotifier)
    }
}

fn build_dispatcher(config: &RelayConfig) -> Result<Dispatcher<GeminiTransport>> {
    let transport = GeminiTransport::new(&config.base_url, config.connect_timeout)?;
    let notifier = notifier_for(config);

    Ok(Dispatcher::new(
        transport,
        Arc::new(SessionStore::new()),
        open_settings(config)?,
        notifier,
        config.keys.clone(),
        EngineOptions::from_config(config),
    ))
}

/// MIME type from a file extension
fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" | "md" => "text/plain",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Read a file into an inline attachment
fn read_attachment(path: &Path) -> Result<FileRef> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    Ok(FileRef::inline(
        name,
        mime_type_for(path),
        encode_inline(&bytes),
        bytes.len() as u64,
    ))
}

/// Prints a job's entries as they grow
///
/// Store notifications coalesce, so several entries may appear between two
/// wake-ups. Progress is tracked per entry ID; indices shift when empty
/// entries are removed at the end of a job.
#[derive(Default)]
struct Printer {
    printed: HashMap<EntryId, usize>,
    wrote_any: bool,
}

impl Printer {
    fn update(&mut self, session: &Session, key: GenerationKey, out: &mut impl Write) -> std::io::Result<()> {
        for idx in session.indices_for(key) {
            let entry = &session.entries[idx];
            if entry.role == EntryRole::Error {
                continue;
            }
            let done = self.printed.get(&entry.id).copied().unwrap_or(0);
            let Some(delta) = entry.content.get(done..) else {
                continue;
            };
            if delta.is_empty() {
                continue;
            }
            if done == 0 && self.wrote_any {
                writeln!(out)?;
            }
            write!(out, "{delta}")?;
            self.wrote_any = true;
            self.printed.insert(entry.id.clone(), entry.content.len());
        }
        out.flush()
    }
}

/// Print whatever the job added since the last call
fn print_progress(printer: &mut Printer, store: &SessionStore, session_id: &SessionId, key: GenerationKey) {
    let Some(session) = store.get(session_id) else {
        return;
    };
    if let Err(e) = printer.update(&session, key, &mut std::io::stdout().lock()) {
        warn!(error = %e, "Failed to write output");
    }
}

async fn ask(dispatcher: Dispatcher<GeminiTransport>, prompt: String, files: &[PathBuf], json: bool) -> Result<()> {
    let mut turn = Turn::new(prompt);
    for path in files {
        turn = turn.with_file(read_attachment(path)?);
    }

    let handle = match dispatcher.dispatch(turn, None)? {
        DispatchOutcome::Started(handle) => handle,
        DispatchOutcome::KeysMissing { .. } => {
            bail!("{}", dispatcher.options().messages.keys_not_configured)
        }
    };
    let session_id = handle.session_id.clone();
    let key = handle.generation_start;

    let mut updates = dispatcher.store().subscribe();
    let mut printer = Printer::default();
    let wait = handle.wait();
    tokio::pin!(wait);

    let phase = loop {
        tokio::select! {
            phase = &mut wait => break phase,
            changed = updates.changed() => {
                if changed.is_ok() {
                    print_progress(&mut printer, dispatcher.store(), &session_id, key);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(session_id = %session_id, "Interrupted, cancelling");
                dispatcher.cancel(&session_id);
            }
        }
    };
    print_progress(&mut printer, dispatcher.store(), &session_id, key);
    println!();

    let session = dispatcher
        .store()
        .get(&session_id)
        .context("Session disappeared")?;
    if json {
        println!("{}", serde_json::to_string_pretty(session.as_ref())?);
    }

    let errors: Vec<&str> = session
        .entries
        .iter()
        .filter(|e| e.belongs_to(key) && e.role == EntryRole::Error)
        .map(|e| e.content.as_str())
        .collect();
    match phase {
        JobPhase::Completed if errors.is_empty() => {
            if let Some(total) = session
                .last_index_for(key)
                .and_then(|i| session.entries[i].cumulative_total_tokens)
            {
                debug!(total_tokens = total, "Generation finished");
            }
            Ok(())
        }
        JobPhase::Cancelled => bail!("Cancelled"),
        _ => bail!("{}", errors.join("\n")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);
    debug!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = resolve_config(&args)?;
    let dispatcher = build_dispatcher(&config)?;

    match args.command {
        Command::Ask { prompt, files, json } => ask(dispatcher, prompt, &files, json).await,
        Command::CountTokens { prompt } => {
            let count = dispatcher.count_tokens(None, &prompt).await?;
            println!("{count}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_ask_with_files() {
        let args = Args::try_parse_from([
            "relay", "--model", "gemini-2.5-pro", "ask", "hi", "-f", "a.png", "--file", "b.pdf",
        ])
        .unwrap();
        assert_eq!(args.model.as_deref(), Some("gemini-2.5-pro"));
        match args.command {
            Command::Ask { prompt, files, json } => {
                assert_eq!(prompt, "hi");
                assert_eq!(files, vec![PathBuf::from("a.png"), PathBuf::from("b.pdf")]);
                assert!(!json);
            }
            Command::CountTokens { .. } => panic!("expected ask"),
        }
    }

    #[test]
    fn test_mime_type_for() {
        assert_eq!(mime_type_for(Path::new("x.PNG")), "image/png");
        assert_eq!(mime_type_for(Path::new("doc.pdf")), "application/pdf");
        assert_eq!(mime_type_for(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn test_read_attachment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, b"hello").unwrap();

        let file = read_attachment(&path).unwrap();
        assert_eq!(file.name, "note.txt");
        assert_eq!(file.mime_type, "text/plain");
        assert_eq!(file.size_bytes, 5);
        assert_eq!(file.inline_data.as_deref(), Some("aGVsbG8="));
    }

    #[test]
    fn test_overrides_win() {
        let dir = TempDir::new().unwrap();
        let args = Args::try_parse_from([
            "relay",
            "--config",
            dir.path().join("missing.toml").to_str().unwrap(),
            "--keys",
            "a,b",
            "--no-stream",
            "count-tokens",
            "x",
        ])
        .unwrap();
        let config = resolve_config(&args).unwrap();
        assert_eq!(config.keys.len(), 2);
        assert!(!config.stream);
    }

    fn args_with_config(dir: &TempDir, contents: &str, extra: &[&str]) -> Args {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        let mut argv = vec!["relay", "--config", path.to_str().unwrap(), "--keys", "a"];
        argv.extend_from_slice(extra);
        argv.extend_from_slice(&["count-tokens", "x"]);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_notifier_follows_config() {
        let dir = TempDir::new().unwrap();
        let quiet = "[app]\nnotify_on_completion = false\n";

        let config = resolve_config(&args_with_config(&dir, quiet, &[])).unwrap();
        assert!(notifier_for(&config).is_foreground());

        let config = resolve_config(&args_with_config(&dir, quiet, &["--notify"])).unwrap();
        assert!(!notifier_for(&config).is_foreground());

        let config = resolve_config(&args_with_config(&dir, "", &[])).unwrap();
        assert!(config.notify_on_completion);
        assert!(!notifier_for(&config).is_foreground());
    }

    #[test]
    fn test_printer_follows_sibling_entries() {
        use relay_core::streaming::{apply_fragment, finalize};
        use relay_core::{Fragment, JobId, JobState, SessionSettings, TranscriptEntry};

        let key = GenerationKey(1_000);
        let mut session = Session::new(SessionSettings::default());
        session.push_user(TranscriptEntry::user("2+2?", vec![]));
        session.entries.push(TranscriptEntry::loading(key));
        let mut job = JobState::new(JobId::new(), session.id.clone(), key);

        let mut printer = Printer::default();
        let mut out = Vec::new();

        apply_fragment(&mut session, &mut job, Fragment::Text("Let me compute.".into()), 1_001);
        printer.update(&session, key, &mut out).unwrap();

        // code and the closing text land in siblings within one update
        apply_fragment(
            &mut session,
            &mut job,
            Fragment::ExecutableCode {
                language: "python".into(),
                code: "print(2+2)".into(),
            },
            1_002,
        );
        apply_fragment(&mut session, &mut job, Fragment::Text("The answer is 4.".into()), 1_003);
        printer.update(&session, key, &mut out).unwrap();

        finalize(&mut session, &mut job, None, false, "empty", 1_100);
        printer.update(&session, key, &mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Let me compute.\n```python\nprint(2+2)\n```\nThe answer is 4."
        );
    }
}
