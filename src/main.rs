//! Console front-end for Ember.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use clap::Parser;

use ember_chat::chat::{ContentSource, CoordinatorEvent};
use ember_chat::config::AppConfig;
use ember_chat::llm::InferenceClient;
use ember_chat::start_ember::{self, Runtime};
use ember_chat::store::{IntegrityReport, WriteJob};

/// Chat with a local Ollama model from the terminal.
#[derive(Debug, Parser)]
#[command(name = "ember", version, about)]
struct Cli {
    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// `SQLite` database path.
    #[arg(long)]
    db: Option<PathBuf>,
    /// Model for new turns.
    #[arg(long)]
    model: Option<String>,
    /// Ollama base URL, e.g. `http://127.0.0.1:11434`.
    #[arg(long)]
    host: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Say(String),
    New(String),
    Switch(String),
    Rename(String),
    Delete(String),
    List,
    Stop,
    Remember(String),
    Memory,
    Forget(i64),
    ForgetAll,
    Check,
    Model(Option<String>),
    Help,
    Quit,
    Invalid(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(Command::Say(line.to_string()));
    }
    let (name, arg) = line.split_once(' ').map_or((line, ""), |(n, a)| (n, a.trim()));
    let command = match (name, arg) {
        ("/new", name) if !name.is_empty() => Command::New(name.to_string()),
        ("/switch", name) if !name.is_empty() => Command::Switch(name.to_string()),
        ("/rename", name) if !name.is_empty() => Command::Rename(name.to_string()),
        ("/delete", name) if !name.is_empty() => Command::Delete(name.to_string()),
        ("/list", _) => Command::List,
        ("/stop", _) => Command::Stop,
        ("/remember", fact) if !fact.is_empty() => Command::Remember(fact.to_string()),
        ("/memory", _) => Command::Memory,
        ("/forget", id) => id
            .parse()
            .map_or_else(|_| Command::Invalid(format!("not a memory id: {id}")), Command::Forget),
        ("/forget-all", _) => Command::ForgetAll,
        ("/check", _) => Command::Check,
        ("/model", "") => Command::Model(None),
        ("/model", name) => Command::Model(Some(name.to_string())),
        ("/help", _) => Command::Help,
        ("/quit" | "/exit", _) => Command::Quit,
        _ => Command::Invalid(format!("unknown command: {line}")),
    };
    Some(command)
}

const HELP: &str = "\
/new <name>      start or open a conversation
/switch <name>   same as /new
/rename <name>   rename the current conversation
/delete <name>   delete a conversation and its messages
/list            list conversations
/stop            cancel the reply in progress
/remember <fact> store a fact
/memory          list stored facts
/forget <id>     delete one fact
/forget-all      delete every fact
/check           store integrity and model status
/model [name]    show or change the model
/quit            exit";

fn print_event(out: &mut impl Write, event: &CoordinatorEvent) -> std::io::Result<()> {
    match event {
        CoordinatorEvent::ChunkReceived { text, .. } => write!(out, "{text}")?,
        CoordinatorEvent::Completed { .. } => writeln!(out)?,
        CoordinatorEvent::Failed { reason, .. } => writeln!(out, "\n[error] {reason}")?,
        CoordinatorEvent::Cancelled { .. } => writeln!(out, "\n[stopped]")?,
        CoordinatorEvent::Notice { source, text } => {
            let tag = match source {
                ContentSource::Search => "search",
                ContentSource::Llm => "model",
                ContentSource::Memory => "memory",
            };
            writeln!(out, "[{tag}] {text}")?;
        }
    }
    out.flush()
}

/// List installed models on a worker thread and hand the report to `report`.
fn list_models_in_background(
    client: Arc<InferenceClient>,
    report: impl FnOnce(String) + Send + 'static,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("ember-models".to_owned())
        .spawn(move || {
            let line = match client.list_models() {
                Ok(models) => format!("models: {}", models.join(", ")),
                Err(err) => format!("models unavailable: {err}"),
            };
            report(line);
        })
}

/// Returns `false` when the user asked to quit.
fn dispatch(runtime: &Runtime, command: Command) -> Result<bool> {
    let coordinator = &runtime.coordinator;
    let store = &runtime.store;
    match command {
        Command::Say(text) => coordinator.submit(&text).context("starting turn")?,
        Command::New(name) | Command::Switch(name) => {
            coordinator.switch_conversation(&name);
            println!("-> {name}");
        }
        Command::Rename(name) => {
            if store.db().get_conversation_id(&name)?.is_some() {
                println!("\"{name}\" already exists");
            } else {
                coordinator.rename_active(&name);
                println!("-> {name}");
            }
        }
        Command::Delete(name) => {
            if store.db().get_conversation_id(&name)?.is_none() {
                println!("no conversation named \"{name}\"");
            } else {
                coordinator.delete_conversation(&name);
                println!("deleted {name}, now in {}", coordinator.active_conversation());
            }
        }
        Command::List => {
            let active = coordinator.active_conversation();
            for conversation in store.db().list_conversations()? {
                let marker = if conversation.name == active { '*' } else { ' ' };
                println!("{marker} {} (updated {})", conversation.name, conversation.updated_at.format("%Y-%m-%d %H:%M"));
            }
        }
        Command::Stop => {
            if !coordinator.cancel() {
                println!("nothing to stop");
            }
        }
        Command::Remember(fact) => {
            store.remember(&fact, None, runtime.config.chat.max_memory_entries);
            println!("[memory] {fact}");
        }
        Command::Memory => {
            for entry in store.db().list_memory()? {
                println!("{:>4}  {}  ({})", entry.id, entry.content, entry.category);
            }
        }
        Command::Forget(id) => {
            store.enqueue(WriteJob::ForgetMemory(id));
        }
        Command::ForgetAll => {
            store.enqueue(WriteJob::ForgetAll);
        }
        Command::Check => {
            match store.db().integrity_check()? {
                IntegrityReport::Ok => println!("store: ok"),
                IntegrityReport::Problems(problems) => {
                    println!("store: {} problem(s)", problems.len());
                    for problem in problems {
                        println!("  {problem}");
                    }
                }
            }
            let alive = runtime.health.is_alive();
            println!("model peer: {}", if alive { "up" } else { "down" });
            println!("model: {}", coordinator.model());
            if alive {
                list_models_in_background(Arc::clone(&runtime.client), |line| println!("{line}"))
                    .context("starting model listing")?;
            }
        }
        Command::Model(None) => println!("model: {}", coordinator.model()),
        Command::Model(Some(name)) => {
            coordinator.set_model(&name);
            println!("model: {name}");
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => return Ok(false),
        Command::Invalid(message) => println!("{message} (try /help)"),
    }
    Ok(true)
}

fn main() -> Result<()> {
    start_ember::init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(db) = cli.db {
        config = config.with_db_path(db);
    }
    if let Some(host) = cli.host {
        config = config.with_base_url(host);
    }
    if let Some(model) = cli.model {
        config = config.with_model(model);
    }

    let (tx, rx) = mpsc::channel::<CoordinatorEvent>();
    let runtime = start_ember::start(config, Arc::new(tx)).context("starting runtime")?;

    let printer = std::thread::Builder::new()
        .name("ember-printer".to_owned())
        .spawn(move || {
            let stdout = std::io::stdout();
            for event in rx {
                if print_event(&mut stdout.lock(), &event).is_err() {
                    break;
                }
            }
        })
        .context("starting printer")?;

    println!("Ember ready in \"{}\". /help for commands.", runtime.coordinator.active_conversation());
    for line in std::io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        let Some(command) = parse_command(&line) else {
            continue;
        };
        match dispatch(&runtime, command) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => eprintln!("error: {err:#}"),
        }
    }

    runtime.shutdown();
    // The printer ends once every event sender is gone.
    let _ = printer.join();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_a_turn() {
        assert_eq!(parse_command("  hello there "), Some(Command::Say("hello there".to_string())));
        assert_eq!(parse_command("   "), None);
    }

    #[test]
    fn test_commands_parse() {
        assert_eq!(parse_command("/new Trip plans"), Some(Command::New("Trip plans".to_string())));
        assert_eq!(parse_command("/forget 12"), Some(Command::Forget(12)));
        assert_eq!(parse_command("/forget-all"), Some(Command::ForgetAll));
        assert_eq!(parse_command("/stop"), Some(Command::Stop));
        assert_eq!(parse_command("/exit"), Some(Command::Quit));
        assert_eq!(parse_command("/rename Trip 2"), Some(Command::Rename("Trip 2".to_string())));
        assert_eq!(parse_command("/delete Old"), Some(Command::Delete("Old".to_string())));
        assert_eq!(parse_command("/model"), Some(Command::Model(None)));
        assert_eq!(parse_command("/model llama3:8b"), Some(Command::Model(Some("llama3:8b".to_string()))));
    }

    #[test]
    fn test_bad_commands_are_reported() {
        assert!(matches!(parse_command("/forget x"), Some(Command::Invalid(_))));
        assert!(matches!(parse_command("/new"), Some(Command::Invalid(_))));
        assert!(matches!(parse_command("/rename"), Some(Command::Invalid(_))));
        assert!(matches!(parse_command("/delete"), Some(Command::Invalid(_))));
        assert!(matches!(parse_command("/dance"), Some(Command::Invalid(_))));
    }

    #[test]
    fn test_event_rendering() {
        let mut out = Vec::new();
        print_event(&mut out, &CoordinatorEvent::ChunkReceived { generation: 1, text: "Hi".to_string() }).unwrap();
        print_event(&mut out, &CoordinatorEvent::Completed { generation: 1, full_text: "Hi".to_string() }).unwrap();
        print_event(&mut out, &CoordinatorEvent::Notice { source: ContentSource::Memory, text: "likes tea".to_string() }).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Hi\n[memory] likes tea\n");
    }

    #[test]
    fn test_model_listing_does_not_block_caller() {
        use ember_chat::config::{InferenceConfig, PerformanceConfig};
        use httpmock::prelude::*;
        use serde_json::json;
        use std::time::{Duration, Instant};

        let server = MockServer::start();
        let tags = server.mock(|when, then| {
            when.method(GET).path("/api/tags");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({ "models": [{ "name": "qwen2.5:7b" }, { "name": "llama3:8b" }] }))
                .delay(Duration::from_millis(400));
        });
        let client = InferenceClient::new(
            InferenceConfig {
                base_url: server.base_url(),
                ..InferenceConfig::default()
            },
            PerformanceConfig::default(),
        )
        .unwrap();

        let (tx, rx) = mpsc::channel();
        let started = Instant::now();
        let worker = list_models_in_background(Arc::new(client), move |line| tx.send(line).unwrap()).unwrap();
        assert!(started.elapsed() < Duration::from_millis(300));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "models: qwen2.5:7b, llama3:8b");
        worker.join().unwrap();
        tags.assert();
    }
}
