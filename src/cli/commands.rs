use log::{ info, warn };
use std::error::Error as StdError;
use std::fs;
use std::io::{ self, IsTerminal, Write };
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{ AsyncBufReadExt, AsyncReadExt, BufReader };
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Args;
use crate::config::{ self, Config };
use crate::history::{ open_history_store, truncate, HistoryStore, SqliteHistoryStore };
use crate::llm::chat::{ new_provider, ChatProvider };
use crate::llm::{ LlmConfig, LlmType };
use crate::models::chat::Conversation;
use crate::session::{ ChatSession, SessionError };
use crate::stream::TokenWriter;

pub type CommandResult = Result<(), Box<dyn StdError + Send + Sync>>;

const MAX_MODEL_DISPLAY: usize = 21;
const MAX_TITLE_DISPLAY: usize = 40;

/// Cancels its token on Ctrl-C for as long as it is alive.
struct CancelOnCtrlC {
    token: CancellationToken,
    listener: JoinHandle<()>,
}

impl CancelOnCtrlC {
    fn install() -> Self {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let listener = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                trigger.cancel();
            }
        });
        Self { token, listener }
    }
}

impl Drop for CancelOnCtrlC {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ReplCommand {
    Quit,
    New,
    Model(String),
    Help,
    Unknown(String),
}

fn parse_repl_command(input: &str) -> ReplCommand {
    let lower = input.to_lowercase();
    match lower.as_str() {
        "/quit" | "/exit" | "/q" => ReplCommand::Quit,
        "/new" | "/clear" => ReplCommand::New,
        "/help" => ReplCommand::Help,
        _ if lower.starts_with("/model ") => ReplCommand::Model(input["/model ".len()..].trim().to_string()),
        _ => ReplCommand::Unknown(input.to_string()),
    }
}

/// Piped input first, then the arguments, separated by a blank line.
fn build_prompt(args: &[String], piped: Option<String>) -> String {
    let mut parts = Vec::new();
    if let Some(input) = piped.filter(|s| !s.is_empty()) {
        parts.push(input);
    }
    if !args.is_empty() {
        parts.push(args.join(" "));
    }
    parts.join("\n\n")
}

fn resolve_system_prompt(system: Option<&str>) -> io::Result<Option<String>> {
    match system {
        None | Some("") => Ok(None),
        Some(s) =>
            match s.strip_prefix('@') {
                Some(path) =>
                    fs::read_to_string(path)
                        .map(Some)
                        .map_err(|e| io::Error::new(e.kind(), format!("failed to read system prompt file {}: {}", path, e))),
                None => Ok(Some(s.to_string())),
            }
    }
}

/// The configured default model applies only to the configured default
/// provider; any other provider starts from its own catalog.
fn resolve_target(args: &Args, config: &Config) -> Result<(LlmType, Option<String>), Box<dyn StdError + Send + Sync>> {
    let llm_type: LlmType = args.provider.as_deref().unwrap_or(&config.default_provider).parse()?;
    let model = args.model.clone().or_else(|| {
        let default_provider = config.default_provider.parse::<LlmType>().ok();
        config.default_model.clone().filter(|_| default_provider == Some(llm_type))
    });
    Ok((llm_type, model))
}

fn create_provider(llm_type: LlmType, config: &Config) -> Result<Arc<dyn ChatProvider>, Box<dyn StdError + Send + Sync>> {
    let provider = new_provider(&LlmConfig {
        llm_type,
        api_key: config.api_key(llm_type),
        base_url: None,
    })?;
    Ok(provider)
}

fn pick_model(provider: &Arc<dyn ChatProvider>, model: Option<String>) -> String {
    model.unwrap_or_else(|| provider.models().first().copied().unwrap_or_default().to_string())
}

fn open_store(args: &Args) -> Result<SqliteHistoryStore, Box<dyn StdError + Send + Sync>> {
    let path: PathBuf = match &args.db {
        Some(path) => path.clone(),
        None => config::default_history_path()?,
    };
    Ok(open_history_store(&path)?)
}

fn chat_failure(err: SessionError) -> Box<dyn StdError + Send + Sync> {
    match &err {
        SessionError::Chat(e) if e.is_provider_unavailable() =>
            format!("{}\n\nTry a different provider with --provider.", e).into(),
        _ => Box::new(err),
    }
}

pub async fn chat(args: &Args, config: &Config) -> CommandResult {
    let stdin_is_terminal = io::stdin().is_terminal();
    if args.prompt.is_empty() && stdin_is_terminal && args.continue_id.is_none() {
        return interactive(args, config).await;
    }
    one_shot(args, config, stdin_is_terminal).await
}

async fn one_shot(args: &Args, config: &Config, stdin_is_terminal: bool) -> CommandResult {
    let piped = if stdin_is_terminal {
        None
    } else {
        let mut input = String::new();
        tokio::io::stdin().read_to_string(&mut input).await
            .map_err(|e| format!("failed to read from stdin: {}", e))?;
        Some(input)
    };
    let prompt = build_prompt(&args.prompt, piped);
    if prompt.trim().is_empty() {
        return Err("no prompt provided\n\nUsage: ask \"your question\"\n       cat file | ask \"explain this\"".into());
    }

    let (llm_type, model) = resolve_target(args, config)?;
    let provider = create_provider(llm_type, config)?;
    let model = pick_model(&provider, model);

    let mut store = None;
    let session = match args.continue_id {
        Some(id) => {
            let history = open_store(args)?;
            let conversation = history.get_conversation(id).await
                .map_err(|e| format!("loading conversation {}: {}", id, e))?;
            store = Some(history);
            ChatSession::resume(provider, model, conversation)
        }
        None => {
            let system = resolve_system_prompt(args.system.as_deref())?;
            ChatSession::new(provider, model, system)
        }
    };
    let mut session = session.with_sampling(args.temperature, Some(args.max_tokens));
    info!("Chatting with {}/{}", session.provider_name(), session.model());

    let mut writer = TokenWriter::new(io::stdout(), io::stdout().is_terminal());
    let ctrl_c = CancelOnCtrlC::install();
    session.turn(&prompt, &ctrl_c.token, &mut writer).await.map_err(chat_failure)?;
    drop(ctrl_c);

    // Piped output is treated as scripting and stays out of history.
    if writer.is_tty() {
        let store = match store {
            Some(store) => Some(store),
            None =>
                open_store(args)
                    .map_err(|e| warn!("failed to open history: {}", e))
                    .ok(),
        };
        if let Some(store) = store {
            session.persist_or_warn(&store).await;
        }
    }
    Ok(())
}

async fn interactive(args: &Args, config: &Config) -> CommandResult {
    let (llm_type, model) = resolve_target(args, config)?;
    let provider = create_provider(llm_type, config)?;
    let model = pick_model(&provider, model);
    let system = resolve_system_prompt(args.system.as_deref())?;
    let mut session = ChatSession::new(provider, model, system).with_sampling(args.temperature, Some(args.max_tokens));

    println!("ask - using {}/{}", session.provider_name(), session.model());
    println!("Type /quit to exit, /new to start fresh, /help for commands");
    println!();

    let store = open_store(args)
        .map_err(|e| warn!("history disabled: {}", e))
        .ok();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut writer = TokenWriter::new(io::stdout(), true);

    loop {
        print!("> ");
        io::stdout().flush()?;

        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => None,
            line = lines.next_line() => line.map_err(|e| format!("failed to read input: {}", e))?,
        };
        let Some(line) = line else {
            println!();
            return Ok(());
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if input.starts_with('/') {
            match parse_repl_command(input) {
                ReplCommand::Quit => return Ok(()),
                ReplCommand::New => {
                    session.reset();
                    println!("Started new conversation");
                }
                ReplCommand::Model(name) if name.is_empty() => println!("Usage: /model <name>"),
                ReplCommand::Model(name) => {
                    println!("Switched to model: {}", name);
                    session.set_model(name);
                }
                ReplCommand::Help => print_help(),
                ReplCommand::Unknown(cmd) => println!("Unknown command: {} (type /help for commands)", cmd),
            }
            continue;
        }

        let ctrl_c = CancelOnCtrlC::install();
        let result = session.turn(input, &ctrl_c.token, &mut writer).await;
        drop(ctrl_c);
        println!();

        match result {
            Ok(_) => {
                if let Some(store) = &store {
                    session.persist_or_warn(store).await;
                }
            }
            Err(e) => println!("Error: {}", chat_failure(e)),
        }
    }
}

fn print_help() {
    println!(
        "Commands:\n  \
         /quit, /exit, /q  Exit interactive mode\n  \
         /new, /clear      Start a new conversation\n  \
         /model <name>     Switch model\n  \
         /help             Show this help"
    );
}

fn format_history_row(conv: &Conversation) -> String {
    format!(
        "{:<4}  {:<21}  {:<11}  {}",
        conv.id.unwrap_or_default(),
        truncate(&conv.model, MAX_MODEL_DISPLAY),
        conv.created_at.format("%b %d %Y"),
        truncate(&conv.title, MAX_TITLE_DISPLAY)
    )
}

pub async fn history(args: &Args, search: &str, limit: usize) -> CommandResult {
    let store = open_store(args)?;
    let conversations = store.list_conversations(limit, search).await
        .map_err(|e| format!("listing conversations: {}", e))?;

    if conversations.is_empty() {
        if search.is_empty() {
            println!("No conversations yet. Start chatting with: ask \"your question\"");
        } else {
            println!("No conversations found matching '{}'", search);
        }
        return Ok(());
    }

    println!("ID    Model                  Date         Title");
    println!("----  ---------------------  -----------  ----------------------------------------");
    for conv in &conversations {
        println!("{}", format_history_row(conv));
    }
    Ok(())
}

fn format_conversation(conv: &Conversation) -> String {
    let mut out = format!(
        "Conversation #{}: {}\nModel: {} | Provider: {} | Date: {}\n{}\n\n",
        conv.id.unwrap_or_default(),
        conv.title,
        conv.model,
        conv.provider,
        conv.created_at.format("%b %d %Y %H:%M"),
        "-".repeat(60)
    );
    for msg in conv.messages.iter().filter(|m| m.role != "system") {
        let label = if msg.role == "assistant" { "Assistant" } else { "You" };
        out.push_str(&format!("[{}]\n{}\n\n", label, msg.content));
    }
    out
}

pub async fn show(args: &Args, id: i64) -> CommandResult {
    let store = open_store(args)?;
    let conversation = store.get_conversation(id).await
        .map_err(|e| format!("loading conversation {}: {}", id, e))?;
    print!("{}", format_conversation(&conversation));
    Ok(())
}

pub fn models(args: &Args, config: &Config) -> CommandResult {
    let (default_type, default_model) = resolve_target(args, config)?;

    for llm_type in LlmType::ALL {
        let provider = match create_provider(llm_type, config) {
            Ok(provider) => provider,
            Err(_) => {
                println!("{}: (not configured)", llm_type);
                continue;
            }
        };

        let selected = (llm_type == default_type).then(|| pick_model(&provider, default_model.clone()));
        println!("{}:", llm_type);
        for model in provider.models() {
            let marker = if selected.as_deref() == Some(*model) { "* " } else { "  " };
            println!("  {}{}", marker, model);
        }
        println!();
    }
    Ok(())
}
