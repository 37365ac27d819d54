pub mod commands;

use clap::{ Parser, Subcommand };
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ask",
    author,
    version,
    about = "Chat with LLMs from your terminal",
    long_about = "ask is a fast, pipe-friendly CLI for chatting with LLMs.\n\n\
        Supports OpenAI and Anthropic with real streaming, conversation history, and system prompts.\n\n\
        Examples:\n  \
        ask \"What is a future?\"\n  \
        cat error.log | ask \"What's wrong here?\"\n  \
        ask -p anthropic \"Explain this code\"\n  \
        ask -s \"Be concise\" \"Review this function\"\n  \
        ask                             # interactive mode",
    args_conflicts_with_subcommands = true
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Prompt text. Piped stdin is prepended to it.
    pub prompt: Vec<String>,

    /// LLM provider (openai, anthropic)
    #[arg(short, long, env = "ASK_PROVIDER", global = true)]
    pub provider: Option<String>,

    /// Model to use. Defaults to the configured model or the provider's first model.
    #[arg(short, long, env = "ASK_MODEL", global = true)]
    pub model: Option<String>,

    /// System prompt, or @path to read it from a file
    #[arg(short, long)]
    pub system: Option<String>,

    /// Continue the conversation with this ID
    #[arg(short = 'c', long = "continue", value_name = "ID")]
    pub continue_id: Option<i64>,

    /// Sampling temperature. 0 leaves it to the provider where allowed.
    #[arg(long, default_value = "0")]
    pub temperature: f64,

    /// Maximum tokens to generate. 0 uses the provider default.
    #[arg(long, default_value = "0")]
    pub max_tokens: u32,

    /// Path to the history database
    #[arg(long, env = "ASK_HISTORY_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Enable debug logging on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List recent conversations
    History {
        /// Search conversations by title or content
        #[arg(long, default_value = "")]
        search: String,

        /// Maximum number of results
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Display a conversation
    Show {
        id: i64,
    },

    /// List available models for each provider
    Models,
}
