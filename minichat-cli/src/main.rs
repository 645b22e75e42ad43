mod repl;

use clap::{Parser, Subcommand};
use minichat::config::{ConfigError, PreferenceSource, Preferences};
use minichat::{ChatSession, ConfigManager, ErrorReporter, MaxTokens, MiniMaxProvider, Provider, ProviderError, Temperature};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "minichat", version, about = "Chat with MiniMax from the terminal")]
struct Cli {
    /// Config file (default: ~/.minichat/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the API base URL (e.g. a proxy)
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a single question and print the reply
    Ask {
        /// The question
        #[arg(required = true)]
        prompt: Vec<String>,

        /// Wait for the whole reply instead of streaming it
        #[arg(long)]
        no_stream: bool,
    },

    /// Interactive conversation (/reset clears history, /quit exits, Ctrl-C stops a reply)
    Chat {
        /// Wait for whole replies instead of streaming them
        #[arg(long)]
        no_stream: bool,
    },

    /// Show or update stored preferences
    Config {
        #[arg(long)]
        api_key: Option<String>,

        /// System prompt; pass an empty string to clear it
        #[arg(long)]
        system_prompt: Option<String>,

        /// One of 0.3, 0.7, 1.0, 1.5
        #[arg(long)]
        temperature: Option<Temperature>,

        /// One of 1024, 2048, 4096, 8192
        #[arg(long)]
        max_tokens: Option<MaxTokens>,

        /// Stream replies by default
        #[arg(long)]
        stream: Option<bool>,
    },
}

/// Stored preferences, with the streaming toggle optionally forced off.
struct CliPreferences {
    manager: ConfigManager,
    no_stream: bool,
}

impl PreferenceSource for CliPreferences {
    fn load(&self) -> Result<Preferences, ConfigError> {
        let mut prefs = self.manager.load()?;
        if self.no_stream {
            prefs.stream_responses = false;
        }
        Ok(prefs)
    }
}

/// Prints errors for the user; details also go to the log.
struct StderrReporter;

impl ErrorReporter for StderrReporter {
    fn report(&self, error: &ProviderError) {
        tracing::debug!(kind = ?error.kind(), status = ?error.status(), "request failed");
        eprintln!("\n{}: {}", error.title(), error);
    }
}

fn build_session(manager: ConfigManager, base_url: Option<String>, no_stream: bool) -> ChatSession {
    let source = Arc::new(CliPreferences { manager, no_stream });
    ChatSession::with_provider_factory(
        source,
        Arc::new(StderrReporter),
        Arc::new(move |config| {
            let provider = MiniMaxProvider::new(config);
            let provider = match &base_url {
                Some(url) => provider.with_base_url(url),
                None => provider,
            };
            Arc::new(provider) as Arc<dyn Provider>
        }),
    )
}

fn update_config(
    manager: &ConfigManager,
    api_key: Option<String>,
    system_prompt: Option<String>,
    temperature: Option<Temperature>,
    max_tokens: Option<MaxTokens>,
    stream: Option<bool>,
) -> anyhow::Result<()> {
    let mut prefs = manager.load_file()?;
    let changed = api_key.is_some()
        || system_prompt.is_some()
        || temperature.is_some()
        || max_tokens.is_some()
        || stream.is_some();

    if let Some(key) = api_key {
        prefs.api_key = key;
    }
    if let Some(prompt) = system_prompt {
        prefs.system_prompt = Some(prompt).filter(|p| !p.trim().is_empty());
    }
    if let Some(t) = temperature {
        prefs.temperature = t;
    }
    if let Some(m) = max_tokens {
        prefs.max_tokens = m;
    }
    if let Some(s) = stream {
        prefs.stream_responses = s;
    }
    if changed {
        manager.save(&prefs)?;
        println!("Saved {}", manager.path().display());
    }

    let key = if prefs.api_key.is_empty() {
        "(not set)".to_string()
    } else {
        let tail: String = prefs.api_key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
        format!("****{}", tail)
    };
    println!("api_key:          {}", key);
    println!("system_prompt:    {}", prefs.system_prompt.as_deref().unwrap_or("(none)"));
    println!("temperature:      {}", prefs.temperature);
    println!("max_tokens:       {}", prefs.max_tokens);
    println!("stream_responses: {}", prefs.stream_responses);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "minichat=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let manager = match cli.config {
        Some(path) => ConfigManager::new(path),
        None => ConfigManager::default_path(),
    };

    match cli.command {
        Commands::Ask { prompt, no_stream } => {
            let session = build_session(manager, cli.base_url, no_stream);
            repl::run_ask(&session, prompt.join(" ")).await?;
        }
        Commands::Chat { no_stream } => {
            let session = build_session(manager, cli.base_url, no_stream);
            repl::run_chat(&session).await?;
        }
        Commands::Config {
            api_key,
            system_prompt,
            temperature,
            max_tokens,
            stream,
        } => {
            update_config(&manager, api_key, system_prompt, temperature, max_tokens, stream)?;
        }
    }

    Ok(())
}
