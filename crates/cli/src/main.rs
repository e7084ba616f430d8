use clap::{Parser, Subcommand};
use opsdesk::console::{Console, ConsoleSettings, ConsoleUpdate};
use opsdesk::store::RestStore;
use opsdesk::watch::{Entry, Slot};
use opsdesk::webhook::WebhookClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

#[derive(Parser)]
#[command(name = "opsdesk")]
#[command(about = "Ops console CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: OPSDESK_CONFIG_PATH or ~/.opsdesk/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// List conversations, most recent first.
    Conversations {
        /// Config file path (default: OPSDESK_CONFIG_PATH or ~/.opsdesk/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Chat with the automation (interactive). Replies are picked up from the database.
    Chat {
        /// Config file path (default: OPSDESK_CONFIG_PATH or ~/.opsdesk/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Existing conversation id to continue. A new conversation is created otherwise.
        #[arg(long, value_name = "ID")]
        session: Option<String>,
    },

    /// Read a reply from stdin and print it as HTML.
    Format,

    /// List the quick commands.
    Commands,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("opsdesk {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Conversations { config }) => {
            if let Err(e) = run_conversations(config).await {
                log::error!("listing conversations failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat { config, session }) => {
            if let Err(e) = run_chat(config, session).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Format) => {
            if let Err(e) = run_format().await {
                log::error!("format failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Commands) => {
            print!("{}", opsdesk::commands::help_text());
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(opsdesk::config::default_config_path);
    let dir = opsdesk::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

fn open_store(config: &opsdesk::config::Config) -> anyhow::Result<Arc<RestStore>> {
    let Some(store) = opsdesk::config::resolve_store(config) else {
        anyhow::bail!("database not configured: set store.url and store.apiKey (or OPSDESK_STORE_URL / OPSDESK_STORE_KEY)");
    };
    Ok(Arc::new(RestStore::new(store)))
}

async fn run_conversations(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, _) = opsdesk::config::load_config(config_path)?;
    let store = open_store(&config)?;
    let console = Console::new(
        store.clone(),
        store,
        Arc::new(WebhookClient::new(None, None)),
        ConsoleSettings::from(&config),
    );
    for c in console.conversations().await? {
        println!("{}  {}  {}", c.id, c.updated_at.format("%Y-%m-%d %H:%M"), c.title);
    }
    Ok(())
}

async fn run_format() -> anyhow::Result<()> {
    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    println!("{}", opsdesk::format::render_html(&input));
    Ok(())
}

fn print_entry(entry: &Entry) {
    match entry {
        Entry::Message(m) => println!("{} {}", marker(m.role.as_str()), m.content.trim()),
        Entry::Placeholder { slot, .. } => match slot {
            Slot::Pending => println!("< ..."),
            Slot::Resolved(m) => println!("< {}", m.content.trim()),
            Slot::Failed(reason) => println!("! {}", reason),
        },
    }
}

fn marker(role: &str) -> &'static str {
    if role == "user" {
        ">"
    } else {
        "<"
    }
}

async fn run_chat(
    config_path: Option<std::path::PathBuf>,
    session: Option<String>,
) -> anyhow::Result<()> {
    let (config, _) = opsdesk::config::load_config(config_path)?;
    let store = open_store(&config)?;
    let webhook_url = opsdesk::config::resolve_webhook_url(&config);
    if webhook_url.is_none() {
        log::warn!("webhook not configured; messages will be saved but not dispatched");
    }
    let automation = WebhookClient::new(
        webhook_url,
        Some(Duration::from_secs(config.webhook.timeout_secs.max(1))),
    );
    let mut console = Console::new(
        store.clone(),
        store,
        Arc::new(automation),
        ConsoleSettings::from(&config),
    );

    match session {
        Some(id) => {
            let timeline = console.open(&id).await?;
            for entry in timeline.entries() {
                print_entry(entry);
            }
        }
        None => {
            let c = console.new_conversation().await?;
            println!("new conversation {}", c.id);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
                    break;
                }
                if input.eq_ignore_ascii_case("/commands") {
                    print!("{}", opsdesk::commands::help_text());
                    continue;
                }
                if input.eq_ignore_ascii_case("/new") {
                    match console.new_conversation().await {
                        Ok(c) => println!("new conversation {}", c.id),
                        Err(e) => eprintln!("chat error: {}", e),
                    }
                    continue;
                }
                if let Some(id) = input.strip_prefix("/open ") {
                    match console.open(id.trim()).await {
                        Ok(timeline) => timeline.entries().iter().for_each(print_entry),
                        Err(e) => eprintln!("chat error: {}", e),
                    }
                    continue;
                }
                let text = opsdesk::commands::find(input).map(|c| c.example).unwrap_or(input);
                if let Err(e) = console.send(text).await {
                    eprintln!("chat error: {}", e);
                }
            }
            update = console.next_update() => {
                match update {
                    Some(ConsoleUpdate::ReplyArrived { message, .. }) => {
                        println!("< {}", message.content.trim());
                    }
                    Some(ConsoleUpdate::ReplyFailed { reason, .. }) => {
                        println!("! {}", reason);
                    }
                    Some(ConsoleUpdate::MessageAppended(m)) => {
                        println!("{} {}", marker(m.role.as_str()), m.content.trim());
                    }
                    None => break,
                }
            }
        }
    }

    console.close();
    Ok(())
}
