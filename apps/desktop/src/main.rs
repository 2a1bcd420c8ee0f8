use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::{load_settings_from, DEFAULT_SETTINGS_FILE},
    load_settings, ChatApp, ClientSettings, MessageState, Route,
};
use shared::{domain::SessionId, protocol::Message};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal group chat client")]
struct Args {
    /// Settings file; defaults to ./chat.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register an account and sign in with it.
    Signup {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        username: String,
    },
    /// List active sessions, newest first.
    Sessions,
    /// Create a session and join it.
    Create { name: String },
    /// Join a session and chat until `/quit` or `/leave`.
    Chat { session_id: SessionId },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = match &args.config {
        Some(path) => load_settings_from(path)?,
        None if Path::new(DEFAULT_SETTINGS_FILE).exists() => {
            load_settings_from(Path::new(DEFAULT_SETTINGS_FILE))?
        }
        None => load_settings(),
    };
    init_tracing(&settings);

    let app = ChatApp::from_settings(&settings).await?;
    app.initialize().await.context("failed to restore sign-in")?;
    if let (Some(email), Some(password)) = (&args.email, &args.password) {
        app.auth()
            .sign_in(email, password)
            .await
            .context("sign in failed")?;
    }

    match args.command {
        Command::Signup {
            email,
            password,
            username,
        } => {
            let user = app.auth().sign_up(&email, &password, &username).await?;
            println!("signed up {} as {}", user.email, username);
        }
        Command::Sessions => {
            require(&app, Route::Sessions)?;
            let sessions = app.sessions().fetch_sessions().await?;
            if sessions.is_empty() {
                println!("no active sessions");
            }
            for session in sessions {
                println!(
                    "{}  {}  (created {})",
                    session.id,
                    session.name,
                    session.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Command::Create { name } => {
            require(&app, Route::Sessions)?;
            let session = app.sessions().create_session(&name).await?;
            println!("created session {} ({})", session.name, session.id);
        }
        Command::Chat { session_id } => {
            require(&app, Route::Chat(session_id))?;
            chat(&app, session_id).await?;
        }
    }

    Ok(())
}

fn init_tracing(settings: &ClientSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn require(app: &ChatApp, route: Route) -> Result<()> {
    let resolved = app.resolve_route(route);
    if resolved != route {
        bail!("{route} is not available, go to {resolved} (pass --email and --password)");
    }
    Ok(())
}

fn print_message(message: &Message) {
    println!(
        "[{}] {}: {}",
        message.created_at.format("%H:%M:%S"),
        message.author_username(),
        message.content
    );
}

async fn chat(app: &ChatApp, session_id: SessionId) -> Result<()> {
    let (session, history) = app.enter_session(session_id).await?;
    println!("== {} ==  (/leave to leave the session, /quit to exit)", session.name);
    for message in &history {
        print_message(message);
    }

    let mut updates = app.messages().watch();
    let printer = tokio::spawn(async move {
        let mut shown = history.len();
        while updates.changed().await.is_ok() {
            let state: MessageState = updates.borrow_and_update().clone();
            if state.messages.len() < shown {
                shown = 0;
            }
            for message in &state.messages[shown..] {
                print_message(message);
            }
            shown = state.messages.len();
            if let Some(error) = &state.error {
                eprintln!("! {error}");
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "/quit" => {
                app.exit_session().await;
                break;
            }
            "/leave" => {
                app.leave_session(session_id).await?;
                info!(%session_id, "left session");
                println!("left {}", session.name);
                break;
            }
            _ => {
                if let Err(err) = app.messages().send_message(&line, session_id).await {
                    warn!(error = %err, "send failed");
                    eprintln!("! {err}");
                }
            }
        }
    }

    printer.abort();
    Ok(())
}
