use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use shared::{
    domain::Table,
    protocol::{OrderBy, Query, Row},
};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/chat.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateAccount {
        email: String,
        password: String,
        username: String,
    },
    CreateSession {
        owner_email: String,
        name: String,
    },
    ListSessions,
}

fn text(row: &Row, key: &str) -> String {
    row.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateAccount {
            email,
            password,
            username,
        } => {
            let account = storage.create_account(&email, &password, &username).await?;
            println!("created profile_id={} username={}", account.profile_id, account.username);
        }
        Command::CreateSession { owner_email, name } => {
            let owner = storage
                .account_by_email(&owner_email)
                .await?
                .ok_or_else(|| anyhow!("no account for {owner_email}"))?;
            let session = storage
                .insert_row(
                    Table::Sessions,
                    json!({ "name": name, "created_by": owner.profile_id.to_string() })
                        .as_object()
                        .cloned()
                        .unwrap_or_default(),
                )
                .await?;
            storage
                .insert_row(
                    Table::SessionParticipants,
                    json!({
                        "session_id": text(&session, "id"),
                        "profile_id": owner.profile_id.to_string(),
                    })
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
                )
                .await?;
            println!("created session_id={}", text(&session, "id"));
        }
        Command::ListSessions => {
            let sessions = storage
                .select_rows(
                    &Query::from(Table::Sessions)
                        .eq("is_active", true)
                        .order_by(OrderBy::desc("created_at")),
                )
                .await?;
            for session in sessions {
                println!(
                    "{}\t{}\t{}",
                    text(&session, "id"),
                    text(&session, "name"),
                    text(&session, "created_at")
                );
            }
        }
    }

    Ok(())
}
