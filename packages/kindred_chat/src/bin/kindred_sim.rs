use anyhow::{Context, Result};
use clap::Parser;
use kindred_chat::{
    ChatSession, FileConfig, MatchId, MemoryBackend, SessionConfig, Table, UserId, load_config,
    logging,
};
use kindred_realtime::MemoryHub;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "kindred-sim")]
#[command(about = "Simulate two matched users chatting over an in-memory hub")]
struct Args {
    /// Messages each side sends
    #[arg(short, long, default_value = "5")]
    messages: usize,

    /// Directory containing kindred.toml (defaults to the current directory)
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Log level for kindred crates when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_tracing(&args.log_level);

    let config_dir = match args.config_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };
    let file_config: FileConfig = load_config(&config_dir)
        .extract()
        .context("Failed to load kindred config")?;
    let config = SessionConfig::from_file(&file_config);

    let hub = MemoryHub::new();
    let backend = Arc::new(MemoryBackend::with_hub(hub.clone()));
    let (alice, bob) = (UserId::new(), UserId::new());
    for (id, name) in [(alice, "Alice"), (bob, "Bob")] {
        backend
            .seed(Table::Profiles, json!({"id": id.to_string(), "display_name": name}))
            .await;
    }
    let match_id = MatchId::new();
    backend
        .seed(
            Table::Matches,
            json!({
                "id": match_id.to_string(),
                "user_a_id": alice.to_string(),
                "user_b_id": bob.to_string(),
            }),
        )
        .await;

    let session =
        |me: UserId| ChatSession::new(me, config.clone(), Arc::new(hub.clone()), backend.clone());
    let (alice_session, bob_session) = (session(alice), session(bob));
    alice_session.start().await?;
    bob_session.start().await?;

    let conversation = alice_session
        .store()
        .conversation_for_match(match_id)
        .await?;
    info!("Match {} opened conversation {}", match_id, conversation);
    alice_session.open_conversation(conversation).await?;

    for n in 1..=args.messages {
        for _ in 0..3 {
            alice_session.keystroke(conversation).await?;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        info!(
            "Bob sees Alice typing: {}",
            bob_session.is_typing(conversation, alice).await
        );
        alice_session
            .send(conversation, &format!("message {} from Alice", n))
            .await?;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    info!(
        "Bob has {} unread before opening",
        bob_session.store().unread_count(conversation).await
    );

    let thread = bob_session.open_conversation(conversation).await?;
    for n in 1..=args.messages {
        bob_session
            .send(conversation, &format!("reply {} from Bob", n))
            .await?;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!("Bob opened a thread of {} message(s)", thread.len());
    for (name, session) in [("Alice", &alice_session), ("Bob", &bob_session)] {
        for summary in session.store().conversations().await {
            println!(
                "{}: chat with {} | unread {} | last: {}",
                name,
                summary.counterpart.display_name,
                summary.unread_count,
                summary
                    .last_message
                    .as_ref()
                    .map(|m| m.content.as_str())
                    .unwrap_or("-"),
            );
        }
        println!(
            "{}: {} message(s) cached, {} online",
            name,
            session.store().messages(conversation).await.len(),
            session.presence().online_users().await.len(),
        );
    }

    alice_session.stop().await;
    bob_session.stop().await;
    Ok(())
}
