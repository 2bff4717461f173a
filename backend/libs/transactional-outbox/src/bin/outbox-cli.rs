use std::env;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use transactional_outbox::SqlxOutboxRepository;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage:");
        eprintln!("  outbox-cli replay-since <rfc3339_ts> <DATABASE_URL>");
        eprintln!("  outbox-cli replay-failed <DATABASE_URL>");
        eprintln!("  outbox-cli failed <DATABASE_URL> [limit]");
        std::process::exit(1);
    }

    let cmd = args[1].as_str();

    match cmd {
        "replay-since" if args.len() == 4 => {
            let ts: DateTime<Utc> = DateTime::parse_from_rfc3339(&args[2])?.with_timezone(&Utc);
            let pool = PgPool::connect(&args[3]).await?;
            let repo = SqlxOutboxRepository::new(pool);
            let count = repo.replay_since(ts).await?;
            println!("Replayed {} events since {}", count, ts);
        }
        "replay-failed" if args.len() == 3 => {
            let pool = PgPool::connect(&args[2]).await?;
            let repo = SqlxOutboxRepository::new(pool);
            let count = repo.replay_failed().await?;
            println!("Re-queued {} failed events", count);
        }
        "failed" if args.len() == 3 || args.len() == 4 => {
            let limit: i64 = match args.get(3) {
                Some(raw) => raw.parse()?,
                None => 50,
            };
            let pool = PgPool::connect(&args[2]).await?;
            let repo = SqlxOutboxRepository::new(pool);
            for event in repo.list_failed(limit).await? {
                println!(
                    "{}\t{}\t{}\tretries={}\t{}",
                    event.id,
                    event.event_type,
                    event.created_at.to_rfc3339(),
                    event.retry_count,
                    event.last_error.unwrap_or_default()
                );
            }
        }
        _ => {
            eprintln!("Invalid arguments");
            std::process::exit(1);
        }
    }

    Ok(())
}
