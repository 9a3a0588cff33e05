// ============================================================================
// gatepass-db — CLI database inspection and bootstrap tool for Gatepass
// ============================================================================
// Usage:
//   gatepass-db stats                         Show database statistics
//   gatepass-db list-links                    List access links
//   gatepass-db export --format json          Export full database as JSON
//   gatepass-db add-owner <USER_ID>           Bootstrap an owner
//   gatepass-db add-mod <USER_ID>             Bootstrap a moderator
//   gatepass-db credit <USER_ID> <AMOUNT>     Credit a balance manually
// ============================================================================

use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use gatepass_core::GateDb;

/// Gatepass database inspection and bootstrap tool
#[derive(Parser)]
#[command(name = "gatepass-db", version, about = "Inspect and manage the Gatepass database")]
struct Cli {
    /// Path to the database file (default: ./gatepass.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show database statistics (users, links, tokens, roles)
    Stats,

    /// List access links
    ListLinks,

    /// Export full database contents as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Add a user to the owners table (role bootstrap)
    AddOwner { user_id: u64 },

    /// Add a user to the moderators table
    AddMod { user_id: u64 },

    /// Credit a user's balance manually (support operations)
    Credit { user_id: u64, amount: u64 },
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {ts})"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let db = GateDb::open(cli.db_path.as_deref())?;

    match cli.command {
        Commands::Stats => cmd_stats(&db),
        Commands::ListLinks => cmd_list_links(&db),
        Commands::Export { format } => cmd_export(&db, &format),
        Commands::AddOwner { user_id } => {
            db.add_owner(user_id)?;
            println!("Added owner {user_id}");
            Ok(())
        }
        Commands::AddMod { user_id } => {
            db.add_moderator(user_id)?;
            println!("Added moderator {user_id}");
            Ok(())
        }
        Commands::Credit { user_id, amount } => {
            let balance = db.credit(user_id, amount)?;
            println!("Credited {amount} stars to user {user_id} (balance: {balance})");
            Ok(())
        }
    }
}

fn cmd_stats(db: &GateDb) -> Result<()> {
    let stats = db.stats()?;

    println!("=== Gatepass Database Stats ===");
    println!("Database: {}", db.path().display());
    println!();
    println!("Users:      {}", stats.total_users);
    println!("Links:      {}", stats.total_links);
    for (owner, count) in &stats.links_by_owner {
        println!("  owner {:<12} {}", owner, count);
    }
    println!(
        "Tokens:     {} total, {} redeemed",
        stats.total_tokens, stats.redeemed_tokens
    );
    println!("Moderators: {}", stats.total_moderators);
    println!("Owners:     {}", stats.total_owners);

    Ok(())
}

fn cmd_list_links(db: &GateDb) -> Result<()> {
    let links = db.list_links()?;

    if links.is_empty() {
        println!("No links found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<14}  {:>6}  {:<12}  {:<22}  {}",
        "CODE", "ENTITY", "PRICE", "OWNER", "CREATED AT", "DISPLAY LINK"
    );
    println!("{}", "-".repeat(90));

    for link in &links {
        println!(
            "{:<8}  {:<14}  {:>6}  {:<12}  {:<22}  {}",
            link.short_code,
            link.entity_id,
            link.price,
            link.owner_id,
            format_timestamp(link.created_at),
            link.display_link
        );
    }

    println!("\nTotal: {} links", links.len());
    Ok(())
}

fn cmd_export(db: &GateDb, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let stats = db.stats()?;
    let links = db.list_links()?;

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": stats,
        "links": links,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}
