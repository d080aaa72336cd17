//! Command implementations.

use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Subcommand;
use stowage_core::auth::TokenStore;
use stowage_core::{Config, Registry, Repository, SyncEvent};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::Instant;
use tracing::info;

use crate::format::{engine_state, event_line, item_row, masked_token};
use crate::models::{Inventory, InventoryItem, INVENTORY_ITEM_ENDPOINT};

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Add an item
    Add {
        name: String,
        #[arg(short, long, default_value_t = 1)]
        quantity: u32,
        #[arg(short, long, value_enum, default_value_t = Inventory::Storage)]
        inventory: Inventory,
    },
    /// List all items
    List,
    /// Show one item as JSON
    Get { id: String },
    /// Change an item
    Update {
        id: String,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        quantity: Option<u32>,
        #[arg(short, long, value_enum)]
        inventory: Option<Inventory>,
    },
    /// Delete an item
    Delete { id: String },
    /// Send pending changes to the server
    Sync {
        /// Give up after this many seconds
        #[arg(short, long, default_value_t = 30)]
        timeout: u64,
    },
    /// Show pending changes and sync state
    Status,
    /// Clear a halted sync and try once more
    Reset,
    /// Show the effective settings
    Config {
        /// Also write them to the config file
        #[arg(long)]
        save: bool,
    },
    /// Store an API token in the OS keychain
    Login { token: String },
    /// Remove the stored API token
    Logout,
}

pub async fn run(command: Command, config: &Config, registry: &Registry) -> Result<()> {
    match command {
        Command::Login { token } => {
            TokenStore::store(&config.api_root, &token)?;
            println!("Token stored for {}", config.api_root);
            return Ok(());
        }
        Command::Logout => {
            TokenStore::delete(&config.api_root)?;
            println!("Token removed for {}", config.api_root);
            return Ok(());
        }
        Command::Config { save } => {
            let mut shown = config.clone();
            shown.token = shown.token.as_deref().map(masked_token);
            println!("{}", serde_json::to_string_pretty(&shown)?);
            if save {
                config.save()?;
                println!("Saved to {}", Config::config_path()?.display());
            }
            return Ok(());
        }
        _ => {}
    }

    let items = registry.get_repository::<InventoryItem>(INVENTORY_ITEM_ENDPOINT)?;

    match command {
        Command::Add {
            name,
            quantity,
            inventory,
        } => {
            let item = items.create(InventoryItem {
                id: String::new(),
                inventory,
                name,
                quantity,
            });
            println!("{}", item.id);
        }
        Command::List => {
            let mut entries = items.entries();
            entries.sort_by(|a, b| a.value.name.to_lowercase().cmp(&b.value.name.to_lowercase()));
            for entry in &entries {
                println!("{}", item_row(entry));
            }
            if entries.is_empty() {
                println!("No items");
            }
        }
        Command::Get { id } => {
            let entry = items
                .find_entry(&id)
                .ok_or_else(|| anyhow!("No item with id {}", id))?;
            println!("{}", serde_json::to_string_pretty(&entry.value)?);
            println!("Stored locally {}", entry.age_display());
        }
        Command::Update {
            id,
            name,
            quantity,
            inventory,
        } => {
            let mut item = items
                .find_by_id(&id)
                .ok_or_else(|| anyhow!("No item with id {}", id))?;
            if let Some(name) = name {
                item.name = name;
            }
            if let Some(quantity) = quantity {
                item.quantity = quantity;
            }
            if let Some(inventory) = inventory {
                item.inventory = inventory;
            }
            items.update(&id, item);
        }
        Command::Delete { id } => {
            items.delete(&id);
        }
        Command::Status => {
            println!("Endpoint:  {}", items.endpoint());
            println!("Items:     {}", items.find_all().len());
            println!("Pending:   {}", items.pending_actions());
            println!("Sync:      {}", engine_state(items.engine_state()));
        }
        Command::Sync { timeout } => {
            sync_until_settled(registry, &items, config.sync.interval(), Duration::from_secs(timeout)).await;
        }
        Command::Reset => {
            if !items.reset_sync() {
                println!("Sync was not halted");
            }
            let mut events = registry.notifier().subscribe();
            let report = items.flush_now().await;
            print_events(&mut events);
            println!(
                "Sent {}, {} pending, sync {}",
                report.sent,
                items.pending_actions(),
                engine_state(items.engine_state())
            );
        }
        Command::Config { .. } | Command::Login { .. } | Command::Logout => {}
    }

    Ok(())
}

/// Flush repeatedly until the queue drains, stopping early on a latch or timeout.
async fn sync_until_settled(
    registry: &Registry,
    items: &Repository<InventoryItem>,
    period: Duration,
    timeout: Duration,
) {
    let mut events = registry.notifier().subscribe();
    let deadline = Instant::now() + timeout;
    info!(pending = items.pending_actions(), "Syncing");

    loop {
        let report = items.flush_now().await;
        print_events(&mut events);

        if items.pending_actions() == 0 {
            println!("All changes synced");
            break;
        }
        if report.halted || report.latched {
            println!(
                "Sync halted with {} pending changes (`stowage reset` retries now)",
                items.pending_actions()
            );
            break;
        }
        if Instant::now() >= deadline {
            println!("Timed out with {} pending changes", items.pending_actions());
            break;
        }
        tokio::time::sleep(period).await;
    }
}

fn print_events(events: &mut broadcast::Receiver<SyncEvent>) {
    loop {
        match events.try_recv() {
            Ok(event) => eprintln!("{}", event_line(&event)),
            Err(TryRecvError::Lagged(missed)) => eprintln!("({} sync events missed)", missed),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
}
