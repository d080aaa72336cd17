//! Output formatting helpers.

use stowage_core::{CacheEntry, EngineState, SyncEvent};

use crate::models::InventoryItem;

/// Width of the name column in listings
const NAME_COLUMN_WIDTH: usize = 32;

/// Truncate a string to a maximum length, adding ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}

/// Hide all but the last four characters of a token.
pub fn masked_token(token: &str) -> String {
    let count = token.chars().count();
    if count <= 4 {
        return "*".repeat(count);
    }
    let tail: String = token.chars().skip(count - 4).collect();
    format!("{}{}", "*".repeat(count - 4), tail)
}

pub fn item_row(entry: &CacheEntry<InventoryItem>) -> String {
    let item = &entry.value;
    format!(
        "{}  {:<8} {:>5}  {:<width$}  {}",
        item.id,
        item.inventory.display_name(),
        item.quantity,
        truncate_string(&item.name, NAME_COLUMN_WIDTH),
        entry.age_display(),
        width = NAME_COLUMN_WIDTH
    )
}

pub fn engine_state(state: EngineState) -> &'static str {
    match state {
        EngineState::Open => "syncing",
        EngineState::Latched => "halted",
        EngineState::Probing => "probing",
    }
}

pub fn event_line(event: &SyncEvent) -> String {
    match event {
        SyncEvent::SyncFailed {
            message, reason, ..
        } => format!("sync failed for {}: {} ({})", event.endpoint(), message, reason),
        SyncEvent::SyncHalted { endpoint, errors } => {
            format!("sync halted for {} after {} errors", endpoint, errors)
        }
        SyncEvent::SyncResumed { endpoint } => format!("sync resumed for {}", endpoint),
    }
}
