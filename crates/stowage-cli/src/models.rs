//! Entities managed by the command line host.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use stowage_core::Entity;

/// Endpoint (and cache-key prefix) for inventory items
pub const INVENTORY_ITEM_ENDPOINT: &str = "item";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Inventory {
    /// Everyday carry
    Edc,
    GoBag,
    Storage,
}

impl Inventory {
    pub fn display_name(&self) -> &'static str {
        match self {
            Inventory::Edc => "EDC",
            Inventory::GoBag => "Go bag",
            Inventory::Storage => "Storage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    #[serde(default)]
    pub id: String,
    pub inventory: Inventory,
    pub name: String,
    pub quantity: u32,
}

impl Entity for InventoryItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_wire_names() {
        let item = InventoryItem {
            id: "a".to_string(),
            inventory: Inventory::GoBag,
            name: "Water filter".to_string(),
            quantity: 1,
        };
        let json = serde_json::to_value(&item).expect("json");
        assert_eq!(json["inventory"], "GO_BAG");

        let parsed: InventoryItem =
            serde_json::from_str(r#"{"inventory": "EDC", "name": "Knife", "quantity": 2}"#)
                .expect("parse");
        assert_eq!(parsed.id, "");
        assert_eq!(parsed.inventory, Inventory::Edc);
    }
}
