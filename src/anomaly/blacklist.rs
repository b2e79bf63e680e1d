use std::collections::HashMap;

use crate::config::{is_hex_address, SuspiciousContractConfig};

/// In-memory set of flagged addresses, keyed by lowercase hex.
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    by_address: HashMap<String, Option<String>>,
}

impl Blacklist {
    /// Configured addresses plus the optional CSV file.
    pub fn load(config: &SuspiciousContractConfig) -> eyre::Result<Self> {
        let mut list = Self::default();
        for address in &config.blacklist {
            list.insert(address, None);
        }
        if let Some(path) = &config.blacklist_path {
            list.extend_from_csv(path)?;
        }
        tracing::info!(addresses = list.len(), "Loaded contract blacklist");
        Ok(list)
    }

    /// Parse an `address[,label]` CSV with a header row. Rows without a valid
    /// address are skipped.
    pub fn extend_from_csv(&mut self, path: &str) -> eyre::Result<usize> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(|e| eyre::eyre!("Failed to open blacklist CSV '{}': {}", path, e))?;

        let mut count = 0;
        for result in reader.records() {
            let record = result?;
            let address = record.get(0).unwrap_or("").trim();
            let label = record
                .get(1)
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string);

            if !self.insert(address, label) {
                tracing::warn!(address = %address, path = %path, "Invalid blacklist entry, skipping");
                continue;
            }
            count += 1;
        }
        Ok(count)
    }

    pub fn insert(&mut self, address: &str, label: Option<String>) -> bool {
        if !is_hex_address(address) {
            return false;
        }
        self.by_address.insert(address.to_lowercase(), label);
        true
    }

    pub fn contains(&self, address: &str) -> bool {
        self.by_address.contains_key(&address.to_lowercase())
    }

    pub fn label(&self, address: &str) -> Option<&str> {
        self.by_address
            .get(&address.to_lowercase())
            .and_then(|l| l.as_deref())
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}
