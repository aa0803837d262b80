//! Bank directory loaded from the network config.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("failed to read network config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid network config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Bank {
    pub id: String,
    pub name: String,
    pub bic: String,
}

#[derive(Debug, Deserialize)]
struct NetworkConfig {
    #[serde(default)]
    banks: Vec<Bank>,
}

/// BIC to bank id, and bank id to bank.
#[derive(Debug, Clone, Default)]
pub struct BankDirectory {
    by_bic: HashMap<String, String>,
    by_id: HashMap<String, Bank>,
}

impl BankDirectory {
    pub fn from_json(raw: &str) -> Result<Self, DirectoryError> {
        let config: NetworkConfig = serde_json::from_str(raw)?;
        Ok(Self::from_banks(config.banks))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_banks(banks: impl IntoIterator<Item = Bank>) -> Self {
        let mut directory = Self::default();
        for bank in banks {
            directory.by_bic.insert(bank.bic.clone(), bank.id.clone());
            directory.by_id.insert(bank.id.clone(), bank);
        }
        directory
    }

    /// Bank id for `bic`; unknown BICs pass through unchanged.
    pub fn bank_id<'a>(&'a self, bic: &'a str) -> &'a str {
        self.by_bic.get(bic).map(String::as_str).unwrap_or(bic)
    }

    pub fn bank(&self, id: &str) -> Option<&Bank> {
        self.by_id.get(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
