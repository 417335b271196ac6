//! UIC ↔ ticker mapping

use crate::errors::{Result, StreamError};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct Maps {
    by_uic: HashMap<i64, String>,
    by_ticker: HashMap<String, i64>,
}

impl Maps {
    fn insert(&mut self, uic: i64, ticker: String) {
        // Keep the mapping one-to-one: evict whatever either side pointed at.
        if let Some(old_ticker) = self.by_uic.remove(&uic) {
            self.by_ticker.remove(&old_ticker);
        }
        if let Some(old_uic) = self.by_ticker.remove(&ticker) {
            self.by_uic.remove(&old_uic);
        }
        self.by_uic.insert(uic, ticker.clone());
        self.by_ticker.insert(ticker, uic);
    }
}

/// Bidirectional instrument table
#[derive(Debug, Default)]
pub struct InstrumentMap {
    maps: RwLock<Maps>,
}

impl InstrumentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole table
    pub fn register<I, S>(&self, instruments: I)
    where
        I: IntoIterator<Item = (i64, S)>,
        S: Into<String>,
    {
        let mut rebuilt = Maps::default();
        for (uic, ticker) in instruments {
            rebuilt.insert(uic, ticker.into());
        }
        debug!("Instrument map rebuilt with {} entries", rebuilt.by_uic.len());
        *self.maps.write().unwrap_or_else(|e| e.into_inner()) = rebuilt;
    }

    /// Add or move a single mapping
    pub fn insert(&self, uic: i64, ticker: impl Into<String>) {
        self.maps
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(uic, ticker.into());
    }

    pub fn ticker(&self, uic: i64) -> Option<String> {
        self.maps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_uic
            .get(&uic)
            .cloned()
    }

    pub fn uic(&self, ticker: &str) -> Option<i64> {
        self.maps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_ticker
            .get(ticker)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.maps.read().unwrap_or_else(|e| e.into_inner()).by_uic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve tickers or raw numeric UICs, dropping duplicates.
    ///
    /// Order of first appearance is kept.
    pub fn resolve<S: AsRef<str>>(&self, identifiers: &[S]) -> Result<Vec<i64>> {
        let maps = self.maps.read().unwrap_or_else(|e| e.into_inner());
        let mut uics: Vec<i64> = Vec::with_capacity(identifiers.len());

        for identifier in identifiers {
            let identifier = identifier.as_ref().trim();
            let uic = match maps.by_ticker.get(identifier) {
                Some(uic) => *uic,
                None => identifier
                    .parse::<i64>()
                    .map_err(|_| StreamError::UnknownInstrument(identifier.to_string()))?,
            };
            if !uics.contains(&uic) {
                uics.push(uic);
            }
        }

        Ok(uics)
    }
}
