//! Tick-indexed transaction receipts
//!
//! Receipts accumulate for the current tick; [`ReceiptHistory::next_tick`]
//! seals them. Only the most recent `history_size` sealed ticks are kept.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub tx_hash: String,
    pub result: Option<serde_json::Value>,
    pub errors: Vec<String>,
}

impl Receipt {
    pub fn success(tx_hash: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            result: Some(result),
            errors: Vec::new(),
        }
    }

    pub fn failure(tx_hash: impl Into<String>, error: impl ToString) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            result: None,
            errors: vec![error.to_string()],
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// One receipt tagged with the tick it was recorded in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptEntry {
    pub tx_hash: String,
    pub tick: u64,
    pub result: Option<serde_json::Value>,
    pub errors: Vec<String>,
}

/// Receipts for the half-open range `[start_tick, end_tick)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptList {
    pub start_tick: u64,
    pub end_tick: u64,
    pub receipts: Vec<ReceiptEntry>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReceiptError {
    #[error("tick {requested} has not been sealed yet (current tick is {current})")]
    FutureTick { requested: u64, current: u64 },
    #[error("tick {requested} is older than the {history_size} ticks kept")]
    Evicted { requested: u64, history_size: u64 },
}

#[derive(Debug, Clone)]
pub struct ReceiptHistory {
    current_tick: u64,
    history_size: u64,
    pending: Vec<Receipt>,
    sealed: BTreeMap<u64, Vec<Receipt>>,
}

impl ReceiptHistory {
    pub fn new(history_size: u64) -> Self {
        Self {
            current_tick: 0,
            history_size,
            pending: Vec::new(),
            sealed: BTreeMap::new(),
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    pub fn history_size(&self) -> u64 {
        self.history_size
    }

    pub fn add_receipt(&mut self, receipt: Receipt) {
        self.pending.push(receipt);
    }

    /// Drops receipts recorded for the current tick without sealing them.
    pub fn discard_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Seals the current tick and starts the next one.
    pub fn next_tick(&mut self) {
        let receipts = std::mem::take(&mut self.pending);
        self.sealed.insert(self.current_tick, receipts);
        self.current_tick += 1;
        let oldest = self.oldest_kept();
        self.sealed = self.sealed.split_off(&oldest);
    }

    fn oldest_kept(&self) -> u64 {
        self.current_tick.saturating_sub(self.history_size)
    }

    pub fn receipts_for_tick(&self, tick: u64) -> Result<&[Receipt], ReceiptError> {
        if tick >= self.current_tick {
            return Err(ReceiptError::FutureTick {
                requested: tick,
                current: self.current_tick,
            });
        }
        if tick < self.oldest_kept() {
            return Err(ReceiptError::Evicted {
                requested: tick,
                history_size: self.history_size,
            });
        }
        Ok(self.sealed.get(&tick).map(Vec::as_slice).unwrap_or(&[]))
    }

    /// Every kept receipt from `start_tick` up to the current tick. The
    /// start is clamped into the kept window; a start in the future yields
    /// an empty range ending at the current tick.
    pub fn list(&self, start_tick: u64) -> ReceiptList {
        let end_tick = self.current_tick;
        let start_tick = start_tick.clamp(self.oldest_kept(), end_tick);
        let receipts = (start_tick..end_tick)
            .filter_map(|tick| Some((tick, self.receipts_for_tick(tick).ok()?)))
            .flat_map(|(tick, receipts)| {
                receipts.iter().map(move |receipt| ReceiptEntry {
                    tx_hash: receipt.tx_hash.clone(),
                    tick,
                    result: receipt.result.clone(),
                    errors: receipt.errors.clone(),
                })
            })
            .collect();
        ReceiptList {
            start_tick,
            end_tick,
            receipts,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn history_with_ticks(size: u64, ticks: u64) -> ReceiptHistory {
        let mut history = ReceiptHistory::new(size);
        for tick in 0..ticks {
            history.add_receipt(Receipt::success(format!("tx-{tick}"), json!(tick)));
            history.next_tick();
        }
        history
    }

    #[test]
    fn test_list_covers_kept_window() {
        let history = history_with_ticks(10, 4);
        let list = history.list(0);
        assert_eq!((list.start_tick, list.end_tick), (0, 4));
        let ticks: Vec<u64> = list.receipts.iter().map(|r| r.tick).collect();
        assert_eq!(ticks, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_list_clamps_to_history_size() {
        let history = history_with_ticks(3, 10);
        let list = history.list(0);
        assert_eq!((list.start_tick, list.end_tick), (7, 10));
        assert_eq!(list.receipts.len(), 3);
        assert_eq!(list.receipts[0].tx_hash, "tx-7");

        let narrowed = history.list(9);
        assert_eq!(narrowed.start_tick, 9);
        assert_eq!(narrowed.receipts.len(), 1);
    }

    #[test]
    fn test_future_start_is_empty() {
        let history = history_with_ticks(3, 5);
        let list = history.list(50);
        assert_eq!((list.start_tick, list.end_tick), (5, 5));
        assert!(list.receipts.is_empty());
    }

    #[test]
    fn test_receipts_for_tick_bounds() {
        let history = history_with_ticks(2, 5);
        assert_eq!(history.receipts_for_tick(4).unwrap().len(), 1);
        assert_eq!(
            history.receipts_for_tick(5),
            Err(ReceiptError::FutureTick {
                requested: 5,
                current: 5
            })
        );
        assert!(matches!(
            history.receipts_for_tick(2),
            Err(ReceiptError::Evicted { .. })
        ));
    }

    #[test]
    fn test_failed_receipt_serializes_camel_case() {
        let receipt = Receipt::failure("0xabc", "entity 4 not found");
        assert!(!receipt.is_success());
        let value = serde_json::to_value(&receipt).unwrap();
        assert_eq!(value["txHash"], "0xabc");
        assert_eq!(value["errors"][0], "entity 4 not found");
    }
}
