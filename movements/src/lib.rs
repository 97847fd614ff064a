//! Balance-movement pagination over a per-version balance series.
//!
//! The input series carries one sample per version that touched the
//! account. Runs with an unchanged (balance, unlocked, locked) triple are
//! collapsed to their first sample, the series is cut at the latest stable
//! version, and pages are addressed by version-valued cursors that work
//! symmetrically in both directions. Output is always in ascending version
//! order regardless of traversal direction.

use core_types::types::{Version, COIN_SCALE};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Asc,
    Desc,
}

/// One sample of an account's balances, in micro-units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSample {
    pub timestamp: u64,
    pub version: Version,
    pub balance: u64,
    pub unlocked: u64,
    pub locked: u64,
}

/// One page entry, balances and deltas scaled to whole coins.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Movement {
    pub version: Version,
    pub timestamp: u64,
    pub balance: f64,
    pub locked_balance: f64,
    /// Change against the previous sample of the deduplicated series; the
    /// very first sample has no predecessor, so this is the absolute
    /// balance.
    pub amount: f64,
    pub unlocked_amount: f64,
    pub locked_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovementsPage {
    /// Length of the deduplicated series, not of this page.
    pub total: usize,
    pub has_more: bool,
    pub prev_cursor: Option<String>,
    pub movements: Vec<Movement>,
}

impl MovementsPage {
    fn empty() -> Self {
        Self {
            total: 0,
            has_more: false,
            prev_cursor: None,
            movements: Vec::new(),
        }
    }
}

/// Collapse runs of samples whose balance triple did not change, keeping
/// the first sample of each run.
pub fn dedup_series(samples: &[BalanceSample]) -> Vec<BalanceSample> {
    let mut out: Vec<BalanceSample> = Vec::with_capacity(samples.len());
    for sample in samples {
        let same = out.last().is_some_and(|prev| {
            prev.balance == sample.balance
                && prev.unlocked == sample.unlocked
                && prev.locked == sample.locked
        });
        if !same {
            out.push(*sample);
        }
    }
    out
}

/// Page through an already-deduplicated series.
///
/// `cursor` is the version the previous page ended at; ascending reads
/// continue strictly after it, descending reads strictly before it.
pub fn paginate(
    series: &[BalanceSample],
    latest_stable_version: Version,
    page_size: usize,
    cursor: Option<Version>,
    direction: Direction,
) -> MovementsPage {
    // Samples are version-ascending, so the stable cut is a truncation.
    let stable_len = series.partition_point(|s| s.version <= latest_stable_version);
    let visible = &series[..stable_len];
    if visible.is_empty() {
        return MovementsPage::empty();
    }
    let len = visible.len();

    let (start, end, prev_index, has_more) = match direction {
        Direction::Asc => {
            let start = match cursor {
                Some(cursor) => visible.partition_point(|s| s.version <= cursor),
                None => 0,
            };
            let end = len.min(start + page_size);
            let prev_index = start
                .checked_sub(page_size + 1)
                .filter(|prev| *prev != start);
            (start, end, prev_index, end != len)
        }
        Direction::Desc => {
            let end = match cursor {
                Some(cursor) => visible.partition_point(|s| s.version < cursor),
                None => len,
            };
            let start = end.saturating_sub(page_size);
            let prev = end + page_size;
            let prev_index = (prev < len && prev != start).then_some(prev);
            (start, end, prev_index, start != 0)
        }
    };

    let movements = (start..end).map(|pos| movement_at(series, pos)).collect();

    MovementsPage {
        total: series.len(),
        has_more,
        prev_cursor: prev_index.map(|prev| visible[prev].version.to_string()),
        movements,
    }
}

fn movement_at(series: &[BalanceSample], pos: usize) -> Movement {
    let sample = &series[pos];
    let (amount, unlocked_amount, locked_amount) = match pos {
        0 => (
            sample.balance as f64,
            sample.unlocked as f64,
            sample.locked as f64,
        ),
        _ => {
            let prev = &series[pos - 1];
            (
                sample.balance as f64 - prev.balance as f64,
                sample.unlocked as f64 - prev.unlocked as f64,
                sample.locked as f64 - prev.locked as f64,
            )
        }
    };
    Movement {
        version: sample.version,
        timestamp: sample.timestamp,
        balance: sample.balance as f64 / COIN_SCALE,
        locked_balance: sample.locked as f64 / COIN_SCALE,
        amount: amount / COIN_SCALE,
        unlocked_amount: unlocked_amount / COIN_SCALE,
        locked_amount: locked_amount / COIN_SCALE,
    }
}
