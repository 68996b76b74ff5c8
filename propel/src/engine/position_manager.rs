use crate::engine::price::PriceTick;
use fnv::FnvHashMap;
use parking_lot::RwLock;
use propel_execution::{AccountId, PositionId, position::Position};
use smol_str::SmolStr;
use std::collections::HashSet;

/// In-memory store of open positions with secondary indexes by account and symbol.
///
/// The primary map and both indexes are maintained atomically under one lock: no observer
/// can see a position without its index entries or vice versa.
#[derive(Debug, Default)]
pub struct PositionManager {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    positions: FnvHashMap<PositionId, Position>,
    by_account: FnvHashMap<AccountId, HashSet<PositionId>>,
    by_symbol: FnvHashMap<SmolStr, HashSet<PositionId>>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an open position, maintaining both secondary indexes.
    pub fn add(&self, position: Position) {
        let mut inner = self.inner.write();
        inner
            .by_account
            .entry(position.account_id)
            .or_default()
            .insert(position.id);
        inner
            .by_symbol
            .entry(position.symbol.clone())
            .or_default()
            .insert(position.id);
        inner.positions.insert(position.id, position);
    }

    /// Remove a position, clearing its index entries. Returns the removed position.
    pub fn remove(&self, id: PositionId) -> Option<Position> {
        let mut inner = self.inner.write();
        let position = inner.positions.remove(&id)?;

        if let Some(set) = inner.by_account.get_mut(&position.account_id) {
            set.remove(&id);
            if set.is_empty() {
                inner.by_account.remove(&position.account_id);
            }
        }
        if let Some(set) = inner.by_symbol.get_mut(&position.symbol) {
            set.remove(&id);
            if set.is_empty() {
                inner.by_symbol.remove(&position.symbol);
            }
        }

        Some(position)
    }

    /// Snapshot of a single position.
    pub fn get(&self, id: PositionId) -> Option<Position> {
        self.inner.read().positions.get(&id).cloned()
    }

    /// Replace a stored position (eg/ after a partial close or TP/SL edit).
    ///
    /// The symbol and account of a position never change, so indexes are untouched.
    pub fn update(&self, position: Position) {
        self.inner.write().positions.insert(position.id, position);
    }

    /// All open positions for an account.
    pub fn get_by_account(&self, account_id: AccountId) -> Vec<Position> {
        let inner = self.inner.read();
        inner
            .by_account
            .get(&account_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.positions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All open positions on a symbol.
    pub fn get_by_symbol(&self, symbol: &str) -> Vec<Position> {
        let inner = self.inner.read();
        inner
            .by_symbol
            .get(symbol)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.positions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of every open position.
    pub fn all(&self) -> Vec<Position> {
        self.inner.read().positions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().positions.is_empty()
    }

    /// Re-mark every position on the symbol from an accepted tick, recomputing unrealized
    /// PnL. LONG marks at the derived bid, SHORT at the derived ask.
    ///
    /// Returns `(position, account)` pairs of the re-marked positions for downstream
    /// liquidation-warning checks and client fan-out.
    pub fn update_price_for_symbol(&self, tick: &PriceTick) -> Vec<(PositionId, AccountId)> {
        let mut inner = self.inner.write();
        let Some(ids) = inner.by_symbol.get(&tick.symbol).cloned() else {
            return Vec::new();
        };

        let mut marked = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(position) = inner.positions.get_mut(&id) {
                position.mark(tick.close_price(position.side));
                marked.push((id, position.account_id));
            }
        }
        marked
    }

    /// Whether the indexes agree with the primary map. Test / debug assertion support.
    pub fn indexes_consistent(&self) -> bool {
        let inner = self.inner.read();

        let account_indexed = inner
            .by_account
            .values()
            .flat_map(|set| set.iter())
            .all(|id| inner.positions.contains_key(id));
        let symbol_indexed = inner
            .by_symbol
            .values()
            .flat_map(|set| set.iter())
            .all(|id| inner.positions.contains_key(id));
        let primary_indexed = inner.positions.values().all(|position| {
            inner
                .by_account
                .get(&position.account_id)
                .is_some_and(|set| set.contains(&position.id))
                && inner
                    .by_symbol
                    .get(&position.symbol)
                    .is_some_and(|set| set.contains(&position.id))
        });

        account_indexed && symbol_indexed && primary_indexed
    }
}
