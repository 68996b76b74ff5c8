use crate::engine::price::PriceTick;
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use propel_execution::{AccountId, PositionId, Side, position::Position, trade::CloseReason};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::sync::Arc;

/// Kind of price trigger attached to a position.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
pub enum TriggerKind {
    Tp,
    Sl,
    /// Forced close. Lives in the stop sequences with priority over a user stop at the
    /// same price.
    Liq,
}

impl TriggerKind {
    /// Close reason recorded when this trigger fires.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            TriggerKind::Tp => CloseReason::TakeProfit,
            TriggerKind::Sl => CloseReason::StopLoss,
            TriggerKind::Liq => CloseReason::Liquidation,
        }
    }

    /// Priority when several triggers fire for one position on the same tick (higher wins).
    fn priority(&self) -> u8 {
        match self {
            TriggerKind::Liq => 2,
            TriggerKind::Sl => 1,
            TriggerKind::Tp => 0,
        }
    }
}

/// Entry in a per-symbol sorted trigger sequence.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct TriggerEntry {
    pub position_id: PositionId,
    pub account_id: AccountId,
    pub side: Side,
    pub kind: TriggerKind,
    pub price: Decimal,
}

/// A trigger that fired on a tick, carrying the exit price derived from that tick.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredTrigger {
    pub entry: TriggerEntry,
    pub exit_price: Decimal,
    pub reason: CloseReason,
}

/// The four ordered sequences for one symbol.
///
/// Orderings put the entry that fires at the smallest price move at the head, so a scan can
/// stop at the first non-firing entry (sorted-break invariant):
/// * `long_tp` ascending (fires while `mid ≥ price`)
/// * `long_sl` descending (fires while `mid ≤ price`), LIQ before SL on price ties
/// * `short_tp` descending (fires while `mid ≤ price`)
/// * `short_sl` ascending (fires while `mid ≥ price`), LIQ before SL on price ties
#[derive(Debug, Default)]
struct SymbolTriggers {
    long_tp: Vec<TriggerEntry>,
    long_sl: Vec<TriggerEntry>,
    short_tp: Vec<TriggerEntry>,
    short_sl: Vec<TriggerEntry>,
}

impl SymbolTriggers {
    fn sequence_mut(&mut self, side: Side, kind: TriggerKind) -> &mut Vec<TriggerEntry> {
        match (side, kind) {
            (Side::Long, TriggerKind::Tp) => &mut self.long_tp,
            (Side::Long, _) => &mut self.long_sl,
            (Side::Short, TriggerKind::Tp) => &mut self.short_tp,
            (Side::Short, _) => &mut self.short_sl,
        }
    }

    fn insert(&mut self, entry: TriggerEntry) {
        let ascending = matches!(
            (entry.side, entry.kind),
            (Side::Long, TriggerKind::Tp) | (Side::Short, TriggerKind::Sl | TriggerKind::Liq)
        );
        let sequence = self.sequence_mut(entry.side, entry.kind);

        // Binary search to the insertion point; LIQ sorts ahead of SL at equal price
        let index = sequence.partition_point(|existing| {
            if existing.price != entry.price {
                if ascending {
                    existing.price < entry.price
                } else {
                    existing.price > entry.price
                }
            } else {
                existing.kind.priority() >= entry.kind.priority()
            }
        });
        sequence.insert(index, entry);
    }

    fn remove_position(&mut self, position_id: PositionId) {
        for sequence in [
            &mut self.long_tp,
            &mut self.long_sl,
            &mut self.short_tp,
            &mut self.short_sl,
        ] {
            sequence.retain(|entry| entry.position_id != position_id);
        }
    }

    fn remove_kind(&mut self, position_id: PositionId, side: Side, kind: TriggerKind) {
        self.sequence_mut(side, kind)
            .retain(|entry| !(entry.position_id == position_id && entry.kind == kind));
    }
}

/// Per-symbol sorted TP/SL/liquidation indexes that fire on every accepted price tick.
///
/// Index mutation and the firing scan are serialised through a per-symbol mutex; distinct
/// symbols never contend.
#[derive(Debug, Default)]
pub struct TriggerEngine {
    symbols: RwLock<FnvHashMap<SmolStr, Arc<Mutex<SymbolTriggers>>>>,
}

impl TriggerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn symbol_entry(&self, symbol: &str) -> Arc<Mutex<SymbolTriggers>> {
        if let Some(entry) = self.symbols.read().get(symbol) {
            return Arc::clone(entry);
        }
        Arc::clone(
            self.symbols
                .write()
                .entry(SmolStr::new(symbol))
                .or_default(),
        )
    }

    /// Register a position's TP/SL/LIQ entries. TP and SL entries exist iff the price is
    /// set; the liquidation entry always exists.
    pub fn register(&self, position: &Position) {
        let entry = self.symbol_entry(&position.symbol);
        let mut triggers = entry.lock();

        if let Some(take_profit) = position.take_profit {
            triggers.insert(TriggerEntry {
                position_id: position.id,
                account_id: position.account_id,
                side: position.side,
                kind: TriggerKind::Tp,
                price: take_profit,
            });
        }
        if let Some(stop_loss) = position.stop_loss {
            triggers.insert(TriggerEntry {
                position_id: position.id,
                account_id: position.account_id,
                side: position.side,
                kind: TriggerKind::Sl,
                price: stop_loss,
            });
        }
        triggers.insert(TriggerEntry {
            position_id: position.id,
            account_id: position.account_id,
            side: position.side,
            kind: TriggerKind::Liq,
            price: position.liquidation_price,
        });
    }

    /// Remove every entry for the position (close / breach).
    pub fn deregister(&self, symbol: &str, position_id: PositionId) {
        let entry = self.symbol_entry(symbol);
        entry.lock().remove_position(position_id);
    }

    /// Replace a position's TP or SL entry with a new price (or none).
    pub fn update_tp_sl(
        &self,
        position: &Position,
        kind: TriggerKind,
        new_price: Option<Decimal>,
    ) {
        let entry = self.symbol_entry(&position.symbol);
        let mut triggers = entry.lock();
        triggers.remove_kind(position.id, position.side, kind);

        if let Some(price) = new_price {
            triggers.insert(TriggerEntry {
                position_id: position.id,
                account_id: position.account_id,
                side: position.side,
                kind,
                price,
            });
        }
    }

    /// Scan the four sequences against an accepted tick, collecting every firing entry.
    ///
    /// Scans stop at the first non-firing entry. Entries are NOT removed here: the caller
    /// removes them once the resulting close commits, leaving failed closes to re-fire on
    /// the next tick. If several triggers fire for one position, the highest-priority one
    /// (LIQ > SL > TP) wins.
    pub fn fired(&self, tick: &PriceTick) -> Vec<FiredTrigger> {
        let entry = self.symbol_entry(&tick.symbol);
        let triggers = entry.lock();
        let mid = tick.mid;

        let mut fired: Vec<FiredTrigger> = Vec::new();
        let mut collect = |sequence: &[TriggerEntry], fires: &dyn Fn(Decimal) -> bool| {
            for entry in sequence {
                if !fires(entry.price) {
                    break;
                }
                let exit_price = tick.close_price(entry.side);
                let candidate = FiredTrigger {
                    entry: *entry,
                    exit_price,
                    reason: entry.kind.close_reason(),
                };

                match fired
                    .iter_mut()
                    .find(|existing| existing.entry.position_id == entry.position_id)
                {
                    Some(existing) => {
                        if entry.kind.priority() > existing.entry.kind.priority() {
                            *existing = candidate;
                        }
                    }
                    None => fired.push(candidate),
                }
            }
        };

        collect(&triggers.long_tp, &|price| mid >= price);
        collect(&triggers.long_sl, &|price| mid <= price);
        collect(&triggers.short_tp, &|price| mid <= price);
        collect(&triggers.short_sl, &|price| mid >= price);

        fired
    }

    /// Number of live entries for a symbol across all four sequences.
    pub fn entry_count(&self, symbol: &str) -> usize {
        let entry = self.symbol_entry(symbol);
        let triggers = entry.lock();
        triggers.long_tp.len()
            + triggers.long_sl.len()
            + triggers.short_tp.len()
            + triggers.short_sl.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn position(side: Side, tp: Option<Decimal>, sl: Option<Decimal>, liq: Decimal) -> Position {
        Position {
            id: PositionId::random(),
            account_id: AccountId::random(),
            symbol: SmolStr::new("BTCUSDT"),
            side,
            quantity: dec!(0.1),
            leverage: 20,
            entry_price: dec!(65000),
            entry_value: dec!(6500),
            margin: dec!(325),
            entry_fee: dec!(3.25),
            take_profit: tp,
            stop_loss: sl,
            liquidation_price: liq,
            current_price: dec!(65000),
            unrealized_pnl: Decimal::ZERO,
            entry_reference_price: dec!(65000),
            accumulated_funding: Decimal::ZERO,
            last_funding_at: None,
            opened_at: Utc::now(),
        }
    }

    fn tick(mid: Decimal) -> PriceTick {
        PriceTick {
            symbol: SmolStr::new("BTCUSDT"),
            upstream_bid: mid,
            upstream_ask: mid,
            mid,
            bid: mid - dec!(3),
            ask: mid + dec!(3),
            spread_bps: dec!(2),
            time: Utc::now(),
        }
    }

    #[test]
    fn test_long_tp_fires_when_mid_reaches_price() {
        let engine = TriggerEngine::new();
        let position = position(Side::Long, Some(dec!(70000)), Some(dec!(60000)), dec!(62075));
        engine.register(&position);

        assert!(engine.fired(&tick(dec!(69999))).is_empty());

        let fired = engine.fired(&tick(dec!(70000)));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].reason, CloseReason::TakeProfit);
        // LONG exits at the derived bid of the firing tick
        assert_eq!(fired[0].exit_price, dec!(69997));
    }

    #[test]
    fn test_long_stop_and_liq_ordering() {
        let engine = TriggerEngine::new();
        // SL above LIQ: a mild drop hits only the stop
        let position = position(Side::Long, None, Some(dec!(63000)), dec!(62075));
        engine.register(&position);

        let fired = engine.fired(&tick(dec!(62900)));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].reason, CloseReason::StopLoss);

        // A crash through both levels must resolve to the liquidation
        let fired = engine.fired(&tick(dec!(62000)));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].reason, CloseReason::Liquidation);
    }

    #[test]
    fn test_liq_beats_sl_at_equal_price() {
        let engine = TriggerEngine::new();
        let position = position(Side::Long, None, Some(dec!(62075)), dec!(62075));
        engine.register(&position);

        let fired = engine.fired(&tick(dec!(62075)));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].reason, CloseReason::Liquidation);
    }

    #[test]
    fn test_short_side_predicates() {
        let engine = TriggerEngine::new();
        let position = position(Side::Short, Some(dec!(60000)), Some(dec!(68000)), dec!(71175));
        engine.register(&position);

        // TP fires when mid drops to the target
        let fired = engine.fired(&tick(dec!(60000)));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].reason, CloseReason::TakeProfit);
        // SHORT exits at the derived ask
        assert_eq!(fired[0].exit_price, dec!(60003));

        // SL fires when mid rises to the stop
        let fired = engine.fired(&tick(dec!(68000)));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].reason, CloseReason::StopLoss);
    }

    #[test]
    fn test_sorted_break_only_fires_crossed_entries() {
        let engine = TriggerEngine::new();
        let near = position(Side::Long, Some(dec!(66000)), None, dec!(62075));
        let far = position(Side::Long, Some(dec!(70000)), None, dec!(62075));
        engine.register(&near);
        engine.register(&far);

        let fired = engine.fired(&tick(dec!(66500)));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].entry.position_id, near.id);

        // Sorted-break invariant: nothing past the first non-firing entry would have fired
        let fired = engine.fired(&tick(dec!(71000)));
        assert_eq!(fired.len(), 2);
    }

    #[test]
    fn test_entries_survive_until_deregistered() {
        let engine = TriggerEngine::new();
        let position = position(Side::Long, Some(dec!(66000)), None, dec!(62075));
        engine.register(&position);

        // Firing does not remove; a failed close re-fires next tick
        assert_eq!(engine.fired(&tick(dec!(66500))).len(), 1);
        assert_eq!(engine.fired(&tick(dec!(66500))).len(), 1);

        engine.deregister("BTCUSDT", position.id);
        assert!(engine.fired(&tick(dec!(66500))).is_empty());
        assert_eq!(engine.entry_count("BTCUSDT"), 0);
    }

    #[test]
    fn test_update_tp_sl_replaces_entry() {
        let engine = TriggerEngine::new();
        let position = position(Side::Long, Some(dec!(66000)), None, dec!(62075));
        engine.register(&position);

        engine.update_tp_sl(&position, TriggerKind::Tp, Some(dec!(69000)));
        assert!(engine.fired(&tick(dec!(66500))).is_empty());
        assert_eq!(engine.fired(&tick(dec!(69000))).len(), 1);

        engine.update_tp_sl(&position, TriggerKind::Tp, None);
        assert!(engine.fired(&tick(dec!(69000))).is_empty());
        // Liquidation entry remains
        assert_eq!(engine.entry_count("BTCUSDT"), 1);
    }
}
