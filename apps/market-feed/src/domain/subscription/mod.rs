//! Subscription Bookkeeping
//!
//! Pure state machine tracking one upstream subscription per symbol.
//!
//! # Design
//!
//! The book tracks:
//! - A reference count of local consumers per symbol
//! - The lifecycle of the upstream subscription (`Pending`, `Active`, `Closing`)
//! - The generation of the upstream request currently in flight
//! - The connection epoch that request was sent on
//!
//! Every mutating call returns what the caller must do upstream (issue a
//! subscribe, issue an unsubscribe, or nothing). Completions are matched by
//! generation so a response to a superseded request is reported as stale
//! instead of corrupting the current state.
//!
//! This allows many consumers to share one upstream subscription and never
//! have two subscribe requests for the same symbol in flight.

use std::collections::HashMap;

use crate::domain::market::Symbol;

// =============================================================================
// Types
// =============================================================================

/// Identifier of one upstream operation issued for a symbol.
pub type Generation = u64;

/// Upstream subscription lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// Subscribe request sent (or waiting to be re-sent), not yet acknowledged.
    Pending,
    /// Acknowledged; ticks are flowing.
    Active,
    /// Unsubscribe request sent, not yet resolved.
    Closing,
}

impl SubscriptionState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Closing => "closing",
        }
    }
}

/// One tracked symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    symbol: Symbol,
    upstream_handle: Option<String>,
    ref_count: usize,
    state: SubscriptionState,
    generation: Generation,
    sent_on: Option<u64>,
    last_epoch: Option<i64>,
}

impl Subscription {
    /// Symbol this subscription streams.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Upstream subscription id, known once acknowledged.
    #[must_use]
    pub fn upstream_handle(&self) -> Option<&str> {
        self.upstream_handle.as_deref()
    }

    /// Number of local consumers holding this subscription.
    #[must_use]
    pub const fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Epoch of the last ingested tick.
    #[must_use]
    pub const fn last_epoch(&self) -> Option<i64> {
        self.last_epoch
    }

    const fn is_sent_before(&self, connection_epoch: u64) -> bool {
        match self.sent_on {
            Some(sent_on) => sent_on < connection_epoch,
            None => true,
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of acquiring a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// First reference: an upstream subscribe must be issued.
    Subscribe {
        /// Generation of the new request.
        generation: Generation,
    },
    /// Joined an existing subscription.
    Joined {
        /// Whether the subscription is already acknowledged.
        active: bool,
    },
    /// The symbol is closing; a subscribe follows once the close resolves.
    Requeued,
}

/// Result of releasing a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Unknown symbol or no references held.
    Noop,
    /// Other consumers still hold the subscription.
    Retained {
        /// References left.
        remaining: usize,
    },
    /// Last reference dropped before the acknowledgment; the close is
    /// issued when the acknowledgment arrives.
    Deferred,
    /// Last reference dropped: an upstream unsubscribe must be issued.
    Unsubscribe {
        /// Upstream subscription id to forget.
        handle: String,
        /// Generation of the close operation.
        generation: Generation,
    },
}

/// Result of a subscribe acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// The subscription is now active.
    Activated,
    /// Every reference was released while pending: an upstream unsubscribe
    /// must be issued for the fresh handle.
    Release {
        /// Generation of the close operation.
        generation: Generation,
    },
    /// The acknowledgment belongs to a superseded request.
    Stale,
}

/// Result of a failed subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The subscription was discarded.
    Removed,
    /// Kept pending; re-issued on the next connection.
    AwaitingReconnect,
    /// The failure belongs to a superseded request.
    Stale,
}

/// Result of a resolved close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Close {
    /// The subscription was discarded.
    Removed,
    /// Consumers re-acquired the symbol while closing: subscribe again.
    Resubscribe {
        /// Generation of the new subscribe request.
        generation: Generation,
    },
    /// The completion belongs to a superseded operation.
    Stale,
}

/// Subscribe request to (re-)issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reissue {
    /// Symbol to subscribe.
    pub symbol: Symbol,
    /// Generation of the new request.
    pub generation: Generation,
}

/// Decision for an inbound streamed tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickVerdict {
    /// Newer than anything seen; forward it.
    Accepted,
    /// No subscription for the symbol.
    UnknownSymbol,
    /// The subscription is closing or has no consumers.
    Inactive,
    /// Not newer than the last ingested tick.
    Stale,
}

impl TickVerdict {
    /// Get the verdict name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::UnknownSymbol => "unknown_symbol",
            Self::Inactive => "inactive",
            Self::Stale => "stale",
        }
    }
}

// =============================================================================
// Subscription Book
// =============================================================================

/// Per-symbol subscription state machine.
///
/// Not synchronized; the owner serializes access.
///
/// # Example
///
/// ```rust
/// use market_feed::domain::subscription::{Ack, Acquire, Release, SubscriptionBook};
///
/// let mut book = SubscriptionBook::new();
///
/// // First consumer triggers the upstream subscribe
/// let Acquire::Subscribe { generation } = book.acquire("R_100") else { unreachable!() };
/// book.mark_sent("R_100", generation, 1);
///
/// // Second consumer joins the pending request
/// assert_eq!(book.acquire("R_100"), Acquire::Joined { active: false });
///
/// assert_eq!(book.on_subscribe_ack("R_100", generation, "abc".into(), None), Ack::Activated);
///
/// // Only the last release closes upstream
/// assert_eq!(book.release("R_100"), Release::Retained { remaining: 1 });
/// assert!(matches!(book.release("R_100"), Release::Unsubscribe { .. }));
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionBook {
    entries: HashMap<Symbol, Subscription>,
    next_generation: Generation,
}

impl SubscriptionBook {
    /// Create an empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    const fn bump(&mut self) -> Generation {
        self.next_generation += 1;
        self.next_generation
    }

    /// Add a consumer reference for a symbol.
    pub fn acquire(&mut self, symbol: &str) -> Acquire {
        if let Some(entry) = self.entries.get_mut(symbol) {
            entry.ref_count += 1;
            return match entry.state {
                SubscriptionState::Pending => Acquire::Joined { active: false },
                SubscriptionState::Active => Acquire::Joined { active: true },
                SubscriptionState::Closing => Acquire::Requeued,
            };
        }

        let generation = self.bump();
        self.entries.insert(
            symbol.to_string(),
            Subscription {
                symbol: symbol.to_string(),
                upstream_handle: None,
                ref_count: 1,
                state: SubscriptionState::Pending,
                generation,
                sent_on: None,
                last_epoch: None,
            },
        );
        Acquire::Subscribe { generation }
    }

    /// Drop a consumer reference for a symbol.
    pub fn release(&mut self, symbol: &str) -> Release {
        let generation = self.next_generation + 1;
        let Some(entry) = self.entries.get_mut(symbol) else {
            return Release::Noop;
        };
        if entry.ref_count == 0 {
            return Release::Noop;
        }

        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return Release::Retained {
                remaining: entry.ref_count,
            };
        }

        match entry.state {
            SubscriptionState::Pending => Release::Deferred,
            SubscriptionState::Closing => Release::Retained { remaining: 0 },
            SubscriptionState::Active => {
                let handle = entry.upstream_handle.take().unwrap_or_default();
                entry.state = SubscriptionState::Closing;
                entry.generation = generation;
                entry.sent_on = None;
                self.next_generation = generation;
                Release::Unsubscribe { handle, generation }
            }
        }
    }

    /// Record the connection epoch an operation was sent on.
    pub fn mark_sent(&mut self, symbol: &str, generation: Generation, connection_epoch: u64) {
        if let Some(entry) = self.entries.get_mut(symbol)
            && entry.generation == generation
        {
            entry.sent_on = Some(connection_epoch);
        }
    }

    /// Apply a subscribe acknowledgment carrying the upstream handle and the
    /// newest epoch of the history seed.
    pub fn on_subscribe_ack(
        &mut self,
        symbol: &str,
        generation: Generation,
        handle: String,
        seed_epoch: Option<i64>,
    ) -> Ack {
        let close_generation = self.next_generation + 1;
        let Some(entry) = self.entries.get_mut(symbol) else {
            return Ack::Stale;
        };
        if entry.generation != generation || entry.state != SubscriptionState::Pending {
            return Ack::Stale;
        }

        entry.last_epoch = entry.last_epoch.max(seed_epoch);

        if entry.ref_count == 0 {
            entry.state = SubscriptionState::Closing;
            entry.generation = close_generation;
            entry.sent_on = None;
            self.next_generation = close_generation;
            return Ack::Release {
                generation: close_generation,
            };
        }

        entry.state = SubscriptionState::Active;
        entry.upstream_handle = Some(handle);
        Ack::Activated
    }

    /// Apply a failed subscribe request.
    ///
    /// `retryable` failures (the connection dropped underneath the request)
    /// keep the subscription pending for the next connection.
    pub fn on_subscribe_failed(
        &mut self,
        symbol: &str,
        generation: Generation,
        retryable: bool,
    ) -> Failure {
        let Some(entry) = self.entries.get(symbol) else {
            return Failure::Stale;
        };
        if entry.generation != generation || entry.state != SubscriptionState::Pending {
            return Failure::Stale;
        }

        if retryable && entry.ref_count > 0 {
            return Failure::AwaitingReconnect;
        }

        self.entries.remove(symbol);
        Failure::Removed
    }

    /// Apply a resolved (or timed out) close.
    pub fn on_close_done(&mut self, symbol: &str, generation: Generation) -> Close {
        let resubscribe_generation = self.next_generation + 1;
        let Some(entry) = self.entries.get_mut(symbol) else {
            return Close::Stale;
        };
        if entry.generation != generation || entry.state != SubscriptionState::Closing {
            return Close::Stale;
        }

        if entry.ref_count == 0 {
            self.entries.remove(symbol);
            return Close::Removed;
        }

        entry.state = SubscriptionState::Pending;
        entry.generation = resubscribe_generation;
        entry.sent_on = None;
        entry.last_epoch = None;
        self.next_generation = resubscribe_generation;
        Close::Resubscribe {
            generation: resubscribe_generation,
        }
    }

    /// The connection dropped.
    ///
    /// Active subscriptions fall back to pending. Pending closes and pending
    /// subscribes without consumers are settled, since the upstream forgets
    /// every subscription of a dead connection. Returns symbols that were
    /// discarded.
    pub fn on_connection_lost(&mut self) -> Vec<Symbol> {
        let mut removed = Vec::new();

        for entry in self.entries.values_mut() {
            match entry.state {
                SubscriptionState::Active => {
                    entry.state = SubscriptionState::Pending;
                    entry.upstream_handle = None;
                }
                SubscriptionState::Closing | SubscriptionState::Pending if entry.ref_count == 0 => {
                    removed.push(entry.symbol.clone());
                }
                SubscriptionState::Closing => {
                    entry.state = SubscriptionState::Pending;
                    entry.sent_on = None;
                }
                SubscriptionState::Pending => {}
            }
        }

        removed.sort();
        for symbol in &removed {
            self.entries.remove(symbol);
        }
        removed
    }

    /// Discard a pending subscription whose last reference is gone.
    ///
    /// Used when the acknowledgment can no longer be expected. Returns
    /// whether the entry was removed.
    pub fn discard_released(&mut self, symbol: &str) -> bool {
        let released = self.entries.get(symbol).is_some_and(|entry| {
            entry.state == SubscriptionState::Pending && entry.ref_count == 0
        });
        if released {
            self.entries.remove(symbol);
        }
        released
    }

    /// Discard every pending subscription without consumers.
    pub fn discard_all_released(&mut self) -> Vec<Symbol> {
        let mut removed: Vec<Symbol> = self
            .entries
            .values()
            .filter(|entry| entry.state == SubscriptionState::Pending && entry.ref_count == 0)
            .map(|entry| entry.symbol.clone())
            .collect();
        removed.sort();
        for symbol in &removed {
            self.entries.remove(symbol);
        }
        removed
    }

    /// A connection with the given epoch was established.
    ///
    /// Every pending subscription whose request was not sent on this
    /// connection gets a fresh generation and must be re-issued. Pending
    /// entries without consumers are discarded instead.
    pub fn on_connected(&mut self, connection_epoch: u64) -> (Vec<Reissue>, Vec<Symbol>) {
        let mut reissue = Vec::new();
        let mut removed = Vec::new();

        let mut symbols: Vec<_> = self.entries.keys().cloned().collect();
        symbols.sort();

        for symbol in symbols {
            let generation = self.next_generation + 1;
            let Some(entry) = self.entries.get_mut(&symbol) else {
                continue;
            };
            if !entry.is_sent_before(connection_epoch) {
                continue;
            }

            match entry.state {
                SubscriptionState::Active | SubscriptionState::Closing => {
                    // Only reachable without a preceding loss notification.
                    if entry.ref_count == 0 {
                        removed.push(symbol);
                        continue;
                    }
                }
                SubscriptionState::Pending if entry.ref_count == 0 => {
                    removed.push(symbol);
                    continue;
                }
                SubscriptionState::Pending => {}
            }

            entry.state = SubscriptionState::Pending;
            entry.upstream_handle = None;
            entry.generation = generation;
            entry.sent_on = None;
            self.next_generation = generation;
            reissue.push(Reissue { symbol, generation });
        }

        for symbol in &removed {
            self.entries.remove(symbol);
        }
        (reissue, removed)
    }

    /// Gate an inbound streamed tick and record its epoch when accepted.
    pub fn accept_tick(&mut self, symbol: &str, epoch: i64) -> TickVerdict {
        let Some(entry) = self.entries.get_mut(symbol) else {
            return TickVerdict::UnknownSymbol;
        };
        if entry.ref_count == 0 || entry.state == SubscriptionState::Closing {
            return TickVerdict::Inactive;
        }
        if entry.last_epoch.is_some_and(|last| epoch <= last) {
            return TickVerdict::Stale;
        }

        entry.last_epoch = Some(epoch);
        TickVerdict::Accepted
    }

    /// Drop every subscription. Returns the discarded symbols.
    pub fn clear(&mut self) -> Vec<Symbol> {
        self.entries.drain().map(|(symbol, _)| symbol).collect()
    }

    /// Look up a subscription.
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<&Subscription> {
        self.entries.get(symbol)
    }

    /// State of a symbol's subscription.
    #[must_use]
    pub fn state_of(&self, symbol: &str) -> Option<SubscriptionState> {
        self.entries.get(symbol).map(|e| e.state)
    }

    /// Reference count of a symbol (0 when unknown).
    #[must_use]
    pub fn ref_count(&self, symbol: &str) -> usize {
        self.entries.get(symbol).map_or(0, |e| e.ref_count)
    }

    /// Whether any consumer still holds a subscription.
    #[must_use]
    pub fn has_live_interest(&self) -> bool {
        self.entries.values().any(|e| e.ref_count > 0)
    }

    /// Symbols with a tracked subscription.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        self.entries.keys().cloned().collect()
    }

    /// Get statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let mut stats = SubscriptionStats {
            symbol_count: self.entries.len(),
            ..SubscriptionStats::default()
        };
        for entry in self.entries.values() {
            stats.total_refs += entry.ref_count;
            match entry.state {
                SubscriptionState::Pending => stats.pending += 1,
                SubscriptionState::Active => stats.active += 1,
                SubscriptionState::Closing => stats.closing += 1,
            }
        }
        stats
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Subscription book statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Number of tracked symbols.
    pub symbol_count: usize,
    /// Sum of consumer references.
    pub total_refs: usize,
    /// Subscriptions awaiting acknowledgment.
    pub pending: usize,
    /// Acknowledged subscriptions.
    pub active: usize,
    /// Subscriptions being closed.
    pub closing: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribed(book: &mut SubscriptionBook, symbol: &str, epoch: u64) -> Generation {
        let Acquire::Subscribe { generation } = book.acquire(symbol) else {
            panic!("expected a fresh subscribe");
        };
        book.mark_sent(symbol, generation, epoch);
        generation
    }

    fn active(book: &mut SubscriptionBook, symbol: &str, handle: &str) {
        let generation = subscribed(book, symbol, 1);
        assert_eq!(
            book.on_subscribe_ack(symbol, generation, handle.to_string(), None),
            Ack::Activated
        );
    }

    #[test]
    fn first_acquire_issues_subscribe() {
        let mut book = SubscriptionBook::new();

        assert!(matches!(book.acquire("R_100"), Acquire::Subscribe { .. }));
        assert_eq!(book.state_of("R_100"), Some(SubscriptionState::Pending));
        assert_eq!(book.ref_count("R_100"), 1);
    }

    #[test]
    fn concurrent_acquire_joins_pending_request() {
        let mut book = SubscriptionBook::new();
        subscribed(&mut book, "R_100", 1);

        assert_eq!(book.acquire("R_100"), Acquire::Joined { active: false });
        assert_eq!(book.acquire("R_100"), Acquire::Joined { active: false });
        assert_eq!(book.ref_count("R_100"), 3);
    }

    #[test]
    fn acquire_on_active_joins_immediately() {
        let mut book = SubscriptionBook::new();
        active(&mut book, "R_100", "h1");

        assert_eq!(book.acquire("R_100"), Acquire::Joined { active: true });
    }

    #[test]
    fn release_unknown_symbol_is_noop() {
        let mut book = SubscriptionBook::new();

        assert_eq!(book.release("R_100"), Release::Noop);
        assert_eq!(book.stats(), SubscriptionStats::default());
    }

    #[test]
    fn release_below_zero_is_noop() {
        let mut book = SubscriptionBook::new();
        subscribed(&mut book, "R_100", 1);

        assert_eq!(book.release("R_100"), Release::Deferred);
        assert_eq!(book.release("R_100"), Release::Noop);
        assert_eq!(book.ref_count("R_100"), 0);
    }

    #[test]
    fn last_release_closes_with_handle() {
        let mut book = SubscriptionBook::new();
        active(&mut book, "R_100", "h1");
        book.acquire("R_100");

        assert_eq!(book.release("R_100"), Release::Retained { remaining: 1 });
        let Release::Unsubscribe { handle, generation } = book.release("R_100") else {
            panic!("expected unsubscribe");
        };
        assert_eq!(handle, "h1");
        assert_eq!(book.state_of("R_100"), Some(SubscriptionState::Closing));

        assert_eq!(book.on_close_done("R_100", generation), Close::Removed);
        assert_eq!(book.state_of("R_100"), None);
    }

    #[test]
    fn release_before_ack_closes_on_ack() {
        let mut book = SubscriptionBook::new();
        let generation = subscribed(&mut book, "R_100", 1);

        assert_eq!(book.release("R_100"), Release::Deferred);
        let Ack::Release {
            generation: close_generation,
        } = book.on_subscribe_ack("R_100", generation, "h1".into(), None)
        else {
            panic!("expected deferred release");
        };
        assert_eq!(book.state_of("R_100"), Some(SubscriptionState::Closing));
        assert_eq!(book.on_close_done("R_100", close_generation), Close::Removed);
    }

    #[test]
    fn reacquire_while_closing_resubscribes_after_close() {
        let mut book = SubscriptionBook::new();
        active(&mut book, "R_100", "h1");
        let Release::Unsubscribe { generation, .. } = book.release("R_100") else {
            panic!("expected unsubscribe");
        };

        assert_eq!(book.acquire("R_100"), Acquire::Requeued);
        let Close::Resubscribe {
            generation: resubscribe,
        } = book.on_close_done("R_100", generation)
        else {
            panic!("expected resubscribe");
        };
        assert_eq!(book.state_of("R_100"), Some(SubscriptionState::Pending));

        // the previous close completion is now stale
        assert_eq!(book.on_close_done("R_100", generation), Close::Stale);
        assert_eq!(
            book.on_subscribe_ack("R_100", resubscribe, "h2".into(), None),
            Ack::Activated
        );
    }

    #[test]
    fn stale_ack_is_reported() {
        let mut book = SubscriptionBook::new();
        let generation = subscribed(&mut book, "R_100", 1);

        assert_eq!(
            book.on_subscribe_ack("R_100", generation + 7, "h".into(), None),
            Ack::Stale
        );
        assert_eq!(
            book.on_subscribe_ack("R_50", generation, "h".into(), None),
            Ack::Stale
        );
    }

    #[test]
    fn failure_removes_unless_retryable() {
        let mut book = SubscriptionBook::new();
        let generation = subscribed(&mut book, "R_100", 1);

        assert_eq!(
            book.on_subscribe_failed("R_100", generation, true),
            Failure::AwaitingReconnect
        );
        assert_eq!(
            book.on_subscribe_failed("R_100", generation, false),
            Failure::Removed
        );
        assert_eq!(book.state_of("R_100"), None);
    }

    #[test]
    fn retryable_failure_without_consumers_removes() {
        let mut book = SubscriptionBook::new();
        let generation = subscribed(&mut book, "R_100", 1);
        book.release("R_100");

        assert_eq!(
            book.on_subscribe_failed("R_100", generation, true),
            Failure::Removed
        );
    }

    #[test]
    fn reconnect_reissues_every_live_subscription() {
        let mut book = SubscriptionBook::new();
        active(&mut book, "R_10", "a");
        active(&mut book, "R_25", "b");

        assert!(book.on_connection_lost().is_empty());
        assert_eq!(book.stats().pending, 2);

        let (reissue, removed) = book.on_connected(2);
        let symbols: Vec<_> = reissue.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["R_10", "R_25"]);
        assert!(removed.is_empty());

        for Reissue { symbol, generation } in reissue {
            book.mark_sent(&symbol, generation, 2);
            assert_eq!(
                book.on_subscribe_ack(&symbol, generation, "new".into(), None),
                Ack::Activated
            );
        }
        assert_eq!(book.stats().active, 2);
    }

    #[test]
    fn reconnect_skips_requests_sent_on_new_connection() {
        let mut book = SubscriptionBook::new();
        subscribed(&mut book, "R_10", 2);

        let (reissue, _) = book.on_connected(2);

        assert!(reissue.is_empty());
    }

    #[test]
    fn connection_loss_settles_closing_subscriptions() {
        let mut book = SubscriptionBook::new();
        active(&mut book, "R_10", "a");
        active(&mut book, "R_25", "b");
        book.release("R_10");
        book.release("R_25");
        book.acquire("R_25");

        let removed = book.on_connection_lost();

        assert_eq!(removed, vec!["R_10".to_string()]);
        assert_eq!(book.state_of("R_25"), Some(SubscriptionState::Pending));
    }

    #[test]
    fn connection_loss_discards_released_pending_entries() {
        let mut book = SubscriptionBook::new();
        subscribed(&mut book, "R_10", 1);
        subscribed(&mut book, "R_25", 1);
        assert_eq!(book.release("R_10"), Release::Deferred);

        assert_eq!(book.on_connection_lost(), vec!["R_10".to_string()]);
        assert_eq!(book.state_of("R_10"), None);

        let (reissue, removed) = book.on_connected(2);
        let symbols: Vec<_> = reissue.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["R_25"]);
        assert!(removed.is_empty());
    }

    #[test]
    fn reconnect_drops_orphaned_pending_entries() {
        let mut book = SubscriptionBook::new();
        subscribed(&mut book, "R_10", 1);
        book.release("R_10");

        let (reissue, removed) = book.on_connected(2);

        assert!(reissue.is_empty());
        assert_eq!(removed, vec!["R_10".to_string()]);
    }

    #[test]
    fn released_pending_entries_can_be_discarded() {
        let mut book = SubscriptionBook::new();
        subscribed(&mut book, "R_10", 1);
        subscribed(&mut book, "R_25", 1);
        active(&mut book, "R_50", "h");
        book.release("R_10");
        book.release("R_50");

        assert!(!book.discard_released("R_25"));
        assert!(!book.discard_released("R_50"));
        assert_eq!(book.discard_all_released(), vec!["R_10".to_string()]);
        assert!(!book.discard_released("R_10"));

        assert_eq!(book.state_of("R_25"), Some(SubscriptionState::Pending));
        assert_eq!(book.state_of("R_50"), Some(SubscriptionState::Closing));
    }

    #[test]
    fn tick_gate() {
        let mut book = SubscriptionBook::new();
        assert_eq!(book.accept_tick("R_100", 1), TickVerdict::UnknownSymbol);

        active(&mut book, "R_100", "h");
        assert_eq!(book.accept_tick("R_100", 100), TickVerdict::Accepted);
        assert_eq!(book.accept_tick("R_100", 100), TickVerdict::Stale);
        assert_eq!(book.accept_tick("R_100", 99), TickVerdict::Stale);
        assert_eq!(book.accept_tick("R_100", 101), TickVerdict::Accepted);

        book.release("R_100");
        assert_eq!(book.accept_tick("R_100", 102), TickVerdict::Inactive);
    }

    #[test]
    fn seed_epoch_gates_older_ticks() {
        let mut book = SubscriptionBook::new();
        let generation = subscribed(&mut book, "R_100", 1);
        book.on_subscribe_ack("R_100", generation, "h".into(), Some(500));

        assert_eq!(book.accept_tick("R_100", 480), TickVerdict::Stale);
        assert_eq!(book.accept_tick("R_100", 501), TickVerdict::Accepted);
    }

    #[test]
    fn stats_are_accurate() {
        let mut book = SubscriptionBook::new();
        active(&mut book, "R_10", "a");
        book.acquire("R_10");
        subscribed(&mut book, "R_25", 1);
        active(&mut book, "R_50", "c");
        book.release("R_50");

        let stats = book.stats();

        assert_eq!(stats.symbol_count, 3);
        assert_eq!(stats.total_refs, 3);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.closing, 1);
        assert!(book.has_live_interest());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone, Copy)]
        enum Op {
            Acquire,
            Release,
            Ack,
            CloseDone,
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                Just(Op::Acquire),
                Just(Op::Release),
                Just(Op::Ack),
                Just(Op::CloseDone),
            ]
        }

        proptest! {
            #[test]
            fn prop_one_upstream_subscription_while_referenced(
                ops in proptest::collection::vec(op(), 0..60),
            ) {
                let mut book = SubscriptionBook::new();
                let mut net_refs: i64 = 0;
                let mut in_flight: Option<(Generation, bool)> = None;
                let mut upstream_open = 0i64;

                for op in ops {
                    match op {
                        Op::Acquire => {
                            net_refs += 1;
                            if let Acquire::Subscribe { generation } = book.acquire("S") {
                                prop_assert!(in_flight.is_none(), "two requests in flight");
                                in_flight = Some((generation, true));
                            }
                        }
                        Op::Release => {
                            if net_refs > 0 {
                                net_refs -= 1;
                            }
                            if let Release::Unsubscribe { generation, .. } = book.release("S") {
                                prop_assert!(in_flight.is_none(), "two requests in flight");
                                in_flight = Some((generation, false));
                            }
                        }
                        Op::Ack => {
                            if let Some((generation, true)) = in_flight {
                                upstream_open += 1;
                                in_flight = None;
                                if let Ack::Release { generation } =
                                    book.on_subscribe_ack("S", generation, "h".into(), None)
                                {
                                    in_flight = Some((generation, false));
                                }
                            }
                        }
                        Op::CloseDone => {
                            if let Some((generation, false)) = in_flight {
                                upstream_open -= 1;
                                in_flight = None;
                                if let Close::Resubscribe { generation } =
                                    book.on_close_done("S", generation)
                                {
                                    in_flight = Some((generation, true));
                                }
                            }
                        }
                    }

                    prop_assert!(upstream_open == 0 || upstream_open == 1);
                    prop_assert_eq!(book.ref_count("S") as i64, net_refs);
                }

                // Drain outstanding operations.
                for _ in 0..4 {
                    match in_flight.take() {
                        Some((generation, true)) => {
                            upstream_open += 1;
                            if let Ack::Release { generation } =
                                book.on_subscribe_ack("S", generation, "h".into(), None)
                            {
                                in_flight = Some((generation, false));
                            }
                        }
                        Some((generation, false)) => {
                            upstream_open -= 1;
                            if let Close::Resubscribe { generation } =
                                book.on_close_done("S", generation)
                            {
                                in_flight = Some((generation, true));
                            }
                        }
                        None => break,
                    }
                }

                prop_assert_eq!(upstream_open, i64::from(net_refs > 0));
            }
        }
    }
}
