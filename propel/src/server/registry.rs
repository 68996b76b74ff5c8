use crate::server::message::ServerMessage;
use fnv::FnvHashMap;
use parking_lot::RwLock;
use propel_execution::{AccountId, UserId};
use propel_integration::channel::{ChannelTxDroppable, UnboundedTx};
use smol_str::SmolStr;
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

/// Unique id of one connected client session.
pub type SessionId = Uuid;

/// Error type for a session's outbound channel. A failed send means the session task
/// dropped its receiver; [`ChannelTxDroppable`] then disables the channel.
#[derive(Debug, Clone)]
pub struct SessionSendError;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SessionSendError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self
    }
}

#[derive(Debug)]
struct SessionEntry {
    user_id: UserId,
    accounts: HashSet<AccountId>,
    tx: ChannelTxDroppable<UnboundedTx<ServerMessage, SessionSendError>>,
}

/// Connected client sessions with symbol-subscription and account fan-out indexes.
///
/// Every outbound channel is an unbounded [`ChannelTxDroppable`]: sends never suspend the
/// publisher, and a disconnected session's channel disables itself on the first failed
/// send rather than erroring the price path. The session task unregisters itself on
/// disconnect.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: FnvHashMap<SessionId, SessionEntry>,
    by_account: FnvHashMap<AccountId, HashSet<SessionId>>,
    by_symbol: FnvHashMap<SmolStr, HashSet<SessionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated session and the accounts it may observe.
    pub fn register(
        &self,
        session_id: SessionId,
        user_id: UserId,
        accounts: impl IntoIterator<Item = AccountId>,
        tx: tokio::sync::mpsc::UnboundedSender<ServerMessage>,
    ) {
        let accounts: HashSet<AccountId> = accounts.into_iter().collect();
        let mut inner = self.inner.write();
        for account_id in &accounts {
            inner.by_account.entry(*account_id).or_default().insert(session_id);
        }
        inner.sessions.insert(
            session_id,
            SessionEntry {
                user_id,
                accounts,
                tx: ChannelTxDroppable::new(UnboundedTx::new(tx)),
            },
        );
        debug!(%session_id, %user_id, "session registered");
    }

    /// Drop a session and all of its index entries.
    pub fn unregister(&self, session_id: SessionId) {
        let mut inner = self.inner.write();
        let Some(entry) = inner.sessions.remove(&session_id) else {
            return;
        };
        for account_id in &entry.accounts {
            if let Some(set) = inner.by_account.get_mut(account_id) {
                set.remove(&session_id);
                if set.is_empty() {
                    inner.by_account.remove(account_id);
                }
            }
        }
        inner.by_symbol.retain(|_, sessions| {
            sessions.remove(&session_id);
            !sessions.is_empty()
        });
        debug!(%session_id, "session unregistered");
    }

    pub fn user_of(&self, session_id: SessionId) -> Option<UserId> {
        self.inner
            .read()
            .sessions
            .get(&session_id)
            .map(|entry| entry.user_id)
    }

    /// Subscribe a session to price ticks for the provided symbols.
    pub fn subscribe(&self, session_id: SessionId, symbols: &[SmolStr]) {
        let mut inner = self.inner.write();
        if !inner.sessions.contains_key(&session_id) {
            return;
        }
        for symbol in symbols {
            inner
                .by_symbol
                .entry(symbol.clone())
                .or_default()
                .insert(session_id);
        }
    }

    pub fn unsubscribe(&self, session_id: SessionId, symbols: &[SmolStr]) {
        let mut inner = self.inner.write();
        for symbol in symbols {
            if let Some(set) = inner.by_symbol.get_mut(symbol) {
                set.remove(&session_id);
                if set.is_empty() {
                    inner.by_symbol.remove(symbol);
                }
            }
        }
    }

    /// Send to every session subscribed to the symbol.
    pub fn broadcast_symbol(&self, symbol: &str, message: &ServerMessage) {
        let mut inner = self.inner.write();
        let Some(subscribers) = inner.by_symbol.get(symbol).cloned() else {
            return;
        };
        for session_id in subscribers {
            if let Some(entry) = inner.sessions.get_mut(&session_id) {
                entry.tx.send(message.clone());
            }
        }
    }

    /// Send to every session watching the account.
    pub fn send_to_account(&self, account_id: AccountId, message: &ServerMessage) {
        let mut inner = self.inner.write();
        let Some(sessions) = inner.by_account.get(&account_id).cloned() else {
            return;
        };
        for session_id in sessions {
            if let Some(entry) = inner.sessions.get_mut(&session_id) {
                entry.tx.send(message.clone());
            }
        }
    }

    /// Send to one session.
    pub fn send_to_session(&self, session_id: SessionId, message: ServerMessage) {
        if let Some(entry) = self.inner.write().sessions.get_mut(&session_id) {
            entry.tx.send(message);
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.read().sessions.len()
    }
}
