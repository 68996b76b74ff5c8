use derive_more::{Constructor, Display};
use std::marker::PhantomData;
use tracing::warn;

/// Transmitter abstraction over different channel kinds.
///
/// Senders on the engine's hot paths must never block, so every implementation is required to
/// offer a synchronous, non-suspending `send`.
pub trait Tx
where
    Self: Clone + Send,
{
    type Item;
    type Error;
    fn send(&self, item: Self::Item) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone)]
pub struct UnboundedTx<T, Error> {
    pub tx: tokio::sync::mpsc::UnboundedSender<T>,
    phantom: PhantomData<Error>,
}

impl<T, Error> UnboundedTx<T, Error> {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<T>) -> Self {
        Self {
            tx,
            phantom: PhantomData,
        }
    }
}

impl<T, Error> Tx for UnboundedTx<T, Error>
where
    T: Clone + Send,
    Error: From<tokio::sync::mpsc::error::SendError<T>> + Clone + Send,
{
    type Item = T;
    type Error = Error;

    fn send(&self, item: Self::Item) -> Result<(), Self::Error> {
        self.tx.send(item).map_err(Error::from)
    }
}

#[derive(Debug, Constructor)]
pub struct UnboundedRx<T> {
    pub rx: tokio::sync::mpsc::UnboundedReceiver<T>,
}

impl<T> UnboundedRx<T> {
    pub fn into_stream(self) -> tokio_stream::wrappers::UnboundedReceiverStream<T> {
        tokio_stream::wrappers::UnboundedReceiverStream::new(self.rx)
    }
}

/// Wrapper around a channel [`Tx`] that disables itself after the first failed send, rather
/// than propagating the error.
///
/// Price-tick fan-out uses this so a dropped subscriber (eg/ a disconnected client session)
/// can never stall or error the publisher.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct ChannelTxDroppable<ChannelTx> {
    pub state: ChannelState<ChannelTx>,
}

impl<ChannelTx> ChannelTxDroppable<ChannelTx> {
    pub fn new(tx: ChannelTx) -> Self {
        Self {
            state: ChannelState::Active(tx),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Display)]
pub enum ChannelState<Tx> {
    Active(Tx),
    Disabled,
}

impl<ChannelTx> ChannelTxDroppable<ChannelTx>
where
    ChannelTx: Tx,
{
    pub fn send(&mut self, item: ChannelTx::Item) {
        let ChannelState::Active(tx) = &self.state else {
            return;
        };

        if tx.send(item).is_err() {
            let name = std::any::type_name::<ChannelTx::Item>();
            warn!(
                name,
                "ChannelTxDroppable receiver dropped - items will no longer be sent"
            );
            self.state = ChannelState::Disabled
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, ChannelState::Active(_))
    }
}

pub fn mpsc_unbounded<T, Error>() -> (UnboundedTx<T, Error>, UnboundedRx<T>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (UnboundedTx::new(tx), UnboundedRx::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct TestError;

    impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TestError {
        fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
            Self
        }
    }

    #[test]
    fn test_channel_tx_droppable_disables_after_receiver_drop() {
        let (tx, rx) = mpsc_unbounded::<u64, TestError>();
        let mut droppable = ChannelTxDroppable::new(tx);

        droppable.send(1);
        assert!(droppable.is_active());

        drop(rx);
        droppable.send(2);
        assert!(!droppable.is_active());

        // Further sends are no-ops
        droppable.send(3);
        assert!(!droppable.is_active());
    }
}
