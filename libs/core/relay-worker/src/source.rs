//! Upstream item sources.
//!
//! The pipeline pulls from an [`ItemSource`]. Acknowledgement is implicit:
//! once `next_item` has returned an item, the source considers it delivered.

use crate::error::RelayError;
use crate::event::WorkItem;
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// Pull-based source of work items.
///
/// `next_item` must be cancel-safe: if the future is dropped before it
/// completes, no item may be lost. The pipeline races it against shutdown.
#[async_trait]
pub trait ItemSource: Send + 'static {
    /// `Ok(None)` means the source is exhausted and ingestion should stop.
    async fn next_item(&mut self) -> Result<Option<WorkItem>, RelayError>;

    fn name(&self) -> &str {
        "source"
    }
}

/// Source fed by an in-process channel. Exhausted once every sender is gone.
pub struct ChannelSource {
    receiver: mpsc::Receiver<WorkItem>,
}

impl ChannelSource {
    pub fn new(receiver: mpsc::Receiver<WorkItem>) -> Self {
        Self { receiver }
    }

    /// Create a source and the sender that feeds it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<WorkItem>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl ItemSource for ChannelSource {
    async fn next_item(&mut self) -> Result<Option<WorkItem>, RelayError> {
        Ok(self.receiver.recv().await)
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Fixed set of items, mainly for replay and tests.
pub struct VecSource {
    items: VecDeque<WorkItem>,
}

impl VecSource {
    pub fn new(items: impl IntoIterator<Item = WorkItem>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

#[async_trait]
impl ItemSource for VecSource {
    async fn next_item(&mut self) -> Result<Option<WorkItem>, RelayError> {
        Ok(self.items.pop_front())
    }

    fn name(&self) -> &str {
        "vec"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_source_exhausts_when_senders_drop() {
        let (tx, mut source) = ChannelSource::channel(4);
        tx.send(WorkItem::new("a", b"1".to_vec())).await.unwrap();
        drop(tx);

        assert_eq!(source.next_item().await.unwrap().unwrap().id, "a");
        assert!(source.next_item().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_vec_source_preserves_order() {
        let mut source = VecSource::new((0..3).map(|i| WorkItem::new(i.to_string(), Vec::new())));
        assert_eq!(source.remaining(), 3);

        let mut ids = Vec::new();
        while let Some(item) = source.next_item().await.unwrap() {
            ids.push(item.id);
        }
        assert_eq!(ids, vec!["0", "1", "2"]);
    }
}
