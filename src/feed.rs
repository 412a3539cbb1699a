//! Change Feed
//! コミット済みの書き込みを購読者へ流す。購読側はイベントを再取得のトリガーとしてのみ使う

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Emergency,
    ServiceRequests,
    ShopOffers,
    PaymentTransaction,
    Notifications,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub operation: Operation,
    pub emergency_id: Option<String>,
    pub row_id: String,
}

impl ChangeEvent {
    pub fn new(table: Table, operation: Operation, emergency_id: Option<&str>, row_id: &str) -> Self {
        Self {
            table,
            operation,
            emergency_id: emergency_id.map(str::to_string),
            row_id: row_id.to_string(),
        }
    }

    /// この emergency のオファー一覧に影響するか
    pub fn touches_emergency(&self, emergency_id: &str) -> bool {
        self.emergency_id.as_deref() == Some(emergency_id)
            && matches!(
                self.table,
                Table::Emergency | Table::ServiceRequests | Table::ShopOffers
            )
    }
}

#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    /// 購読者がいなくてもエラーにしない
    pub fn publish(&self, event: ChangeEvent) {
        trace!(?event, "change feed publish");
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let feed = ChangeFeed::new(8);
        let mut rx = feed.subscribe();

        feed.publish(ChangeEvent::new(Table::ShopOffers, Operation::Insert, Some("e1"), "o1"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.row_id, "o1");
        assert!(event.touches_emergency("e1"));
        assert!(!event.touches_emergency("e2"));
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let feed = ChangeFeed::new(4);
        feed.publish(ChangeEvent::new(Table::Emergency, Operation::Update, Some("e1"), "e1"));
    }

    #[test]
    fn notifications_do_not_invalidate_offers() {
        let event = ChangeEvent::new(Table::Notifications, Operation::Insert, Some("e1"), "n1");
        assert!(!event.touches_emergency("e1"));
    }
}
