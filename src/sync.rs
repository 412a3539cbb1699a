//! Client Sync Layer
//! 運転手のオファー一覧を最新に保つ
//!
//! 定期ポーリングと change feed の両方を「再取得しろ」という1種類の合図にまとめ、
//! 同じ reconcile で処理する。結果が変わったときだけ watch チャネルに流す。

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::error::Result;
use crate::feed::ChangeEvent;
use crate::models::{EmergencyStatus, OfferView};
use crate::services::lifecycle::load_emergency;
use crate::services::offers::{list_outstanding_offers, outstanding_offers};
use crate::AppState;

pub type OfferReceiver = watch::Receiver<Vec<OfferView>>;

#[derive(Debug, Clone, Copy)]
enum Signal {
    Tick,
    Changed,
    Lagged,
}

/// 依頼者だけが購読できる。emergency が waiting でなくなると最後の一覧を流して終わる
pub async fn watch_offers(
    state: Arc<AppState>,
    emergency_id: &str,
    caller: &str,
) -> Result<OfferReceiver> {
    // 初回取得より先に購読して取りこぼしを防ぐ
    let feed = state.feed.subscribe();
    let initial = list_outstanding_offers(&state, emergency_id, caller).await?;

    let (tx, rx) = watch::channel(initial);
    info!("OfferWatch started: emergency={}, caller={}", emergency_id, caller);
    tokio::spawn(run(state, emergency_id.to_string(), tx, feed));
    Ok(rx)
}

async fn run(
    state: Arc<AppState>,
    emergency_id: String,
    tx: watch::Sender<Vec<OfferView>>,
    mut feed: broadcast::Receiver<ChangeEvent>,
) {
    let mut ticker = tokio::time::interval(state.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // 最初の tick は即時に来るので捨てる
    ticker.tick().await;

    loop {
        let signal = tokio::select! {
            _ = tx.closed() => break,
            _ = ticker.tick() => Signal::Tick,
            event = feed.recv() => match event {
                Ok(event) if event.touches_emergency(&emergency_id) => Signal::Changed,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    // 取りこぼした分は再取得で埋まる
                    debug!("OfferWatch lagged: emergency={}, skipped={}", emergency_id, skipped);
                    Signal::Lagged
                }
                Err(RecvError::Closed) => break,
            },
        };
        trace!(?signal, emergency = %emergency_id, "offer watch signal");

        if !reconcile(&state, &emergency_id, &tx).await {
            break;
        }
    }

    debug!("OfferWatch stopped: emergency={}", emergency_id);
}

/// 一覧を取り直し、変わっていれば流す。監視を続けるなら true
pub(crate) async fn reconcile(
    state: &AppState,
    emergency_id: &str,
    tx: &watch::Sender<Vec<OfferView>>,
) -> bool {
    let fetched = async {
        let mut conn = state.db.acquire().await?;
        let emergency = load_emergency(&mut conn, emergency_id).await?;
        let offers = outstanding_offers(&mut conn, &emergency).await?;
        Ok::<_, crate::error::DispatchError>((emergency.status, offers))
    }
    .await;

    let (status, offers) = match fetched {
        Ok(v) => v,
        Err(e) => {
            // 次の合図で再試行
            warn!("OfferWatch refresh failed: emergency={}, error={}", emergency_id, e);
            return true;
        }
    };

    tx.send_if_modified(|current| {
        if *current == offers {
            return false;
        }
        *current = offers;
        true
    });

    status == EmergencyStatus::Waiting
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::error::DispatchError;
    use crate::feed::{Operation, Table};
    use crate::models::{ServiceType, ShopType};
    use crate::services::acceptance::accept_offer;
    use crate::testutil::{
        seed_emergency, seed_request, seed_shop, test_state, test_state_with, T0,
    };
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn new_offer_reaches_the_watcher() {
        let (state, _dir) = test_state().await;
        let shop = seed_shop(&state, "mech", ShopType::Mechanic, 9.88, 123.60).await;
        let emergency = seed_emergency(&state, "driver", ServiceType::Repair, T0).await;

        let mut rx = watch_offers(state.clone(), &emergency.id, "driver").await.unwrap();
        assert!(rx.borrow().is_empty());

        let request = seed_request(&state, &emergency, &shop, 300.0, 0.0, T0 + 5).await;

        timeout(Duration::from_secs(5), rx.changed())
            .await
            .unwrap()
            .unwrap();
        let offers = rx.borrow_and_update().clone();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].service_id, request.id);
    }

    #[tokio::test]
    async fn watch_ends_once_the_emergency_is_accepted() {
        let (state, _dir) = test_state().await;
        let shop = seed_shop(&state, "mech", ShopType::Mechanic, 9.88, 123.60).await;
        let emergency = seed_emergency(&state, "driver", ServiceType::Repair, T0).await;
        let request = seed_request(&state, &emergency, &shop, 300.0, 0.0, T0 + 5).await;

        let mut rx = watch_offers(state.clone(), &emergency.id, "driver").await.unwrap();
        assert_eq!(rx.borrow().len(), 1);

        accept_offer(&state, &emergency.id, &request.id, "driver", T0 + 60)
            .await
            .unwrap();

        // 空の一覧が流れたあと送信側が閉じる
        let closed = timeout(Duration::from_secs(5), async {
            while rx.changed().await.is_ok() {}
        })
        .await;
        assert!(closed.is_ok());
        assert!(rx.borrow().is_empty());
    }

    #[tokio::test]
    async fn lagged_feed_still_triggers_a_refresh() {
        let config = AppConfig {
            feed_capacity: 1,
            ..AppConfig::default()
        };
        let (state, _dir) = test_state_with(config).await;
        let shop = seed_shop(&state, "mech", ShopType::Mechanic, 9.88, 123.60).await;
        let emergency = seed_emergency(&state, "driver", ServiceType::Repair, T0).await;

        let mut rx = watch_offers(state.clone(), &emergency.id, "driver").await.unwrap();

        // 受信側が動く前に溢れさせる
        for i in 0..8 {
            state.feed.publish(ChangeEvent::new(
                Table::Notifications,
                Operation::Insert,
                None,
                &format!("noise-{}", i),
            ));
        }
        seed_request(&state, &emergency, &shop, 300.0, 0.0, T0 + 5).await;

        timeout(Duration::from_secs(5), async {
            while rx.borrow_and_update().is_empty() {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(rx.borrow().len(), 1);
    }

    #[tokio::test]
    async fn only_the_requester_can_watch() {
        let (state, _dir) = test_state().await;
        let emergency = seed_emergency(&state, "driver", ServiceType::Repair, T0).await;

        let err = watch_offers(state.clone(), &emergency.id, "someone-else")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));
    }

    #[tokio::test]
    async fn unchanged_refresh_does_not_notify() {
        let (state, _dir) = test_state().await;
        let emergency = seed_emergency(&state, "driver", ServiceType::Repair, T0).await;

        let (tx, rx) = watch::channel(Vec::new());
        assert!(reconcile(&state, &emergency.id, &tx).await);
        assert!(!rx.has_changed().unwrap());
    }
}
