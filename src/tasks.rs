//! Background periodic tasks: refreshing the user roster and flushing
//! traffic counters to the subscription API.
//!
//! Grounded on `internal/app/service/users.go`'s `FetchUsersTask`/
//! `ReportTrafficsTask`, each a `for range time.Tick(interval)` loop run in
//! its own goroutine from `UsersService.Start()`.

use crate::api::SubscriptionApi;
use crate::registry::{apply_diff, diff_roster, TrafficTable, User, UserTable};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Polls `GET /users`, diffs against the last-seen roster, and applies the
/// diff to `table`. Runs until cancelled (callers `tokio::spawn` this and
/// abort the handle on shutdown).
pub async fn fetch_users_task(
    api: Arc<dyn SubscriptionApi>,
    table: Arc<UserTable>,
    interval: Duration,
) -> ! {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let last_roster: Mutex<Vec<User>> = Mutex::new(Vec::new());

    loop {
        ticker.tick().await;
        match api.get_user_list().await {
            Ok(next) => {
                let prev = std::mem::take(&mut *last_roster.lock().unwrap());
                let (deleted, added) = diff_roster(&prev, &next);
                if !deleted.is_empty() || !added.is_empty() {
                    log::info!(
                        "roster refresh: {} removed, {} added",
                        deleted.len(),
                        added.len()
                    );
                }
                apply_diff(&table, &deleted, &added);
                *last_roster.lock().unwrap() = next;
            }
            Err(e) => {
                log::error!("failed to fetch user list: {e}");
            }
        }
    }
}

/// Periodically drains `traffic` and POSTs the non-zero entries. The table is
/// cleared only on a successful POST -- on failure the counters are kept so
/// the next tick retries with the accumulated total, matching the source's
/// `ReportTrafficsTask` (`clear()` sits inside the `err == nil` branch).
pub async fn report_traffic_task(
    api: Arc<dyn SubscriptionApi>,
    traffic: Arc<TrafficTable>,
    interval: Duration,
) -> ! {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let snapshot = traffic.to_user_traffics();
        if snapshot.is_empty() {
            continue;
        }
        match api.report_user_traffic(&snapshot).await {
            Ok(()) => traffic.clear(),
            Err(e) => log::error!("failed to report traffic: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeInfo;
    use crate::error::ApiError;
    use crate::registry::UserTraffic;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct FixtureApi {
        rosters: AsyncMutex<Vec<Vec<User>>>,
        reports: AtomicUsize,
        fail_reports: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl SubscriptionApi for FixtureApi {
        async fn get_node_info(&self) -> Result<NodeInfo, ApiError> {
            unimplemented!()
        }

        async fn get_user_list(&self) -> Result<Vec<User>, ApiError> {
            let mut rosters = self.rosters.lock().await;
            Ok(rosters.pop().unwrap_or_default())
        }

        async fn report_user_traffic(&self, _traffics: &[UserTraffic]) -> Result<(), ApiError> {
            self.reports.fetch_add(1, Ordering::SeqCst);
            if self.fail_reports.load(Ordering::SeqCst) {
                return Err(ApiError::Status {
                    status: 500,
                    body: "fixture failure".to_string(),
                });
            }
            Ok(())
        }
    }

    fn user(id: i64, uuid: &str) -> User {
        User {
            id,
            uuid: uuid.to_string(),
            speed_limit: None,
            device_limit: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_users_task_applies_successive_diffs() {
        let api: Arc<dyn SubscriptionApi> = Arc::new(FixtureApi {
            // Popped in reverse: first tick sees one user, second sees none.
            rosters: AsyncMutex::new(vec![vec![], vec![user(1, "A")]]),
            reports: AtomicUsize::new(0),
            fail_reports: std::sync::atomic::AtomicBool::new(false),
        });
        let table = Arc::new(UserTable::new());

        let handle = tokio::spawn(fetch_users_task(api, table.clone(), Duration::from_millis(10)));

        tokio::time::advance(Duration::from_millis(15)).await;
        tokio::task::yield_now().await;
        assert_eq!(table.auth("A"), (1, true));

        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(table.auth("A"), (-1, false));

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn report_traffic_task_clears_after_reporting() {
        let api: Arc<dyn SubscriptionApi> = Arc::new(FixtureApi {
            rosters: AsyncMutex::new(vec![]),
            reports: AtomicUsize::new(0),
            fail_reports: std::sync::atomic::AtomicBool::new(false),
        });
        let traffic = Arc::new(TrafficTable::new());
        traffic.get_or_create(1).up.add(100);

        let handle = tokio::spawn(report_traffic_task(
            api.clone(),
            traffic.clone(),
            Duration::from_millis(10),
        ));

        tokio::time::advance(Duration::from_millis(15)).await;
        tokio::task::yield_now().await;
        handle.abort();

        assert!(traffic.to_user_traffics().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn report_traffic_task_retains_counters_on_failure() {
        let api = Arc::new(FixtureApi {
            rosters: AsyncMutex::new(vec![]),
            reports: AtomicUsize::new(0),
            fail_reports: std::sync::atomic::AtomicBool::new(true),
        });
        let traffic = Arc::new(TrafficTable::new());
        traffic.get_or_create(1).up.add(100);

        let dyn_api: Arc<dyn SubscriptionApi> = api.clone();
        let handle = tokio::spawn(report_traffic_task(
            dyn_api,
            traffic.clone(),
            Duration::from_millis(10),
        ));

        tokio::time::advance(Duration::from_millis(15)).await;
        tokio::task::yield_now().await;
        handle.abort();

        // The POST was attempted and failed, so the counters must survive
        // for the next tick's retry rather than being dropped on the floor.
        assert_eq!(api.reports.load(Ordering::SeqCst), 1);
        let snapshot = traffic.to_user_traffics();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].upload, 100);
    }
}
