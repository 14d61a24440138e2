//! Background refresh of stored chains.

use crate::credentials::ChainCredentials;

/// Decides where a refresh re-enters the chain.
pub trait RefreshStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Index of the first step to re-assume. Steps before it keep their current credentials and
    /// the last of them acts for the returned step.
    fn first_step(
        &self,
        credentials: &[ChainCredentials],
        now: chrono::DateTime<chrono::Utc>,
        window: std::time::Duration,
    ) -> usize;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FullChain;

impl RefreshStrategy for FullChain {
    fn name(&self) -> &'static str {
        "full"
    }

    fn first_step(
        &self,
        _credentials: &[ChainCredentials],
        _now: chrono::DateTime<chrono::Utc>,
        _window: std::time::Duration,
    ) -> usize {
        0
    }
}

/// Re-assumes from the first step whose credentials are expired or expire within the window.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpiringSuffix;

impl RefreshStrategy for ExpiringSuffix {
    fn name(&self) -> &'static str {
        "expiring_suffix"
    }

    fn first_step(
        &self,
        credentials: &[ChainCredentials],
        now: chrono::DateTime<chrono::Utc>,
        window: std::time::Duration,
    ) -> usize {
        credentials
            .iter()
            .position(|c| {
                c.credentials.is_expired_at(now) || c.credentials.expires_within(now, window)
            })
            .unwrap_or(0)
    }
}

pub fn strategy_for(kind: crate::config::RefreshStrategyKind) -> &'static dyn RefreshStrategy {
    match kind {
        crate::config::RefreshStrategyKind::Full => &FullChain,
        crate::config::RefreshStrategyKind::ExpiringSuffix => &ExpiringSuffix,
    }
}

pub struct RefreshScheduler;

const MIN_REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

impl RefreshScheduler {
    /// Starts a task calling [`refresh_expiring_sessions`] every `refresh_interval` of the
    /// manager's default config.
    ///
    /// [`refresh_expiring_sessions`]: crate::chain::RoleChainManager::refresh_expiring_sessions
    pub fn spawn<A>(manager: crate::chain::RoleChainManager<A>) -> RefreshHandle
    where
        A: crate::engine::RoleAssumer + ?Sized,
    {
        let mut interval = manager.default_config().refresh_interval;
        if interval < MIN_REFRESH_INTERVAL {
            tracing::warn!(interval = ?interval, min = ?MIN_REFRESH_INTERVAL, "refresh_interval is too short, clamping");
            interval = MIN_REFRESH_INTERVAL;
        }
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let (ctx, cancel) = crate::context::Context::cancellable();

        let task = tokio::spawn(async move {
            tracing::debug!(interval = ?interval, "refresh scheduler started");
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {}
                }
                match manager.refresh_expiring_sessions(&ctx).await {
                    Ok(report) if report == Default::default() => {}
                    Ok(report) => {
                        tracing::info!(
                            refreshed = report.refreshed,
                            failed = report.failed,
                            skipped = report.skipped,
                            "refreshed expiring sessions"
                        );
                    }
                    Err(e) if e.is_cancellation() => break,
                    Err(e) => tracing::warn!(err = %e, "refresh pass failed"),
                }
            }
            tracing::debug!("refresh scheduler stopped");
        });

        RefreshHandle {
            shutdown: Some(shutdown_tx),
            cancel,
            task: Some(task),
        }
    }

    /// Like [`RefreshScheduler::spawn`], but only when the default config enables auto refresh.
    pub fn spawn_if_enabled<A>(
        manager: crate::chain::RoleChainManager<A>,
    ) -> Option<RefreshHandle>
    where
        A: crate::engine::RoleAssumer + ?Sized,
    {
        manager
            .default_config()
            .enable_auto_refresh
            .then(|| Self::spawn(manager))
    }
}

/// Stops the scheduler task when stopped or dropped.
#[derive(Debug)]
pub struct RefreshHandle {
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    cancel: crate::context::CancelHandle,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl RefreshHandle {
    /// Signals the task, interrupts any in-flight refresh, and waits for it to finish.
    pub async fn stop(mut self) {
        self.signal();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(err = ?e, "refresh scheduler task failed");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    fn signal(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.send(()).ok();
        }
        self.cancel.cancel();
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::ScriptedAssumer;
    use crate::chain::RoleChainManager;
    use crate::context::Context;
    use crate::credentials::RoleChainStep;

    fn at(now: chrono::DateTime<chrono::Utc>, secs: i64) -> chrono::DateTime<chrono::Utc> {
        now + chrono::Duration::seconds(secs)
    }

    #[test]
    fn strategies_pick_entry_point() {
        let now = chrono::Utc::now();
        let window = std::time::Duration::from_secs(300);
        let session =
            crate::session::test_session("s", &[at(now, 3600), at(now, 3600), at(now, 60)]);
        let creds = session.credentials();
        assert_eq!(FullChain.first_step(&creds, now, window), 0);
        assert_eq!(ExpiringSuffix.first_step(&creds, now, window), 2);

        let session = crate::session::test_session("s", &[at(now, 3600), at(now, -10), at(now, 60)]);
        assert_eq!(ExpiringSuffix.first_step(&session.credentials(), now, window), 1);

        let session = crate::session::test_session("s", &[at(now, 30), at(now, 60)]);
        assert_eq!(ExpiringSuffix.first_step(&session.credentials(), now, window), 0);
    }

    #[test]
    fn strategy_lookup() {
        use crate::config::RefreshStrategyKind;
        assert_eq!(strategy_for(RefreshStrategyKind::Full).name(), "full");
        assert_eq!(
            strategy_for(RefreshStrategyKind::ExpiringSuffix).name(),
            "expiring_suffix"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_refreshes_on_tick_and_stops() {
        let assumer = ScriptedAssumer::default();
        assumer.short_lived.lock().insert("A".to_owned());
        let manager = RoleChainManager::new(assumer);
        let session = manager
            .assume_role_chain(
                &Context::background(),
                vec![RoleChainStep::new("arn:aws:iam::123456789012:role/A")],
                None,
            )
            .await
            .unwrap();
        assert_eq!(manager.assumer().calls(), 1);

        let handle = RefreshScheduler::spawn(manager.clone());
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        assert_eq!(manager.assumer().calls(), 1);

        tokio::time::sleep(std::time::Duration::from_secs(31)).await;
        assert_eq!(manager.assumer().calls(), 2);
        assert!(session.refreshed_at().is_some());

        handle.stop().await;
        tokio::time::sleep(std::time::Duration::from_secs(600)).await;
        assert_eq!(manager.assumer().calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_stops_task() {
        let manager = RoleChainManager::new(ScriptedAssumer::default());
        let handle = RefreshScheduler::spawn(manager.clone());
        assert!(!handle.is_finished());
        drop(handle);
        tokio::time::sleep(std::time::Duration::from_secs(120)).await;
        assert_eq!(manager.assumer().calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_clamped() {
        let assumer = ScriptedAssumer::default();
        assumer.short_lived.lock().insert("A".to_owned());
        let manager = RoleChainManager::new(assumer).with_config(crate::config::ChainConfig {
            refresh_interval: std::time::Duration::ZERO,
            ..Default::default()
        });
        manager
            .assume_role_chain(
                &Context::background(),
                vec![RoleChainStep::new("arn:aws:iam::123456789012:role/A")],
                None,
            )
            .await
            .unwrap();

        let handle = RefreshScheduler::spawn(manager.clone());
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(!handle.is_finished());
        assert!(manager.assumer().calls() >= 2);
        handle.stop().await;
    }

    #[tokio::test]
    async fn disabled_auto_refresh_spawns_nothing() {
        let manager = RoleChainManager::new(ScriptedAssumer::default()).with_config(
            crate::config::ChainConfig {
                enable_auto_refresh: false,
                ..Default::default()
            },
        );
        assert!(RefreshScheduler::spawn_if_enabled(manager).is_none());
    }
}
