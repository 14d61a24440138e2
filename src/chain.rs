//! Role chain orchestration: validate, assume each step in order with retries, roll back on
//! failure, and keep completed chains in a [`SessionStore`](crate::session::SessionStore).

use std::sync::Arc;

use crate::config::ChainConfig;
use crate::context::Context;
use crate::credentials::{AssumeRoleOptions, ChainCredentials, Credentials, RoleChainStep};
use crate::engine::RoleAssumer;
use crate::session::{ChainedSession, SessionStore};

/// Duration used when probing a single step.
const VALIDATE_STEP_DURATION_SECONDS: u32 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Validating,
    Assuming(usize),
    RollingBack(usize),
    Completed,
    Stored,
}

/// A chain being executed. Holds the credentials of steps that have succeeded so far.
struct PendingChain<'a> {
    chain_id: &'a str,
    steps: &'a [RoleChainStep],
    config: &'a ChainConfig,
    state: ChainState,
    credentials: Vec<ChainCredentials>,
}

impl<'a> PendingChain<'a> {
    fn new(chain_id: &'a str, steps: &'a [RoleChainStep], config: &'a ChainConfig) -> Self {
        Self {
            chain_id,
            steps,
            config,
            state: ChainState::Validating,
            credentials: Vec::with_capacity(steps.len()),
        }
    }

    fn transition(&mut self, next: ChainState) {
        tracing::trace!(chain_id = self.chain_id, from = ?self.state, to = ?next, "chain state transition");
        self.state = next;
    }

    /// Assumes `steps[from..]`. `credentials` must already hold the first `from` steps.
    async fn run<A>(&mut self, ctx: &Context, assumer: &A, from: usize) -> crate::Result<()>
    where
        A: RoleAssumer + ?Sized,
    {
        self.credentials.truncate(from);
        for i in from..self.steps.len() {
            self.transition(ChainState::Assuming(i));
            let step = &self.steps[i];
            let options = effective_options(self.chain_id, i, step, self.config);
            let prior = match i {
                0 => None,
                _ => Some(self.credentials[i - 1].credentials.clone()),
            };

            let result = assume_with_retry(
                ctx,
                assumer,
                self.config,
                self.chain_id,
                i,
                &step.role_arn,
                &options,
                prior.as_deref(),
            )
            .await;

            match result {
                Ok(creds) => {
                    tracing::debug!(
                        chain_id = self.chain_id,
                        step = i + 1,
                        role_arn = %step.role_arn,
                        expiration = ?creds.expiration,
                        "chain step assumed"
                    );
                    self.credentials.push(ChainCredentials {
                        step_index: i,
                        role_arn: step.role_arn.clone(),
                        credentials: Arc::new(creds),
                        assumed_at: chrono::Utc::now(),
                    });
                }
                Err(e) => {
                    self.rollback(i);
                    if e.is_cancellation() {
                        return Err(e);
                    }
                    return Err(crate::Error::ChainStepFailed {
                        step: i + 1,
                        role_arn: step.role_arn.clone(),
                        source: Box::new(e),
                    });
                }
            }
        }
        self.transition(ChainState::Completed);
        Ok(())
    }

    fn rollback(&mut self, failed: usize) {
        self.transition(ChainState::RollingBack(failed));
        tracing::debug!(
            chain_id = self.chain_id,
            step = failed + 1,
            kept = failed,
            "rolling back chain"
        );
        self.credentials.truncate(failed);
    }
}

#[allow(clippy::too_many_arguments)]
async fn assume_with_retry<A>(
    ctx: &Context,
    assumer: &A,
    config: &ChainConfig,
    chain_id: &str,
    index: usize,
    role_arn: &str,
    options: &AssumeRoleOptions,
    prior: Option<&Credentials>,
) -> crate::Result<Credentials>
where
    A: RoleAssumer + ?Sized,
{
    let mut attempt: u32 = 0;
    loop {
        if let Some(e) = ctx.err() {
            return Err(e);
        }
        let e = match assumer.assume(ctx, role_arn, options, prior).await {
            Ok(c) => return Ok(c),
            Err(e) => e,
        };
        attempt += 1;
        if e.is_cancellation() || !e.is_retryable() || attempt > config.retry_attempts {
            return Err(e);
        }
        let delay = config.retry_delay * attempt;
        tracing::warn!(
            chain_id = chain_id,
            step = index + 1,
            role_arn = role_arn,
            attempt = attempt,
            delay = ?delay,
            err = %e,
            "assume role failed, retrying"
        );
        ctx.sleep(delay).await?;
    }
}

/// Resolves the options actually sent for step `index`.
///
/// Session name: step, then options, then a name derived from the chain id. Step-level external ID
/// overrides the options one. Zero duration takes the configured default.
fn effective_options(
    chain_id: &str,
    index: usize,
    step: &RoleChainStep,
    config: &ChainConfig,
) -> AssumeRoleOptions {
    let mut options = step.options.clone().unwrap_or_default();
    let session_name = step
        .session_name
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| options.session_name.take().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| default_session_name(chain_id, index));
    options.session_name = Some(session_name);
    if let Some(ref external_id) = step.external_id {
        options.external_id = Some(external_id.clone());
    }
    if options.duration_seconds == 0 {
        options.duration_seconds = config.default_duration_seconds;
    }
    options
}

fn default_session_name(chain_id: &str, index: usize) -> String {
    let tail = chain_id.strip_prefix("chain-").unwrap_or(chain_id);
    format!("{}-{}-step-{}", env!("CARGO_PKG_NAME"), tail, index + 1)
}

static CHAIN_SEQUENCE: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

fn generate_chain_id() -> String {
    let now = chrono::Utc::now();
    let seq = CHAIN_SEQUENCE.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    format!(
        "chain-{}-{}-{}",
        now.timestamp(),
        now.timestamp_subsec_nanos(),
        seq
    )
}

/// Outcome of one [`RoleChainManager::refresh_expiring_sessions`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub failed: usize,
    /// Sessions due for refresh but already being refreshed elsewhere.
    pub skipped: usize,
}

pub struct RoleChainManager<A: ?Sized> {
    assumer: Arc<A>,
    sessions: SessionStore,
    default_config: ChainConfig,
}

impl<A: ?Sized> Clone for RoleChainManager<A> {
    fn clone(&self) -> Self {
        Self {
            assumer: self.assumer.clone(),
            sessions: self.sessions.clone(),
            default_config: self.default_config.clone(),
        }
    }
}

impl<A: ?Sized> std::fmt::Debug for RoleChainManager<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleChainManager")
            .field("sessions", &self.sessions)
            .field("default_config", &self.default_config)
            .finish()
    }
}

impl<A> RoleChainManager<A>
where
    A: RoleAssumer,
{
    pub fn new(assumer: A) -> Self {
        Self::from_arc(Arc::new(assumer))
    }
}

impl<A> RoleChainManager<A>
where
    A: RoleAssumer + ?Sized,
{
    pub fn from_arc(assumer: Arc<A>) -> Self {
        Self {
            assumer,
            sessions: SessionStore::new(),
            default_config: ChainConfig::default(),
        }
    }

    /// Replaces the config used when a call passes `None`.
    pub fn with_config(mut self, config: ChainConfig) -> Self {
        self.default_config = config;
        self
    }

    pub fn default_config(&self) -> &ChainConfig {
        &self.default_config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn assumer(&self) -> &A {
        &self.assumer
    }

    /// Runs the chain without storing it.
    async fn execute(
        &self,
        ctx: &Context,
        steps: Vec<RoleChainStep>,
        config: Option<ChainConfig>,
    ) -> crate::Result<ChainedSession> {
        let config = config.unwrap_or_else(|| self.default_config.clone());
        crate::validator::validate_chain(&steps, config.max_steps)?;

        let chain_id = generate_chain_id();
        tracing::debug!(chain_id = chain_id, steps = steps.len(), "assuming role chain");

        let mut pending = PendingChain::new(&chain_id, &steps, &config);
        pending.run(ctx, self.assumer.as_ref(), 0).await?;
        let credentials = pending.credentials;

        ChainedSession::new(chain_id, steps, config, credentials)
    }

    /// Validates and assumes `steps` in order, then stores the resulting session.
    ///
    /// On failure nothing is stored and the error names the failing step (1-indexed).
    pub async fn assume_role_chain(
        &self,
        ctx: &Context,
        steps: Vec<RoleChainStep>,
        config: Option<ChainConfig>,
    ) -> crate::Result<Arc<ChainedSession>> {
        let session = Arc::new(self.execute(ctx, steps, config).await?);
        self.sessions.put(session.clone());
        tracing::info!(
            chain_id = session.chain_id(),
            steps = session.steps().len(),
            state = ?ChainState::Stored,
            "role chain assumed"
        );
        Ok(session)
    }

    /// Runs a chain and returns only its final credentials; no session is kept.
    pub async fn assume_role_chain_credentials(
        &self,
        ctx: &Context,
        steps: Vec<RoleChainStep>,
        config: Option<ChainConfig>,
    ) -> crate::Result<Arc<Credentials>> {
        let session = self.execute(ctx, steps, config).await?;
        session
            .final_credentials()
            .ok_or_else(|| crate::Error::SessionNotFound(session.chain_id().to_owned()))
    }

    pub fn get_session(&self, chain_id: &str) -> crate::Result<Arc<ChainedSession>> {
        self.sessions
            .get(chain_id)
            .ok_or_else(|| crate::Error::SessionNotFound(chain_id.to_owned()))
    }

    pub fn remove_session(&self, chain_id: &str) -> bool {
        self.sessions.remove(chain_id)
    }

    pub fn list_sessions(&self) -> Vec<Arc<ChainedSession>> {
        self.sessions.list()
    }

    /// Re-assumes every step of a stored chain, replacing its contents in place.
    pub async fn refresh_chain(
        &self,
        ctx: &Context,
        chain_id: &str,
    ) -> crate::Result<Arc<ChainedSession>> {
        let session = self.get_session(chain_id)?;
        {
            let _guard = session.begin_refresh().await;
            self.refresh_session(ctx, &session, &crate::refresh::FullChain)
                .await?;
        }
        Ok(session)
    }

    /// Refreshes every stored session whose final credentials expire within its configured window.
    /// Sessions whose config disables auto refresh are left alone.
    ///
    /// Individual failures are logged and counted; only cancellation aborts the pass.
    pub async fn refresh_expiring_sessions(&self, ctx: &Context) -> crate::Result<RefreshReport> {
        let mut report = RefreshReport::default();
        for session in self.sessions.list() {
            let window = session.config().refresh_before_expiry;
            if !session.config().enable_auto_refresh
                || !session.needs_refresh(chrono::Utc::now(), window)
            {
                continue;
            }
            let Some(_guard) = session.try_begin_refresh() else {
                tracing::debug!(chain_id = session.chain_id(), "refresh already in progress");
                report.skipped += 1;
                continue;
            };
            // Checked again now that the guard is held.
            if !session.needs_refresh(chrono::Utc::now(), window) {
                continue;
            }
            let strategy = crate::refresh::strategy_for(session.config().refresh_strategy);
            match self.refresh_session(ctx, &session, strategy).await {
                Ok(()) => report.refreshed += 1,
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    tracing::warn!(chain_id = session.chain_id(), err = %e, "failed to refresh chain");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Caller must hold the session's refresh guard.
    async fn refresh_session(
        &self,
        ctx: &Context,
        session: &ChainedSession,
        strategy: &dyn crate::refresh::RefreshStrategy,
    ) -> crate::Result<()> {
        let current = session.credentials();
        let from = strategy
            .first_step(
                &current,
                chrono::Utc::now(),
                session.config().refresh_before_expiry,
            )
            .min(current.len());
        tracing::debug!(
            chain_id = session.chain_id(),
            from_step = from + 1,
            strategy = strategy.name(),
            "refreshing role chain"
        );

        let mut pending = PendingChain::new(session.chain_id(), session.steps(), session.config());
        pending.credentials = current;
        pending.run(ctx, self.assumer.as_ref(), from).await?;
        session.replace(pending.credentials)?;

        tracing::info!(chain_id = session.chain_id(), "role chain refreshed");
        Ok(())
    }

    /// Assumes one step with a short duration to check it is reachable. Nothing is stored.
    pub async fn validate_chain_step(
        &self,
        ctx: &Context,
        step: &RoleChainStep,
        prior: Option<&Credentials>,
    ) -> crate::Result<()> {
        let mut options = step.options.clone().unwrap_or_default();
        if let Some(ref session_name) = step.session_name {
            options.session_name = Some(session_name.clone());
        }
        if let Some(ref external_id) = step.external_id {
            options.external_id = Some(external_id.clone());
        }
        options.duration_seconds = VALIDATE_STEP_DURATION_SECONDS;
        self.assumer
            .assume(ctx, &step.role_arn, &options, prior)
            .await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedAssumer;
    use super::*;

    fn arn(name: &str) -> String {
        format!("arn:aws:iam::123456789012:role/{name}")
    }

    fn chain(names: &[&str]) -> Vec<RoleChainStep> {
        names.iter().map(|n| RoleChainStep::new(arn(n))).collect()
    }

    fn fast_config() -> ChainConfig {
        ChainConfig {
            retry_delay: std::time::Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn chains_of_every_length() {
        let names = ["A", "B", "C", "D", "E"];
        for len in 1..=names.len() {
            let manager = RoleChainManager::new(ScriptedAssumer::default());
            let session = manager
                .assume_role_chain(&Context::background(), chain(&names[..len]), None)
                .await
                .unwrap();
            let state = session.snapshot();
            assert_eq!(state.credentials.len(), len);
            assert!(Arc::ptr_eq(
                state.final_credentials.as_ref().unwrap(),
                &state.credentials[len - 1].credentials
            ));
            for (i, c) in state.credentials.iter().enumerate() {
                assert_eq!(c.step_index, i);
                assert_eq!(c.role_arn, arn(names[i]));
            }
            assert_eq!(manager.assumer().calls(), len);
            assert_eq!(manager.list_sessions().len(), 1);
        }
    }

    #[tokio::test]
    async fn prior_credentials_are_threaded() {
        let manager = RoleChainManager::new(ScriptedAssumer::default());
        manager
            .assume_role_chain(&Context::background(), chain(&["A", "B", "C"]), None)
            .await
            .unwrap();
        let log = manager.assumer().log.lock().clone();
        assert_eq!(log[0].acting, None);
        assert_eq!(log[1].acting.as_deref(), Some("A-0"));
        assert_eq!(log[2].acting.as_deref(), Some("B-1"));
    }

    #[tokio::test]
    async fn circular_chain_makes_no_calls() {
        let manager = RoleChainManager::new(ScriptedAssumer::default());
        let err = manager
            .assume_role_chain(&Context::background(), chain(&["A", "B", "A"]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::CircularDependency { step: 3, .. }));
        assert_eq!(manager.assumer().calls(), 0);
        assert!(manager.sessions().is_empty());
    }

    #[tokio::test]
    async fn too_long_for_config() {
        let manager = RoleChainManager::new(ScriptedAssumer::default());
        let config = ChainConfig {
            max_steps: 2,
            ..Default::default()
        };
        let err = manager
            .assume_role_chain(&Context::background(), chain(&["A", "B", "C"]), Some(config))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::ChainTooLong { len: 3, max: 2 }));
        assert_eq!(manager.assumer().calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_last_step_is_retried_and_reported() {
        let manager = RoleChainManager::new(ScriptedAssumer::failing(&["roleC"]));
        let err = manager
            .assume_role_chain(
                &Context::background(),
                chain(&["roleA", "roleB", "roleC"]),
                None,
            )
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("step 3"), "{message}");
        assert!(message.contains("roleC"), "{message}");
        assert!(matches!(err, crate::Error::ChainStepFailed { step: 3, .. }));
        assert_eq!(manager.assumer().calls(), 6);
        assert_eq!(manager.assumer().calls_for("roleC"), 4);
        assert!(manager.sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_delay_is_linear() {
        let manager = RoleChainManager::new(ScriptedAssumer::failing(&["A"]));
        let start = tokio::time::Instant::now();
        manager
            .assume_role_chain(&Context::background(), chain(&["A"]), None)
            .await
            .unwrap_err();
        // 1s + 2s + 3s
        let elapsed = start.elapsed();
        assert!(elapsed >= std::time::Duration::from_secs(6), "{elapsed:?}");
        assert!(elapsed < std::time::Duration::from_secs(7), "{elapsed:?}");
    }

    #[tokio::test]
    async fn transient_failure_recovers() {
        let assumer = ScriptedAssumer::default();
        assumer.flaky.lock().insert("B".to_owned(), 2);
        let manager = RoleChainManager::new(assumer).with_config(fast_config());
        let session = manager
            .assume_role_chain(&Context::background(), chain(&["A", "B"]), None)
            .await
            .unwrap();
        assert_eq!(session.credentials().len(), 2);
        assert_eq!(manager.assumer().calls_for("B"), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_at_once() {
        let manager = RoleChainManager::new(ScriptedAssumer::rejecting(&["B"])).with_config(fast_config());
        let err = manager
            .assume_role_chain(&Context::background(), chain(&["A", "B"]), None)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), crate::Error::MfaTokenMalformed(_)));
        assert_eq!(manager.assumer().calls_for("B"), 1);
    }

    #[tokio::test]
    async fn rollback_keeps_succeeded_prefix() {
        let assumer = ScriptedAssumer::failing(&["C"]);
        let steps = chain(&["A", "B", "C", "D"]);
        let config = ChainConfig {
            retry_attempts: 0,
            ..Default::default()
        };
        let mut pending = PendingChain::new("chain-test", &steps, &config);
        let err = pending
            .run(&Context::background(), &assumer, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::ChainStepFailed { step: 3, .. }));
        assert_eq!(pending.state, ChainState::RollingBack(2));
        assert_eq!(pending.credentials.len(), 2);
        assert_eq!(assumer.calls(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_chains_get_distinct_ids() {
        let manager = RoleChainManager::new(ScriptedAssumer::default());
        let mut tasks = Vec::new();
        for _ in 0..100 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .assume_role_chain(&Context::background(), chain(&["A"]), None)
                    .await
                    .map(|s| s.chain_id().to_owned())
            }));
        }
        let mut ids = std::collections::HashSet::new();
        for task in tasks {
            ids.insert(task.await.unwrap().unwrap());
        }
        assert_eq!(ids.len(), 100);
        assert_eq!(manager.sessions().len(), 100);
    }

    #[tokio::test]
    async fn session_lookup_and_removal() {
        let manager = RoleChainManager::new(ScriptedAssumer::default());
        let session = manager
            .assume_role_chain(&Context::background(), chain(&["A"]), None)
            .await
            .unwrap();
        let id = session.chain_id().to_owned();
        assert!(Arc::ptr_eq(&manager.get_session(&id).unwrap(), &session));
        assert!(manager.remove_session(&id));
        assert!(!manager.remove_session(&id));
        assert!(matches!(
            manager.get_session(&id),
            Err(crate::Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn refresh_without_expiring_sessions_is_a_no_op() {
        let manager = RoleChainManager::new(ScriptedAssumer::default());
        manager
            .assume_role_chain(&Context::background(), chain(&["A", "B"]), None)
            .await
            .unwrap();
        let report = manager
            .refresh_expiring_sessions(&Context::background())
            .await
            .unwrap();
        assert_eq!(report, RefreshReport::default());
        assert_eq!(manager.assumer().calls(), 2);
    }

    #[tokio::test]
    async fn refresh_expiring_full_chain() {
        let assumer = ScriptedAssumer::default();
        assumer.short_lived.lock().insert("B".to_owned());
        let manager = RoleChainManager::new(assumer);
        let session = manager
            .assume_role_chain(&Context::background(), chain(&["A", "B"]), None)
            .await
            .unwrap();
        let before = session.final_credentials().unwrap();

        let report = manager
            .refresh_expiring_sessions(&Context::background())
            .await
            .unwrap();
        assert_eq!(report.refreshed, 1);
        assert_eq!(manager.assumer().calls(), 4);

        let after = manager.get_session(session.chain_id()).unwrap();
        assert!(Arc::ptr_eq(&after, &session));
        assert_ne!(
            after.final_credentials().unwrap().access_key_id,
            before.access_key_id
        );
        assert!(after.refreshed_at().is_some());
        assert_eq!(manager.sessions().len(), 1);
    }

    #[tokio::test]
    async fn refresh_expiring_suffix_only() {
        let assumer = ScriptedAssumer::default();
        assumer.short_lived.lock().insert("C".to_owned());
        let manager = RoleChainManager::new(assumer).with_config(ChainConfig {
            refresh_strategy: crate::config::RefreshStrategyKind::ExpiringSuffix,
            ..Default::default()
        });
        let session = manager
            .assume_role_chain(&Context::background(), chain(&["A", "B", "C"]), None)
            .await
            .unwrap();
        let b_key = session.credentials()[1].credentials.access_key_id.clone();

        let report = manager
            .refresh_expiring_sessions(&Context::background())
            .await
            .unwrap();
        assert_eq!(report.refreshed, 1);
        assert_eq!(manager.assumer().calls(), 4);
        let last = manager.assumer().log.lock().last().cloned().unwrap();
        assert_eq!(last.role, "C");
        assert_eq!(last.acting, Some(b_key.clone()));
        assert_eq!(session.credentials()[1].credentials.access_key_id, b_key);
    }

    #[tokio::test]
    async fn failed_refresh_leaves_session_untouched() {
        let assumer = ScriptedAssumer::default();
        assumer.short_lived.lock().insert("A".to_owned());
        let manager = RoleChainManager::new(assumer).with_config(ChainConfig {
            retry_attempts: 0,
            ..Default::default()
        });
        let session = manager
            .assume_role_chain(&Context::background(), chain(&["A"]), None)
            .await
            .unwrap();
        let before = session.final_credentials().unwrap();
        manager.assumer().flaky.lock().insert("A".to_owned(), 1);

        let report = manager
            .refresh_expiring_sessions(&Context::background())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert!(Arc::ptr_eq(&session.final_credentials().unwrap(), &before));
        assert!(session.refreshed_at().is_none());
    }

    #[tokio::test]
    async fn busy_session_is_skipped() {
        let assumer = ScriptedAssumer::default();
        assumer.short_lived.lock().insert("A".to_owned());
        let manager = RoleChainManager::new(assumer);
        let session = manager
            .assume_role_chain(&Context::background(), chain(&["A"]), None)
            .await
            .unwrap();
        let _guard = session.try_begin_refresh().unwrap();
        let report = manager
            .refresh_expiring_sessions(&Context::background())
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(manager.assumer().calls(), 1);
    }

    #[tokio::test]
    async fn manual_refresh_keeps_chain_id() {
        let manager = RoleChainManager::new(ScriptedAssumer::default());
        let session = manager
            .assume_role_chain(&Context::background(), chain(&["A", "B"]), None)
            .await
            .unwrap();
        let refreshed = manager
            .refresh_chain(&Context::background(), session.chain_id())
            .await
            .unwrap();
        assert_eq!(refreshed.chain_id(), session.chain_id());
        assert_eq!(manager.assumer().calls(), 4);
        assert!(matches!(
            manager
                .refresh_chain(&Context::background(), "chain-missing")
                .await,
            Err(crate::Error::SessionNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_retry_sleep() {
        let manager = RoleChainManager::new(ScriptedAssumer::failing(&["A"])).with_config(
            ChainConfig {
                retry_delay: std::time::Duration::from_secs(3600),
                ..Default::default()
            },
        );
        let (ctx, handle) = Context::cancellable();
        let task = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.assume_role_chain(&ctx, chain(&["A"]), None).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        handle.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, crate::Error::Cancelled));
        assert_eq!(manager.assumer().calls(), 1);
        assert!(manager.sessions().is_empty());
    }

    #[tokio::test]
    async fn credentials_only_entry_point_stores_nothing() {
        let manager = RoleChainManager::new(ScriptedAssumer::default());
        let creds = manager
            .assume_role_chain_credentials(&Context::background(), chain(&["A", "B"]), None)
            .await
            .unwrap();
        assert_eq!(creds.access_key_id, "B-1");
        assert!(manager.sessions().is_empty());
    }

    #[tokio::test]
    async fn validate_step_uses_short_duration() {
        let manager = RoleChainManager::new(ScriptedAssumer::default());
        let step = RoleChainStep::new(arn("A")).with_external_id("partner");
        manager
            .validate_chain_step(&Context::background(), &step, None)
            .await
            .unwrap();
        let call = manager.assumer().log.lock()[0].clone();
        assert_eq!(call.options.duration_seconds, 900);
        assert_eq!(call.options.external_id.as_deref(), Some("partner"));
        assert!(manager.sessions().is_empty());
    }

    #[test]
    fn option_precedence() {
        let config = ChainConfig::default();
        let step = RoleChainStep::new(arn("A"))
            .with_session_name("from-step")
            .with_external_id("step-ext")
            .with_options(AssumeRoleOptions {
                session_name: Some("from-options".to_owned()),
                external_id: Some("options-ext".to_owned()),
                duration_seconds: 1800,
                ..Default::default()
            });
        let options = effective_options("chain-1-2-3", 0, &step, &config);
        assert_eq!(options.session_name.as_deref(), Some("from-step"));
        assert_eq!(options.external_id.as_deref(), Some("step-ext"));
        assert_eq!(options.duration_seconds, 1800);

        let options = effective_options("chain-1-2-3", 1, &RoleChainStep::new(arn("B")), &config);
        assert_eq!(options.session_name.as_deref(), Some("rolechain-1-2-3-step-2"));
        assert_eq!(options.duration_seconds, 3600);
    }

    #[test]
    fn chain_ids_are_unique_within_a_process() {
        let a = generate_chain_id();
        let b = generate_chain_id();
        assert_ne!(a, b);
        assert!(a.starts_with("chain-"));
        assert!(default_session_name(&a, 4).len() <= 64);
    }
}
