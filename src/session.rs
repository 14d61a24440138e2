//! In-memory table of completed role chains.
//!
//! Lock order: [`SessionStore`]'s map lock is only held for map access and is always released
//! before a [`ChainedSession`]'s own state lock is taken. No code path holds a session lock while
//! acquiring the map lock.

/// Mutable part of a [`ChainedSession`].
#[derive(Clone, Debug)]
pub struct SessionState {
    pub credentials: Vec<crate::credentials::ChainCredentials>,
    pub final_credentials: Option<std::sync::Arc<crate::credentials::Credentials>>,
    pub last_used_at: chrono::DateTime<chrono::Utc>,
    pub refreshed_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct ChainedSession {
    chain_id: String,
    steps: Vec<crate::credentials::RoleChainStep>,
    config: crate::config::ChainConfig,
    created_at: chrono::DateTime<chrono::Utc>,
    state: parking_lot::RwLock<SessionState>,
    refresh_guard: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ChainedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ChainedSession")
            .field("chain_id", &self.chain_id)
            .field("steps", &self.steps.len())
            .field("credentials", &state.credentials.len())
            .field(
                "expiration",
                &state.final_credentials.as_ref().map(|c| c.expiration),
            )
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl ChainedSession {
    /// Builds a completed session. `credentials` must hold one entry per step.
    pub(crate) fn new(
        chain_id: String,
        steps: Vec<crate::credentials::RoleChainStep>,
        config: crate::config::ChainConfig,
        credentials: Vec<crate::credentials::ChainCredentials>,
    ) -> crate::Result<Self> {
        let final_credentials = final_of(&steps, &credentials)?;
        let now = chrono::Utc::now();
        Ok(Self {
            chain_id,
            steps,
            config,
            created_at: now,
            state: parking_lot::RwLock::new(SessionState {
                credentials,
                final_credentials: Some(final_credentials),
                last_used_at: now,
                refreshed_at: None,
            }),
            refresh_guard: tokio::sync::Mutex::new(()),
        })
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn steps(&self) -> &[crate::credentials::RoleChainStep] {
        &self.steps
    }

    pub fn config(&self) -> &crate::config::ChainConfig {
        &self.config
    }

    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.created_at
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn credentials(&self) -> Vec<crate::credentials::ChainCredentials> {
        self.state.read().credentials.clone()
    }

    pub fn final_credentials(&self) -> Option<std::sync::Arc<crate::credentials::Credentials>> {
        self.state.read().final_credentials.clone()
    }

    pub fn last_used_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.state.read().last_used_at
    }

    pub fn refreshed_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.state.read().refreshed_at
    }

    pub(crate) fn touch(&self) {
        self.state.write().last_used_at = chrono::Utc::now();
    }

    /// True when the final credentials are still valid but expire within `window`.
    pub fn needs_refresh(
        &self,
        now: chrono::DateTime<chrono::Utc>,
        window: std::time::Duration,
    ) -> bool {
        self.state
            .read()
            .final_credentials
            .as_ref()
            .is_some_and(|c| c.expires_within(now, window))
    }

    /// Swaps in freshly assumed credentials, keeping the chain id.
    pub(crate) fn replace(
        &self,
        credentials: Vec<crate::credentials::ChainCredentials>,
    ) -> crate::Result<()> {
        let final_credentials = final_of(&self.steps, &credentials)?;
        let mut state = self.state.write();
        state.credentials = credentials;
        state.final_credentials = Some(final_credentials);
        state.refreshed_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// Held for the duration of a refresh; `None` if one is already running.
    pub(crate) fn try_begin_refresh(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        self.refresh_guard.try_lock().ok()
    }

    pub(crate) async fn begin_refresh(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.refresh_guard.lock().await
    }
}

fn final_of(
    steps: &[crate::credentials::RoleChainStep],
    credentials: &[crate::credentials::ChainCredentials],
) -> crate::Result<std::sync::Arc<crate::credentials::Credentials>> {
    match credentials.last() {
        Some(last) if credentials.len() == steps.len() => Ok(last.credentials.clone()),
        _ => Err(crate::Error::UserError(format!(
            "incomplete chain: {} of {} steps assumed",
            credentials.len(),
            steps.len()
        ))),
    }
}

#[derive(Clone, Default)]
pub struct SessionStore {
    items: std::sync::Arc<
        parking_lot::RwLock<std::collections::HashMap<String, std::sync::Arc<ChainedSession>>>,
    >,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("len", &self.len())
            .finish()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, session: std::sync::Arc<ChainedSession>) {
        tracing::trace!(chain_id = session.chain_id(), "Storing session");
        let previous = self
            .items
            .write()
            .insert(session.chain_id().to_owned(), session);
        if let Some(previous) = previous {
            tracing::warn!(chain_id = previous.chain_id(), "Replaced an existing session");
        }
    }

    /// Looks up a session and updates its `last_used_at`.
    pub fn get(&self, chain_id: &str) -> Option<std::sync::Arc<ChainedSession>> {
        let session = self.peek(chain_id)?;
        session.touch();
        Some(session)
    }

    /// Looks up a session without touching it.
    pub fn peek(&self, chain_id: &str) -> Option<std::sync::Arc<ChainedSession>> {
        self.items.read().get(chain_id).cloned()
    }

    pub fn remove(&self, chain_id: &str) -> bool {
        let removed = self.items.write().remove(chain_id).is_some();
        if removed {
            tracing::debug!(chain_id = chain_id, "Discarding a session");
        }
        removed
    }

    pub fn list(&self) -> Vec<std::sync::Arc<ChainedSession>> {
        self.items.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

#[cfg(test)]
pub(crate) fn test_session(
    chain_id: &str,
    expirations: &[chrono::DateTime<chrono::Utc>],
) -> ChainedSession {
    let steps: Vec<_> = (0..expirations.len())
        .map(|i| {
            crate::credentials::RoleChainStep::new(format!(
                "arn:aws:iam::123456789012:role/Role{i}"
            ))
        })
        .collect();
    let credentials = expirations
        .iter()
        .enumerate()
        .map(|(i, exp)| crate::credentials::ChainCredentials {
            step_index: i,
            role_arn: steps[i].role_arn.clone(),
            credentials: std::sync::Arc::new(crate::credentials::test_credentials(
                &format!("ASIA{i}"),
                *exp,
            )),
            assumed_at: chrono::Utc::now(),
        })
        .collect();
    ChainedSession::new(
        chain_id.to_owned(),
        steps,
        crate::config::ChainConfig::default(),
        credentials,
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hours(h: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now() + chrono::Duration::hours(h)
    }

    #[test]
    fn final_credentials_is_last_step() {
        let session = test_session("chain-1", &[hours(1), hours(2)]);
        let state = session.snapshot();
        assert_eq!(state.credentials.len(), 2);
        assert_eq!(
            state.final_credentials.unwrap().access_key_id,
            state.credentials[1].credentials.access_key_id
        );
        assert!(state.refreshed_at.is_none());
    }

    #[test]
    fn incomplete_session_is_rejected() {
        let full = test_session("chain-1", &[hours(1), hours(1)]);
        let mut creds = full.credentials();
        creds.pop();
        let err = ChainedSession::new(
            "chain-2".to_owned(),
            full.steps().to_vec(),
            crate::config::ChainConfig::default(),
            creds.clone(),
        );
        assert!(err.is_err());
        assert!(full.replace(creds).is_err());
        assert_eq!(full.credentials().len(), 2);
    }

    #[test]
    fn replace_keeps_chain_id() {
        let session = test_session("chain-1", &[hours(1)]);
        let mut creds = session.credentials();
        creds[0].credentials = std::sync::Arc::new(crate::credentials::test_credentials(
            "ASIANEW",
            hours(3),
        ));
        session.replace(creds).unwrap();
        assert_eq!(session.chain_id(), "chain-1");
        assert_eq!(session.final_credentials().unwrap().access_key_id, "ASIANEW");
        assert!(session.refreshed_at().is_some());
    }

    #[test]
    fn needs_refresh_window() {
        let window = std::time::Duration::from_secs(300);
        let now = chrono::Utc::now();
        let soon = test_session("a", &[hours(1), now + chrono::Duration::seconds(60)]);
        assert!(soon.needs_refresh(now, window));
        let later = test_session("b", &[hours(1), hours(1)]);
        assert!(!later.needs_refresh(now, window));
        let expired = test_session("c", &[now - chrono::Duration::seconds(1)]);
        assert!(!expired.needs_refresh(now, window));
    }

    #[test]
    fn store_get_touches_peek_does_not() {
        let store = SessionStore::new();
        let session = std::sync::Arc::new(test_session("chain-1", &[hours(1)]));
        let before = session.last_used_at();
        store.put(session.clone());

        std::thread::sleep(std::time::Duration::from_millis(5));
        store.peek("chain-1").unwrap();
        assert_eq!(session.last_used_at(), before);

        store.get("chain-1").unwrap();
        assert!(session.last_used_at() > before);
    }

    #[test]
    fn store_remove_and_list() {
        let store = SessionStore::new();
        assert!(store.is_empty());
        store.put(std::sync::Arc::new(test_session("a", &[hours(1)])));
        store.put(std::sync::Arc::new(test_session("b", &[hours(1)])));
        assert_eq!(store.len(), 2);

        let mut ids: Vec<_> = store.list().iter().map(|s| s.chain_id().to_owned()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(store.remove("a"));
        assert!(!store.remove("a"));
        assert!(store.get("a").is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn refresh_guard_is_exclusive() {
        let session = test_session("a", &[hours(1)]);
        let guard = session.try_begin_refresh().unwrap();
        assert!(session.try_begin_refresh().is_none());
        drop(guard);
        let _guard = session.begin_refresh().await;
        assert!(session.try_begin_refresh().is_none());
    }
}
