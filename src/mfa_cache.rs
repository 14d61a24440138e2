//! Reuse of MFA-gated credentials, so a fresh token is only needed once the previous session is
//! about to expire.

use std::sync::Arc;

use crate::context::Context;
use crate::credentials::{AssumeRoleOptions, Credentials};

/// Cached credentials are not handed out within this long of their expiry.
pub const DEFAULT_EXPIRY_BUFFER: std::time::Duration = std::time::Duration::from_secs(5 * 60);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    role_arn: String,
    mfa_serial: String,
}

/// MFA-assumed credentials keyed by `(role ARN, MFA device)`.
#[derive(Clone, Debug)]
pub struct MfaSessionCache {
    items: Arc<parking_lot::RwLock<std::collections::HashMap<CacheKey, Arc<Credentials>>>>,
    buffer: std::time::Duration,
}

impl Default for MfaSessionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MfaSessionCache {
    pub fn new() -> Self {
        Self {
            items: Default::default(),
            buffer: DEFAULT_EXPIRY_BUFFER,
        }
    }

    pub fn with_expiry_buffer(mut self, buffer: std::time::Duration) -> Self {
        self.buffer = buffer;
        self
    }

    /// Cached credentials still valid for longer than the expiry buffer.
    pub fn get(&self, role_arn: &str, mfa_serial: &str) -> Option<Arc<Credentials>> {
        let key = CacheKey {
            role_arn: role_arn.to_owned(),
            mfa_serial: mfa_serial.to_owned(),
        };
        let now = chrono::Utc::now();
        self.items
            .read()
            .get(&key)
            .filter(|c| !c.is_expired_at(now) && !c.expires_within(now, self.buffer))
            .cloned()
    }

    /// Returns cached credentials for `(role_arn, options.mfa_serial)`, assuming the role through
    /// `assumer` only when there are none usable. The token in `options` is not consulted on a hit.
    pub async fn get_or_assume<A>(
        &self,
        ctx: &Context,
        assumer: &A,
        role_arn: &str,
        options: &AssumeRoleOptions,
        prior: Option<&Credentials>,
    ) -> crate::Result<Arc<Credentials>>
    where
        A: crate::engine::RoleAssumer + ?Sized,
    {
        let serial = options.mfa_serial.as_deref().ok_or_else(|| {
            crate::Error::MfaDeviceInvalid("no MFA device given for a cached MFA session".to_owned())
        })?;
        if let Some(cached) = self.get(role_arn, serial) {
            tracing::debug!(role_arn = role_arn, expiration = ?cached.expiration, "reusing MFA session");
            return Ok(cached);
        }

        let credentials = Arc::new(assumer.assume(ctx, role_arn, options, prior).await?);
        self.items.write().insert(
            CacheKey {
                role_arn: role_arn.to_owned(),
                mfa_serial: serial.to_owned(),
            },
            credentials.clone(),
        );
        Ok(credentials)
    }

    /// Drops entries past their expiration; returns how many were removed.
    pub fn clear_expired(&self) -> usize {
        let now = chrono::Utc::now();
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|_, c| !c.is_expired_at(now));
        before - items.len()
    }

    pub fn remove(&self, role_arn: &str, mfa_serial: &str) -> bool {
        self.items
            .write()
            .remove(&CacheKey {
                role_arn: role_arn.to_owned(),
                mfa_serial: mfa_serial.to_owned(),
            })
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}
