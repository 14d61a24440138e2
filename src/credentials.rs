//! Credential and chain-step data types shared across the crate.

/// Temporary credentials produced by one successful role assumption.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    #[serde(serialize_with = "serialize_secret")]
    pub secret_access_key: secrecy::SecretString,
    pub session_token: Option<String>,
    pub region: Option<String>,
    pub account: String,
    pub expiration: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub properties: CredentialProperties,
}

/// Audit trail of the assumption that produced a [`Credentials`].
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CredentialProperties {
    pub role_arn: String,
    pub session_name: String,
    pub assumed_role_id: String,
    pub assumed_role_arn: String,
}

impl Credentials {
    pub fn is_expired_at(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.expiration <= now
    }

    /// True when still valid at `now` but expiring within `window`.
    pub fn expires_within(
        &self,
        now: chrono::DateTime<chrono::Utc>,
        window: std::time::Duration,
    ) -> bool {
        let Ok(window) = chrono::Duration::from_std(window) else {
            return self.expiration > now;
        };
        now < self.expiration && self.expiration < now + window
    }
}

fn serialize_secret<S>(secret: &secrecy::SecretString, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use secrecy::ExposeSecret;
    serializer.serialize_str(secret.expose_secret())
}

/// One hop of a role chain.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct RoleChainStep {
    pub role_arn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<AssumeRoleOptions>,
}

impl RoleChainStep {
    pub fn new(role_arn: impl Into<String>) -> Self {
        Self {
            role_arn: role_arn.into(),
            ..Default::default()
        }
    }

    pub fn with_session_name(mut self, session_name: impl Into<String>) -> Self {
        self.session_name = Some(session_name.into());
        self
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_options(mut self, options: AssumeRoleOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Per-step overrides for `sts:AssumeRole`.
///
/// `duration_seconds == 0` means the chain's configured default applies.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AssumeRoleOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    pub duration_seconds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mfa_serial: Option<String>,
    #[serde(skip_serializing)]
    pub mfa_token: Option<secrecy::SecretString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub policy_arns: Vec<String>,
}

/// Credentials obtained at one step of a chain.
#[derive(Clone, Debug)]
pub struct ChainCredentials {
    pub step_index: usize,
    pub role_arn: String,
    pub credentials: std::sync::Arc<Credentials>,
    pub assumed_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
pub(crate) fn test_credentials(
    access_key_id: &str,
    expiration: chrono::DateTime<chrono::Utc>,
) -> Credentials {
    Credentials {
        access_key_id: access_key_id.to_owned(),
        secret_access_key: format!("{access_key_id}-secret").into(),
        session_token: Some(format!("{access_key_id}-token")),
        region: None,
        account: "123456789012".to_owned(),
        expiration,
        properties: CredentialProperties::default(),
    }
}
