//! A single role assumption step, with MFA-gated and external-ID-gated variants.

/// The capability the chain orchestrator needs: `(ctx, role_arn, options, acting) -> Credentials`.
///
/// `prior == None` assumes with the ambient identity; otherwise exactly `prior` acts.
#[async_trait::async_trait]
pub trait RoleAssumer: Send + Sync + 'static {
    async fn assume(
        &self,
        ctx: &crate::context::Context,
        role_arn: &str,
        options: &crate::credentials::AssumeRoleOptions,
        prior: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<crate::credentials::Credentials>;
}

pub struct RoleAssumptionEngine<P> {
    provider: P,
}

impl<P> std::fmt::Debug for RoleAssumptionEngine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleAssumptionEngine").finish()
    }
}

impl<P> RoleAssumptionEngine<P>
where
    P: crate::provider::CredentialProvider,
{
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Assumes `role_arn`. When `options.mfa_serial` is set this is the MFA variant and the device
    /// and token are checked before the provider sees the token.
    pub async fn assume_role(
        &self,
        ctx: &crate::context::Context,
        role_arn: &str,
        options: &crate::credentials::AssumeRoleOptions,
        prior: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<crate::credentials::Credentials> {
        if let Some(ref serial) = options.mfa_serial {
            let token = options.mfa_token.as_ref().ok_or_else(|| {
                crate::Error::MfaTokenMalformed(
                    "MFA serial is given but the token is missing".to_owned(),
                )
            })?;
            self.check_mfa(ctx, serial, token, prior).await?;
        }

        let mut options = std::borrow::Cow::Borrowed(options);
        if options.session_name.as_deref().is_none_or(str::is_empty) {
            options.to_mut().session_name = Some(generate_session_name());
        }

        let output = self
            .provider
            .assume_role(ctx, role_arn, &options, prior)
            .await
            .map_err(|e| wrap_failure(role_arn, e))?;

        let account = crate::validator::account_from_arn(&output.assumed_role_user.arn)
            .unwrap_or_default()
            .to_owned();
        let credentials = crate::credentials::Credentials {
            access_key_id: output.credentials.access_key_id,
            secret_access_key: output.credentials.secret_access_key,
            session_token: Some(output.credentials.session_token).filter(|t| !t.is_empty()),
            region: options.region.clone(),
            account,
            expiration: output.credentials.expiration,
            properties: crate::credentials::CredentialProperties {
                role_arn: role_arn.to_owned(),
                session_name: options.session_name.clone().unwrap_or_default(),
                assumed_role_id: output.assumed_role_user.assumed_role_id,
                assumed_role_arn: output.assumed_role_user.arn,
            },
        };

        tracing::debug!(
            role_arn = role_arn,
            access_key_id = %credentials.access_key_id,
            expiration = ?credentials.expiration,
            "AssumeRole completed successfully"
        );
        Ok(credentials)
    }

    /// MFA-gated assumption; `mfa_serial`/`mfa_token` override whatever `options` carries.
    pub async fn assume_with_mfa(
        &self,
        ctx: &crate::context::Context,
        role_arn: &str,
        mfa_serial: &str,
        mfa_token: secrecy::SecretString,
        options: &crate::credentials::AssumeRoleOptions,
        prior: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<crate::credentials::Credentials> {
        let mut options = options.clone();
        options.mfa_serial = Some(mfa_serial.to_owned());
        options.mfa_token = Some(mfa_token);
        self.assume_role(ctx, role_arn, &options, prior).await
    }

    /// External-ID-gated assumption. The external ID is handed to the provider verbatim.
    pub async fn assume_with_external_id(
        &self,
        ctx: &crate::context::Context,
        role_arn: &str,
        external_id: &str,
        options: &crate::credentials::AssumeRoleOptions,
        prior: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<crate::credentials::Credentials> {
        if external_id.is_empty() {
            return Err(crate::Error::ExternalIdEmpty);
        }
        let mut options = options.clone();
        options.external_id = Some(external_id.to_owned());
        self.assume_role(ctx, role_arn, &options, prior).await
    }

    pub async fn list_mfa_devices(
        &self,
        ctx: &crate::context::Context,
        user_name: &str,
        prior: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<Vec<crate::provider::MfaDevice>> {
        self.provider.list_mfa_devices(ctx, user_name, prior).await
    }

    /// Lists the MFA devices of the IAM user behind `prior` (or the ambient identity).
    pub async fn current_user_mfa_devices(
        &self,
        ctx: &crate::context::Context,
        prior: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<Vec<crate::provider::MfaDevice>> {
        let identity = self.provider.get_caller_identity(ctx, prior).await?;
        let user_name = iam_user_name(&identity.arn).ok_or_else(|| {
            crate::Error::UserError(format!(
                "caller {} is not an IAM user and has no MFA devices",
                identity.arn
            ))
        })?;
        tracing::debug!(user_name = user_name, account = %identity.account, "resolved current IAM user");
        self.provider.list_mfa_devices(ctx, user_name, prior).await
    }

    /// Whether the role's trust policy only admits MFA-authenticated principals.
    ///
    /// The policy is read with `prior`'s identity, which needs `iam:GetRole` in the role's account.
    pub async fn role_requires_mfa(
        &self,
        ctx: &crate::context::Context,
        role_arn: &str,
        prior: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<bool> {
        let arn = crate::validator::RoleArn::parse(role_arn).ok_or_else(|| {
            crate::Error::UserError(format!("invalid role ARN: {role_arn}"))
        })?;
        let role_name = arn.role_name.rsplit('/').next().unwrap_or(arn.role_name);
        let policy = self
            .provider
            .get_role_trust_policy(ctx, role_name, prior)
            .await?;
        Ok(trust_policy_requires_mfa(&policy))
    }

    async fn check_mfa(
        &self,
        ctx: &crate::context::Context,
        serial: &str,
        token: &secrecy::SecretString,
        prior: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<crate::provider::MfaDevice> {
        {
            use secrecy::ExposeSecret;
            validate_mfa_token(token.expose_secret())?;
        }
        let user_name = mfa_user_name(serial).ok_or_else(|| {
            crate::Error::MfaDeviceInvalid(format!("invalid MFA device ARN format: {serial}"))
        })?;

        let devices = match self.provider.list_mfa_devices(ctx, user_name, prior).await {
            Ok(d) => d,
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                tracing::warn!(serial = serial, user_name = user_name, err = ?e, "failed to list MFA devices");
                return Err(crate::Error::MfaDeviceInvalid(format!(
                    "failed to list MFA devices: {e}"
                )));
            }
        };
        match devices.into_iter().find(|d| d.serial_number == serial) {
            Some(device) => {
                tracing::debug!(serial = serial, kind = ?device.kind, "MFA device verified");
                Ok(device)
            }
            None => Err(crate::Error::MfaDeviceInvalid(format!(
                "MFA device {serial} not found or not enabled for {user_name}"
            ))),
        }
    }
}

#[async_trait::async_trait]
impl<P> RoleAssumer for RoleAssumptionEngine<P>
where
    P: crate::provider::CredentialProvider + 'static,
{
    async fn assume(
        &self,
        ctx: &crate::context::Context,
        role_arn: &str,
        options: &crate::credentials::AssumeRoleOptions,
        prior: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<crate::credentials::Credentials> {
        self.assume_role(ctx, role_arn, options, prior).await
    }
}

fn wrap_failure(role_arn: &str, e: crate::Error) -> crate::Error {
    if e.is_cancellation() {
        return e;
    }
    crate::Error::AssumeRoleFailed {
        role_arn: role_arn.to_owned(),
        source: Box::new(e),
    }
}

/// MFA tokens are exactly six ASCII digits.
pub fn validate_mfa_token(token: &str) -> crate::Result<()> {
    if token.len() != 6 {
        return Err(crate::Error::MfaTokenMalformed(
            "MFA token must be 6 digits".to_owned(),
        ));
    }
    if !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(crate::Error::MfaTokenMalformed(
            "MFA token must contain only digits".to_owned(),
        ));
    }
    Ok(())
}

/// `arn:aws:iam::123456789012:mfa/alice` -> `alice`
fn mfa_user_name(serial: &str) -> Option<&str> {
    let (_, user) = serial.rsplit_once('/')?;
    if user.is_empty() {
        return None;
    }
    Some(user)
}

/// `arn:aws:iam::123456789012:user/path/alice` -> `alice`
fn iam_user_name(arn: &str) -> Option<&str> {
    let resource = arn.splitn(6, ':').nth(5)?;
    let user = resource.strip_prefix("user/")?.rsplit('/').next()?;
    (!user.is_empty()).then_some(user)
}

const MFA_CONDITION_KEYS: &[&str] = &["aws:MultiFactorAuthPresent", "aws:MultiFactorAuthAge"];

/// True when some `Allow` statement is conditioned on `aws:MultiFactorAuthPresent` being true or on
/// `aws:MultiFactorAuthAge`.
pub fn trust_policy_requires_mfa(policy: &serde_json::Value) -> bool {
    let statements = match policy.get("Statement") {
        Some(serde_json::Value::Array(a)) => a.iter().collect::<Vec<_>>(),
        Some(s @ serde_json::Value::Object(_)) => vec![s],
        _ => return false,
    };
    statements.into_iter().any(|statement| {
        if statement.get("Effect").and_then(|e| e.as_str()) != Some("Allow") {
            return false;
        }
        let Some(conditions) = statement.get("Condition").and_then(|c| c.as_object()) else {
            return false;
        };
        conditions.iter().any(|(operator, entries)| {
            let Some(entries) = entries.as_object() else {
                return false;
            };
            entries.iter().any(|(key, value)| {
                let Some(key) = MFA_CONDITION_KEYS.iter().find(|k| k.eq_ignore_ascii_case(key)) else {
                    return false;
                };
                if *key == "aws:MultiFactorAuthAge" {
                    return operator.starts_with("Numeric");
                }
                operator.starts_with("Bool") && condition_is_true(value)
            })
        })
    })
}

fn condition_is_true(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => s.eq_ignore_ascii_case("true"),
        serde_json::Value::Array(a) => a.iter().any(condition_is_true),
        _ => false,
    }
}

/// Session name appears in CloudTrail logs for auditing.
pub(crate) fn generate_session_name() -> String {
    let timestamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let random: u16 = rand::random();
    format!("{}-{}-{:x}", env!("CARGO_PKG_NAME"), timestamp, random)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted provider double which counts calls.

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct MockProvider {
        pub assume_calls: AtomicUsize,
        pub list_calls: AtomicUsize,
        pub devices: Vec<String>,
        pub fail_assume: bool,
        pub last_options: parking_lot::Mutex<Option<crate::credentials::AssumeRoleOptions>>,
        pub last_acting: parking_lot::Mutex<Option<String>>,
        /// `sts get-caller-identity` ARN; an IAM user `alice` when unset.
        pub caller_arn: Option<String>,
        pub trust_policy: Option<serde_json::Value>,
        pub last_role_name: parking_lot::Mutex<Option<String>>,
    }

    impl MockProvider {
        pub fn with_devices(devices: &[&str]) -> Self {
            Self {
                devices: devices.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        pub fn assume_calls(&self) -> usize {
            self.assume_calls.load(Ordering::SeqCst)
        }

        pub fn list_calls(&self) -> usize {
            self.list_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl crate::provider::CredentialProvider for MockProvider {
        async fn assume_role(
            &self,
            _ctx: &crate::context::Context,
            role_arn: &str,
            options: &crate::credentials::AssumeRoleOptions,
            acting: Option<&crate::credentials::Credentials>,
        ) -> crate::Result<crate::provider::AssumeRoleOutput> {
            let n = self.assume_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_options.lock() = Some(options.clone());
            *self.last_acting.lock() = acting.map(|c| c.access_key_id.clone());
            if self.fail_assume {
                return Err(crate::provider::Error::Unknown(
                    "mock failure".to_owned(),
                    Box::new(std::io::Error::other("mock failure")),
                )
                .into());
            }
            let role_name = role_arn.rsplit('/').next().unwrap_or_default();
            let account = crate::validator::account_from_arn(role_arn).unwrap_or_default();
            Ok(crate::provider::AssumeRoleOutput {
                credentials: crate::provider::AssumeRoleOutputCredentials {
                    access_key_id: format!("ASIA{role_name}{n}"),
                    secret_access_key: "secret".to_owned().into(),
                    session_token: "token".to_owned(),
                    expiration: chrono::Utc::now() + chrono::Duration::hours(1),
                },
                assumed_role_user: crate::provider::AssumedRoleUser {
                    assumed_role_id: format!("AROA{role_name}:session"),
                    arn: format!("arn:aws:sts::{account}:assumed-role/{role_name}/session"),
                },
            })
        }

        async fn list_mfa_devices(
            &self,
            _ctx: &crate::context::Context,
            user_name: &str,
            _acting: Option<&crate::credentials::Credentials>,
        ) -> crate::Result<Vec<crate::provider::MfaDevice>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .devices
                .iter()
                .map(|serial| crate::provider::MfaDevice {
                    serial_number: serial.clone(),
                    user_name: user_name.to_owned(),
                    enable_date: None,
                    kind: crate::provider::MfaDevice::kind_of(serial),
                })
                .collect())
        }

        async fn get_caller_identity(
            &self,
            _ctx: &crate::context::Context,
            _acting: Option<&crate::credentials::Credentials>,
        ) -> crate::Result<crate::provider::CallerIdentity> {
            let arn = self
                .caller_arn
                .clone()
                .unwrap_or_else(|| "arn:aws:iam::123456789012:user/alice".to_owned());
            Ok(crate::provider::CallerIdentity {
                user_id: "AIDAEXAMPLE".to_owned(),
                account: "123456789012".to_owned(),
                arn,
            })
        }

        async fn get_role_trust_policy(
            &self,
            _ctx: &crate::context::Context,
            role_name: &str,
            _acting: Option<&crate::credentials::Credentials>,
        ) -> crate::Result<serde_json::Value> {
            *self.last_role_name.lock() = Some(role_name.to_owned());
            Ok(self
                .trust_policy
                .clone()
                .unwrap_or_else(|| serde_json::json!({"Version": "2012-10-17", "Statement": []})))
        }
    }
}
