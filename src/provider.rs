//! Provider boundary: the external credential-exchange command.
//!
//! The chaining logic only depends on [`CredentialProvider`]; [`AwsCliProvider`] is the shipped
//! implementation which shells out to `aws sts assume-role` and injects the acting identity through
//! the child's environment.

/// Output of `sts:AssumeRole` as printed by `aws sts assume-role --output json`.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AssumeRoleOutput {
    pub credentials: AssumeRoleOutputCredentials,
    pub assumed_role_user: AssumedRoleUser,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AssumeRoleOutputCredentials {
    pub access_key_id: String,
    pub secret_access_key: secrecy::SecretString,
    pub session_token: String,
    pub expiration: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AssumedRoleUser {
    pub assumed_role_id: String,
    pub arn: String,
}

/// Output of `aws sts get-caller-identity --output json`.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallerIdentity {
    pub user_id: String,
    pub account: String,
    pub arn: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetRoleOutput {
    role: GetRoleItem,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetRoleItem {
    assume_role_policy_document: serde_json::Value,
}

impl GetRoleItem {
    /// The CLI decodes the document into an object; raw API responses carry it as a string.
    fn into_policy(self) -> crate::Result<serde_json::Value> {
        match self.assume_role_policy_document {
            serde_json::Value::String(s) => Ok(serde_json::from_str(&s)?),
            v => Ok(v),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MfaDeviceKind {
    Virtual,
    Hardware,
}

#[derive(Clone, Debug)]
pub struct MfaDevice {
    pub serial_number: String,
    pub user_name: String,
    pub enable_date: Option<chrono::DateTime<chrono::Utc>>,
    pub kind: MfaDeviceKind,
}

impl MfaDevice {
    pub fn kind_of(serial_number: &str) -> MfaDeviceKind {
        if serial_number.contains(":mfa/") {
            MfaDeviceKind::Virtual
        } else {
            MfaDeviceKind::Hardware
        }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListMfaDevicesOutput {
    #[serde(rename = "MFADevices", default)]
    mfa_devices: Vec<ListMfaDevicesItem>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListMfaDevicesItem {
    serial_number: String,
    #[serde(default)]
    user_name: String,
    #[serde(default)]
    enable_date: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<ListMfaDevicesItem> for MfaDevice {
    fn from(item: ListMfaDevicesItem) -> MfaDevice {
        MfaDevice {
            kind: MfaDevice::kind_of(&item.serial_number),
            serial_number: item.serial_number,
            user_name: item.user_name,
            enable_date: item.enable_date,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid Argument: {0}")]
    InvalidArgument(String, #[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String, #[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Permission denied: {0}")]
    PermissionDenied(String, #[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String, #[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Not found: {0}")]
    NotFound(String, #[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Unknown: {0} ({1})")]
    Unknown(String, #[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Malformed requests fail identically on every attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Error::InvalidArgument(..) | Error::NotFound(..))
    }
}

/// A capability to exchange an identity for role credentials.
///
/// `acting == None` means the ambient/default identity of the process.
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn assume_role(
        &self,
        ctx: &crate::context::Context,
        role_arn: &str,
        options: &crate::credentials::AssumeRoleOptions,
        acting: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<AssumeRoleOutput>;

    async fn list_mfa_devices(
        &self,
        ctx: &crate::context::Context,
        user_name: &str,
        acting: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<Vec<MfaDevice>>;

    async fn get_caller_identity(
        &self,
        ctx: &crate::context::Context,
        acting: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<CallerIdentity>;

    /// Trust policy (`AssumeRolePolicyDocument`) of a role in the acting identity's account.
    async fn get_role_trust_policy(
        &self,
        ctx: &crate::context::Context,
        role_name: &str,
        acting: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<serde_json::Value>;
}

#[async_trait::async_trait]
impl<P> CredentialProvider for std::sync::Arc<P>
where
    P: CredentialProvider + ?Sized,
{
    async fn assume_role(
        &self,
        ctx: &crate::context::Context,
        role_arn: &str,
        options: &crate::credentials::AssumeRoleOptions,
        acting: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<AssumeRoleOutput> {
        (**self).assume_role(ctx, role_arn, options, acting).await
    }

    async fn list_mfa_devices(
        &self,
        ctx: &crate::context::Context,
        user_name: &str,
        acting: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<Vec<MfaDevice>> {
        (**self).list_mfa_devices(ctx, user_name, acting).await
    }

    async fn get_caller_identity(
        &self,
        ctx: &crate::context::Context,
        acting: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<CallerIdentity> {
        (**self).get_caller_identity(ctx, acting).await
    }

    async fn get_role_trust_policy(
        &self,
        ctx: &crate::context::Context,
        role_name: &str,
        acting: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<serde_json::Value> {
        (**self).get_role_trust_policy(ctx, role_name, acting).await
    }
}

/// Environment variables which could make the CLI pick an identity other than the injected one.
const IDENTITY_ENV_VARS: &[&str] = &[
    "AWS_PROFILE",
    "AWS_DEFAULT_PROFILE",
    "AWS_CONTAINER_CREDENTIALS_FULL_URI",
    "AWS_CONTAINER_CREDENTIALS_RELATIVE_URI",
    "AWS_CONTAINER_AUTHORIZATION_TOKEN",
    "AWS_WEB_IDENTITY_TOKEN_FILE",
    "AWS_ROLE_ARN",
];

/// Invokes the `aws` command line.
#[derive(Clone)]
pub struct AwsCliProvider {
    program: std::ffi::OsString,
    leading_args: Vec<std::ffi::OsString>,
    region: Option<String>,
}

impl std::fmt::Debug for AwsCliProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCliProvider")
            .field("program", &self.program)
            .field("region", &self.region)
            .finish()
    }
}

impl Default for AwsCliProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AwsCliProvider {
    pub fn new() -> Self {
        Self {
            program: "aws".into(),
            leading_args: Vec::new(),
            region: None,
        }
    }

    pub fn from_settings(settings: &crate::config::ProviderSettings) -> Self {
        let mut provider = Self::new();
        if let Some(ref program) = settings.program {
            provider.program = program.into();
        }
        provider.region = settings.region.clone();
        provider
    }

    /// Replaces the executable; `leading_args` are placed before the `sts ...` arguments.
    pub fn with_command(
        mut self,
        program: impl Into<std::ffi::OsString>,
        leading_args: impl IntoIterator<Item = impl Into<std::ffi::OsString>>,
    ) -> Self {
        self.program = program.into();
        self.leading_args = leading_args.into_iter().map(Into::into).collect();
        self
    }

    /// Default region applied when a step doesn't specify one.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    fn command(&self, acting: Option<&crate::credentials::Credentials>) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.leading_args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref region) = self.region {
            cmd.env("AWS_DEFAULT_REGION", region);
        }
        if let Some(creds) = acting {
            use secrecy::ExposeSecret;
            for var in IDENTITY_ENV_VARS {
                cmd.env_remove(var);
            }
            cmd.env("AWS_ACCESS_KEY_ID", &creds.access_key_id);
            cmd.env(
                "AWS_SECRET_ACCESS_KEY",
                creds.secret_access_key.expose_secret(),
            );
            match creds.session_token {
                Some(ref token) => cmd.env("AWS_SESSION_TOKEN", token),
                None => cmd.env_remove("AWS_SESSION_TOKEN"),
            };
        }
        cmd
    }

    async fn run(
        &self,
        ctx: &crate::context::Context,
        operation: &str,
        mut cmd: tokio::process::Command,
    ) -> crate::Result<Vec<u8>> {
        let output = ctx.run(cmd.output()).await??;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            tracing::debug!(operation = operation, status = ?output.status, stderr = %stderr, "provider command failed");
            return Err(classify_failure(operation, output.status, stderr).into());
        }
        Ok(output.stdout)
    }
}

#[async_trait::async_trait]
impl CredentialProvider for AwsCliProvider {
    #[tracing::instrument(skip_all, fields(role_arn = role_arn))]
    async fn assume_role(
        &self,
        ctx: &crate::context::Context,
        role_arn: &str,
        options: &crate::credentials::AssumeRoleOptions,
        acting: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<AssumeRoleOutput> {
        let mut cmd = self.command(acting);
        cmd.args(assume_role_args(role_arn, options));

        tracing::debug!(
            session_name = ?options.session_name,
            duration_seconds = options.duration_seconds,
            acting = ?acting.map(|c| &c.access_key_id),
            "invoking sts assume-role"
        );
        let stdout = self.run(ctx, "AssumeRole", cmd).await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    #[tracing::instrument(skip_all, fields(user_name = user_name))]
    async fn list_mfa_devices(
        &self,
        ctx: &crate::context::Context,
        user_name: &str,
        acting: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<Vec<MfaDevice>> {
        let mut cmd = self.command(acting);
        cmd.args([
            "iam",
            "list-mfa-devices",
            "--user-name",
            user_name,
            "--output",
            "json",
        ]);
        let stdout = self.run(ctx, "ListMFADevices", cmd).await?;
        let parsed: ListMfaDevicesOutput = serde_json::from_slice(&stdout)?;
        Ok(parsed.mfa_devices.into_iter().map(Into::into).collect())
    }

    async fn get_caller_identity(
        &self,
        ctx: &crate::context::Context,
        acting: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<CallerIdentity> {
        let mut cmd = self.command(acting);
        cmd.args(["sts", "get-caller-identity", "--output", "json"]);
        let stdout = self.run(ctx, "GetCallerIdentity", cmd).await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    #[tracing::instrument(skip_all, fields(role_name = role_name))]
    async fn get_role_trust_policy(
        &self,
        ctx: &crate::context::Context,
        role_name: &str,
        acting: Option<&crate::credentials::Credentials>,
    ) -> crate::Result<serde_json::Value> {
        let mut cmd = self.command(acting);
        cmd.args(["iam", "get-role", "--role-name", role_name, "--output", "json"]);
        let stdout = self.run(ctx, "GetRole", cmd).await?;
        let parsed: GetRoleOutput = serde_json::from_slice(&stdout)?;
        parsed.role.into_policy()
    }
}

fn assume_role_args(
    role_arn: &str,
    options: &crate::credentials::AssumeRoleOptions,
) -> Vec<String> {
    let mut args = vec![
        "sts".to_owned(),
        "assume-role".to_owned(),
        "--role-arn".to_owned(),
        role_arn.to_owned(),
        "--role-session-name".to_owned(),
        options.session_name.clone().unwrap_or_default(),
    ];
    if options.duration_seconds > 0 {
        args.push("--duration-seconds".to_owned());
        args.push(options.duration_seconds.to_string());
    }
    if let Some(ref external_id) = options.external_id {
        args.push("--external-id".to_owned());
        args.push(external_id.clone());
    }
    if let (Some(serial), Some(token)) = (&options.mfa_serial, &options.mfa_token) {
        use secrecy::ExposeSecret;
        args.push("--serial-number".to_owned());
        args.push(serial.clone());
        args.push("--token-code".to_owned());
        args.push(token.expose_secret().to_owned());
    }
    if let Some(ref policy) = options.policy {
        args.push("--policy".to_owned());
        args.push(policy.clone());
    }
    for policy_arn in options.policy_arns.iter() {
        args.push("--policy-arns".to_owned());
        args.push(format!("arn={policy_arn}"));
    }
    if let Some(ref region) = options.region {
        args.push("--region".to_owned());
        args.push(region.clone());
    }
    args.push("--output".to_owned());
    args.push("json".to_owned());
    args
}

#[derive(thiserror::Error, Debug)]
#[error("command exited with {status}: {stderr}")]
struct CommandFailure {
    status: std::process::ExitStatus,
    stderr: String,
}

/// Maps the AWS error code found in the CLI's stderr to our taxonomy.
fn classify_failure(operation: &str, status: std::process::ExitStatus, stderr: String) -> Error {
    macro_rules! match_map_error {
        (
            $stderr:expr,
            $(
                $c:literal => $t:ident,
            )*
        ) => {
            match $stderr {
                $(
                    s if s.contains(concat!("(", $c)) => {
                        let message = format!(
                            "AWS says {code} for {operation}: {stderr}",
                            code = $c,
                            operation = operation,
                            stderr = s,
                        );
                        Error::$t(message, Box::new(CommandFailure { status, stderr: s.to_owned() }))
                    }
                )*
                s => {
                    let message = format!(
                        "provider command failed for {operation}: {stderr}",
                        operation = operation,
                        stderr = s,
                    );
                    Error::Unknown(message, Box::new(CommandFailure { status, stderr: s.to_owned() }))
                }
            }
        }
    }

    match_map_error! {
        stderr.as_str(),
        "AccessDenied" => PermissionDenied,
        "ExpiredToken" => Unauthenticated,
        "InvalidClientTokenId" => Unauthenticated,
        "Throttling" => ResourceExhausted,
        "MalformedPolicyDocument" => InvalidArgument,
        "PackedPolicyTooLarge" => InvalidArgument,
        "ValidationError" => InvalidArgument,
        "RegionDisabledException" => InvalidArgument,
        "NoSuchEntity" => NotFound,
    }
}
