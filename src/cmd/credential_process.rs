#[derive(clap::Args, Debug)]
pub struct CredentialProcessArgs {
    /// Chain definition ID (from chains.d/*.json).
    chain: String,

    /// 6-digit MFA token, used for steps which specify an mfa_serial.
    #[arg(long, env = "ROLECHAIN_MFA_TOKEN", hide_env_values = true)]
    mfa_token: Option<String>,

    /// Reuse and save credentials in the encrypted local store under this profile name.
    #[arg(long)]
    cache: Option<String>,

    /// Abort if the chain doesn't complete within this many seconds.
    #[arg(long, default_value_t = 120)]
    timeout: u64,
}

#[tokio::main]
pub async fn run(args: &CredentialProcessArgs) -> Result<(), anyhow::Error> {
    let settings = crate::config::Settings::load().await?;
    let definition = crate::config::ChainDefinition::find_from_fs(&args.chain).await?;
    let config = definition.config_or(&settings.chain).clone();

    let store = match args.cache {
        Some(_) => Some(
            crate::credential_store::CredentialStore::open_default(
                crate::cipher::KeyScope::default(),
            )
            .await?,
        ),
        None => None,
    };
    if let (Some(store), Some(profile)) = (&store, &args.cache) {
        match store.retrieve(profile).await {
            Ok(c) if !c.expires_within(chrono::Utc::now(), config.refresh_before_expiry) => {
                tracing::debug!(profile = profile, aws_access_key_id = ?c.access_key_id, "Vending credentials from cache");
                write_response(&c)?;
                return Ok(());
            }
            Ok(_) => tracing::debug!(profile = profile, "cached credentials are expiring"),
            Err(e) => tracing::debug!(profile = profile, err = %e, "cache miss"),
        }
    }

    let steps = apply_mfa_token(definition.steps, args.mfa_token.as_deref());
    let provider = crate::provider::AwsCliProvider::from_settings(&settings.provider);
    let manager = crate::chain::RoleChainManager::new(
        crate::engine::RoleAssumptionEngine::new(provider),
    )
    .with_config(config);
    let ctx = crate::context::Context::background()
        .with_timeout(std::time::Duration::from_secs(args.timeout));

    match manager
        .assume_role_chain_credentials(&ctx, steps, None)
        .await
    {
        Ok(c) => {
            tracing::info!(chain = %args.chain, aws_access_key_id = ?c.access_key_id, "Vending credentials from chain");
            if let (Some(store), Some(profile)) = (&store, &args.cache) {
                if let Err(e) = store.store(profile, &c).await {
                    tracing::warn!(profile = profile, err = %e, "Failed to cache credentials");
                }
            }
            write_response(&c)?;
            Ok(())
        }
        Err(e) => {
            tracing::debug!(err = ?e, chain = %args.chain, "Failed to obtain AWS credentials");
            let product = env!("CARGO_PKG_NAME");
            let chain = &args.chain;
            eprintln!(":: {product} :: ERROR when obtaining AWS credentials through chain {chain} :::::::");
            eprintln!(":: {product} :: > {e}");
            if matches!(e.root(), crate::Error::MfaTokenMalformed(_)) {
                eprintln!(":: {product} :: > Pass a 6-digit token with --mfa-token");
            }
            Err(crate::Error::FailureButSilentlyExit.into())
        }
    }
}

fn apply_mfa_token(
    mut steps: Vec<crate::credentials::RoleChainStep>,
    token: Option<&str>,
) -> Vec<crate::credentials::RoleChainStep> {
    let Some(token) = token else {
        return steps;
    };
    for options in steps.iter_mut().filter_map(|s| s.options.as_mut()) {
        if options.mfa_serial.is_some() && options.mfa_token.is_none() {
            options.mfa_token = Some(token.to_owned().into());
        }
    }
    steps
}

fn write_response(c: &crate::credentials::Credentials) -> Result<(), anyhow::Error> {
    serde_json::to_writer(std::io::stdout(), &CredentialProcessResponse::from(c))?;
    Ok(())
}

/// https://docs.aws.amazon.com/sdkref/latest/guide/feature-process-credentials.html
#[derive(Clone, Debug, serde::Serialize, zeroize::ZeroizeOnDrop)]
#[serde(rename_all = "PascalCase")]
pub struct CredentialProcessResponse {
    pub version: i64,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    #[zeroize(skip)]
    pub expiration: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&crate::credentials::Credentials> for CredentialProcessResponse {
    fn from(cred: &crate::credentials::Credentials) -> CredentialProcessResponse {
        use secrecy::ExposeSecret;
        CredentialProcessResponse {
            version: 1,
            access_key_id: cred.access_key_id.clone(),
            secret_access_key: cred.secret_access_key.expose_secret().to_owned(),
            session_token: cred.session_token.clone().filter(|t| !t.is_empty()),
            expiration: Some(cred.expiration),
        }
    }
}
