#[derive(clap::Args, Debug)]
pub struct ValidateArgs {
    /// Chain definition ID (from chains.d/*.json).
    chain: String,

    /// Also try assuming the first step (15 minute session) with the ambient identity.
    #[arg(long, default_value_t = false)]
    probe: bool,
}

#[tokio::main]
pub async fn run(args: &ValidateArgs) -> Result<(), anyhow::Error> {
    let settings = crate::config::Settings::load().await?;
    let definition = crate::config::ChainDefinition::find_from_fs(&args.chain).await?;
    let config = definition.config_or(&settings.chain);
    let product = env!("CARGO_PKG_NAME");
    let chain = &args.chain;

    if let Err(e) = crate::validator::validate_chain(&definition.steps, config.max_steps) {
        eprintln!(":: {product} :: Chain {chain} is invalid ({})", definition.config_path.display());
        eprintln!(":: {product} :: > {e}");
        return Err(crate::Error::FailureButSilentlyExit.into());
    }

    for (i, step) in definition.steps.iter().enumerate() {
        println!("{}. {}", i + 1, step.role_arn);
    }

    if args.probe {
        let Some(first) = definition.steps.first() else {
            return Ok(());
        };
        let provider = crate::provider::AwsCliProvider::from_settings(&settings.provider);
        let manager = crate::chain::RoleChainManager::new(
            crate::engine::RoleAssumptionEngine::new(provider),
        );
        let ctx = crate::context::Context::background()
            .with_timeout(std::time::Duration::from_secs(60));
        if let Err(e) = manager.validate_chain_step(&ctx, first, None).await {
            tracing::debug!(err = ?e, "probe failed");
            eprintln!(":: {product} :: Couldn't assume {} :::::::", first.role_arn);
            eprintln!(":: {product} :: > {e}");
            return Err(crate::Error::FailureButSilentlyExit.into());
        }
        println!("first step is reachable");
    }

    Ok(())
}
