#[derive(clap::Parser)]
#[clap(author, version, long_about = None)]
#[clap(about = "Assume IAM role chains and vend the resulting credentials")]
#[clap(propagate_version = true)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    CredentialProcess(rolechain::cmd::credential_process::CredentialProcessArgs),
    MfaDevices(rolechain::cmd::mfa_devices::MfaDevicesArgs),
    Validate(rolechain::cmd::validate::ValidateArgs),
}

fn main() -> Result<std::process::ExitCode, anyhow::Error> {
    use clap::Parser;
    let cli = Cli::parse();

    enable_tracing();
    let retval = match &cli.command {
        Commands::CredentialProcess(args) => rolechain::cmd::credential_process::run(args),
        Commands::MfaDevices(args) => rolechain::cmd::mfa_devices::run(args),
        Commands::Validate(args) => rolechain::cmd::validate::run(args),
    };
    match retval {
        Ok(_) => Ok(std::process::ExitCode::SUCCESS),
        Err(e) => match e.downcast_ref::<rolechain::Error>() {
            Some(rolechain::Error::FailureButSilentlyExit) => Ok(std::process::ExitCode::FAILURE),
            Some(rolechain::Error::SilentlyExitWithCode(c)) => Ok(*c),
            _ => Err(e),
        },
    }
}

fn enable_tracing() {
    let filter = std::env::var("ROLECHAIN_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "rolechain=info".to_owned());

    // stdout is reserved for credential_process output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}
