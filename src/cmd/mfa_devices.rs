#[derive(clap::Args, Debug)]
pub struct MfaDevicesArgs {
    /// IAM user name. Defaults to the user behind the ambient identity (sts get-caller-identity).
    #[arg(long)]
    user: Option<String>,

    /// Also report whether this role's trust policy requires MFA.
    #[arg(long)]
    role_arn: Option<String>,
}

#[tokio::main]
pub async fn run(args: &MfaDevicesArgs) -> Result<(), anyhow::Error> {
    let settings = crate::config::Settings::load().await?;
    let provider = crate::provider::AwsCliProvider::from_settings(&settings.provider);
    let engine = crate::engine::RoleAssumptionEngine::new(provider);
    let ctx =
        crate::context::Context::background().with_timeout(std::time::Duration::from_secs(60));

    let devices = match args.user {
        Some(ref user) => engine.list_mfa_devices(&ctx, user, None).await?,
        None => engine.current_user_mfa_devices(&ctx, None).await?,
    };
    if devices.is_empty() {
        eprintln!(":: {} :: No MFA devices found", env!("CARGO_PKG_NAME"));
    }
    for device in devices.iter() {
        let kind = match device.kind {
            crate::provider::MfaDeviceKind::Virtual => "virtual",
            crate::provider::MfaDeviceKind::Hardware => "hardware",
        };
        match device.enable_date {
            Some(d) => println!("{}\t{}\t{}", device.serial_number, kind, d.to_rfc3339()),
            None => println!("{}\t{}", device.serial_number, kind),
        }
    }

    if let Some(ref role_arn) = args.role_arn {
        let required = engine.role_requires_mfa(&ctx, role_arn, None).await?;
        println!(
            "{role_arn}: MFA {}",
            if required { "required" } else { "not required" }
        );
    }
    Ok(())
}
