use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use lifecycle_api::auth::{generate_signing_key, signing_key_from_hex};
use lifecycle_api::{issue_token, ApiState, OperatorClaims, TokenVerifier, OPERATOR_ROLE};
use lifecycle_core::{
    FileRegistrationStore, InMemoryResourceLayer, RegistrationStore, SystemBuilder,
};
use lifecycle_server::config::{ServerConfig, StoreKind};
use lifecycle_server::{run_simulation, telemetry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

fn cli() -> Command {
    let config_arg = Arg::new("config")
        .long("config")
        .short('c')
        .value_parser(value_parser!(PathBuf))
        .help("Path to the TOML configuration file");

    Command::new("lifecycle-server")
        .version(lifecycle_server::VERSION)
        .about("Tenant lifecycle orchestration server")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("serve")
                .about("Run the dispatcher, reconciler and management API")
                .arg(config_arg.clone())
                .arg(
                    Arg::new("bind")
                        .long("bind")
                        .value_parser(value_parser!(SocketAddr))
                        .help("Listen address, overrides [server].bind"),
                ),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run the onboarding and offboarding scenarios in-process")
                .arg(config_arg)
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(Command::new("keygen").about("Generate an operator token signing key"))
        .subcommand(
            Command::new("issue-token")
                .about("Issue an operator bearer token")
                .arg(
                    Arg::new("signing-key")
                        .long("signing-key")
                        .required(true)
                        .help("Hex-encoded ed25519 signing key"),
                )
                .arg(
                    Arg::new("subject")
                        .long("subject")
                        .required(true)
                        .help("Operator name recorded in the token"),
                )
                .arg(
                    Arg::new("ttl")
                        .long("ttl")
                        .default_value("3600")
                        .value_parser(value_parser!(i64))
                        .help("Token lifetime in seconds"),
                )
                .arg(
                    Arg::new("role")
                        .long("role")
                        .default_value(OPERATOR_ROLE)
                        .help("Role claim"),
                ),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("serve", args)) => serve(args).await,
        Some(("simulate", args)) => {
            let config = ServerConfig::load(args.get_one::<PathBuf>("config").map(PathBuf::as_path))?;
            telemetry::init(&config.logging)?;

            let report = run_simulation(&config).await;
            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.generate_text());
            }
            std::process::exit(if report.passed() { 0 } else { 1 });
        }
        Some(("keygen", _)) => {
            let key = generate_signing_key();
            println!("signing_key   = \"{}\"", hex::encode(key.to_bytes()));
            println!("verifying_key = \"{}\"", hex::encode(key.verifying_key().to_bytes()));
            Ok(())
        }
        Some(("issue-token", args)) => {
            let key = args
                .get_one::<String>("signing-key")
                .context("--signing-key is required")?;
            let key = signing_key_from_hex(key).context("invalid --signing-key")?;
            let subject = args
                .get_one::<String>("subject")
                .context("--subject is required")?;
            let ttl = args.get_one::<i64>("ttl").copied().unwrap_or(3600);

            let mut claims = OperatorClaims::operator(subject.clone(), ttl);
            if let Some(role) = args.get_one::<String>("role") {
                claims.role.clone_from(role);
            }
            println!("{}", issue_token(&key, &claims)?);
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn serve(args: &ArgMatches) -> anyhow::Result<()> {
    let mut config = ServerConfig::load(args.get_one::<PathBuf>("config").map(PathBuf::as_path))?;
    if let Some(bind) = args.get_one::<SocketAddr>("bind") {
        config.server.bind = *bind;
    }
    telemetry::init(&config.logging)?;
    let verifier = TokenVerifier::new(config.verifying_key()?);

    let store: Arc<dyn RegistrationStore> = match (config.store.kind, &config.store.path) {
        (StoreKind::File, Some(path)) => Arc::new(
            FileRegistrationStore::open(path)
                .await
                .with_context(|| format!("opening registration store {}", path.display()))?,
        ),
        _ => Arc::new(lifecycle_core::InMemoryRegistrationStore::new()),
    };

    let layer = Arc::new(InMemoryResourceLayer::new(config.stack_outputs()));
    let mut system = SystemBuilder::new(layer)
        .with_store(store)
        .with_settings(config.job_settings())
        .with_job_budget(config.job_budget())
        .build();
    system.start();
    system.start_reconciler(config.reconcile_interval());

    let state = ApiState::new(system.control_plane.clone(), verifier);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
        tracing::info!("shutdown signal received");
    };
    let (addr, server) = lifecycle_api::bind(config.server.bind, state, shutdown)
        .with_context(|| format!("binding {}", config.server.bind))?;
    tracing::info!(
        %addr,
        failure_policy = ?config.jobs.failure_policy,
        job_budget_secs = config.jobs.job_budget_secs,
        "lifecycle server ready"
    );

    server.await;
    system.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn serve_accepts_bind_override() {
        let matches = cli()
            .try_get_matches_from(["lifecycle-server", "serve", "--bind", "0.0.0.0:9090"])
            .unwrap();
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "serve");
        assert_eq!(
            args.get_one::<SocketAddr>("bind").copied(),
            Some(SocketAddr::from(([0, 0, 0, 0], 9090)))
        );
    }

    #[test]
    fn issue_token_requires_a_key() {
        assert!(cli()
            .try_get_matches_from(["lifecycle-server", "issue-token", "--subject", "alice"])
            .is_err());
    }
}
