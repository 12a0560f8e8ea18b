use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use flowfix::{
    bootstrap::{
        authorize, couchdb_credentials_from_cluster, free_local_port, mint_user_token,
        resolve_oc_path, service_broker_token_from_cluster,
    },
    config::{
        CREDENTIALS_DATABASE, DEFAULT_NAMESPACE, DEFAULT_USER_ID, DEFAULT_USER_NAME,
        DEFAULT_WORKERS, PlatformConfig, ReconcileOptions, StoreConfig, TunnelConfig,
        decode_basic_credentials,
    },
    execute::DisableMode,
    graph::{analyze_saved_pipeline, render_analyses},
    http::{CouchStore, HttpClient, HttpPlatform, PortForward, tunnel::wait_for_port},
    reconcile::{Disposition, Reconciler, RunReport},
    sender::{SenderStatus, update_sender},
};

#[derive(Parser, Debug)]
#[command(
    name = "flowfix",
    about = "Reconcile pipeline parameter credentials and maintain stored pipeline flows"
)]
struct Cli {
    /// Log filter (trace, debug, info, warn, error); RUST_LOG takes precedence.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify flows and credential records, and optionally repair ambiguous records.
    Reconcile(ReconcileArgs),
    /// Point the sender of send-email nodes at a parameter.
    UpdateSender(UpdateSenderArgs),
    /// Report nodes that consume task output through a wait-for-any gate.
    FindNodes(FindNodesArgs),
}

#[derive(Args, Debug)]
struct ReconcileArgs {
    /// Cluster host url.
    #[arg(long, env = "FLOWFIX_HOST")]
    host: String,
    /// Instance namespace.
    #[arg(long, short = 'n', default_value = DEFAULT_NAMESPACE)]
    namespace: String,
    /// Admin user id.
    #[arg(long, default_value = DEFAULT_USER_ID)]
    user_id: String,
    /// Admin user name; also recorded as owner of created records.
    #[arg(long, default_value = DEFAULT_USER_NAME)]
    user_name: String,
    /// Admin token; minted through the service broker when absent.
    #[arg(long, env = "FLOWFIX_USER_TOKEN", hide_env_values = true)]
    user_token: Option<String>,
    /// Service broker token; read from the cluster when absent.
    #[arg(long, env = "FLOWFIX_SERVICE_BROKER_TOKEN", hide_env_values = true)]
    service_broker_token: Option<String>,
    /// Document store credentials as base64 `user:password`; read from the cluster when absent.
    #[arg(long, env = "FLOWFIX_COUCHDB_CREDENTIALS", hide_env_values = true)]
    couchdb_credentials: Option<String>,
    /// Local port of the document store tunnel; a free port is chosen when absent.
    #[arg(long)]
    couchdb_proxy_port: Option<u16>,
    /// Path of the `oc` client.
    #[arg(long)]
    oc_path: Option<PathBuf>,
    /// Only look at this project.
    #[arg(long)]
    project_id: Option<String>,
    /// Only reconcile this primary pipeline.
    #[arg(long)]
    primary_pipeline_id: Option<String>,
    /// Apply the computed plans.
    #[arg(long)]
    fix: bool,
    /// Directory receiving the audit dumps.
    #[arg(long, default_value = ".")]
    dump_dir: PathBuf,
    /// Concurrent project discovery workers.
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,
    /// Delete superseded records instead of re-scoping them to the void project.
    #[arg(long)]
    hard_delete: bool,
    /// Accept invalid TLS certificates from the platform.
    #[arg(long)]
    insecure_tls: bool,
    /// Print the run report as JSON on stdout.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct UpdateSenderArgs {
    #[command(subcommand)]
    scenario: SenderScenario,
}

#[derive(Subcommand, Debug)]
enum SenderScenario {
    /// Update every pipeline of a project.
    Project(SenderCommon),
    /// Update one pipeline of a project.
    Pipeline(SenderPipelineArgs),
}

#[derive(Args, Debug)]
struct SenderCommon {
    /// Cluster host url.
    #[arg(long, env = "FLOWFIX_HOST")]
    host: String,
    #[arg(long, env = "FLOWFIX_USERNAME")]
    username: String,
    #[arg(long, env = "FLOWFIX_PASSWORD", hide_env_values = true)]
    password: String,
    #[arg(long)]
    project_name: String,
    /// Parameter set entry (`set.param`), user variable or pipeline parameter name.
    #[arg(long)]
    sender_value: String,
    #[arg(long)]
    insecure_tls: bool,
}

#[derive(Args, Debug)]
struct SenderPipelineArgs {
    #[arg(long)]
    pipeline_name: String,
    #[command(flatten)]
    common: SenderCommon,
}

#[derive(Args, Debug)]
struct FindNodesArgs {
    /// Saved pipeline flow JSON.
    #[arg(long = "pipeline-file")]
    pipeline_file: PathBuf,
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    match cli.command {
        Commands::Reconcile(args) => handle_reconcile(args),
        Commands::UpdateSender(args) => handle_update_sender(args),
        Commands::FindNodes(args) => handle_find_nodes(args),
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn handle_reconcile(args: ReconcileArgs) -> Result<()> {
    let mut platform_config = PlatformConfig::new(&args.host)?;
    platform_config.accept_invalid_certs = args.insecure_tls;
    let oc_path = resolve_oc_path(args.oc_path);

    let broker_token = match args.service_broker_token {
        Some(token) => Some(token),
        None => match service_broker_token_from_cluster(&oc_path, &args.namespace) {
            Ok(token) => Some(token),
            Err(err) if args.user_token.is_some() => {
                warn!(error = %err, "no service broker token; master secrets will not be read");
                None
            }
            Err(err) => return Err(err).context("cannot obtain the service broker token"),
        },
    };

    let user_token = match args.user_token {
        Some(token) => token,
        None => {
            let client = HttpClient::new(
                platform_config.accept_invalid_certs,
                platform_config.request_timeout,
                platform_config.retry,
            )?;
            let broker = broker_token
                .as_deref()
                .context("a service broker token is required to mint the admin token")?;
            mint_user_token(
                &client,
                &platform_config.host,
                broker,
                &args.user_id,
                &args.user_name,
            )
            .context("cannot obtain the admin token")?
        }
    };

    let (db_user, db_password) = match &args.couchdb_credentials {
        Some(encoded) => decode_basic_credentials(encoded)?,
        None => couchdb_credentials_from_cluster(&oc_path, &args.namespace)
            .context("cannot obtain document store credentials")?,
    };

    let local_port = match args.couchdb_proxy_port {
        Some(port) => port,
        None => free_local_port()?,
    };
    let tunnel_config = TunnelConfig::couchdb(oc_path, args.namespace.clone(), local_port);
    let _tunnel = if wait_for_port(local_port, Duration::from_millis(300)).is_ok() {
        info!(local_port, "using the running document store tunnel");
        None
    } else {
        let tunnel = PortForward::start(&tunnel_config)?;
        tunnel
            .wait_ready(tunnel_config.ready_timeout)
            .context("document store tunnel did not come up")?;
        Some(tunnel)
    };

    let store = CouchStore::new(&StoreConfig {
        local_port,
        database: CREDENTIALS_DATABASE.to_string(),
        username: db_user,
        password: db_password,
        retry: platform_config.retry,
    })?;
    let platform = Arc::new(
        HttpPlatform::new(&platform_config, user_token)?.with_service_broker_token(broker_token),
    );

    info!(fix = args.fix, primary_pipeline_id = ?args.primary_pipeline_id, "starting reconciliation");
    let options = ReconcileOptions {
        project_id: args.project_id,
        primary_pipeline_id: args.primary_pipeline_id,
        fix: args.fix,
        dump_dir: Some(args.dump_dir),
        workers: args.workers,
        disable_mode: if args.hard_delete {
            DisableMode::Delete
        } else {
            DisableMode::Void
        },
        owner_user_id: args.user_name,
    };
    let reconciler = Reconciler::new(
        platform.clone(),
        Arc::new(store),
        platform.clone(),
        platform,
        options,
    );
    let report = reconciler.run().context("reconciliation aborted")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if report.has_failures() {
        bail!(
            "{} primary pipeline(s) could not be repaired",
            report.count(Disposition::Failed)
        );
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    for group in &report.groups {
        println!(
            "{}: {} ({})",
            group.primary_pipeline_id, group.disposition, group.reason
        );
        for action in &group.plan {
            if report.fix && !group.results.is_empty() {
                continue;
            }
            println!("  {} {}: {}", action.name(), action.subject(), action.reason());
        }
        for result in &group.results {
            println!("  {} {}: {}", result.action, result.subject, result.outcome);
        }
    }
    println!(
        "projects: {}, flows: {}, records: {}, hazards: {}, data quality issues: {}",
        report.projects,
        report.flows,
        report.credentials,
        report.hazards.len(),
        report.issues.len()
    );
    println!(
        "groups: {} planned, {} fixed, {} skipped, {} broken, {} failed",
        report.count(Disposition::Planned),
        report.count(Disposition::Fixed),
        report.count(Disposition::Skipped),
        report.count(Disposition::Broken),
        report.count(Disposition::Failed)
    );
}

fn handle_update_sender(args: UpdateSenderArgs) -> Result<()> {
    let (common, pipeline_name) = match args.scenario {
        SenderScenario::Project(common) => (common, None),
        SenderScenario::Pipeline(args) => (args.common, Some(args.pipeline_name)),
    };
    let mut config = PlatformConfig::new(&common.host)?;
    config.accept_invalid_certs = common.insecure_tls;
    let client = HttpClient::new(config.accept_invalid_certs, config.request_timeout, config.retry)?;
    let token = authorize(&client, &config.host, &common.username, &common.password)?;
    let platform = HttpPlatform::new(&config, token)?;

    let report = update_sender(
        &platform,
        &common.project_name,
        pipeline_name.as_deref(),
        &common.sender_value,
    )?;
    for outcome in &report.pipelines {
        let status = match &outcome.status {
            SenderStatus::Updated => "updated".to_string(),
            SenderStatus::NoSendEmailNode => "no send-email node".to_string(),
            SenderStatus::Failed(reason) => format!("failed: {reason}"),
        };
        println!("{} ({}): {status}", outcome.name, outcome.pipeline_id);
    }
    println!(
        "{} pipeline(s) updated, {} failed",
        report.updated(),
        report.failed()
    );
    if report.failed() > 0 {
        bail!("{} pipeline(s) failed", report.failed());
    }
    Ok(())
}

fn handle_find_nodes(args: FindNodesArgs) -> Result<()> {
    let analyses = analyze_saved_pipeline(&args.pipeline_file)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&analyses)?);
    } else {
        print!("{}", render_analyses(&analyses));
    }
    Ok(())
}
