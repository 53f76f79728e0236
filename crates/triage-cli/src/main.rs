//! deploy-triage - guided troubleshooting for failed container deployments
//!
//! Runs the diagnosis engine offline against a JSON cluster snapshot.
//!
//! ## Commands
//!
//! - `diagnose`: run a request and print the response
//! - `plan`: show which fetchers a request would run, without running them
//! - `config`: print the effective configuration

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use cluster_probe::fakes::{ClusterSnapshot, InMemoryCluster};
use cluster_probe::Collaborators;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, Level};

use triage_core::{
    render_text, Action, DiagnosticRequest, FormattedResponse, TimeWindow, TriageConfig,
    TriageEngine,
};

#[derive(Parser)]
#[command(name = "deploy-triage")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Guided troubleshooting for failed container-service deployments", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    log_json: bool,

    /// TOML configuration file (DEPLOY_TRIAGE_* variables still apply)
    #[arg(short, long, global = true, env = "DEPLOY_TRIAGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diagnose a deployment against a cluster snapshot
    Diagnose {
        #[command(flatten)]
        request: RequestArgs,

        /// Print the response as JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show the plan the router would pick, without fetching evidence
    Plan {
        #[command(flatten)]
        request: RequestArgs,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Args)]
struct RequestArgs {
    /// Cluster snapshot (JSON) to diagnose against
    #[arg(short, long)]
    snapshot: PathBuf,

    /// guidance, stack, service, task, logs, image_pull or network
    #[arg(short, long, default_value = "guidance")]
    action: String,

    #[arg(long)]
    cluster: Option<String>,

    #[arg(long)]
    service: Option<String>,

    /// Application name, used to discover cluster, service and stack
    #[arg(long)]
    app: Option<String>,

    /// Free-text description of what is wrong
    #[arg(long, default_value = "")]
    symptom: String,

    /// Window start (RFC 3339)
    #[arg(long)]
    since: Option<DateTime<Utc>>,

    /// Window end (RFC 3339)
    #[arg(long)]
    until: Option<DateTime<Utc>>,

    /// Look-back in seconds when the window is not fully given
    #[arg(long)]
    window_secs: Option<u64>,

    /// Extra parameters, e.g. `stack_name=shop` or `filter_pattern=ERROR`
    #[arg(short = 'p', long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    triage_core::init_tracing(cli.log_json, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Diagnose { request, json } => cmd_diagnose(&config, &request, json).await,
        Commands::Plan { request } => cmd_plan(&config, &request).await,
        Commands::Config => cmd_config(&config),
    }
}

fn load_config(path: Option<&Path>) -> Result<TriageConfig> {
    match path {
        Some(path) => TriageConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => {
            let mut config = TriageConfig::default();
            config
                .apply_env_overrides()
                .context("invalid DEPLOY_TRIAGE_* override")?;
            config.validate().context("invalid configuration")?;
            Ok(config)
        }
    }
}

fn load_engine(config: &TriageConfig, snapshot: &Path) -> Result<TriageEngine> {
    let text = std::fs::read_to_string(snapshot)
        .with_context(|| format!("failed to read snapshot {}", snapshot.display()))?;
    let snapshot = ClusterSnapshot::from_json(&text)
        .with_context(|| format!("failed to parse snapshot {}", snapshot.display()))?;
    let cluster = Arc::new(InMemoryCluster::new(snapshot));
    Ok(TriageEngine::new(
        Collaborators::uniform(cluster),
        config.clone(),
    ))
}

fn build_request(config: &TriageConfig, args: &RequestArgs) -> Result<DiagnosticRequest> {
    let action: Action = args.action.parse()?;
    let mut request = DiagnosticRequest::new(action).with_symptom(args.symptom.clone());

    if let Some(cluster) = &args.cluster {
        request = request.with_cluster(cluster.clone());
    }
    if let Some(service) = &args.service {
        request = request.with_service(service.clone());
    }
    if let Some(app) = &args.app {
        request = request.with_app_name(app.clone());
    }

    if args.since.is_some() || args.until.is_some() || args.window_secs.is_some() {
        let secs = args.window_secs.unwrap_or(config.default_window_secs);
        let window = TimeWindow::resolve(args.since, args.until, secs, Utc::now())?;
        request = request.with_time_window(window);
    }

    for (key, value) in &args.params {
        request = request.with_param(key.clone(), value.clone());
    }
    Ok(request)
}

async fn cmd_diagnose(config: &TriageConfig, args: &RequestArgs, json: bool) -> Result<()> {
    let engine = load_engine(config, &args.snapshot)?;
    let request = build_request(config, args)?;
    debug!(action = %request.action(), "request built");

    let response = engine
        .diagnose_formatted(&request)
        .await
        .context("diagnosis failed")?;
    print!("{}", render_response(&response, json)?);
    Ok(())
}

fn render_response(response: &FormattedResponse, json: bool) -> Result<String> {
    if json {
        let mut out = response.to_json().context("failed to serialize response")?;
        out.push('\n');
        Ok(out)
    } else {
        Ok(render_text(response))
    }
}

async fn cmd_plan(config: &TriageConfig, args: &RequestArgs) -> Result<()> {
    let engine = load_engine(config, &args.snapshot)?;
    let request = build_request(config, args)?;
    let plan = engine.plan(&request).await.context("planning failed")?;

    println!("branch: {}", plan.branch.as_str());
    println!("cluster: {}", plan.target.cluster);
    if let Some(service) = plan.target.service_name() {
        println!("service: {service}");
    }
    if let Some(stack) = &plan.target.stack_name {
        println!("stack: {stack}");
    }
    let steps: Vec<&str> = plan.steps.iter().map(|s| s.as_str()).collect();
    println!("steps: {}", steps.join(" -> "));
    for detected in &plan.symptoms {
        println!("symptom: {} ({})", detected.keyword, detected.category);
    }
    for warning in &plan.warnings {
        println!("  ! {warning}");
    }
    Ok(())
}

fn cmd_config(config: &TriageConfig) -> Result<()> {
    let text = serde_json::to_string_pretty(config).context("failed to serialize config")?;
    println!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = r#"{
      "clusters": [{"name": "shop-cluster", "status": "ACTIVE"}],
      "services": [{
        "description": {"cluster": "shop-cluster", "name": "web", "status": "ACTIVE",
                        "desired_count": 2, "running_count": 2}
      }]
    }"#;

    fn request_args(snapshot: PathBuf) -> RequestArgs {
        RequestArgs {
            snapshot,
            action: "guidance".to_string(),
            cluster: Some("shop-cluster".to_string()),
            service: Some("web".to_string()),
            app: None,
            symptom: "site is down".to_string(),
            since: None,
            until: None,
            window_secs: None,
            params: vec![],
        }
    }

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("stack_name=shop=v2").unwrap(),
            ("stack_name".to_string(), "shop=v2".to_string())
        );
        assert!(parse_param("no-equals").is_err());
        assert!(parse_param("=value").is_err());
    }

    #[test]
    fn test_cli_parses_diagnose_flags() {
        let cli = Cli::try_parse_from([
            "deploy-triage",
            "diagnose",
            "--snapshot",
            "snap.json",
            "--action",
            "image-pull",
            "--app",
            "shop",
            "-p",
            "filter_pattern=ERROR",
            "--json",
        ])
        .unwrap();
        match cli.command {
            Commands::Diagnose { request, json } => {
                assert!(json);
                assert_eq!(request.action.parse::<Action>().unwrap(), Action::ImagePull);
                assert_eq!(request.params.len(), 1);
            }
            _ => panic!("expected diagnose"),
        }
    }

    #[test]
    fn test_build_request_resolves_window() {
        let config = TriageConfig::default();
        let mut args = request_args(PathBuf::from("unused.json"));
        assert!(build_request(&config, &args)
            .unwrap()
            .time_window()
            .is_none());

        args.until = Some("2026-10-18T12:00:00Z".parse().unwrap());
        args.window_secs = Some(600);
        let window = build_request(&config, &args).unwrap().time_window().unwrap();
        assert_eq!(window.start().to_rfc3339(), "2026-10-18T11:50:00+00:00");

        args.action = "teleport".to_string();
        assert!(build_request(&config, &args).is_err());
    }

    #[tokio::test]
    async fn test_diagnose_renders_json_response() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        std::fs::write(&path, SNAPSHOT).unwrap();

        let config = TriageConfig::default();
        let args = request_args(path.clone());
        let engine = load_engine(&config, &path).unwrap();
        let response = engine
            .diagnose_formatted(&build_request(&config, &args).unwrap())
            .await
            .unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&render_response(&response, true).unwrap()).unwrap();
        assert!(json["path_taken"].as_array().is_some());
        assert!(render_response(&response, false)
            .unwrap()
            .starts_with("status: "));
    }

    #[test]
    fn test_missing_snapshot_is_reported() {
        let err = load_engine(&TriageConfig::default(), Path::new("/nonexistent/snap.json"))
            .unwrap_err();
        assert!(err.to_string().contains("failed to read snapshot"));
    }

    #[test]
    fn test_config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triage.toml");
        std::fs::write(&path, "[session]\ntimeout_ms = 1500\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.session.timeout_ms, 1500);
    }
}
