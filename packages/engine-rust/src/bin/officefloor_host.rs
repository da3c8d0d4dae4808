//! `OfficeFloor` host: opens an office floor, runs one management request
//! against it and closes it again.
//!
//! Without `--office` a small demonstration office is opened. Offices given
//! as JSON may only reference the function types and sources registered
//! here.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use officefloor_core::{
    Escalation, FunctionDescriptor, ManagedObjectDescriptor, ManagedObjectScope,
    OfficeDescriptor, ParameterType, TeamDescriptor, TeamKind, Value,
};
use officefloor_engine::managed_object::{
    ManagedObject, ManagedObjectSource, ManagedObjectSourceMetaData, PlainManagedObject,
    SourceContext,
};
use officefloor_engine::management::{build_management_pipeline, ManagementRequest};
use officefloor_engine::{EngineConfig, FunctionType, OfficeFloor, SourceRegistry};
use tower::ServiceExt;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Office floor host CLI
#[derive(Parser)]
#[command(name = "officefloor-host")]
#[command(about = "Open an office floor and invoke a function on it", long_about = None)]
#[command(version)]
struct Cli {
    /// Office configuration file (JSON)
    #[arg(short, long, env = "OFFICEFLOOR_OFFICE")]
    office: Option<PathBuf>,

    /// Office to invoke the function on
    #[arg(long, requires = "function")]
    invoke: Option<String>,

    /// Function to invoke
    #[arg(long, requires = "invoke")]
    function: Option<String>,

    /// Parameter passed to the function
    #[arg(long)]
    parameter: Option<String>,

    /// Monitor clock interval in milliseconds
    #[arg(long, env = "OFFICEFLOOR_MONITOR_INTERVAL_MS", default_value_t = 100)]
    monitor_interval_ms: u64,

    /// How long closing waits for in-flight work, in milliseconds
    #[arg(long, env = "OFFICEFLOOR_CLOSE_TIMEOUT_MS", default_value_t = 10_000)]
    close_timeout_ms: u64,

    /// How long a management request may take, in milliseconds
    #[arg(long, env = "OFFICEFLOOR_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    request_timeout_ms: u64,

    /// Log level
    #[arg(long, env = "OFFICEFLOOR_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "OFFICEFLOOR_LOG_JSON")]
    json: bool,
}

// ---------------------------------------------------------------------------
// Demonstration sources
// ---------------------------------------------------------------------------

/// Running total shared by every function of a process.
#[derive(Default)]
struct Tally(AtomicI64);

struct TallySource;

impl ManagedObjectSource for TallySource {
    fn init(&mut self, _context: &SourceContext) -> anyhow::Result<ManagedObjectSourceMetaData> {
        Ok(ManagedObjectSourceMetaData::new::<Tally>().concurrent())
    }

    fn source(&self) -> Result<Box<dyn ManagedObject>, Escalation> {
        Ok(Box::new(PlainManagedObject::new(Tally::default())))
    }
}

fn registry() -> SourceRegistry {
    let registry = SourceRegistry::new();
    registry.register_function(
        "greet",
        FunctionType::new(|context| {
            let name = context
                .parameter()
                .and_then(Value::as_str)
                .unwrap_or("world")
                .to_string();
            info!(function = context.function_name(), "hello {name}");
            Ok(Some(Value::String(name)))
        })
        .parameter(ParameterType::String),
    );
    registry.register_function(
        "add",
        FunctionType::new(|context| {
            let amount = context.parameter().and_then(Value::as_int).unwrap_or(1);
            let tally = context.object::<Tally>(0)?;
            let total = tally.0.fetch_add(amount, Ordering::SeqCst) + amount;
            Ok(Some(Value::Int(total)))
        })
        .object::<Tally>("tally")
        .parameter(ParameterType::Int),
    );
    registry.register_function(
        "report",
        FunctionType::new(|context| {
            let total = context.object::<Tally>(0)?.0.load(Ordering::SeqCst);
            info!(total, "tally");
            if total < 0 {
                return Err(Escalation::msg(format!("tally is negative: {total}")));
            }
            Ok(None)
        })
        .object::<Tally>("tally"),
    );
    registry.register_function(
        "complain",
        FunctionType::new(|context| {
            if let Some(escalation) = context.escalation() {
                warn!(error = %escalation, "escalation handled");
            }
            Ok(None)
        }),
    );
    registry.register_managed_object_source("tally", || TallySource);
    registry
}

fn demo_office() -> OfficeDescriptor {
    OfficeDescriptor::new("demo")
        .managed_object(ManagedObjectDescriptor::new(
            "tally",
            "tally",
            ManagedObjectScope::Process,
        ))
        .function(FunctionDescriptor::new("greet", "greet"))
        .function(
            FunctionDescriptor::new("add", "add")
                .object("tally", "tally")
                .next("report"),
        )
        .function(FunctionDescriptor::new("report", "report").object("tally", "tally"))
        .function(FunctionDescriptor::new("complain", "complain"))
        .team(TeamDescriptor::new("workers", TeamKind::Pooled { size: 2 }).assign("add"))
        .on_escalation("message", "complain")
}

fn load_offices(path: Option<&PathBuf>) -> anyhow::Result<Vec<OfficeDescriptor>> {
    let Some(path) = path else {
        return Ok(vec![demo_office()]);
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read office configuration {}", path.display()))?;
    let office = OfficeDescriptor::from_json(&json)
        .with_context(|| format!("invalid office configuration {}", path.display()))?;
    Ok(vec![office])
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());
    if cli.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let config = EngineConfig {
        monitor_interval_ms: cli.monitor_interval_ms,
        close_timeout_ms: cli.close_timeout_ms,
        ..EngineConfig::default()
    };
    let offices = load_offices(cli.office.as_ref())?;
    let floor = match OfficeFloor::open(config, &offices, &registry()) {
        Ok(floor) => Arc::new(floor),
        Err(officefloor_engine::OpenError::Configuration { issues }) => {
            for issue in &issues {
                warn!(
                    office = %issue.office,
                    asset = %issue.asset_name,
                    "{}",
                    issue.message
                );
            }
            anyhow::bail!("office floor has {} configuration issue(s)", issues.len());
        }
        Err(e) => return Err(e.into()),
    };

    let request = match (cli.invoke, cli.function) {
        (Some(office), Some(function)) => ManagementRequest::Invoke {
            office,
            function,
            parameter: cli.parameter,
        },
        _ => ManagementRequest::ListOffices,
    };
    let pipeline = build_management_pipeline(
        Arc::clone(&floor),
        Duration::from_millis(cli.request_timeout_ms),
    );
    let result = pipeline.oneshot(request).await;

    let report = floor.close();
    info!(
        processes_terminated = report.processes_terminated,
        abandoned_jobs = report.abandoned_jobs,
        "office floor closed"
    );

    let response = result?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
