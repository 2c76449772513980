use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use informa::{DeltaKind, Error as InformerError, Informer, InformerConfig, Object};
use informa_kubehub::{create_headless_service, delete_service, KubeListerWatcher, ListWatchParams};
use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client};
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};

mod telemetry;

#[derive(Parser, Debug)]
#[command(name = "informactl", version, about = "Informa CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a Service informer and print its events until Ctrl-C
    Watch,
    /// Create services, restart informers around them, then clean up
    Scenario {
        /// Pause after each restart so watch events can arrive
        #[arg(long = "wait-secs", default_value_t = 1)]
        wait_secs: u64,
    },
}

#[derive(Serialize)]
struct EventLine<'a> {
    informer: &'a str,
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn print_line(output: Output, line: &EventLine<'_>) {
    match output {
        Output::Human => {
            let mut s = format!("[{}] {}", line.informer, line.event);
            if let Some(k) = &line.key {
                s.push(' ');
                s.push_str(k);
            }
            if let Some(rv) = &line.rv {
                s.push_str(&format!(" rv={}", rv));
            }
            if let Some(e) = &line.error {
                s.push_str(&format!(" ({})", e));
            }
            println!("{}", s);
        }
        Output::Json => match serde_json::to_string(line) {
            Ok(s) => println!("{}", s),
            Err(e) => warn!(error = %e, "failed to encode event line"),
        },
    }
}

fn verb(kind: DeltaKind) -> &'static str {
    match kind {
        DeltaKind::Added => "add",
        DeltaKind::Updated => "update",
        DeltaKind::Deleted => "delete",
    }
}

fn service_informer(api: Api<Service>, output: Output, tag: &'static str) -> Informer<Service> {
    let lw = Arc::new(KubeListerWatcher::new(api, ListWatchParams::from_env()));
    let informer = Informer::from_list_watch(lw, InformerConfig::from_env());
    for kind in [DeltaKind::Added, DeltaKind::Updated, DeltaKind::Deleted] {
        informer.on(kind, move |svc: &Service| {
            print_line(output, &EventLine {
                informer: tag,
                event: verb(kind),
                key: Some(svc.key().to_string()),
                rv: svc.resource_version().map(|v| v.to_string()),
                error: None,
            });
            Ok(())
        });
    }
    informer.on_error(move |e: &InformerError| {
        print_line(output, &EventLine { informer: tag, event: "error", key: None, rv: None, error: Some(e.to_string()) });
    });
    informer.on_connect(move |e: Option<&InformerError>| {
        print_line(output, &EventLine {
            informer: tag,
            event: "connect",
            key: None,
            rv: None,
            error: e.map(|e| e.to_string()),
        });
    });
    informer
}

/// Start failures are reported and the script carries on.
async fn start_logged(informer: &Informer<Service>, tag: &str) {
    match informer.start().await {
        Ok(()) => info!(informer = tag, known = informer.store().len(), "scenario: informer started"),
        Err(e) => error!(informer = tag, error = %e, "scenario: start failed"),
    }
}

async fn stop_logged(informer: &Informer<Service>, tag: &str) {
    info!(informer = tag, "scenario: stopping informer");
    informer.stop().await;
}

async fn pause(secs: u64) {
    if secs > 0 {
        info!(secs, "scenario: waiting");
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}

async fn run_scenario(api: Api<Service>, output: Output, wait_secs: u64) -> Result<()> {
    create_headless_service(&api, "svc1").await?;

    let a = service_informer(api.clone(), output, "A");
    // Expect an add for svc1.
    start_logged(&a, "A").await;
    stop_logged(&a, "A").await;

    // Nothing changed while stopped: expect no events.
    start_logged(&a, "A").await;
    pause(wait_secs).await;
    stop_logged(&a, "A").await;

    create_headless_service(&api, "svc2").await?;
    // Expect an add for svc2 only.
    start_logged(&a, "A").await;
    pause(wait_secs).await;
    stop_logged(&a, "A").await;

    // A fresh informer has seen nothing: expect adds for svc1 and svc2.
    let b = service_informer(api.clone(), output, "B");
    start_logged(&b, "B").await;
    pause(wait_secs).await;
    stop_logged(&b, "B").await;

    delete_service(&api, "svc1").await?;
    delete_service(&api, "svc2").await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    telemetry::init_metrics();
    let cli = Cli::parse();

    let client = Client::try_default().await?;
    let ns = cli.namespace.clone().unwrap_or_else(|| client.default_namespace().to_string());
    let api: Api<Service> = Api::namespaced(client, &ns);

    match cli.command {
        Commands::Watch => {
            info!(ns = %ns, "watch invoked");
            let informer = service_informer(api, cli.output, "services");
            informer.start().await?;
            info!(known = informer.store().len(), "watching; press Ctrl-C to stop");
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C");
            }
            informer.stop().await;
        }
        Commands::Scenario { wait_secs } => {
            info!(ns = %ns, wait_secs, "scenario invoked");
            run_scenario(api, cli.output, wait_secs).await?;
        }
    }
    Ok(())
}
