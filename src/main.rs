//! f11r operator - game servers and scheduled playtests on Kubernetes

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use f11r_operator::config::OperatorConfig;
use f11r_operator::controller::{
    game_server_error_policy, playtest_error_policy, reconcile_game_server, reconcile_playtest,
    GameServerContext, PlaytestContext, CONTROLLER_NAME,
};
use f11r_operator::crd::{GameServer, Playtest};
use f11r_operator::random::PortRanges;

/// f11r operator - game servers and scheduled playtests on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "f11r-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the GameServer and Playtest controllers (default mode)
    Controller,
}

/// Controller settings
#[derive(Args, Debug)]
struct ControllerArgs {
    /// Image repository for game servers; the server version is used as the tag
    #[arg(long, env = "GAME_SERVER_IMAGE")]
    game_server_image: Option<String>,

    /// First game port handed out (inclusive)
    #[arg(long, env = "GAME_PORT_MIN", default_value_t = 7700)]
    game_port_min: u16,

    /// End of the game port range (exclusive)
    #[arg(long, env = "GAME_PORT_MAX", default_value_t = 7800)]
    game_port_max: u16,

    /// First NetImgui port; offset in step with the game port
    #[arg(long, env = "NETIMGUI_PORT_MIN", default_value_t = 7800)]
    netimgui_port_min: u16,

    /// First status port; offset in step with the game port
    #[arg(long, env = "STATUS_PORT_MIN", default_value_t = 9000)]
    status_port_min: u16,

    /// Seconds between periodic resyncs of settled objects
    #[arg(long, env = "RESYNC_SECS", default_value_t = 60)]
    resync_secs: u64,

    /// Skip installing CRDs on startup
    #[arg(long)]
    skip_crd_install: bool,
}

impl ControllerArgs {
    fn operator_config(&self) -> anyhow::Result<OperatorConfig> {
        let image = self.game_server_image.clone().ok_or_else(|| {
            anyhow::anyhow!("--game-server-image (or GAME_SERVER_IMAGE) is required")
        })?;
        let config = OperatorConfig::new(image)
            .with_ports(PortRanges {
                game_min: self.game_port_min,
                game_max: self.game_port_max,
                netimgui_min: self.netimgui_port_min,
                status_min: self.status_port_min,
            })
            .with_resync_interval(Duration::from_secs(self.resync_secs));
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,f11r_operator=debug,kube=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    if cli.crd {
        for crd in [GameServer::crd(), Playtest::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.controller).await,
    }
}

/// Ensure the GameServer and Playtest CRDs are installed
///
/// Uses server-side apply so the installed schema always matches this build.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CONTROLLER_NAME).force();

    for crd in [GameServer::crd(), Playtest::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD...");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    tracing::info!("All CRDs installed/updated");
    Ok(())
}

/// Run both controllers until a shutdown signal arrives
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let config = args.operator_config()?;

    tracing::info!(
        image = %config.game_server_image,
        resync_secs = config.resync_interval.as_secs(),
        "f11r operator starting..."
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if !args.skip_crd_install {
        ensure_crds_installed(&client).await?;
    }

    let resync_interval = config.resync_interval;
    let game_server_ctx = Arc::new(GameServerContext::builder(client.clone(), config).build());
    let playtest_ctx = Arc::new(
        PlaytestContext::builder(client.clone())
            .resync_interval(resync_interval)
            .build(),
    );

    tracing::info!("Starting controllers...");
    tracing::info!("  - GameServer controller");
    tracing::info!("  - Playtest controller");

    let game_server_controller = Controller::new(
        Api::<GameServer>::all(client.clone()),
        WatcherConfig::default(),
    )
    .owns(Api::<Pod>::all(client.clone()), WatcherConfig::default())
    .shutdown_on_signal()
    .run(reconcile_game_server, game_server_error_policy, game_server_ctx)
    .for_each(|result| async move {
        match result {
            Ok(action) => {
                tracing::debug!(?action, "GameServer reconciliation completed");
            }
            Err(e) => {
                tracing::error!(error = ?e, "GameServer reconciliation error");
            }
        }
    });

    let playtest_controller = Controller::new(
        Api::<Playtest>::all(client.clone()),
        WatcherConfig::default(),
    )
    .owns(Api::<GameServer>::all(client), WatcherConfig::default())
    .shutdown_on_signal()
    .run(reconcile_playtest, playtest_error_policy, playtest_ctx)
    .for_each(|result| async move {
        match result {
            Ok(action) => {
                tracing::debug!(?action, "Playtest reconciliation completed");
            }
            Err(e) => {
                tracing::error!(error = ?e, "Playtest reconciliation error");
            }
        }
    });

    tokio::select! {
        _ = game_server_controller => {
            tracing::info!("GameServer controller completed");
        }
        _ = playtest_controller => {
            tracing::info!("Playtest controller completed");
        }
    }

    tracing::info!("f11r operator shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn controller_args_build_config() {
        let cli = Cli::parse_from([
            "f11r-operator",
            "--game-server-image",
            "registry.example/game-server",
            "--game-port-min",
            "8000",
            "--game-port-max",
            "8050",
            "--resync-secs",
            "30",
            "controller",
        ]);
        assert!(matches!(cli.command, Some(Commands::Controller)));

        let config = cli.controller.operator_config().unwrap();
        assert_eq!(config.game_server_image, "registry.example/game-server");
        assert_eq!(config.ports.game_min, 8000);
        assert_eq!(config.ports.game_max, 8050);
        assert_eq!(config.ports.netimgui_min, 7800);
        assert_eq!(config.resync_interval, Duration::from_secs(30));
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let cli = Cli::parse_from([
            "f11r-operator",
            "--game-server-image",
            "img",
            "--game-port-min",
            "7800",
            "--game-port-max",
            "7700",
        ]);
        assert!(cli.controller.operator_config().is_err());
    }
}
