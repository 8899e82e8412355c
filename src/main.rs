use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vpn_orchestrator::api::OfflineApi;
use vpn_orchestrator::connection::openvpn::OpenVpnFactory;
use vpn_orchestrator::credentials::KeyringCredentialStore;
use vpn_orchestrator::emergency::EmergencyConfig;
use vpn_orchestrator::firewall::{FirewallMode, FirewallSettings, FirewallWhen, policy};
use vpn_orchestrator::helper::NoSharing;
use vpn_orchestrator::{
    CleanupOptions, ConnectState, Engine, EngineDeps, EngineEvent, EngineHandle, EngineSettings,
    LocationId,
};

#[derive(Parser)]
#[command(name = "vpn-orchestrator")]
#[command(about = "Connect, firewall and clean up a VPN tunnel")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect with an OpenVPN config file and stay connected until Ctrl+C
    Connect {
        /// Path to the .ovpn file
        config: PathBuf,

        /// Settings file (defaults to the per-user settings)
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// OpenVPN binary
        #[arg(long, default_value = "openvpn")]
        openvpn: PathBuf,

        /// TOML file with emergency connection endpoints
        #[arg(long)]
        emergency: Option<PathBuf>,
    },
    /// Generate a default settings file
    Init {
        /// Where to write it (defaults to the per-user settings path)
        path: Option<PathBuf>,
    },
    /// Print the firewall policy tables
    Policy,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so prompts on stdout stay readable
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Connect {
            config,
            settings,
            openvpn,
            emergency,
        } => {
            if !is_root() {
                error!("Connecting requires root privileges");
                std::process::exit(1);
            }
            let ok = connect(&config, settings, openvpn, emergency).await?;
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Init { path } => {
            let path = path.unwrap_or_else(EngineSettings::default_path);
            EngineSettings::default().save(&path)?;
            println!("Created default settings: {}", path.display());
        }
        Commands::Policy => print_policy(),
    }

    Ok(())
}

#[cfg(unix)]
fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(not(unix))]
fn is_root() -> bool {
    true
}

fn load_settings(path: Option<PathBuf>) -> Result<EngineSettings, Box<dyn std::error::Error>> {
    let path = path.unwrap_or_else(EngineSettings::default_path);
    if path.exists() {
        info!("Loading settings from {}", path.display());
        Ok(EngineSettings::load(&path)?)
    } else {
        Ok(EngineSettings::default())
    }
}

/// Returns false when the connection ended with an error
async fn connect(
    config: &Path,
    settings: Option<PathBuf>,
    openvpn: PathBuf,
    emergency: Option<PathBuf>,
) -> Result<bool, Box<dyn std::error::Error>> {
    let config = config.canonicalize()?;
    let dir = config
        .parent()
        .ok_or("Config file has no parent directory")?
        .to_path_buf();

    let mut settings = load_settings(settings)?;
    settings.custom_configs_path = Some(dir);
    let firewall_always_on = settings.firewall.mode == FirewallMode::AlwaysOn;

    let emergency = match emergency {
        Some(path) => toml::from_str::<EmergencyConfig>(&std::fs::read_to_string(path)?)?,
        None => EmergencyConfig::default(),
    };

    let capabilities = vpn_orchestrator::platform::get_capabilities()?;
    let deps = EngineDeps {
        firewall: capabilities.firewall,
        helper: capabilities.helper,
        api: Arc::new(OfflineApi),
        sharing: Arc::new(NoSharing),
        credentials: Arc::new(KeyringCredentialStore::new()),
        factories: vec![Arc::new(OpenVpnFactory::new(openvpn))],
        mtu_probe: capabilities.mtu_probe,
        emergency,
    };

    let (engine, mut events) = Engine::start(settings, deps);

    let (stop_tx, mut stop_rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;

    engine.connect(
        LocationId::CustomConfig {
            path: config.display().to_string(),
        },
        None,
    );

    let mut firewall_on = false;
    let mut ok = true;
    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                info!("Interrupted, shutting down...");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if let EngineEvent::FirewallStateChanged(on) = event {
                    firewall_on = on;
                }
                match handle_event(&engine, event).await {
                    Flow::Continue => {}
                    Flow::Stop { failed } => {
                        ok = !failed;
                        break;
                    }
                }
            }
        }
    }

    engine
        .cleanup(CleanupOptions {
            firewall_checked: firewall_on,
            firewall_always_on,
            ..CleanupOptions::default()
        })
        .await;
    info!("Shutdown complete");
    Ok(ok)
}

enum Flow {
    Continue,
    Stop { failed: bool },
}

async fn handle_event(engine: &EngineHandle, event: EngineEvent) -> Flow {
    match event {
        EngineEvent::ConnectStateChanged(change) => match change.state {
            ConnectState::Connected => println!("Connected to {}", change.location),
            ConnectState::Disconnected => {
                if let Some(error) = change.error {
                    error!("Connection failed: {}", error);
                    return Flow::Stop { failed: true };
                }
                if engine.connect_state() == ConnectState::Disconnected {
                    println!("Disconnected");
                    return Flow::Stop { failed: false };
                }
            }
            _ => {}
        },
        EngineEvent::ProtocolPortChanged { protocol, port } => {
            info!("Using {} port {}", protocol, port);
        }
        EngineEvent::FirewallStateChanged(on) => {
            info!("Firewall {}", if on { "on" } else { "off" });
        }
        EngineEvent::RequestUsername(name) => {
            let (username, password) = prompt(move || {
                let username = read_line(&format!("Username for {}: ", name))?;
                let password = rpassword::prompt_password("Password: ")?;
                Ok((username, password))
            })
            .await;
            engine.continue_with_username_and_password(&username, &password, true);
        }
        EngineEvent::RequestPassword(name) => {
            let password =
                prompt(move || rpassword::prompt_password(format!("Password for {}: ", name)))
                    .await;
            engine.continue_with_password(&password, true);
        }
        EngineEvent::RequestPrivKeyPassword(name) => {
            let password = prompt(move || {
                rpassword::prompt_password(format!("Private key password for {}: ", name))
            })
            .await;
            engine.continue_with_priv_key_password(&password, true);
        }
        EngineEvent::HelperSplitTunnelingStartFailed => {
            warn!("Split tunneling could not be started");
        }
        EngineEvent::TestTunnelResult(false) => warn!("Tunnel test failed"),
        EngineEvent::EmergencyConnectError(error) => {
            warn!("Emergency connection failed: {}", error);
        }
        _ => {}
    }
    Flow::Continue
}

/// Run a blocking prompt off the runtime; a failed read counts as cancel
async fn prompt<T, F>(f: F) -> T
where
    T: Default + Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            warn!("Prompt failed: {}", e);
            T::default()
        }
        Err(e) => {
            warn!("Prompt task failed: {}", e);
            T::default()
        }
    }
}

fn read_line(label: &str) -> std::io::Result<String> {
    print!("{}", label);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn print_policy() {
    println!("Connect:");
    println!("  {:<10} {:<18} {:<8} {:<8} after", "mode", "when", "allows", "before");
    for mode in [FirewallMode::Manual, FirewallMode::Automatic, FirewallMode::AlwaysOn] {
        for when in [FirewallWhen::BeforeConnection, FirewallWhen::AfterConnection] {
            for allows in [true, false] {
                let settings = FirewallSettings { mode, when };
                println!(
                    "  {:<10} {:<18} {:<8} {:<8} {:?}",
                    format!("{:?}", mode),
                    format!("{:?}", when),
                    allows,
                    policy::enable_before_connection(settings),
                    policy::after_connection(settings, allows)
                );
            }
        }
    }

    println!();
    println!("Exit:");
    println!("  {:<8} {:<8} {:<8} {:<10} action", "checked", "restart", "launch", "always_on");
    for checked in [true, false] {
        for restart in [true, false] {
            for launch in [true, false] {
                for always_on in [true, false] {
                    println!(
                        "  {:<8} {:<8} {:<8} {:<10} {:?}",
                        checked,
                        restart,
                        launch,
                        always_on,
                        policy::on_exit(checked, restart, launch, always_on)
                    );
                }
            }
        }
    }
}
