// # Tollgate Server
//
// Main entry point for the proxy. Wires the configured backend transport,
// loads persisted state, prints the admin key on first launch and serves
// the metered and admin surfaces.

use clap::Parser;
use rand::RngCore;
use std::sync::Arc;
use tollgate::persist::StateFile;
use tollgate::proxy::{run_server, ProxyEngine};
use tollgate::rpc::backend::{BackendTransport, FnBackend, StdioBackend};
use tollgate::{ProxyConfig, Result, SystemClock, VERSION};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about = "Metered, policy-enforcing JSON-RPC proxy")]
struct Cli {
    /// HTTP listen port for the metered and admin surfaces.
    #[arg(long, default_value_t = 8788)]
    port: u16,

    /// Directory for persisted state (keys, groups, admin key).
    #[arg(long)]
    state_path: Option<String>,

    /// Downstream tool server command. Without one, a loopback echo
    /// backend answers every forward.
    #[arg(long)]
    backend_cmd: Option<String>,

    /// Arguments passed to the backend command.
    #[arg(long, num_args = 0.., value_delimiter = ' ')]
    backend_args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    print_banner();

    let clock = SystemClock::shared();
    let persist = cli.state_path.as_ref().map(|p| Arc::new(StateFile::new(p)));

    // The admin key survives restarts when state is persisted; it is
    // printed so the operator can reach the admin surface.
    let (admin_key, fresh) = match persist.as_ref().and_then(|p| p.load_admin_key()) {
        Some(key) => (key, false),
        None => {
            let key = generate_admin_key();
            if let Some(persist) = &persist {
                persist.save_admin_key(&key);
            }
            (key, true)
        }
    };

    let backend: Arc<dyn BackendTransport> = match &cli.backend_cmd {
        Some(command) => {
            info!(command = %command, "spawning backend");
            Arc::new(StdioBackend::spawn(command, &cli.backend_args)?)
        }
        None => {
            warn!("no --backend-cmd given, using loopback echo backend");
            Arc::new(FnBackend::new(|request: &tollgate::rpc::RpcRequest| {
                Ok(serde_json::json!({
                    "echo": true,
                    "method": &request.method,
                    "params": &request.params,
                }))
            }))
        }
    };

    let config = ProxyConfig {
        port: cli.port,
        state_path: cli.state_path.clone(),
        backend_cmd: cli.backend_cmd.clone(),
        backend_args: cli.backend_args.clone(),
        ..ProxyConfig::default()
    };

    let engine = ProxyEngine::new(config, clock, backend, persist);
    print_startup_info(&cli, &admin_key, fresh, engine.keys.len());

    run_server(engine, admin_key, cli.port).await
}

fn generate_admin_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    format!("tgadm_{}", hex::encode(bytes))
}

fn print_banner() {
    println!("╔══════════════════════════════════════════════════╗");
    println!("║  Tollgate - Metered JSON-RPC Proxy v{:<12} ║", VERSION);
    println!("╚══════════════════════════════════════════════════╝");
    println!();
}

fn print_startup_info(cli: &Cli, admin_key: &str, fresh: bool, key_count: usize) {
    println!("Port:         {}", cli.port);
    println!(
        "State path:   {}",
        cli.state_path.as_deref().unwrap_or("(in-memory)")
    );
    println!(
        "Backend:      {}",
        cli.backend_cmd.as_deref().unwrap_or("(loopback echo)")
    );
    println!("Loaded keys:  {}", key_count);
    println!();
    if fresh {
        println!("Generated admin key (save it, it will not be shown again):");
    } else {
        println!("Admin key (from state):");
    }
    println!("  {}", admin_key);
    println!();
    println!("Metered surface:  POST http://127.0.0.1:{}/rpc", cli.port);
    println!("Admin surface:    http://127.0.0.1:{}/admin (X-Admin-Key header)", cli.port);
    println!();
}
