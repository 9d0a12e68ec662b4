//! natctl - declarative NAT bridges for virtualization hosts
//!
//! Command-line front end. Every subcommand maps to one core operation;
//! the model file is the source of truth and each mutation is persisted
//! before nftables and dnsmasq are brought in line with it.
//!
//! # Usage
//!
//! ```bash
//! natctl init --wan vmbr0                       # Write a fresh model file
//! natctl bridge add vmbr1 --subnet 10.10.10.0/24 --gateway 10.10.10.1 --nat
//! natctl forward add vmbr1 --proto tcp --ext-port 2222 --to 10.10.10.101 --port 22
//! natctl dhcp set vmbr1 10.10.10.100 10.10.10.200
//! natctl plan                                   # Diff compiled outputs vs disk
//! natctl apply                                  # Re-run both reconcilers
//! ```
//!
//! Exit codes: 0 success, 1 rejected or failed, 2 model saved but the host
//! lags behind (see the printed diagnostic).

use clap::{Args, Parser, Subcommand};
use natctl::config::{HostPaths, InitOptions};
use natctl::core::dhcp::DhcpPlan;
use natctl::core::error::DiagnosticHint;
use natctl::core::inventory::{HostInventory, VmKind};
use natctl::core::nat::NatPlan;
use natctl::core::state::{AttachBridge, NetworkState, NewBridge, NewForward};
use natctl::core::tool::Tools;
use natctl::{ApplyReport, DhcpPool, Protocol};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

shadow_rs::shadow!(build);

/// Exit code for a committed mutation whose host apply failed
const EXIT_PARTIAL: u8 = 2;

#[derive(Parser)]
#[command(name = "natctl")]
#[command(about = "Declarative NAT, port-forward and DHCP manager for host bridges", long_about = None)]
struct Cli {
    /// Model file (default: /etc/natctl/natctl.json)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a new model file
    Init(InitArgs),
    /// Show version and build information
    Version,
    /// Reconcile nftables and dnsmasq with the model
    Apply,
    /// Show the model summary and live host state
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Show compiled outputs as a diff against the files on disk
    Plan,
    /// Manage bridges
    #[command(subcommand)]
    Bridge(BridgeCommand),
    /// Manage masquerading
    #[command(subcommand)]
    Nat(NatCommand),
    /// Manage port forwards
    #[command(subcommand)]
    Forward(ForwardCommand),
    /// Manage DHCP pools
    #[command(subcommand)]
    Dhcp(DhcpCommand),
    /// List addresses in use on every managed bridge
    UsedIps {
        #[arg(long)]
        json: bool,
    },
    /// Manage guest network interfaces
    #[command(subcommand)]
    Vm(VmCommand),
    /// Show recent audit log entries
    Log {
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
    },
}

#[derive(Args)]
struct InitArgs {
    /// External interface all DNAT and masquerade rules match on
    #[arg(long)]
    wan: String,
    #[arg(long)]
    listen: Option<String>,
    /// `local` or `pam`
    #[arg(long)]
    auth_mode: Option<String>,
    #[arg(long)]
    pam_service: Option<String>,
    #[arg(long = "allow-user")]
    allow_users: Vec<String>,
    #[arg(long)]
    admin_user: Option<String>,
    #[arg(long)]
    admin_pass_hash: Option<String>,
    #[arg(long)]
    proxmox_url: Option<String>,
    #[arg(long)]
    proxmox_token_id: Option<String>,
    #[arg(long)]
    proxmox_secret: Option<String>,
    #[arg(long)]
    proxmox_node: Option<String>,
}

#[derive(Args)]
struct PoolArgs {
    /// First address handed out
    #[arg(long = "dhcp-start", requires = "end")]
    start: Option<String>,
    /// Last address handed out
    #[arg(long = "dhcp-end", requires = "start")]
    end: Option<String>,
    /// Lease duration, e.g. `12h`, `30m`, `infinite`
    #[arg(long, default_value = "")]
    lease: String,
    #[arg(long, default_value = "")]
    dns1: String,
    #[arg(long, default_value = "")]
    dns2: String,
}

impl PoolArgs {
    fn pool(&self) -> Option<DhcpPool> {
        match (&self.start, &self.end) {
            (Some(start), Some(end)) => Some(DhcpPool::from_input(start, end, &self.lease, &self.dns1, &self.dns2)),
            _ => None,
        }
    }
}

#[derive(Subcommand)]
enum BridgeCommand {
    /// List host bridges and whether natctl manages them
    List,
    /// Create a bridge on the host and manage it
    Add {
        name: String,
        #[arg(long)]
        subnet: String,
        #[arg(long)]
        gateway: String,
        #[arg(long)]
        nat: bool,
        /// Address-less interface to use as the bridge port
        #[arg(long)]
        uplink: Option<String>,
        #[command(flatten)]
        pool: PoolArgs,
    },
    /// Manage a bridge that already exists on the host
    Attach {
        name: String,
        #[arg(long)]
        nat: bool,
        #[command(flatten)]
        pool: PoolArgs,
    },
    /// Stop managing a bridge (the interface is kept)
    Detach { name: String },
}

#[derive(Subcommand)]
enum NatCommand {
    /// Flip masquerading on a bridge
    Toggle { bridge: String },
}

#[derive(Subcommand)]
enum ForwardCommand {
    /// List forwards on all bridges
    List,
    /// Add a port forward
    Add {
        bridge: String,
        /// `tcp`, `udp` or `tcp+udp`
        #[arg(long, default_value = "tcp")]
        proto: String,
        #[arg(long)]
        ext_port: u16,
        /// Internal address
        #[arg(long)]
        to: String,
        /// Internal port (defaults to the external port)
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, default_value = "")]
        comment: String,
    },
    /// Remove a forward by id
    Rm { id: String },
    /// Enable or disable a forward by id
    Toggle { id: String },
    /// Guest addresses per bridge, to pick a forward target from
    Targets,
}

#[derive(Subcommand)]
enum DhcpCommand {
    /// Set or replace the pool of a bridge
    Set {
        bridge: String,
        start: String,
        end: String,
        #[arg(long, default_value = "")]
        lease: String,
        #[arg(long, default_value = "")]
        dns1: String,
        #[arg(long, default_value = "")]
        dns2: String,
    },
    /// Remove the pool of a bridge
    Disable { bridge: String },
    /// Show active leases
    Leases,
}

#[derive(Subcommand)]
enum VmCommand {
    /// Point a guest NIC at a bridge
    SetBridge {
        /// `qemu` or `lxc`
        #[arg(long, default_value = "qemu")]
        kind: VmKind,
        #[arg(long)]
        vmid: u32,
        /// NIC key, `net0` by default
        #[arg(long)]
        key: Option<String>,
        bridge: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            if let Some(diagnostic) = e.diagnostic() {
                print_hint(diagnostic);
            }
            ExitCode::FAILURE
        }
    }
}

async fn handle_cli(cli: Cli) -> natctl::Result<ExitCode> {
    let paths = cli
        .config
        .map_or_else(HostPaths::default, HostPaths::with_config_file);
    let tools = Tools::from_env();

    match cli.command {
        Commands::Init(args) => {
            let options = InitOptions {
                wan_interface: args.wan,
                listen_addr: args.listen,
                auth_mode: args.auth_mode,
                auth_pam_service: args.pam_service,
                auth_allow_users: args.allow_users,
                admin_user: args.admin_user,
                admin_pass_hash: args.admin_pass_hash,
                proxmox_url: args.proxmox_url,
                proxmox_token_id: args.proxmox_token_id,
                proxmox_secret: args.proxmox_secret,
                proxmox_node: args.proxmox_node,
            };
            NetworkState::init(options, &tools, &paths).await?;
            println!("✓ Wrote {}", paths.config_file.display());
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Version => {
            println!("natctl {}", build::PKG_VERSION);
            println!(
                "commit {}{}",
                build::SHORT_COMMIT,
                if build::GIT_CLEAN { "" } else { " (dirty)" }
            );
            println!("built {}", build::BUILD_TIME);
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    warn_if_not_root();
    let state = NetworkState::load(&tools, &paths).await?;
    let inventory = HostInventory::new(tools.ip.clone(), paths.sys_class_net.clone());

    let report = match cli.command {
        Commands::Init(_) | Commands::Version => return Ok(ExitCode::SUCCESS),
        Commands::Apply => state.reapply().await,
        Commands::Status { json } => {
            let status = state.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("WAN interface: {}", status.wan_interface);
                println!("Bridges: {}", status.bridges);
                println!("Forwards: {}", status.forwards);
                println!(
                    "DHCP service: {}",
                    if status.dhcp_active { "active" } else { "inactive" }
                );
                println!();
                println!("{}", status.nat_rules.trim_end());
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Plan => {
            let (nat, dhcp) = state.plan().await?;
            let rules = match nat {
                NatPlan::Ruleset(rules) => rules.render(),
                NatPlan::RemoveTable => String::new(),
            };
            let dnsmasq = match dhcp {
                DhcpPlan::Config(text) => text,
                DhcpPlan::Stop => String::new(),
            };
            print_diff(state.nat().rules_file(), &rules).await;
            print_diff(state.dhcp().config_file(), &dnsmasq).await;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Bridge(BridgeCommand::List) => {
            for view in state.host_bridges(&inventory).await? {
                println!(
                    "{} {:<12} {:<18} {}",
                    if view.managed { "*" } else { " " },
                    view.name,
                    view.cidr.as_deref().unwrap_or("-"),
                    view.ports
                );
            }
            let uplinks = state.uplinks(&inventory).await?;
            if !uplinks.is_empty() {
                let names: Vec<_> = uplinks.iter().map(|u| format!("{} ({})", u.name, u.kind)).collect();
                println!();
                println!("Available uplinks: {}", names.join(", "));
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Bridge(BridgeCommand::Add {
            name,
            subnet,
            gateway,
            nat,
            uplink,
            pool,
        }) => {
            let request = NewBridge {
                name,
                subnet,
                gateway,
                nat_enabled: nat,
                uplink,
                dhcp: pool.pool(),
            };
            state.declare_bridge(&inventory, request).await?
        }
        Commands::Bridge(BridgeCommand::Attach { name, nat, pool }) => {
            let request = AttachBridge {
                name,
                nat_enabled: nat,
                dhcp: pool.pool(),
            };
            state.attach_bridge(&inventory, request).await?
        }
        Commands::Bridge(BridgeCommand::Detach { name }) => state.detach_bridge(&name).await?,
        Commands::Nat(NatCommand::Toggle { bridge }) => {
            let (enabled, report) = state.toggle_nat(&bridge).await?;
            println!("NAT on {bridge}: {}", if enabled { "on" } else { "off" });
            report
        }
        Commands::Forward(ForwardCommand::List) => {
            for bridge in state.bridges().await {
                for f in &bridge.forwards {
                    println!(
                        "{}  {:<8} {:<8} {:>5} -> {}:{}  {}{}",
                        f.id,
                        bridge.name,
                        f.protocol,
                        f.ext_port,
                        f.int_ip,
                        f.int_port,
                        if f.enabled { "" } else { "[disabled] " },
                        f.comment
                    );
                }
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Forward(ForwardCommand::Add {
            bridge,
            proto,
            ext_port,
            to,
            port,
            comment,
        }) => {
            let request = NewForward {
                bridge,
                protocol: Protocol::parse(&proto)?,
                ext_port,
                int_ip: to,
                int_port: port.unwrap_or(ext_port),
                comment,
            };
            let (id, report) = state.add_forward(request).await?;
            println!("Forward {id} added");
            report
        }
        Commands::Forward(ForwardCommand::Targets) => {
            for list in state.bridge_ip_options(&inventory).await? {
                println!("{}", list.bridge);
                for option in &list.options {
                    println!("  {:<16} {}", option.ip, option.label);
                }
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Forward(ForwardCommand::Rm { id }) => state.delete_forward(&id).await?,
        Commands::Forward(ForwardCommand::Toggle { id }) => {
            let (enabled, report) = state.toggle_forward(&id).await?;
            println!("Forward {id}: {}", if enabled { "enabled" } else { "disabled" });
            report
        }
        Commands::Dhcp(DhcpCommand::Set {
            bridge,
            start,
            end,
            lease,
            dns1,
            dns2,
        }) => {
            let pool = DhcpPool::from_input(&start, &end, &lease, &dns1, &dns2);
            state.set_dhcp(&bridge, pool).await?
        }
        Commands::Dhcp(DhcpCommand::Disable { bridge }) => state.clear_dhcp(&bridge).await?,
        Commands::Dhcp(DhcpCommand::Leases) => {
            for lease in state.leases().await? {
                println!("{:<16} {}  {}", lease.ip, lease.mac, lease.hostname);
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::UsedIps { json } => {
            let usage = state.used_ips(&inventory).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&usage)?);
            } else {
                for bridge in &usage {
                    println!("{} ({})", bridge.bridge, bridge.subnet);
                    for used in &bridge.ips {
                        println!("  {used}");
                    }
                }
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Vm(VmCommand::SetBridge {
            kind,
            vmid,
            key,
            bridge,
        }) => {
            let value = state
                .set_vm_bridge(&inventory, kind, vmid, key.as_deref(), &bridge)
                .await?;
            println!("✓ {kind} {vmid}: {value}");
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Log { count } => {
            let events = match state.audit().read_recent(count).await {
                Ok(events) => events,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    println!("No audit log at {}", state.audit().path().display());
                    return Ok(ExitCode::SUCCESS);
                }
                Err(e) => return Err(e.into()),
            };
            for event in events {
                println!(
                    "{} {:<16} {} {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    serde_json::to_value(event.event_type)?
                        .as_str()
                        .unwrap_or_default(),
                    if event.success { "ok" } else { "FAILED" },
                    event.error.unwrap_or_default()
                );
            }
            return Ok(ExitCode::SUCCESS);
        }
    };

    Ok(print_report(&report))
}

fn print_report(report: &ApplyReport) -> ExitCode {
    println!("nat:  {}", report.nat);
    println!("dhcp: {}", report.dhcp);
    for warning in &report.warnings {
        println!("warning: {warning}");
    }

    if report.is_complete() {
        println!("✓ Host matches the model.");
        return ExitCode::SUCCESS;
    }

    eprintln!();
    eprintln!("✗ The model was saved, but the host does not match it yet.");
    for (step, diagnostic) in report.failures() {
        eprintln!("{step}: {diagnostic}");
        print_hint(diagnostic);
    }
    eprintln!("Fix the cause and run `natctl apply`.");
    ExitCode::from(EXIT_PARTIAL)
}

fn print_hint(diagnostic: &str) {
    let hint = DiagnosticHint::for_diagnostic(diagnostic);
    eprintln!("  {}", hint.user_message);
    for suggestion in &hint.suggestions {
        eprintln!("  - {suggestion}");
    }
}

async fn print_diff(path: &Path, compiled: &str) {
    let on_disk = tokio::fs::read_to_string(path).await.unwrap_or_default();
    let name = path.display().to_string();

    if on_disk == compiled {
        println!("{name}: up to date");
        return;
    }
    let (old_header, new_header) = (format!("{name} (on disk)"), format!("{name} (compiled)"));
    let diff = similar::TextDiff::from_lines(on_disk.as_str(), compiled);
    print!(
        "{}",
        diff.unified_diff()
            .context_radius(3)
            .header(&old_header, &new_header)
    );
}

fn warn_if_not_root() {
    if !nix::unistd::getuid().is_root() {
        tracing::warn!("Not running as root; nft, systemctl and ip will likely be refused");
    }
}
