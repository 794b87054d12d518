//! Provisioner CLI - VM cluster lifecycle on a single hypervisor host.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use provisioner::hypervisor::{Hypervisor, MemoryHypervisor, Virsh};
use provisioner::network::HostDns;
use provisioner::orchestrator::{ClusterStatus, TeardownReport};
use provisioner::state::{ClusterKind, ClusterStateStore};
use provisioner::{ClusterError, ClusterOrchestrator, ClustersFile, PcieValidator, Settings};

/// Provision and manage HPC and Cloud VM clusters.
#[derive(Parser)]
#[command(name = "provisioner")]
#[command(about = "Provision and manage VM clusters on a hypervisor host")]
struct Cli {
    /// Cluster configuration file.
    #[arg(long, env = "PROVISIONER_CONFIG", default_value = "config/clusters.yaml")]
    config: PathBuf,

    /// Directory holding cluster state and the shared GPU record.
    #[arg(long, env = "PROVISIONER_STATE_DIR", default_value = "output")]
    state_dir: PathBuf,

    /// Parent directory of per-cluster storage pools.
    #[arg(long, default_value = "/var/lib/libvirt/images")]
    pool_root: PathBuf,

    /// Hypervisor connection URI (defaults to `LIBVIRT_DEFAULT_URI`, then qemu:///system).
    #[arg(long)]
    uri: Option<String>,

    /// Run against an in-memory hypervisor with throwaway state.
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create (or resume) a cluster and start its VMs.
    Start {
        /// Cluster kind (hpc or cloud).
        #[arg(long)]
        kind: ClusterKind,

        /// Wait for every VM to report running.
        #[arg(long, default_value = "false")]
        wait: bool,

        /// Seconds to wait for each VM to boot.
        #[arg(long, default_value = "300")]
        boot_timeout: u64,
    },

    /// Stop every VM of a cluster and release its GPUs.
    Stop {
        #[arg(long)]
        kind: ClusterKind,

        /// Seconds to wait for a graceful shutdown before forcing.
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Remove a cluster's VMs, storage and network.
    Destroy {
        #[arg(long)]
        kind: ClusterKind,

        /// Keep VM disk images on the host.
        #[arg(long, default_value = "false")]
        retain_volumes: bool,
    },

    /// Restart one VM, re-claiming its GPUs.
    Restart {
        #[arg(long)]
        kind: ClusterKind,

        /// VM name.
        #[arg(long)]
        vm: String,

        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show recorded topology and live VM states.
    Status {
        #[arg(long)]
        kind: ClusterKind,

        /// Print JSON instead of a table.
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Check host and device readiness for PCIe passthrough.
    ValidatePcie {
        /// Devices to check; defaults to every device in the config file.
        #[arg(long, value_delimiter = ',')]
        devices: Vec<String>,
    },

    /// List GPU ownership across all clusters on this host.
    GpuAllocations,
}

fn load_config(path: &Path) -> Result<ClustersFile> {
    let file = ClustersFile::load(path)
        .with_context(|| format!("Failed to load cluster config {}", path.display()))?;
    for (pci, clusters) in file.shared_gpus() {
        warn!(pci = %pci, clusters = ?clusters, "Device requested by more than one cluster");
        println!(
            "⚠️  {pci} is requested by {}; only one cluster can run it at a time",
            clusters.join(" and ")
        );
    }
    Ok(file)
}

fn cluster_name(file: &ClustersFile, kind: ClusterKind) -> Result<String> {
    Ok(file.cluster(kind)?.name.clone())
}

fn print_report(action: &str, report: &TeardownReport) {
    println!("\n✅ {action} {} VM(s)", report.vms.len());
    for vm in &report.vms {
        println!("  - {vm}");
    }
    if !report.released_gpus.is_empty() {
        println!("  Released GPUs:");
        for pci in &report.released_gpus {
            println!("    {pci}");
        }
    }
    for warning in &report.warnings {
        println!("  ⚠️  {warning}");
    }
}

fn print_status(status: &ClusterStatus) {
    println!("\nCluster: {} ({})", status.cluster_name, status.status);
    if let Some(kind) = status.cluster_type {
        println!("  Type:    {kind}");
    }
    if let (Some(network), Some(subnet)) = (&status.network, &status.subnet) {
        println!("  Network: {network} ({subnet})");
    }
    if let Some(pool) = &status.storage_pool {
        println!("  Pool:    {pool}");
    }
    if status.vms.is_empty() {
        return;
    }
    println!(
        "\n{:<28} {:<12} {:<10} {:<16} {}",
        "VM", "ROLE", "STATE", "IP", "GPUS"
    );
    println!("{}", "-".repeat(84));
    for vm in &status.vms {
        let gpus: Vec<String> = vm.gpus.iter().map(ToString::to_string).collect();
        println!(
            "{:<28} {:<12} {:<10} {:<16} {}",
            vm.name,
            vm.role.to_string(),
            vm.state.to_string(),
            vm.ip_address.map(|ip| ip.to_string()).unwrap_or_default(),
            gpus.join(",")
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Dry runs keep everything, state included, in a scratch directory.
    let scratch = if cli.dry_run {
        Some(tempfile::tempdir().context("Failed to create dry-run directory")?)
    } else {
        None
    };

    let mut settings = Settings {
        state_dir: cli.state_dir.clone(),
        pool_root: cli.pool_root.clone(),
        ..Settings::default()
    };
    let hypervisor: Arc<dyn Hypervisor> = if let Some(dir) = &scratch {
        info!(dir = %dir.path().display(), "Dry run: using in-memory hypervisor");
        settings.state_dir = dir.path().join("state");
        settings.pool_root = dir.path().join("pools");
        settings.dns_config_dir = dir.path().join("dnsmasq.d");
        settings.check_free_space = false;
        Arc::new(MemoryHypervisor::new())
    } else {
        Arc::new(Virsh::new(cli.uri.as_deref()))
    };

    match cli.command {
        Commands::Start {
            kind,
            wait,
            boot_timeout,
        } => {
            let file = load_config(&cli.config)?;
            let config = file.cluster(kind)?;
            settings.wait_for_boot = wait;
            settings.boot_timeout = Duration::from_secs(boot_timeout);
            let mut orchestrator = ClusterOrchestrator::new(hypervisor, settings.clone());
            if let Some(dir) = &scratch {
                orchestrator = orchestrator.with_dns(
                    HostDns::new(dir.path().join("dnsmasq.d"))
                        .with_privilege_check(|| true)
                        .with_restart_commands(Vec::new()),
                );
            }

            let state = match orchestrator.start(config, kind, Some(cli.config.as_path())).await {
                Ok(state) => state,
                Err(e) => {
                    if let ClusterError::Orchestration {
                        rollback_warnings, ..
                    } = &e
                    {
                        for warning in rollback_warnings {
                            println!("⚠️  rollback: {warning}");
                        }
                    }
                    return Err(e).context(format!("Failed to start {kind} cluster"));
                }
            };

            println!("\n✅ Cluster {} is up", state.cluster_name);
            for vm in state.all_vms() {
                println!(
                    "  {:<28} {:<10} {}",
                    vm.name,
                    vm.state.to_string(),
                    vm.ip_address.map(|ip| ip.to_string()).unwrap_or_default()
                );
            }
            println!(
                "  State: {}",
                ClusterStateStore::for_cluster(&settings.state_dir, &state.cluster_name)
                    .path()
                    .display()
            );
        }

        Commands::Stop { kind, timeout } => {
            let name = cluster_name(&load_config(&cli.config)?, kind)?;
            settings.shutdown_timeout = Duration::from_secs(timeout);
            let orchestrator = ClusterOrchestrator::new(hypervisor, settings);
            let report = orchestrator
                .stop(&name)
                .await
                .with_context(|| format!("Failed to stop cluster {name}"))?;
            print_report("Stopped", &report);
        }

        Commands::Destroy {
            kind,
            retain_volumes,
        } => {
            let name = cluster_name(&load_config(&cli.config)?, kind)?;
            let orchestrator = ClusterOrchestrator::new(hypervisor, settings);
            let report = orchestrator
                .destroy(&name, retain_volumes)
                .await
                .with_context(|| format!("Failed to destroy cluster {name}"))?;
            print_report("Destroyed", &report);
            if retain_volumes {
                println!("  Disk images were kept");
            }
        }

        Commands::Restart { kind, vm, timeout } => {
            let name = cluster_name(&load_config(&cli.config)?, kind)?;
            let mut store = ClusterStateStore::for_cluster(&settings.state_dir, &name);
            let Some(state) = store.load()? else {
                bail!("Cluster {name} has no recorded state");
            };
            let Some(record) = state.vm(&vm) else {
                bail!("VM {vm} is not part of cluster {name}");
            };
            let gpus: Vec<_> = record
                .assigned_gpus
                .iter()
                .map(|g| g.pci_address.clone())
                .collect();

            let orchestrator = ClusterOrchestrator::new(hypervisor, settings);
            orchestrator
                .lifecycle()
                .restart(&vm, &gpus, Duration::from_secs(timeout))
                .await
                .with_context(|| format!("Failed to restart {vm}"))?;
            println!("\n✅ Restarted {vm}");
        }

        Commands::Status { kind, json } => {
            let name = cluster_name(&load_config(&cli.config)?, kind)?;
            let orchestrator = ClusterOrchestrator::new(hypervisor, settings);
            let status = orchestrator.status(&name).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }

        Commands::ValidatePcie { devices } => {
            let devices = if devices.is_empty() {
                let file = load_config(&cli.config)?;
                let mut all = Vec::new();
                for kind in [ClusterKind::Hpc, ClusterKind::Cloud] {
                    let Ok(cluster) = file.cluster(kind) else {
                        continue;
                    };
                    for node in cluster.all_nodes(kind) {
                        for device in node.passthrough_devices() {
                            if !all.contains(&device.pci_address) {
                                all.push(device.pci_address.clone());
                            }
                        }
                    }
                }
                all
            } else {
                devices
            };

            let orchestrator = ClusterOrchestrator::new(hypervisor, settings);
            let validator: &PcieValidator = orchestrator.validator();
            validator
                .validate_host()
                .context("Host is not ready for PCIe passthrough")?;
            println!("\n✅ Host passthrough checks passed");
            if devices.is_empty() {
                println!("  No devices requested");
            }
            for device in validator.validate_devices(devices.as_slice())? {
                println!(
                    "  ✅ {} {} driver={} group={}",
                    device.pci_address,
                    device.class_name(),
                    device.current_driver.as_deref().unwrap_or("none"),
                    device.iommu_group.as_deref().unwrap_or("?")
                );
            }
        }

        Commands::GpuAllocations => {
            let orchestrator = ClusterOrchestrator::new(hypervisor, settings);
            let allocations = orchestrator.gpu_allocations()?;
            if allocations.is_empty() {
                println!("No GPUs allocated");
            } else {
                println!("\n{:<16} OWNER", "GPU");
                println!("{}", "-".repeat(44));
                for (pci, owner) in allocations {
                    println!("{:<16} {owner}", pci.to_string());
                }
            }
        }
    }

    Ok(())
}
