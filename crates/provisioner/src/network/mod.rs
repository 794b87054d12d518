//! Per-cluster virtual networks and IP address assignment.

mod dns;
mod subnet;

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

pub use dns::HostDns;
pub use subnet::Subnet;

use crate::config::NetworkSettings;
use crate::error::ClusterError;
use crate::hypervisor::{ForwardMode, Hypervisor, NetworkSpec, StaticHost};
use crate::state::{DhcpRange, DnsMode, NetworkConfig};

const DEFAULT_FORWARDERS: [&str; 2] = ["8.8.8.8", "1.1.1.1"];

/// Name of the virtual network of `cluster`.
#[must_use]
pub fn network_name(cluster: &str) -> String {
    format!("{cluster}-network")
}

/// Stable locally-administered unicast MAC derived from a VM name.
#[must_use]
pub fn mac_address(vm_name: &str) -> String {
    let digest = Sha1::digest(vm_name.as_bytes());
    let mut bytes = [0u8; 6];
    bytes.copy_from_slice(&digest[..6]);
    bytes[0] = (bytes[0] & 0xFE) | 0x02;
    bytes
        .iter()
        .map(|b| hex::encode([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

/// A cluster network known to the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRef {
    pub name: String,
    pub bridge: String,
    /// `false` when the network already existed.
    pub created: bool,
}

#[derive(Debug)]
struct LeaseTable {
    subnet: Subnet,
    gateway: Ipv4Addr,
    /// Addresses pinned by configuration.
    statics: BTreeMap<String, Ipv4Addr>,
    assigned: BTreeMap<String, Ipv4Addr>,
}

impl LeaseTable {
    fn in_use(&self, ip: Ipv4Addr) -> bool {
        ip == self.gateway
            || self.statics.values().any(|s| *s == ip)
            || self.assigned.values().any(|a| *a == ip)
    }
}

/// Creates cluster networks and hands out addresses within them.
pub struct NetworkAllocator {
    hypervisor: Arc<dyn Hypervisor>,
    dns: HostDns,
    leases: Mutex<HashMap<String, LeaseTable>>,
}

impl NetworkAllocator {
    #[must_use]
    pub fn new(hypervisor: Arc<dyn Hypervisor>, dns: HostDns) -> Self {
        Self {
            hypervisor,
            dns,
            leases: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn dns(&self) -> &HostDns {
        &self.dns
    }

    fn leases(&self) -> std::sync::MutexGuard<'_, HashMap<String, LeaseTable>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fill in defaults for a cluster's network section.
    ///
    /// # Errors
    /// Returns a configuration error for an unparseable subnet.
    pub fn resolve_config(
        cluster: &str,
        settings: &NetworkSettings,
    ) -> Result<NetworkConfig, ClusterError> {
        let subnet = Subnet::parse(&settings.subnet)?;
        let (default_start, default_end) = subnet.default_dhcp_range();
        Ok(NetworkConfig {
            subnet: subnet.to_string(),
            bridge_name: settings
                .bridge
                .clone()
                .unwrap_or_else(|| format!("br-{cluster}")),
            gateway_ip: settings.gateway_ip.unwrap_or_else(|| subnet.gateway()),
            dhcp_range: DhcpRange {
                start: settings.dhcp_start.unwrap_or(default_start),
                end: settings.dhcp_end.unwrap_or(default_end),
            },
            dns_mode: settings.dns_mode,
            dns_servers: settings.dns_servers.clone(),
            static_leases: BTreeMap::new(),
        })
    }

    /// Start tracking addresses for `cluster`.
    ///
    /// Leases already recorded in `config` are kept, so a re-run hands every
    /// VM the address it had before.
    ///
    /// # Errors
    /// Returns a configuration error for an unparseable subnet.
    pub fn register(
        &self,
        cluster: &str,
        config: &NetworkConfig,
        statics: BTreeMap<String, Ipv4Addr>,
    ) -> Result<(), ClusterError> {
        let subnet = Subnet::parse(&config.subnet)?;
        let assigned = config
            .static_leases
            .iter()
            .map(|(vm, lease)| (vm.clone(), lease.ip))
            .collect();
        self.leases().insert(
            cluster.to_string(),
            LeaseTable {
                subnet,
                gateway: config.gateway_ip,
                statics,
                assigned,
            },
        );
        Ok(())
    }

    /// Address for `vm`: its configured static IP, its existing lease, or
    /// the lowest free host address in the subnet.
    ///
    /// A configured static IP replaces a different recorded lease.
    ///
    /// # Errors
    /// `ResourceExhausted` when the subnet has no free host address,
    /// `ResourceConflict` when a static IP is already leased to another VM.
    pub fn allocate_ip(&self, cluster: &str, vm: &str) -> Result<Ipv4Addr, ClusterError> {
        let mut leases = self.leases();
        let table = leases.get_mut(cluster).ok_or_else(|| {
            ClusterError::Configuration(format!(
                "network of cluster '{cluster}' has not been registered"
            ))
        })?;

        let ip = if let Some(ip) = table.statics.get(vm).copied() {
            if let Some((holder, _)) = table
                .assigned
                .iter()
                .find(|(name, a)| **a == ip && name.as_str() != vm)
            {
                return Err(ClusterError::ResourceConflict(format!(
                    "static IP {ip} of {vm} is already leased to {holder}"
                )));
            }
            match table.assigned.get(vm) {
                Some(previous) if *previous == ip => return Ok(ip),
                Some(previous) => warn!(
                    cluster = %cluster,
                    vm = %vm,
                    previous = %previous,
                    ip = %ip,
                    "Configured static IP replaces recorded lease"
                ),
                None => {}
            }
            ip
        } else if let Some(ip) = table.assigned.get(vm) {
            return Ok(*ip);
        } else {
            table
                .subnet
                .hosts()
                .find(|ip| !table.in_use(*ip))
                .ok_or_else(|| {
                    ClusterError::ResourceExhausted(format!(
                        "No available IP addresses in network {}",
                        network_name(cluster)
                    ))
                })?
        };

        table.assigned.insert(vm.to_string(), ip);
        info!(cluster = %cluster, vm = %vm, ip = %ip, "Allocated IP address");
        Ok(ip)
    }

    /// Give back the lease of `vm`. Returns `false` if it had none.
    pub fn release_ip(&self, cluster: &str, vm: &str) -> bool {
        let released = self
            .leases()
            .get_mut(cluster)
            .and_then(|t| t.assigned.remove(vm));
        if let Some(ip) = released {
            debug!(cluster = %cluster, vm = %vm, ip = %ip, "Released IP address");
        }
        released.is_some()
    }

    /// Current leases of `cluster`.
    #[must_use]
    pub fn leased(&self, cluster: &str) -> BTreeMap<String, Ipv4Addr> {
        self.leases()
            .get(cluster)
            .map(|t| t.assigned.clone())
            .unwrap_or_default()
    }

    fn forwarders(config: &NetworkConfig) -> Vec<String> {
        match config.dns_mode {
            DnsMode::ServiceDiscovery => vec!["127.0.0.1".to_string()],
            _ if !config.dns_servers.is_empty() => config.dns_servers.clone(),
            _ => DEFAULT_FORWARDERS.iter().map(ToString::to_string).collect(),
        }
    }

    fn spec(cluster: &str, config: &NetworkConfig) -> Result<NetworkSpec, ClusterError> {
        let subnet = Subnet::parse(&config.subnet)?;
        Ok(NetworkSpec {
            name: network_name(cluster),
            bridge: config.bridge_name.clone(),
            gateway: config.gateway_ip,
            prefix_len: subnet.prefix_len(),
            dhcp_start: config.dhcp_range.start,
            dhcp_end: config.dhcp_range.end,
            forward: if config.dns_mode == DnsMode::Routed {
                ForwardMode::Route
            } else {
                ForwardMode::Nat
            },
            domain: format!("{cluster}.local"),
            dns_forwarders: Self::forwarders(config),
            hosts: config
                .static_leases
                .iter()
                .map(|(vm, lease)| StaticHost {
                    name: vm.clone(),
                    mac: lease.mac.clone(),
                    ip: lease.ip,
                })
                .collect(),
        })
    }

    /// Define and start the cluster network. Idempotent: an existing
    /// network is returned with `created == false`.
    ///
    /// `shared-dns` clusters also get a host resolver drop-in, re-applied
    /// for an existing network whose drop-in has gone missing. The
    /// privilege check runs before anything is defined.
    ///
    /// # Errors
    /// Returns `PermissionDenied` for unprivileged `shared-dns`, or the
    /// hypervisor failure. A network defined by this call is removed again
    /// if a later step fails; removal failures come back as
    /// [`ClusterError::Incomplete`].
    pub async fn create_network(
        &self,
        cluster: &str,
        config: &NetworkConfig,
    ) -> Result<NetworkRef, ClusterError> {
        let name = network_name(cluster);
        let shared_dns = config.dns_mode == DnsMode::SharedDns;
        if shared_dns {
            self.dns.ensure_privileged()?;
        }

        if self.hypervisor.list_networks().await?.contains(&name) {
            info!(cluster = %cluster, network = %name, "Network already exists");
            if shared_dns && !self.dns.is_integrated(cluster) {
                info!(cluster = %cluster, "Restoring missing DNS drop-in");
                self.dns.integrate(cluster, config.gateway_ip).await?;
            }
            return Ok(NetworkRef {
                name,
                bridge: config.bridge_name.clone(),
                created: false,
            });
        }

        let spec = Self::spec(cluster, config)?;
        self.hypervisor.define_network(&spec).await?;
        let activated = async {
            self.hypervisor.start_network(&name).await?;
            if shared_dns {
                self.dns.integrate(cluster, config.gateway_ip).await?;
            }
            Ok::<(), ClusterError>(())
        }
        .await;
        if let Err(e) = activated {
            let mut cleanup_failures = Vec::new();
            if let Err(undo) = self.hypervisor.stop_network(&name).await {
                warn!(cluster = %cluster, network = %name, error = %undo, "Failed to stop network");
                cleanup_failures.push(format!("stop network {name}: {undo}"));
            }
            if let Err(undo) = self.hypervisor.undefine_network(&name).await {
                warn!(cluster = %cluster, network = %name, error = %undo, "Failed to undefine network");
                cleanup_failures.push(format!("undefine network {name}: {undo}"));
            }
            return Err(e.with_cleanup_failures(cleanup_failures));
        }

        info!(
            cluster = %cluster,
            network = %name,
            bridge = %config.bridge_name,
            subnet = %config.subnet,
            dns_mode = %config.dns_mode,
            "Created cluster network"
        );
        Ok(NetworkRef {
            name,
            bridge: config.bridge_name.clone(),
            created: true,
        })
    }

    /// Tear down the cluster network and its DNS drop-in, and forget its
    /// leases. Returns `false` if the network did not exist.
    ///
    /// # Errors
    /// Returns the first hypervisor or host failure.
    pub async fn destroy_network(&self, cluster: &str) -> Result<bool, ClusterError> {
        let name = network_name(cluster);
        self.leases().remove(cluster);
        self.dns.remove(cluster).await?;

        match self.hypervisor.stop_network(&name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(cluster = %cluster, network = %name, "Network not found");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        match self.hypervisor.undefine_network(&name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        info!(cluster = %cluster, network = %name, "Destroyed cluster network");
        Ok(true)
    }
}
