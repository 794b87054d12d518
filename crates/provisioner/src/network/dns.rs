//! Host-level DNS forwarding for `shared-dns` clusters.
//!
//! Writes a dnsmasq drop-in that forwards `<cluster>.local` to the cluster
//! gateway, then restarts the host resolver. Requires root.

use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, PersistenceError};

fn effective_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Manages the dnsmasq drop-in files of every cluster.
#[derive(Debug, Clone)]
pub struct HostDns {
    config_dir: PathBuf,
    is_privileged: fn() -> bool,
    restart_commands: Vec<Vec<String>>,
}

impl HostDns {
    #[must_use]
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            is_privileged: effective_root,
            restart_commands: vec![
                vec!["systemctl".into(), "restart".into(), "dnsmasq".into()],
                vec!["service".into(), "dnsmasq".into(), "restart".into()],
            ],
        }
    }

    /// Replace the privilege probe (root check by default).
    #[must_use]
    pub fn with_privilege_check(mut self, check: fn() -> bool) -> Self {
        self.is_privileged = check;
        self
    }

    /// Commands tried in order until one succeeds. Empty skips the restart.
    #[must_use]
    pub fn with_restart_commands(mut self, commands: Vec<Vec<String>>) -> Self {
        self.restart_commands = commands;
        self
    }

    #[must_use]
    pub fn config_path(&self, cluster: &str) -> PathBuf {
        self.config_dir.join(format!("{cluster}.conf"))
    }

    /// Fail with [`ClusterError::PermissionDenied`] unless the process may
    /// write the drop-in directory and restart dnsmasq.
    ///
    /// # Errors
    /// See above.
    pub fn ensure_privileged(&self) -> Result<(), ClusterError> {
        if (self.is_privileged)() {
            Ok(())
        } else {
            Err(ClusterError::PermissionDenied(format!(
                "shared-dns mode must run as root to write {} and restart dnsmasq",
                self.config_dir.display()
            )))
        }
    }

    /// Whether the drop-in of `cluster` is installed.
    #[must_use]
    pub fn is_integrated(&self, cluster: &str) -> bool {
        self.config_path(cluster).is_file()
    }

    /// Drop-in content for `cluster`.
    #[must_use]
    pub fn render(cluster: &str, gateway: Ipv4Addr) -> String {
        format!(
            "# Managed by provisioner for cluster {cluster}\n\
             server=/{cluster}.local/{gateway}\n\
             domain={cluster}.local\n\
             local=/{cluster}.local/\n\
             cache-size=1000\n"
        )
    }

    /// Install the drop-in and restart the resolver. On failure the previous
    /// file (if any) is put back.
    ///
    /// # Errors
    /// Returns `PermissionDenied` without touching the host when not
    /// privileged, or the write/restart failure otherwise.
    pub async fn integrate(&self, cluster: &str, gateway: Ipv4Addr) -> Result<(), ClusterError> {
        self.ensure_privileged()?;
        let path = self.config_path(cluster);
        let previous = read_optional(&path).await?;

        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .map_err(|e| PersistenceError::io(&self.config_dir, e))?;
        tokio::fs::write(&path, Self::render(cluster, gateway))
            .await
            .map_err(|e| PersistenceError::io(&path, e))?;

        if let Err(e) = self.restart().await {
            warn!(cluster = %cluster, error = %e, "dnsmasq restart failed, restoring previous config");
            restore(&path, previous).await;
            return Err(e);
        }
        info!(cluster = %cluster, path = %path.display(), "Integrated cluster DNS with host resolver");
        Ok(())
    }

    /// Remove the drop-in of `cluster`. Returns `false` if there was none.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be removed, or the
    /// resolver cannot be restarted afterwards.
    pub async fn remove(&self, cluster: &str) -> Result<bool, ClusterError> {
        let path = self.config_path(cluster);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(PersistenceError::io(&path, e).into()),
        }
        self.restart().await?;
        info!(cluster = %cluster, "Removed cluster DNS integration");
        Ok(true)
    }

    async fn restart(&self) -> Result<(), ClusterError> {
        let mut failures = Vec::new();
        for command in &self.restart_commands {
            let Some((program, args)) = command.split_first() else {
                continue;
            };
            debug!(command = %command.join(" "), "Restarting host resolver");
            match Command::new(program).args(args).output().await {
                Ok(output) if output.status.success() => return Ok(()),
                Ok(output) => failures.push(format!(
                    "{}: {}",
                    command.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                )),
                Err(e) => failures.push(format!("{}: {e}", command.join(" "))),
            }
        }
        if failures.is_empty() {
            return Ok(());
        }
        Err(ClusterError::HostCommand(format!(
            "failed to restart dnsmasq ({})",
            failures.join("; ")
        )))
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, PersistenceError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PersistenceError::io(path, e)),
    }
}

async fn restore(path: &Path, previous: Option<String>) {
    let result = match previous {
        Some(content) => tokio::fs::write(path, content).await,
        None => tokio::fs::remove_file(path).await,
    };
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to restore DNS config");
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn dns(dir: &TempDir, restart: &[&str]) -> HostDns {
        HostDns::new(dir.path())
            .with_privilege_check(|| true)
            .with_restart_commands(vec![restart.iter().map(ToString::to_string).collect()])
    }

    #[tokio::test]
    async fn test_integrate_writes_dropin() {
        let dir = TempDir::new().unwrap();
        let dns = dns(&dir, &["true"]);
        dns.integrate("hpc", Ipv4Addr::new(192, 168, 100, 1)).await.unwrap();

        let content = std::fs::read_to_string(dns.config_path("hpc")).unwrap();
        assert!(content.contains("server=/hpc.local/192.168.100.1"));
        assert!(content.contains("domain=hpc.local"));
        assert!(content.contains("local=/hpc.local/"));
        assert!(content.contains("cache-size=1000"));

        assert!(dns.remove("hpc").await.unwrap());
        assert!(!dns.remove("hpc").await.unwrap());
    }

    #[tokio::test]
    async fn test_unprivileged_fails_fast() {
        let dir = TempDir::new().unwrap();
        let dns = dns(&dir, &["true"]).with_privilege_check(|| false);
        let err = dns
            .integrate("hpc", Ipv4Addr::new(10, 0, 0, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::PermissionDenied(_)));
        assert!(!dns.config_path("hpc").exists());
    }

    #[tokio::test]
    async fn test_failed_restart_restores_previous_file() {
        let dir = TempDir::new().unwrap();
        let dns = dns(&dir, &["false"]);
        std::fs::write(dns.config_path("hpc"), "old\n").unwrap();

        let err = dns
            .integrate("hpc", Ipv4Addr::new(10, 0, 0, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::HostCommand(_)));
        assert_eq!(std::fs::read_to_string(dns.config_path("hpc")).unwrap(), "old\n");
    }

    #[tokio::test]
    async fn test_failed_restart_removes_new_file() {
        let dir = TempDir::new().unwrap();
        let dns = dns(&dir, &["false"]);
        assert!(dns.integrate("k8s", Ipv4Addr::new(10, 0, 0, 1)).await.is_err());
        assert!(!dns.config_path("k8s").exists());
    }
}
