//! Linux network settings
//!
//! Applies a [`NetworkSettings`] descriptor to a TUN interface with
//! `ip` and, for DNS, `resolvconf` when it is installed.

use crate::config::MtuSetting;
use crate::error::{AdapterError, Result};
use crate::platform::NetworkSettingsApplier;
use crate::tunnel::NetworkSettings;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Applies settings to one interface by shelling out to `ip`
#[derive(Debug, Clone)]
pub struct LinuxSettingsApplier {
    interface: String,
}

impl LinuxSettingsApplier {
    /// Applier for `interface`
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    /// Execute a system command
    async fn run_command(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!("Executing command: {} {:?}", program, args);

        let output = Command::new(program).args(args).output().await.map_err(|e| {
            AdapterError::Interface(format!(
                "Failed to execute {} {}: {}",
                program,
                args.join(" "),
                e
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AdapterError::Interface(format!(
                "Command failed: {} {}: {}",
                program,
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn set_mtu(&self, mtu: MtuSetting) -> Result<()> {
        match mtu {
            MtuSetting::Fixed(mtu) => {
                let mtu = mtu.to_string();
                self.run_command("ip", &["link", "set", "dev", &self.interface, "mtu", &mtu])
                    .await?;
            }
            MtuSetting::TunnelOverhead(overhead) => {
                // Only the OS packet-tunnel framework derives an MTU from overhead
                warn!(
                    "Leaving MTU of {} unchanged (tunnel overhead of {} bytes requested)",
                    self.interface, overhead
                );
            }
        }
        Ok(())
    }

    async fn configure_dns(&self, servers: &[String], search_domains: &[String]) -> Result<()> {
        let mut resolv = String::new();
        for server in servers {
            resolv.push_str(&format!("nameserver {}\n", server));
        }
        if !search_domains.is_empty() {
            resolv.push_str(&format!("search {}\n", search_domains.join(" ")));
        }

        let mut child = match Command::new("resolvconf")
            .args(["-a", &self.interface, "-m", "0", "-x"])
            .stdin(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!("No DNS configuration method available (resolvconf: {})", e);
                return Ok(());
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(resolv.as_bytes()).await.map_err(|e| {
                AdapterError::Interface(format!("Failed to write DNS config: {}", e))
            })?;
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AdapterError::Interface(format!("resolvconf failed: {}", e)))?;
        if !status.success() {
            return Err(AdapterError::Interface(format!(
                "resolvconf exited with {}",
                status
            )));
        }

        debug!("DNS configured via resolvconf");
        Ok(())
    }
}

#[async_trait]
impl NetworkSettingsApplier for LinuxSettingsApplier {
    async fn apply(&self, settings: &NetworkSettings) -> Result<()> {
        info!(
            "Applying network settings to {} (remote {})",
            self.interface, settings.remote_address
        );

        // Stale addresses and routes from an earlier start
        let _ = self
            .run_command("ip", &["address", "flush", "dev", &self.interface])
            .await;

        self.set_mtu(settings.mtu).await?;

        for address in &settings.ipv4.addresses {
            let prefix = u32::from(address.subnet_mask).count_ones();
            let cidr = format!("{}/{}", address.address, prefix);
            self.run_command("ip", &["-4", "address", "add", &cidr, "dev", &self.interface])
                .await?;
        }
        for address in &settings.ipv6.addresses {
            let cidr = address.to_string();
            self.run_command("ip", &["-6", "address", "add", &cidr, "dev", &self.interface])
                .await?;
        }

        self.run_command("ip", &["link", "set", "dev", &self.interface, "up"])
            .await?;

        for route in &settings.ipv4.included_routes {
            let route = route.trunc().to_string();
            self.run_command("ip", &["-4", "route", "replace", &route, "dev", &self.interface])
                .await?;
        }
        for route in &settings.ipv6.included_routes {
            let route = route.trunc().to_string();
            self.run_command("ip", &["-6", "route", "replace", &route, "dev", &self.interface])
                .await?;
        }

        if let Some(dns) = &settings.dns {
            let servers: Vec<String> = dns.servers.iter().map(ToString::to_string).collect();
            self.configure_dns(&servers, &dns.search_domains).await?;
        }

        info!("Network settings applied to {}", self.interface);
        Ok(())
    }
}
