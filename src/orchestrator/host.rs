use async_trait::async_trait;
use mockall::automock;
use tokio::process::Command;
use tracing::debug;

use super::{Backend, Error};

/// Captured result of a one-shot host command.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl CmdOutput {
    pub fn ok(&self) -> bool {
        self.code == 0
    }
}

/// Seam for everything that touches the host: the reconciler only ever talks
/// to the datapath through `run`, so tests substitute a recording fake.
#[automock]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command`, capturing stdout/stderr/exit code. With `check` set, a
    /// non-zero exit becomes `Error::CommandFailed`; without it the caller
    /// inspects the captured output itself (probing).
    async fn run(&self, command: &str, check: bool) -> Result<CmdOutput, Error>;
}

/// The real thing: splits the command on whitespace and execs it.
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str, check: bool) -> Result<CmdOutput, Error> {
        debug!("running: {}", command);
        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or_else(|| Error::Spawn {
            command: command.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;

        let output = Command::new(program)
            .args(parts)
            .output()
            .await
            .map_err(|source| Error::Spawn {
                command: command.to_string(),
                source,
            })?;

        let out = CmdOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code().unwrap_or(-1),
        };

        if check && !out.ok() {
            return Err(Error::CommandFailed {
                command: command.to_string(),
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            });
        }

        Ok(out)
    }
}

/// Typed probes layered over the raw runner.
pub struct Host {
    runner: Box<dyn CommandRunner>,
}

impl Host {
    pub fn new() -> Self {
        Host {
            runner: Box::new(ShellRunner),
        }
    }

    pub fn with_runner(runner: Box<dyn CommandRunner>) -> Self {
        Host { runner }
    }

    pub async fn run(&self, command: &str, check: bool) -> Result<CmdOutput, Error> {
        self.runner.run(command, check).await
    }

    pub async fn link_exists(&self, name: &str) -> Result<bool, Error> {
        Ok(self.run(&format!("ip link show {name}"), false).await?.ok())
    }

    /// IPv4 `addr/prefix` entries currently configured on an interface.
    pub async fn iface_ipv4s(&self, iface: &str) -> Result<Vec<String>, Error> {
        let out = self.run(&format!("ip -o addr show {iface}"), false).await?;
        Ok(addrs_of(&out.stdout, "inet"))
    }

    /// IPv6 `addr/prefix` entries currently configured on an interface.
    pub async fn iface_ipv6s(&self, iface: &str) -> Result<Vec<String>, Error> {
        let out = self.run(&format!("ip -o addr show {iface}"), false).await?;
        Ok(addrs_of(&out.stdout, "inet6"))
    }

    pub async fn docker_exists(&self, container: &str) -> Result<bool, Error> {
        let out = self
            .run(&format!("docker ps -f name=^{container}$ -q"), false)
            .await?;
        let exists = !out.stdout.trim().is_empty();
        if !exists {
            debug!("container {} does not exist", container);
        }
        Ok(exists)
    }

    pub async fn docker_has_iface(&self, container: &str, iface: &str) -> Result<bool, Error> {
        Ok(self
            .run(&format!("docker exec {container} ip link show {iface}"), false)
            .await?
            .ok())
    }

    pub async fn lsmod_has(&self, module: &str) -> Result<bool, Error> {
        let out = self.run("lsmod", true).await?;
        Ok(out.stdout.contains(module))
    }

    /// Whether `iface` is currently a port of `bridge` in the given backend.
    pub async fn bridge_contains(
        &self,
        backend: Backend,
        bridge: &str,
        iface: &str,
    ) -> Result<bool, Error> {
        match backend {
            Backend::Ovs => {
                let out = self
                    .run(&format!("ovs-vsctl port-to-br {iface}"), false)
                    .await?;
                Ok(out.stdout.trim() == bridge)
            }
            Backend::Linux => {
                let out = self
                    .run(&format!("ip -o link show master {bridge}"), false)
                    .await?;
                Ok(out.stdout.contains(iface))
            }
        }
    }

    /// Resolve a `usb:<bus-id>` sentinel against /sys/class/net. Exactly one
    /// interface must sit on that bus.
    pub async fn resolve_usb(&self, bus: &str) -> Result<String, Error> {
        let out = self.run("ls -l /sys/class/net", false).await?;
        let matches: Vec<&str> = out
            .stdout
            .lines()
            .filter(|line| line.contains(bus))
            .collect();
        if matches.len() > 1 {
            return Err(Error::validation(format!(
                "identified more than one interface for USB bus: {bus}"
            )));
        }
        let Some(line) = matches.first() else {
            return Err(Error::validation(format!(
                "no network interface found for USB bus: {bus}"
            )));
        };
        // `ls -l` symlink lines carry the interface name in the ninth field
        line.split_whitespace()
            .nth(8)
            .map(str::to_string)
            .ok_or_else(|| Error::validation(format!("unparseable /sys/class/net entry for bus {bus}")))
    }
}

fn addrs_of(output: &str, key: &str) -> Vec<String> {
    let mut found = Vec::new();
    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == key {
                if let Some(addr) = tokens.next() {
                    found.push(addr.to_string());
                }
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testing::scripted_host;

    const ADDR_SHOW: &str = "\
2: br0    inet 10.1.0.1/24 brd 10.1.0.255 scope global br0\\       valid_lft forever preferred_lft forever
2: br0    inet6 fe80::42:acff:fe11:2/64 scope link \\       valid_lft forever preferred_lft forever";

    #[tokio::test]
    async fn parses_interface_addresses_per_family() {
        let (runner, host) = scripted_host();
        runner.respond("ip -o addr show br0", 0, ADDR_SHOW);

        assert_eq!(host.iface_ipv4s("br0").await.unwrap(), vec!["10.1.0.1/24"]);
        assert_eq!(
            host.iface_ipv6s("br0").await.unwrap(),
            vec!["fe80::42:acff:fe11:2/64"]
        );
    }

    #[tokio::test]
    async fn missing_link_yields_no_addresses() {
        let (runner, host) = scripted_host();
        runner.respond("ip -o addr show nope", 1, "");

        assert!(host.iface_ipv4s("nope").await.unwrap().is_empty());
        assert!(!host.link_exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn docker_exists_checks_ps_output() {
        let (runner, host) = scripted_host();
        runner.respond("docker ps -f name=^c1$ -q", 0, "f00dbabe\n");
        runner.respond("docker ps -f name=^c2$ -q", 0, "");

        assert!(host.docker_exists("c1").await.unwrap());
        assert!(!host.docker_exists("c2").await.unwrap());
    }

    #[tokio::test]
    async fn resolves_usb_bus_to_single_interface() {
        let (runner, host) = scripted_host();
        runner.respond(
            "ls -l /sys/class/net",
            0,
            "total 0\n\
             lrwxrwxrwx 1 root root 0 Jan 1 00:00 enx9cebe8 -> ../../devices/pci0000:00/usb1/1-1/net/enx9cebe8\n\
             lrwxrwxrwx 1 root root 0 Jan 1 00:00 eth0 -> ../../devices/pci0000:00/0000:00:1f.6/net/eth0",
        );

        assert_eq!(host.resolve_usb("1-1").await.unwrap(), "enx9cebe8");
    }

    #[tokio::test]
    async fn rejects_ambiguous_or_missing_usb_bus() {
        let (runner, host) = scripted_host();
        runner.respond(
            "ls -l /sys/class/net",
            0,
            "lrwxrwxrwx 1 root root 0 Jan 1 00:00 enxa -> ../1-1/net/enxa\n\
             lrwxrwxrwx 1 root root 0 Jan 1 00:00 enxb -> ../1-1.2/net/enxb",
        );

        assert!(matches!(
            host.resolve_usb("1-1").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            host.resolve_usb("3-4").await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn checked_run_surfaces_command_failure() {
        let (runner, host) = scripted_host();
        runner.respond("brctl addbr br0", 1, "");

        let err = host.run("brctl addbr br0", true).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { code: 1, .. }));
        // unchecked probing of the same failure just reports the exit code
        assert!(!host.run("brctl addbr br0", false).await.unwrap().ok());
    }

    #[tokio::test]
    async fn host_delegates_to_the_runner_seam() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .withf(|command, check| command == "ovs-vsctl br-exists br0" && !check)
            .returning(|_, _| {
                Ok(CmdOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    code: 2,
                })
            });

        let host = Host::with_runner(Box::new(mock));
        let out = host.run("ovs-vsctl br-exists br0", false).await.unwrap();
        assert_eq!(out.code, 2);
    }
}
