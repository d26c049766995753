use std::process::{Command, Output};

/// Opaque handle to the emulated link a scenario shapes.
///
/// Names the client-side interface (e.g. `c1-eth0`) and, optionally, the
/// network namespace it lives in. Built by whoever owns the topology and
/// handed to the shaper and the cross-traffic generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkHandle {
    pub interface: String,
    pub namespace: Option<String>,
}

impl LinkHandle {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            namespace: None,
        }
    }

    pub fn in_namespace(interface: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Program and arguments that run `cmd` on the link's side of the
    /// topology (inside the namespace when there is one).
    pub fn argv(&self, cmd: &str, args: &[&str]) -> Vec<String> {
        let mut argv: Vec<String> = match &self.namespace {
            Some(ns) => ["sudo", "ip", "netns", "exec", ns.as_str(), cmd]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            None => vec![cmd.to_string()],
        };
        argv.extend(args.iter().map(|s| s.to_string()));
        argv
    }

    pub fn exec(&self, cmd: &str, args: &[&str]) -> std::io::Result<Output> {
        let argv = self.argv(cmd, args);
        Command::new(&argv[0]).args(&argv[1..]).output()
    }

    /// Async command for long-running helpers such as `iperf3`.
    pub fn command(&self, cmd: &str, args: &[String]) -> tokio::process::Command {
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let argv = self.argv(cmd, &refs);
        let mut command = tokio::process::Command::new(&argv[0]);
        command.args(&argv[1..]);
        command
    }
}

/// A Linux network namespace managed via `ip netns`.
///
/// Creates the namespace on construction, initializes loopback, and
/// deletes the namespace on drop. Only the privileged tests build one; a
/// real testbed hands the harness a [`LinkHandle`] instead.
pub struct Namespace {
    pub name: String,
}

impl Namespace {
    pub fn new(name: &str) -> Result<Self, std::io::Error> {
        let _ = Command::new("sudo")
            .args(["ip", "netns", "del", name])
            .output();

        let output = Command::new("sudo")
            .args(["ip", "netns", "add", name])
            .output()?;

        if !output.status.success() {
            return Err(std::io::Error::other(format!(
                "Failed to create netns: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let _ = Command::new("sudo")
            .args(["ip", "netns", "exec", name, "ip", "link", "set", "lo", "up"])
            .output();

        Ok(Self {
            name: name.to_string(),
        })
    }

    pub fn exec(&self, cmd: &str, args: &[&str]) -> Result<Output, std::io::Error> {
        Command::new("sudo")
            .args(["ip", "netns", "exec", &self.name, cmd])
            .args(args)
            .output()
    }

    pub fn link(&self, interface: &str) -> LinkHandle {
        LinkHandle::in_namespace(interface, self.name.clone())
    }

    /// Create a veth pair between two namespaces and bring both ends up.
    pub fn add_veth_link(
        &self,
        other: &Namespace,
        veth_name_local: &str,
        veth_name_peer: &str,
        ip_local: &str,
        ip_peer: &str,
    ) -> std::io::Result<()> {
        let _ = Command::new("sudo")
            .args(["ip", "link", "del", veth_name_local])
            .output();

        run_checked(
            Command::new("sudo").args([
                "ip",
                "link",
                "add",
                veth_name_local,
                "type",
                "veth",
                "peer",
                "name",
                veth_name_peer,
            ]),
            "create veth pair",
        )?;
        run_checked(
            Command::new("sudo").args(["ip", "link", "set", veth_name_local, "netns", &self.name]),
            "move local veth",
        )?;
        run_checked(
            Command::new("sudo").args(["ip", "link", "set", veth_name_peer, "netns", &other.name]),
            "move peer veth",
        )?;

        for (ns, veth, ip) in [
            (self, veth_name_local, ip_local),
            (other, veth_name_peer, ip_peer),
        ] {
            check_output(ns.exec("ip", &["addr", "add", ip, "dev", veth])?, "set IP")?;
            check_output(ns.exec("ip", &["link", "set", veth, "up"])?, "set link up")?;
        }
        Ok(())
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        let _ = Command::new("sudo")
            .args(["ip", "netns", "del", &self.name])
            .status();
    }
}

fn run_checked(cmd: &mut Command, what: &str) -> std::io::Result<()> {
    check_output(cmd.output()?, what)
}

fn check_output(output: Output, what: &str) -> std::io::Result<()> {
    if output.status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!(
            "Failed to {what}: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}
