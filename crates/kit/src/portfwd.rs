//! Host port allocation and NAT forwarding rules.
//!
//! A port is claimed by binding a loopback listener and dropping it right
//! away, so it is only known to be free at that instant. Allocations made
//! through this process are serialized; other processes can still race us.

use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;
use std::sync::Mutex;

use rand::Rng;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::hostexec::Runner;
use crate::types::{NicType, PortForwardRule, VmDescriptor};
use crate::validate;
use crate::vm::VirtualBox;

/// Held from probing a port until its rule is installed.
static ALLOCATION_LOCK: Mutex<()> = Mutex::new(());

/// Find a loopback TCP port in `range` that can currently be bound.
///
/// Port 0 is rejected: binding it asks the kernel for any port, which is
/// not a port a forwarding rule can name.
///
/// Scanning starts at a random port and wraps around, so concurrent callers
/// are unlikely to probe in lockstep.
pub fn probe_free_port(range: RangeInclusive<u16>) -> Result<u16> {
    let (min, max) = (*range.start(), *range.end());
    if min == 0 {
        return Err(Error::InvalidArgument {
            field: "port range",
            value: format!("{min}-{max}"),
            reason: "must not include port 0",
        });
    }
    if min > max {
        return Err(Error::PortsExhausted { min, max });
    }
    let span = u32::from(max - min) + 1;
    let offset = rand::rng().random_range(0..span);
    for i in 0..span {
        let port = min + ((offset + i) % span) as u16;
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
            Ok(listener) => {
                drop(listener);
                debug!("Probed free port {port}");
                return Ok(port);
            }
            Err(e) => debug!("Port {port} unavailable: {e}"),
        }
    }
    Err(Error::PortsExhausted { min, max })
}

impl<R: Runner> VirtualBox<R> {
    /// Forward a free host loopback port to `guest_port` on `vm`.
    ///
    /// Interface 1 is switched to NAT, overwriting whatever attachment it
    /// had. An existing rule with the configured name is replaced.
    #[instrument(skip(self))]
    pub fn forward_port(&self, vm: &str, guest_port: u16) -> Result<VmDescriptor> {
        validate::vm_ref("VM", vm)?;
        validate::record_field("rule name", &self.config.rule_name)?;

        let _guard = ALLOCATION_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let current = self.get_info(vm)?;
        let host_port = probe_free_port(self.config.port_range.clone())?;
        let rule = PortForwardRule {
            name: self.config.rule_name.clone(),
            host_port,
            guest_port,
        };

        self.vboxmanage([
            "modifyvm".to_owned(),
            vm.to_owned(),
            "--nic1".to_owned(),
            NicType::Nat.to_string(),
        ])?;
        if current.ssh_port.is_some() {
            debug!("Replacing existing rule {}", rule.name);
            self.vboxmanage(["modifyvm", vm, "--natpf1", "delete", rule.name.as_str()])?;
        }
        self.vboxmanage([
            "modifyvm".to_owned(),
            vm.to_owned(),
            "--natpf1".to_owned(),
            rule.to_natpf(),
        ])?;
        info!("Forwarding 127.0.0.1:{host_port} to guest port {guest_port}");

        self.get_info(vm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VBoxConfig;
    use crate::hostexec::testutil::FakeRunner;
    use crate::hostexec::CommandOutput;
    use crate::vm::tests::{dump, UUID};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn free_port() -> u16 {
        let l = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        l.local_addr().unwrap().port()
    }

    #[test]
    fn test_probe_within_range() {
        for _ in 0..20 {
            let port = probe_free_port(7000..=8000).unwrap();
            assert!((7000..=8000).contains(&port));
        }
    }

    #[test]
    fn test_probe_rejects_port_zero() {
        for range in [0..=0, 0..=10] {
            let err = probe_free_port(range).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument { .. }), "{err}");
        }
    }

    #[test]
    fn test_probe_single_port_range() {
        let port = free_port();
        assert_eq!(probe_free_port(port..=port).unwrap(), port);
        // The probe does not hold the port; asking again yields it again.
        assert_eq!(probe_free_port(port..=port).unwrap(), port);
    }

    #[test]
    fn test_probe_exhausted() {
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        let err = probe_free_port(port..=port).unwrap_err();
        assert!(
            matches!(err, Error::PortsExhausted { min, max } if min == port && max == port),
            "{err}"
        );
    }

    #[test]
    fn test_probe_empty_range() {
        #[allow(clippy::reversed_empty_ranges)]
        let err = probe_free_port(8000..=7000).unwrap_err();
        assert!(matches!(err, Error::PortsExhausted { .. }));
    }

    /// A fake VBoxManage that remembers the installed rule.
    fn stateful_runner() -> FakeRunner {
        let rule: Rc<RefCell<Option<String>>> = Rc::default();
        FakeRunner::new(move |argv| match argv[1].as_str() {
            "showvminfo" => {
                let mut out = dump("poweroff");
                if let Some(r) = rule.borrow().as_ref() {
                    out.push_str(&format!("Forwarding(0)=\"{r}\"\n"));
                }
                CommandOutput::ok(out)
            }
            "modifyvm" if argv[3] == "--natpf1" => {
                if argv[4] == "delete" {
                    *rule.borrow_mut() = None;
                } else if rule.borrow().is_some() {
                    return CommandOutput::failed(
                        "VBoxManage: error: A NAT rule of this name already exists\n",
                    );
                } else {
                    *rule.borrow_mut() = Some(argv[4].clone());
                }
                CommandOutput::ok("")
            }
            _ => CommandOutput::ok(""),
        })
    }

    #[test]
    fn test_forward_port_installs_rule() {
        let port = free_port();
        let config = VBoxConfig::default().with_port_range(port..=port);
        let vbox = VirtualBox::with_runner(config, stateful_runner());
        let vm = vbox.forward_port(UUID, 22).unwrap();
        assert_eq!(vm.ssh_port, Some(port));
        let calls = vbox.runner.calls();
        assert_eq!(calls[1], ["VBoxManage", "modifyvm", UUID, "--nic1", "nat"]);
        assert_eq!(
            calls[2],
            [
                "VBoxManage".to_owned(),
                "modifyvm".to_owned(),
                UUID.to_owned(),
                "--natpf1".to_owned(),
                format!("vboxkit_ssh_port_rule,tcp,127.0.0.1,{port},,22"),
            ]
        );
    }

    #[test]
    fn test_forward_port_replaces_rule() {
        let port = free_port();
        let config = VBoxConfig::default().with_port_range(port..=port);
        let vbox = VirtualBox::with_runner(config, stateful_runner());
        vbox.forward_port(UUID, 22).unwrap();
        let vm = vbox.forward_port(UUID, 2222).unwrap();
        assert_eq!(vm.ssh_port, Some(port));
        assert!(vbox
            .runner
            .calls()
            .iter()
            .any(|c| c[3..] == ["--natpf1", "delete", "vboxkit_ssh_port_rule"]));
    }

    #[test]
    fn test_forward_port_exhausted_runs_no_modifyvm() {
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        let config = VBoxConfig::default().with_port_range(port..=port);
        let vbox = VirtualBox::with_runner(config, stateful_runner());
        let err = vbox.forward_port(UUID, 22).unwrap_err();
        assert!(matches!(err, Error::PortsExhausted { .. }), "{err}");
        assert_eq!(vbox.runner.subcommands(), ["showvminfo"]);
    }
}
