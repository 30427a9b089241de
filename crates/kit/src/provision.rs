//! Create, wire up and boot a VM in one go.
//!
//! Each step runs in order; the first failure stops the sequence and the
//! VM is destroyed again. A destroy that also fails is recorded next to the
//! original failure instead of hiding it.

use camino::Utf8PathBuf;
use tracing::{debug, info, instrument, warn};

use crate::error::{Diagnostics, Error, InjectStage};
use crate::hostexec::Runner;
use crate::types::{BootMode, CreateRequest, VmDescriptor};
use crate::vm::VirtualBox;

/// Default guest account that receives the injected key.
pub const DEFAULT_SSH_USER: &str = "root";

/// SSH access to set up before first boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshAccess {
    /// Guest account.
    pub user: String,
    /// Public key file on the host.
    pub public_key: Utf8PathBuf,
}

/// Everything needed to bring up a new VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// Import parameters.
    pub create: CreateRequest,
    /// When set, forward a host port to guest SSH and inject the key.
    pub ssh: Option<SshAccess>,
    /// How to start the VM.
    pub boot_mode: BootMode,
}

impl<R: Runner> VirtualBox<R> {
    /// Create, optionally set up SSH, and start a VM.
    ///
    /// On failure the VM is destroyed by name, disks included; the returned
    /// diagnostics list the failed step and, if it also failed, the destroy.
    /// A name that is already registered is refused before importing, so
    /// the rollback can never take an existing VM with it.
    #[instrument(skip_all, fields(name = %req.create.name))]
    pub fn provision(&self, req: &ProvisionRequest) -> Result<VmDescriptor, Diagnostics> {
        let name = req.create.name.as_str();

        if let Ok(existing) = self.get_info(name) {
            let mut diags = Diagnostics::default();
            diags.push(
                "Error creating VM",
                Error::InvalidArgument {
                    field: "VM name",
                    value: name.to_owned(),
                    reason: "a VM with this name is already registered",
                },
            );
            debug!("Refusing to provision over {}", existing.handle());
            return Err(diags);
        }

        let vm = self
            .create(&req.create)
            .map_err(|e| self.rollback(name, "Error creating VM", e))?;

        if let Some(ssh) = &req.ssh {
            self.forward_port(&vm.id, self.config.guest_ssh_port)
                .map_err(|e| self.rollback(name, "Error forwarding local port", e))?;
            match self.inject_ssh_key(&vm.id, &ssh.user, &ssh.public_key) {
                Ok(()) => {}
                // The image was already written back; only a stray scratch
                // file is left over.
                Err(e @ Error::Inject {
                    stage: InjectStage::RemoveScratch,
                    ..
                }) => warn!("{e}"),
                Err(e) => return Err(self.rollback(name, "Error injecting SSH key", e)),
            }
        }

        let vm = self
            .start(&vm.id, req.boot_mode)
            .map_err(|e| self.rollback(name, "Error starting VM", e))?;
        info!("Provisioned {} ({})", vm.name, vm.id);
        Ok(vm)
    }

    /// Best-effort destroy after `error` happened during `step`.
    fn rollback(&self, vm: &str, step: &str, error: Error) -> Diagnostics {
        let mut diags = Diagnostics::default();
        warn!("{step}: {error}; destroying {vm}");
        diags.push(step, error);
        if let Err(e) = self.destroy(vm) {
            warn!("Rollback of {vm} failed: {e}");
            diags.push("Error destroying VM", e);
        }
        diags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VBoxConfig;
    use crate::hostexec::testutil::FakeRunner;
    use crate::hostexec::CommandOutput;
    use crate::vm::tests::{dump, UUID};
    use std::cell::Cell;
    use std::net::{Ipv4Addr, TcpListener};

    fn request(ssh: Option<SshAccess>) -> ProvisionRequest {
        ProvisionRequest {
            create: CreateRequest {
                image: "base.ova".into(),
                name: "vm1".into(),
                memory_mb: 2048,
                cpus: 2,
            },
            ssh,
            boot_mode: BootMode::Headless,
        }
    }

    /// A host where `vm1` is unknown until `import` has run; after that,
    /// commands are answered by `handler`.
    fn fresh_host(handler: impl Fn(&[String]) -> CommandOutput + 'static) -> FakeRunner {
        let imported = Cell::new(false);
        FakeRunner::new(move |argv| {
            if argv[1] == "import" {
                imported.set(true);
            }
            if argv[1] == "showvminfo" && !imported.get() {
                return CommandOutput::failed(format!(
                    "VBoxManage: error: Could not find a registered machine named '{}'\n",
                    argv[2]
                ));
            }
            handler(argv)
        })
    }

    #[test]
    fn test_provision_without_ssh() {
        let vbox = VirtualBox::with_runner(
            VBoxConfig::default(),
            fresh_host(|argv| match argv[1].as_str() {
                "showvminfo" => CommandOutput::ok(dump("running")),
                _ => CommandOutput::ok(""),
            }),
        );
        let vm = vbox.provision(&request(None)).unwrap();
        assert!(vm.is_running());
        assert_eq!(vm.ipv4, None);
        assert_eq!(
            vbox.runner.subcommands(),
            [
                "showvminfo",
                "import",
                "modifyvm",
                "showvminfo",
                "guestproperty",
                "startvm",
                "showvminfo",
                "guestproperty"
            ]
        );
        assert_eq!(vbox.runner.calls()[5][2], UUID);
    }

    #[test]
    fn test_existing_name_is_refused_without_rollback() {
        let vbox = VirtualBox::with_runner(
            VBoxConfig::default(),
            FakeRunner::new(|argv| match argv[1].as_str() {
                "showvminfo" => CommandOutput::ok(dump("poweroff")),
                _ => CommandOutput::ok(""),
            }),
        );
        let diags = vbox.provision(&request(None)).unwrap_err();
        assert_eq!(diags.entries().len(), 1);
        assert!(
            matches!(diags.entries()[0].error, Error::InvalidArgument { .. }),
            "{diags}"
        );
        assert_eq!(vbox.runner.subcommands(), ["showvminfo"]);
    }

    #[test]
    fn test_create_failure_rolls_back_by_name() {
        let vbox = VirtualBox::with_runner(
            VBoxConfig::default(),
            fresh_host(|argv| match argv[1].as_str() {
                "import" => CommandOutput::failed("VBoxManage: error: Appliance read failed\n"),
                _ => CommandOutput::ok(""),
            }),
        );
        let diags = vbox.provision(&request(None)).unwrap_err();
        assert_eq!(diags.entries().len(), 1);
        assert_eq!(diags.entries()[0].summary, "Error creating VM");
        assert_eq!(
            vbox.runner.calls()[2],
            ["VBoxManage", "unregistervm", "vm1", "--delete", "--delete-all"]
        );
    }

    #[test]
    fn test_failed_rollback_is_reported_separately() {
        let vbox = VirtualBox::with_runner(
            VBoxConfig::default(),
            fresh_host(|argv| match argv[1].as_str() {
                "import" => CommandOutput::failed("import exploded\n"),
                "unregistervm" => CommandOutput::failed("VBoxManage: error: Could not find a registered machine named 'vm1'\n"),
                _ => CommandOutput::ok(""),
            }),
        );
        let diags = vbox.provision(&request(None)).unwrap_err();
        let summaries: Vec<_> = diags.entries().iter().map(|d| d.summary.as_str()).collect();
        assert_eq!(summaries, ["Error creating VM", "Error destroying VM"]);
        let text = diags.to_string();
        assert!(text.contains("import exploded"), "{text}");
        assert!(text.contains("Could not find a registered machine"), "{text}");
    }

    #[test]
    fn test_forward_failure_destroys_vm() {
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        let vbox = VirtualBox::with_runner(
            VBoxConfig::default().with_port_range(port..=port),
            fresh_host(|argv| match argv[1].as_str() {
                "showvminfo" => CommandOutput::ok(dump("poweroff")),
                _ => CommandOutput::ok(""),
            }),
        );
        let diags = vbox
            .provision(&request(Some(SshAccess {
                user: DEFAULT_SSH_USER.into(),
                public_key: "/home/me/.ssh/id_ed25519.pub".into(),
            })))
            .unwrap_err();
        assert_eq!(diags.entries().len(), 1);
        assert!(matches!(
            diags.entries()[0].error,
            Error::PortsExhausted { .. }
        ));
        let subcommands = vbox.runner.subcommands();
        assert_eq!(subcommands.last().map(String::as_str), Some("unregistervm"));
        assert!(!subcommands.iter().any(|s| s == "startvm"));
    }

    #[test]
    fn test_stray_scratch_file_does_not_roll_back() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let image = root.join("disk.vmdk");
        std::fs::write(&image, "disk").unwrap();
        let key = root.join("id_ed25519.pub");
        std::fs::write(&key, "ssh-ed25519 AAAA test@host\n").unwrap();
        let port = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let started = Cell::new(false);
        let disk = image.clone();
        let vbox = VirtualBox::with_runner(
            VBoxConfig::default()
                .with_port_range(port..=port)
                .with_scratch_dir(root.clone()),
            fresh_host(move |argv| match argv[1].as_str() {
                "showvminfo" => {
                    let state = if started.get() { "running" } else { "poweroff" };
                    CommandOutput::ok(format!(
                        "name=\"vm1\"\nUUID=\"{UUID}\"\nVMState=\"{state}\"\n\"SATA Controller-0-0\"=\"{disk}\"\n"
                    ))
                }
                "startvm" => {
                    started.set(true);
                    CommandOutput::ok("")
                }
                // The customize tool edits the scratch copy and then
                // deletes it, so removing it afterwards fails.
                "-a" => {
                    let mut content = std::fs::read_to_string(&argv[2]).unwrap();
                    content.push_str("+key");
                    std::fs::write(&argv[2], content).unwrap();
                    std::fs::remove_file(&argv[2]).unwrap();
                    CommandOutput::ok("")
                }
                _ => CommandOutput::ok(""),
            }),
        );
        let vm = vbox
            .provision(&request(Some(SshAccess {
                user: DEFAULT_SSH_USER.into(),
                public_key: key,
            })))
            .unwrap();
        assert!(vm.is_running());
        assert_eq!(std::fs::read_to_string(&image).unwrap(), "disk+key");
        assert!(!vbox.runner.subcommands().iter().any(|s| s == "unregistervm"));
    }
}
