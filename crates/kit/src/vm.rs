//! VM lifecycle operations over VBoxManage.
//!
//! Every mutating operation finishes by re-reading the VM with
//! `showvminfo`, so callers always get the descriptor VirtualBox reports
//! after the change rather than one assembled from the request.

use std::ffi::OsString;
use std::net::Ipv4Addr;

use tracing::{debug, info, instrument};

use crate::config::VBoxConfig;
use crate::error::{Error, Result};
use crate::hostexec::{ProcessRunner, Runner};
use crate::machinereadable::{self, DumpKeys};
use crate::types::{BootMode, CreateRequest, NicSpec, NicType, VmDescriptor};
use crate::validate;

/// Guest property the guest additions publish the first adapter's address under.
pub const GUEST_IPV4_PROPERTY: &str = "/VirtualBox/GuestInfo/Net/0/V4/IP";

/// Controller for VMs of one VirtualBox installation.
#[derive(Debug)]
pub struct VirtualBox<R = ProcessRunner> {
    pub(crate) config: VBoxConfig,
    pub(crate) runner: R,
}

impl VirtualBox<ProcessRunner> {
    /// A controller that runs the configured tools as child processes.
    pub fn new(config: VBoxConfig) -> Self {
        let runner = ProcessRunner::new(config.command_timeout);
        Self { config, runner }
    }
}

impl<R: Runner> VirtualBox<R> {
    /// A controller that dispatches commands through `runner`.
    pub fn with_runner(config: VBoxConfig, runner: R) -> Self {
        Self { config, runner }
    }

    /// The active configuration.
    pub fn config(&self) -> &VBoxConfig {
        &self.config
    }

    /// Run a tool and return its stdout, turning a non-zero exit into
    /// [`Error::Tool`] carrying its stderr.
    pub(crate) fn exec<I, S>(&self, program: &OsString, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        let out = self.runner.run(program, &args)?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(Error::Tool {
                program: program.to_string_lossy().into_owned(),
                subcommand: args
                    .first()
                    .map(|a| a.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                stderr: out.stderr,
            })
        }
    }

    pub(crate) fn vboxmanage<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.exec(&self.config.vboxmanage, args)
    }

    /// Import an appliance as a new VM.
    ///
    /// On failure nothing is rolled back here; see [`VirtualBox::provision`]
    /// for a flow that destroys the partial VM.
    #[instrument(skip(self), fields(name = %req.name))]
    pub fn create(&self, req: &CreateRequest) -> Result<VmDescriptor> {
        validate::vm_ref("image", &req.image)?;
        validate::vm_ref("VM name", &req.name)?;
        info!("Importing {} as '{}'", req.image, req.name);
        self.vboxmanage([
            "import".to_owned(),
            req.image.clone(),
            "--vsys=0".to_owned(),
            format!("--vmname={}", req.name),
            format!("--memory={}", req.memory_mb),
            format!("--cpus={}", req.cpus),
        ])?;
        if self.config.nat_localhost_reachable {
            self.vboxmanage([
                "modifyvm",
                req.name.as_str(),
                "--nat-localhostreachable1",
                "on",
            ])?;
        }
        self.get_info(&req.name)
    }

    /// Reconfigure network interface 1.
    ///
    /// The attachment flag is only passed for types that have one; an
    /// attachment given for NAT is ignored.
    #[instrument(skip(self, vm), fields(vm = %vm.handle()))]
    pub fn modify_nic(&self, vm: &VmDescriptor, nic: &NicSpec) -> Result<VmDescriptor> {
        let handle = vm.handle();
        validate::vm_ref("VM", handle)?;
        let mut args: Vec<String> = vec![
            "modifyvm".into(),
            handle.into(),
            "--nic1".into(),
            nic.kind.to_string(),
        ];
        match (nic.kind.attachment_flag(), nic.attachment.as_deref()) {
            (Some(flag), Some(attachment)) => {
                validate::record_field("interface attachment", attachment)?;
                args.push(flag.into());
                args.push(attachment.into());
            }
            (None, Some(attachment)) => {
                debug!("Ignoring attachment '{attachment}' for {} interface", nic.kind);
            }
            (_, None) => {
                if nic.kind == NicType::Bridged {
                    debug!("No host interface given; keeping the current bridge adapter");
                }
            }
        }
        self.vboxmanage(args)?;
        self.get_info(handle)
    }

    /// Power on a VM.
    ///
    /// This returns as soon as VBoxManage does; the guest may not have
    /// reported an address yet.
    #[instrument(skip(self))]
    pub fn start(&self, vm: &str, mode: BootMode) -> Result<VmDescriptor> {
        validate::vm_ref("VM", vm)?;
        info!("Starting {vm} ({mode})");
        self.vboxmanage(["startvm".to_owned(), vm.to_owned(), format!("--type={mode}")])?;
        self.get_info(vm)
    }

    /// Hard power-off, equivalent to pulling the plug.
    #[instrument(skip(self))]
    pub fn stop(&self, vm: &str) -> Result<VmDescriptor> {
        validate::vm_ref("VM", vm)?;
        info!("Powering off {vm}");
        self.vboxmanage(["controlvm", vm, "poweroff"])?;
        self.get_info(vm)
    }

    /// Unregister a VM and delete all of its files. Irreversible.
    #[instrument(skip(self))]
    pub fn destroy(&self, vm: &str) -> Result<()> {
        validate::vm_ref("VM", vm)?;
        info!("Destroying {vm}");
        self.vboxmanage(["unregistervm", vm, "--delete", "--delete-all"])?;
        Ok(())
    }

    /// Read the current state of a VM.
    ///
    /// For a running VM the guest address is looked up too; failing to get
    /// one just leaves `ipv4` empty.
    #[instrument(skip(self))]
    pub fn get_info(&self, vm: &str) -> Result<VmDescriptor> {
        validate::vm_ref("VM", vm)?;
        let dump = self.vboxmanage(["showvminfo", vm, "--machinereadable"])?;
        let mut desc = machinereadable::parse_vm_info(
            &dump,
            DumpKeys {
                disk_slot: &self.config.disk_slot,
                rule_name: &self.config.rule_name,
            },
        )?;
        if desc.is_running() {
            desc.ipv4 = match self.guest_ip(&desc) {
                Ok(ip) => ip,
                Err(e) => {
                    debug!("Guest address of {vm} not known yet: {e}");
                    None
                }
            };
        }
        Ok(desc)
    }

    /// Ask the guest property store for the first adapter's IPv4 address.
    ///
    /// `Ok(None)` means the guest has not reported one (yet).
    pub fn guest_ip(&self, vm: &VmDescriptor) -> Result<Option<Ipv4Addr>> {
        let out = self.vboxmanage([
            "guestproperty",
            "enumerate",
            vm.handle(),
            GUEST_IPV4_PROPERTY,
        ])?;
        let Some(prop) = machinereadable::find_guest_property(&out, GUEST_IPV4_PROPERTY)? else {
            return Ok(None);
        };
        prop.value
            .parse::<Ipv4Addr>()
            .map(Some)
            .map_err(|_| Error::MalformedOutput {
                what: "guestproperty",
                detail: format!("'{}' is not an IPv4 address", prop.value),
            })
    }
}
