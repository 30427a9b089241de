//! Subcommand options and their implementations.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use comfy_table::Table;
use indicatif::ProgressBar;
use tracing::debug;

use vboxkit::config::{
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_CUSTOMIZE_TOOL, DEFAULT_DISK_SLOT, DEFAULT_GUEST_SSH_PORT,
    DEFAULT_PORT_MAX, DEFAULT_PORT_MIN, DEFAULT_RULE_NAME, DEFAULT_VBOXMANAGE,
};
use vboxkit::provision::DEFAULT_SSH_USER;
use vboxkit::{
    BootMode, CreateRequest, NicSpec, NicType, ProvisionRequest, SshAccess, VBoxConfig,
    VirtualBox, VmDescriptor,
};

use crate::utils;

/// Options shared by every subcommand.
#[derive(Debug, clap::Args)]
pub(crate) struct GlobalOpts {
    /// VBoxManage binary
    #[clap(long, global = true, env = "VBOXKIT_VBOXMANAGE", default_value = DEFAULT_VBOXMANAGE)]
    vboxmanage: String,

    /// Guest customization tool used for SSH key injection
    #[clap(long, global = true, env = "VBOXKIT_CUSTOMIZE_TOOL", default_value = DEFAULT_CUSTOMIZE_TOOL)]
    customize_tool: String,

    /// Lowest host port handed out for forwarding
    #[clap(long, global = true, env = "VBOXKIT_PORT_MIN", default_value_t = DEFAULT_PORT_MIN)]
    port_min: u16,

    /// Highest host port handed out for forwarding
    #[clap(long, global = true, env = "VBOXKIT_PORT_MAX", default_value_t = DEFAULT_PORT_MAX)]
    port_max: u16,

    /// Name of the NAT rule used for SSH forwarding
    #[clap(long, global = true, env = "VBOXKIT_RULE_NAME", default_value = DEFAULT_RULE_NAME)]
    rule_name: String,

    /// showvminfo controller slot holding the primary disk
    #[clap(long, global = true, env = "VBOXKIT_DISK_SLOT", default_value = DEFAULT_DISK_SLOT)]
    disk_slot: String,

    /// Directory for scratch copies of disk images (must not contain spaces)
    #[clap(long, global = true, env = "VBOXKIT_SCRATCH_DIR")]
    scratch_dir: Option<Utf8PathBuf>,

    /// Kill external commands after this many seconds (0 disables)
    #[clap(long, global = true, env = "VBOXKIT_TIMEOUT", default_value_t = DEFAULT_COMMAND_TIMEOUT.as_secs())]
    timeout: u64,

    /// Don't let the guest reach host loopback services through NAT
    #[clap(long, global = true)]
    no_nat_localhost: bool,
}

impl GlobalOpts {
    pub(crate) fn to_config(&self) -> VBoxConfig {
        let timeout = (self.timeout > 0).then(|| Duration::from_secs(self.timeout));
        let mut config = VBoxConfig::default()
            .with_vboxmanage(&self.vboxmanage)
            .with_customize_tool(&self.customize_tool)
            .with_port_range(self.port_min..=self.port_max)
            .with_rule_name(&self.rule_name)
            .with_disk_slot(&self.disk_slot)
            .with_command_timeout(timeout);
        if let Some(dir) = &self.scratch_dir {
            config = config.with_scratch_dir(dir.clone());
        }
        config.nat_localhost_reachable = !self.no_nat_localhost;
        config
    }
}

/// Output format selection.
#[derive(Debug, clap::Args)]
pub(crate) struct OutputOpts {
    /// Print the VM as JSON
    #[clap(long)]
    json: bool,
}

impl OutputOpts {
    fn print(&self, vm: &VmDescriptor) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(vm)?);
        } else {
            println!("{}", descriptor_table(vm));
        }
        Ok(())
    }
}

fn descriptor_table(vm: &VmDescriptor) -> Table {
    fn opt<T: ToString>(v: &Option<T>) -> String {
        v.as_ref().map(ToString::to_string).unwrap_or_default()
    }
    let mut table = Table::new();
    table.set_header(vec!["PROPERTY", "VALUE"]);
    for (k, v) in [
        ("id", vm.id.clone()),
        ("name", vm.name.clone()),
        ("state", opt(&vm.state)),
        ("disk", opt(&vm.disk_path)),
        ("ipv4", opt(&vm.ipv4)),
        ("ssh port", opt(&vm.ssh_port)),
        ("memory (MiB)", opt(&vm.memory_mb)),
        ("cpus", opt(&vm.cpus)),
        ("nic1", opt(&vm.nic1)),
    ] {
        table.add_row(vec![k.to_owned(), v]);
    }
    table
}

fn parse_memory(s: &str) -> Result<u64> {
    utils::parse_memory_to_mb(s)
}

/// Parameters common to `create` and `provision`.
#[derive(Debug, Parser)]
pub(crate) struct ImportOpts {
    /// Path or URL of the appliance (.ova/.ovf) to import
    image: String,

    /// Name for the new VM
    #[clap(long)]
    name: String,

    /// Memory for the VM (e.g. 2048, 2G, 512M)
    #[clap(long, default_value = "1G", value_parser = parse_memory)]
    memory: u64,

    /// Number of virtual CPUs
    #[clap(long, default_value_t = 1)]
    cpus: u32,
}

impl ImportOpts {
    fn to_request(&self) -> CreateRequest {
        CreateRequest {
            image: self.image.clone(),
            name: self.name.clone(),
            memory_mb: self.memory,
            cpus: self.cpus,
        }
    }
}

#[derive(Debug, Parser)]
pub(crate) struct CreateOpts {
    #[clap(flatten)]
    import: ImportOpts,

    #[clap(flatten)]
    output: OutputOpts,
}

impl CreateOpts {
    pub(crate) fn run(self, vbox: &VirtualBox) -> Result<()> {
        let vm = vbox
            .create(&self.import.to_request())
            .with_context(|| format!("Creating VM '{}'", self.import.name))?;
        self.output.print(&vm)
    }
}

#[derive(Debug, Parser)]
pub(crate) struct StartOpts {
    /// VM name or UUID
    vm: String,

    /// Frontend to start the VM with
    #[clap(long = "type", value_enum, default_value_t = BootMode::Headless)]
    mode: BootMode,

    #[clap(flatten)]
    output: OutputOpts,
}

impl StartOpts {
    pub(crate) fn run(self, vbox: &VirtualBox) -> Result<()> {
        let vm = vbox
            .start(&self.vm, self.mode)
            .with_context(|| format!("Starting VM '{}'", self.vm))?;
        self.output.print(&vm)
    }
}

#[derive(Debug, Parser)]
pub(crate) struct VmOpts {
    /// VM name or UUID
    vm: String,

    #[clap(flatten)]
    output: OutputOpts,
}

impl VmOpts {
    pub(crate) fn stop(self, vbox: &VirtualBox) -> Result<()> {
        let vm = vbox
            .stop(&self.vm)
            .with_context(|| format!("Stopping VM '{}'", self.vm))?;
        self.output.print(&vm)
    }

    pub(crate) fn info(self, vbox: &VirtualBox) -> Result<()> {
        let vm = vbox
            .get_info(&self.vm)
            .with_context(|| format!("Inspecting VM '{}'", self.vm))?;
        self.output.print(&vm)
    }
}

#[derive(Debug, Parser)]
pub(crate) struct DestroyOpts {
    /// VM name or UUID
    vm: String,
}

impl DestroyOpts {
    pub(crate) fn run(self, vbox: &VirtualBox) -> Result<()> {
        vbox.destroy(&self.vm)
            .with_context(|| format!("Destroying VM '{}'", self.vm))?;
        println!("VM '{}' destroyed", self.vm);
        Ok(())
    }
}

#[derive(Debug, Parser)]
pub(crate) struct IpOpts {
    /// VM name or UUID
    vm: String,

    /// Keep polling up to this many seconds until the guest reports an address
    #[clap(long)]
    wait: Option<u64>,
}

impl IpOpts {
    pub(crate) fn run(self, vbox: &VirtualBox) -> Result<()> {
        let vm = vbox
            .get_info(&self.vm)
            .with_context(|| format!("Inspecting VM '{}'", self.vm))?;
        let ip = match (vm.ipv4, self.wait) {
            (Some(ip), _) => Some(ip),
            (None, None) => None,
            (None, Some(_)) if !vm.is_running() => {
                return Err(eyre!("VM '{}' is not running", self.vm));
            }
            (None, Some(secs)) => {
                let pb = ProgressBar::new_spinner();
                pb.enable_steady_tick(Duration::from_millis(100));
                let r = utils::wait_for_readiness(
                    &pb,
                    "Waiting for guest address",
                    || Ok(vbox.get_info(&self.vm)?.ipv4),
                    Duration::from_secs(secs),
                    Duration::from_secs(1),
                );
                pb.finish_and_clear();
                let (ip, elapsed) = r?;
                debug!("Guest address reported after {:.1}s", elapsed.as_secs_f64());
                Some(ip)
            }
        };
        match ip {
            Some(ip) => println!("{ip}"),
            None => eprintln!("VM '{}' has not reported an address yet", self.vm),
        }
        Ok(())
    }
}

#[derive(Debug, Parser)]
pub(crate) struct SetNicOpts {
    /// VM name or UUID
    vm: String,

    /// Attachment type for interface 1
    #[clap(long = "type", value_enum)]
    kind: NicType,

    /// Host interface (bridged), adapter (hostonly), network (hostonlynet,
    /// natnetwork) or driver (generic) to attach to
    #[clap(long)]
    attach_to: Option<String>,

    #[clap(flatten)]
    output: OutputOpts,
}

impl SetNicOpts {
    pub(crate) fn run(self, vbox: &VirtualBox) -> Result<()> {
        let current = vbox
            .get_info(&self.vm)
            .with_context(|| format!("Inspecting VM '{}'", self.vm))?;
        let mut spec = NicSpec::new(self.kind);
        if let Some(a) = self.attach_to {
            spec = spec.with_attachment(a);
        }
        let vm = vbox
            .modify_nic(&current, &spec)
            .with_context(|| format!("Reconfiguring network of VM '{}'", self.vm))?;
        self.output.print(&vm)
    }
}

#[derive(Debug, Parser)]
pub(crate) struct ForwardPortOpts {
    /// VM name or UUID
    vm: String,

    /// Guest port to forward to
    #[clap(long, default_value_t = DEFAULT_GUEST_SSH_PORT)]
    guest_port: u16,

    #[clap(flatten)]
    output: OutputOpts,
}

impl ForwardPortOpts {
    pub(crate) fn run(self, vbox: &VirtualBox) -> Result<()> {
        let vm = vbox
            .forward_port(&self.vm, self.guest_port)
            .with_context(|| format!("Forwarding a port to VM '{}'", self.vm))?;
        self.output.print(&vm)
    }
}

/// Make sure the customization tool is installed before touching any image.
fn check_customize_tool(config: &VBoxConfig) -> Result<()> {
    which::which(&config.customize_tool).map_err(|_| {
        eyre!(
            "{} not found; install libguestfs tools or pass --customize-tool",
            config.customize_tool.to_string_lossy()
        )
    })?;
    Ok(())
}

fn check_public_key(path: &Utf8Path) -> Result<()> {
    if !path.is_file() {
        return Err(eyre!("SSH public key {} does not exist", path));
    }
    Ok(())
}

#[derive(Debug, Parser)]
pub(crate) struct InjectKeyOpts {
    /// VM name or UUID
    vm: String,

    /// Guest account to authorize the key for
    #[clap(long, default_value = DEFAULT_SSH_USER)]
    user: String,

    /// Public key file
    #[clap(long)]
    key: Utf8PathBuf,
}

impl InjectKeyOpts {
    pub(crate) fn run(self, vbox: &VirtualBox) -> Result<()> {
        check_customize_tool(vbox.config())?;
        check_public_key(&self.key)?;
        vbox.inject_ssh_key(&self.vm, &self.user, &self.key)
            .with_context(|| format!("Injecting SSH key into VM '{}'", self.vm))?;
        println!("Authorized {} for {} in VM '{}'", self.key, self.user, self.vm);
        Ok(())
    }
}

#[derive(Debug, Parser)]
pub(crate) struct ProvisionOpts {
    #[clap(flatten)]
    import: ImportOpts,

    /// Public key to authorize in the guest; also sets up SSH port forwarding
    #[clap(long)]
    ssh_key: Option<Utf8PathBuf>,

    /// Guest account for the SSH key
    #[clap(long, default_value = DEFAULT_SSH_USER)]
    ssh_user: String,

    /// Frontend to start the VM with
    #[clap(long = "type", value_enum, default_value_t = BootMode::Headless)]
    mode: BootMode,

    #[clap(flatten)]
    output: OutputOpts,
}

impl ProvisionOpts {
    pub(crate) fn run(self, vbox: &VirtualBox) -> Result<()> {
        if let Some(key) = &self.ssh_key {
            check_customize_tool(vbox.config())?;
            check_public_key(key)?;
        }
        let req = ProvisionRequest {
            create: self.import.to_request(),
            ssh: self.ssh_key.map(|public_key| SshAccess {
                user: self.ssh_user,
                public_key,
            }),
            boot_mode: self.mode,
        };
        let vm = vbox
            .provision(&req)
            .with_context(|| format!("Provisioning VM '{}'", req.create.name))?;
        self.output.print(&vm)?;
        if let (Some(port), Some(ssh)) = (vm.ssh_port, &req.ssh) {
            println!("\nConnect with: ssh -p {port} {}@127.0.0.1", ssh.user);
        }
        Ok(())
    }
}
