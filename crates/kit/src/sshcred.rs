//! SSH key injection into a VM's disk image before first boot.
//!
//! The image is copied to scratch space, the guest customization tool
//! (virt-sysprep by default) edits the copy, and the copy replaces the
//! original with an atomic rename. The original is never opened for writing
//! until the tool has succeeded, and the scratch copy is removed on every
//! exit path.

use std::fs::File;
use std::io::{self, Seek as _, SeekFrom};

use camino::Utf8Path;
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument};

use crate::config::VBoxConfig;
use crate::error::{Error, InjectStage, Result, StageExt as _};
use crate::hostexec::Runner;
use crate::validate;
use crate::vm::VirtualBox;

impl<R: Runner> VirtualBox<R> {
    /// Authorize `public_key` for `user` inside the guest disk of `vm`.
    ///
    /// The VM must be powered off. Callers must not inject into the same VM
    /// concurrently.
    #[instrument(skip(self))]
    pub fn inject_ssh_key(&self, vm: &str, user: &str, public_key: &Utf8Path) -> Result<()> {
        validate::guest_user(user)?;
        validate::vm_ref("SSH public key path", public_key.as_str())?;
        validate::tool_path("scratch directory", self.config.scratch_dir.as_str())?;

        let desc = self.get_info(vm).stage(InjectStage::ResolveImage)?;
        let image = desc
            .disk_path
            .ok_or_else(|| Error::NoDiskImage {
                vm: vm.to_owned(),
                slot: self.config.disk_slot.clone(),
            })
            .stage(InjectStage::ResolveImage)?;

        info!("Injecting {public_key} for {user} into {image}");
        self.inject_into_image(&image, user, public_key)
    }

    /// Run the copy/customize/write-back pipeline against `image`.
    pub(crate) fn inject_into_image(
        &self,
        image: &Utf8Path,
        user: &str,
        public_key: &Utf8Path,
    ) -> Result<()> {
        let mut scratch =
            copy_to_scratch(&self.config, image).stage(InjectStage::CopyToScratch)?;
        let scratch_path = scratch.path().to_path_buf();
        debug!("Scratch copy at {}", scratch_path.display());

        self.exec(
            &self.config.customize_tool,
            [
                "-a".into(),
                scratch_path.clone().into_os_string(),
                "--ssh-inject".into(),
                format!("{user}:file:{public_key}").into(),
            ],
        )
        .stage(InjectStage::Customize)?;

        write_back(scratch.as_file_mut(), image).stage(InjectStage::WriteBack)?;

        scratch
            .close()
            .map_err(|e| Error::io(format!("Removing {}", scratch_path.display()), e))
            .stage(InjectStage::RemoveScratch)?;
        Ok(())
    }
}

/// Copy `image` into a scratch file named after it and flush it to disk.
///
/// The returned file is deleted when dropped.
fn copy_to_scratch(config: &VBoxConfig, image: &Utf8Path) -> Result<NamedTempFile> {
    let stem = image.file_stem().unwrap_or("disk");
    let suffix = image
        .extension()
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();
    // The customization tool can't cope with spaces in paths, and VirtualBox
    // likes to put VMs under "VirtualBox VMs".
    let stem: String = stem
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();

    let mut src = File::open(image).map_err(|e| Error::io(format!("Opening {image}"), e))?;
    let mut scratch = tempfile::Builder::new()
        .prefix(&format!("{stem}."))
        .suffix(&suffix)
        .tempfile_in(&config.scratch_dir)
        .map_err(|e| {
            Error::io(
                format!("Creating scratch file in {}", config.scratch_dir),
                e,
            )
        })?;
    io::copy(&mut src, scratch.as_file_mut())
        .map_err(|e| Error::io(format!("Copying {image} to scratch"), e))?;
    scratch
        .as_file()
        .sync_all()
        .map_err(|e| Error::io("Flushing scratch copy", e))?;
    Ok(scratch)
}

/// Atomically replace `image` with the contents of `scratch`.
///
/// The data goes to a sibling temporary file first, so a crash leaves either
/// the old image or the new one, never a truncated file.
fn write_back(scratch: &mut File, image: &Utf8Path) -> Result<()> {
    let dir = match image.parent() {
        Some(p) if !p.as_str().is_empty() => p,
        _ => Utf8Path::new("."),
    };
    let name = image.file_name().unwrap_or("disk");
    let permissions = std::fs::metadata(image)
        .map_err(|e| Error::io(format!("Reading metadata of {image}"), e))?
        .permissions();

    scratch
        .seek(SeekFrom::Start(0))
        .map_err(|e| Error::io("Rewinding scratch copy", e))?;
    let mut staged = tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .tempfile_in(dir)
        .map_err(|e| Error::io(format!("Creating temporary file in {dir}"), e))?;
    io::copy(scratch, staged.as_file_mut())
        .map_err(|e| Error::io(format!("Writing customized image for {image}"), e))?;
    staged
        .as_file()
        .set_permissions(permissions)
        .map_err(|e| Error::io(format!("Copying permissions of {image}"), e))?;
    staged
        .as_file()
        .sync_all()
        .map_err(|e| Error::io("Flushing customized image", e))?;
    staged
        .persist(image)
        .map_err(|e| Error::io(format!("Replacing {image}"), e.error))?;

    // Make the rename itself durable.
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!("Failed to sync {dir}: {e}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostexec::testutil::FakeRunner;
    use crate::hostexec::CommandOutput;
    use camino::Utf8PathBuf;
    use std::io::Write as _;

    struct Fixture {
        _dir: tempfile::TempDir,
        image: Utf8PathBuf,
        key: Utf8PathBuf,
        scratch: Utf8PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let vmdir = root.join("VirtualBox VMs").join("vm1");
        std::fs::create_dir_all(&vmdir).unwrap();
        let image = vmdir.join("vm1 disk001.vmdk");
        std::fs::write(&image, b"original image contents").unwrap();
        let key = root.join("id_ed25519.pub");
        std::fs::write(&key, b"ssh-ed25519 AAAA test@host\n").unwrap();
        let scratch = root.join("scratch");
        std::fs::create_dir(&scratch).unwrap();
        Fixture {
            _dir: dir,
            image,
            key,
            scratch,
        }
    }

    fn scratch_entries(f: &Fixture) -> usize {
        std::fs::read_dir(&f.scratch).unwrap().count()
    }

    /// Emulates virt-sysprep by appending the selector to the `-a` image.
    fn sysprep(image: Utf8PathBuf) -> impl Fn(&[String]) -> CommandOutput {
        move |argv: &[String]| match argv[0].as_str() {
            "VBoxManage" => CommandOutput::ok(format!(
                "name=\"vm1\"\nUUID=\"u\"\nVMState=\"poweroff\"\n\"SATA Controller-0-0\"=\"{image}\"\n"
            )),
            "virt-sysprep" => {
                assert_eq!(argv[1], "-a");
                assert_eq!(argv[3], "--ssh-inject");
                assert!(!argv[2].contains(' '), "scratch path has spaces: {}", argv[2]);
                let mut f = std::fs::OpenOptions::new()
                    .append(true)
                    .open(&argv[2])
                    .unwrap();
                write!(f, "+{}", argv[4]).unwrap();
                CommandOutput::ok("")
            }
            other => panic!("unexpected program {other}"),
        }
    }

    #[test]
    fn test_inject_replaces_image_with_customized_copy() {
        let f = fixture();
        let config = VBoxConfig::default().with_scratch_dir(f.scratch.clone());
        let vbox = VirtualBox::with_runner(config, FakeRunner::new(sysprep(f.image.clone())));
        vbox.inject_ssh_key("vm1", "root", &f.key).unwrap();

        let contents = std::fs::read_to_string(&f.image).unwrap();
        assert_eq!(
            contents,
            format!("original image contents+root:file:{}", f.key)
        );
        assert_eq!(scratch_entries(&f), 0);
        // Nothing left next to the image either.
        assert_eq!(
            std::fs::read_dir(f.image.parent().unwrap()).unwrap().count(),
            1
        );
        let calls = vbox.runner.calls();
        assert_eq!(calls[1][0], "virt-sysprep");
        assert!(calls[1][2].starts_with(f.scratch.as_str()));
        assert!(calls[1][2].ends_with(".vmdk"));
    }

    #[test]
    fn test_customize_failure_leaves_original() {
        let f = fixture();
        let image = f.image.clone();
        let config = VBoxConfig::default().with_scratch_dir(f.scratch.clone());
        let vbox = VirtualBox::with_runner(
            config,
            FakeRunner::new(move |argv| {
                if argv[0] == "virt-sysprep" {
                    CommandOutput::failed("virt-sysprep: error: no operating systems were found\n")
                } else {
                    sysprep(image.clone())(argv)
                }
            }),
        );
        let err = vbox.inject_ssh_key("vm1", "root", &f.key).unwrap_err();
        match &err {
            Error::Inject { stage, source } => {
                assert_eq!(*stage, InjectStage::Customize);
                assert!(source.to_string().contains("no operating systems"));
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(
            std::fs::read_to_string(&f.image).unwrap(),
            "original image contents"
        );
        assert_eq!(scratch_entries(&f), 0);
    }

    #[test]
    fn test_missing_image_fails_at_copy() {
        let f = fixture();
        std::fs::remove_file(&f.image).unwrap();
        let config = VBoxConfig::default().with_scratch_dir(f.scratch.clone());
        let vbox = VirtualBox::with_runner(config, FakeRunner::new(sysprep(f.image.clone())));
        let err = vbox.inject_ssh_key("vm1", "root", &f.key).unwrap_err();
        assert!(
            matches!(err, Error::Inject { stage: InjectStage::CopyToScratch, .. }),
            "{err}"
        );
        assert_eq!(vbox.runner.subcommands(), ["showvminfo"]);
        assert_eq!(scratch_entries(&f), 0);
    }

    #[test]
    fn test_no_disk_attached() {
        let f = fixture();
        let config = VBoxConfig::default().with_scratch_dir(f.scratch.clone());
        let vbox = VirtualBox::with_runner(
            config,
            FakeRunner::new(|_| CommandOutput::ok("name=\"vm1\"\nUUID=\"u\"\n")),
        );
        let err = vbox.inject_ssh_key("vm1", "root", &f.key).unwrap_err();
        assert!(
            matches!(err, Error::Inject { stage: InjectStage::ResolveImage, .. }),
            "{err}"
        );
    }

    #[test]
    fn test_rejects_bad_user_before_running_anything() {
        let f = fixture();
        let vbox = VirtualBox::with_runner(
            VBoxConfig::default().with_scratch_dir(f.scratch.clone()),
            FakeRunner::new(sysprep(f.image.clone())),
        );
        let err = vbox.inject_ssh_key("vm1", "root:file", &f.key).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert!(vbox.runner.calls().is_empty());
    }

    #[test]
    fn test_failed_write_back_leaves_original_intact() {
        let f = fixture();
        // Write-only, so copying out of it fails after the sibling
        // temporary file exists.
        let mut scratch = File::create(f.scratch.join("vm1.vmdk")).unwrap();
        let err = write_back(&mut scratch, &f.image)
            .stage(InjectStage::WriteBack)
            .unwrap_err();
        match &err {
            Error::Inject { stage, source } => {
                assert_eq!(*stage, InjectStage::WriteBack);
                assert!(matches!(**source, Error::Io { .. }), "{source}");
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(
            std::fs::read_to_string(&f.image).unwrap(),
            "original image contents"
        );
        let siblings: Vec<_> = std::fs::read_dir(f.image.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(siblings, ["vm1 disk001.vmdk"]);
    }

    #[test]
    fn test_scratch_removal_failure_is_reported_after_write_back() {
        let f = fixture();
        let image = f.image.clone();
        let config = VBoxConfig::default().with_scratch_dir(f.scratch.clone());
        let vbox = VirtualBox::with_runner(
            config,
            FakeRunner::new(move |argv| {
                let out = sysprep(image.clone())(argv);
                if argv[0] == "virt-sysprep" {
                    std::fs::remove_file(&argv[2]).unwrap();
                }
                out
            }),
        );
        let err = vbox.inject_ssh_key("vm1", "root", &f.key).unwrap_err();
        assert!(
            matches!(err, Error::Inject { stage: InjectStage::RemoveScratch, .. }),
            "{err}"
        );
        // The image was already replaced by then.
        assert_eq!(
            std::fs::read_to_string(&f.image).unwrap(),
            format!("original image contents+root:file:{}", f.key)
        );
        assert_eq!(scratch_entries(&f), 0);
    }

    #[test]
    fn test_write_back_is_exact() {
        let f = fixture();
        let mut scratch = tempfile::tempfile_in(&f.scratch).unwrap();
        scratch.write_all(b"short").unwrap();
        write_back(&mut scratch, &f.image).unwrap();
        assert_eq!(std::fs::read(&f.image).unwrap(), b"short");
    }
}
