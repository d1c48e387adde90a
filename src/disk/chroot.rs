//! Configuration applied inside the provisioned system.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::warn;

use crate::disk::plan::ProvisionPlan;
use crate::process::{Cmd, Runner};
use crate::profile::DistroProfile;

const SPICE_ACL_HELPER: &str = "/usr/lib/spice-client-glib-usb-acl-helper";

/// `/etc/sudoers.d/10-<group>` granting `group` full sudo.
pub fn write_sudoers_dropin(target: &Path, group: &str) -> Result<()> {
    let dir = target.join("etc/sudoers.d");
    fs::create_dir_all(&dir).with_context(|| format!("creating '{}'", dir.display()))?;
    let path = dir.join(format!("10-{}", group));
    fs::write(&path, format!("%{} ALL=(ALL:ALL) ALL\n", group))
        .with_context(|| format!("writing '{}'", path.display()))?;
    // sudo ignores drop-ins that are group or world writable.
    fs::set_permissions(&path, fs::Permissions::from_mode(0o440))
        .with_context(|| format!("setting mode on '{}'", path.display()))?;
    Ok(())
}

/// Replace (or append) `GRUB_CMDLINE_LINUX_DEFAULT` in `/etc/default/grub`
/// content.
pub fn rewrite_cmdline(grub_defaults: &str, cmdline: &str) -> String {
    let replacement = format!("GRUB_CMDLINE_LINUX_DEFAULT=\"{}\"", cmdline);
    let mut found = false;
    let mut out: Vec<String> = grub_defaults
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("GRUB_CMDLINE_LINUX_DEFAULT=") {
                found = true;
                replacement.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !found {
        out.push(replacement);
    }
    let mut text = out.join("\n");
    text.push('\n');
    text
}

fn in_chroot<'a>(target: &Path, argv: impl IntoIterator<Item = &'a str>) -> Cmd {
    Cmd::new("chroot").arg_path(target).args(argv)
}

/// Bootloader, accounts, services and initramfs, in that order.
pub fn configure(
    runner: &dyn Runner,
    target: &Path,
    plan: &ProvisionPlan,
    profile: &DistroProfile,
) -> Result<()> {
    println!("Installing GRUB...");
    runner.run(
        &in_chroot(
            target,
            [
                "grub-install",
                "--target=x86_64-efi",
                "--efi-directory=/boot/efi",
                "--bootloader-id=GRUB",
                "--recheck",
            ],
        )
        .error_msg("grub-install failed. Is the ESP mounted at /boot/efi?"),
    )?;

    let grub_defaults = target.join("etc/default/grub");
    if grub_defaults.is_file() {
        let text = fs::read_to_string(&grub_defaults)
            .with_context(|| format!("reading '{}'", grub_defaults.display()))?;
        fs::write(&grub_defaults, rewrite_cmdline(&text, &plan.kernel_cmdline))
            .with_context(|| format!("writing '{}'", grub_defaults.display()))?;
    } else {
        warn!(path = %grub_defaults.display(), "no grub defaults file, kernel cmdline left unchanged");
    }

    runner.run(
        &in_chroot(target, ["grub-mkconfig", "-o", "/boot/grub/grub.cfg"])
            .error_msg("grub-mkconfig failed"),
    )?;

    if let Some(user) = &plan.username {
        println!("Creating user {}...", user);
        runner.run(
            &in_chroot(
                target,
                ["useradd", "-m", "-G", profile.admin_group, "-s", "/bin/bash", user.as_str()],
            )
            .error_msg(format!("useradd failed for '{}'", user)),
        )?;
        write_sudoers_dropin(target, profile.admin_group)?;
        if plan.set_passwords {
            println!("Set the password for {}:", user);
            runner.run(&in_chroot(target, ["passwd", user.as_str()]))?;
        }
    }
    if plan.set_passwords {
        println!("Set the root password:");
        runner.run(&in_chroot(target, ["passwd", "root"]))?;
    }

    let zone = format!("/usr/share/zoneinfo/{}", plan.timezone);
    runner.run(
        &in_chroot(target, ["ln", "-sf", zone.as_str(), "/etc/localtime"])
            .error_msg(format!("Unknown timezone '{}'", plan.timezone)),
    )?;

    runner.run(
        &in_chroot(
            target,
            [
                "systemctl",
                "enable",
                plan.display_manager.as_str(),
                plan.network_service.as_str(),
            ],
        )
        .error_msg("systemctl enable failed"),
    )?;

    let modprobe = target.join("etc/modprobe.d");
    fs::create_dir_all(&modprobe)
        .with_context(|| format!("creating '{}'", modprobe.display()))?;
    fs::write(modprobe.join("disable-ntfs3.conf"), "blacklist ntfs3\n")
        .context("writing ntfs3 blacklist")?;

    runner.run(&in_chroot(target, ["chmod", "4755", SPICE_ACL_HELPER]).allow_fail())?;

    println!("Rebuilding initramfs...");
    runner.run(
        &in_chroot(target, profile.initramfs_rebuild_args().iter().copied())
            .error_msg("initramfs rebuild failed"),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_is_replaced_in_place() {
        let input = "GRUB_DEFAULT=0\nGRUB_CMDLINE_LINUX_DEFAULT=\"loglevel=3\"\nGRUB_CMDLINE_LINUX=\"\"\n";
        assert_eq!(
            rewrite_cmdline(input, "quiet splash"),
            "GRUB_DEFAULT=0\nGRUB_CMDLINE_LINUX_DEFAULT=\"quiet splash\"\nGRUB_CMDLINE_LINUX=\"\"\n"
        );
    }

    #[test]
    fn sudoers_dropin_is_read_only() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_sudoers_dropin(tmp.path(), "sudo").unwrap();

        let path = tmp.path().join("etc/sudoers.d/10-sudo");
        assert_eq!(fs::read_to_string(&path).unwrap(), "%sudo ALL=(ALL:ALL) ALL\n");
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o440);
    }

    #[test]
    fn cmdline_is_appended_when_absent() {
        assert_eq!(
            rewrite_cmdline("GRUB_DEFAULT=0\n", "quiet"),
            "GRUB_DEFAULT=0\nGRUB_CMDLINE_LINUX_DEFAULT=\"quiet\"\n"
        );
    }
}
