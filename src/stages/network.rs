//! Networking, remote access and the USB serial console.

use anyhow::Result;
use log::{info, warn};

use super::StageContext;
use crate::fetch::fetch_authorized_keys;
use crate::rootfs;

const MULTI_USER: &str = "multi-user.target";

pub(super) fn wired(ctx: &StageContext<'_>) -> Result<()> {
    rootfs::write_file(
        ctx.root,
        "etc/systemd/network/20-wired.network",
        "[Match]\nName=en* eth*\n\n[Network]\nDHCP=yes\n",
    )?;
    rootfs::symlink(
        ctx.root,
        "etc/resolv.conf",
        "/run/systemd/resolve/stub-resolv.conf",
    )?;
    rootfs::enable_unit(ctx.root, "systemd-networkd.service", MULTI_USER)?;
    rootfs::enable_unit(ctx.root, "systemd-resolved.service", MULTI_USER)?;
    Ok(())
}

pub(super) fn ssh(ctx: &StageContext<'_>) -> Result<()> {
    let keys = fetch_authorized_keys(ctx.fetcher, &ctx.config.ssh_key_urls);
    let mut drop_in = format!("Port {}\n", ctx.config.ssh_port);
    if keys.is_empty() {
        warn!("no SSH public keys were collected; key authentication will not work");
    } else {
        rootfs::create_dir_mode(ctx.root, "root/.ssh", 0o700)?;
        rootfs::write_file_mode(ctx.root, "root/.ssh/authorized_keys", &keys, 0o600)?;
        drop_in.push_str(
            "PermitRootLogin prohibit-password\n\
             PasswordAuthentication no\n\
             KbdInteractiveAuthentication no\n",
        );
        info!("installed {} authorized key(s)", keys.lines().count());
    }
    rootfs::write_file(
        ctx.root,
        "etc/ssh/sshd_config.d/10-rpi-image-builder.conf",
        &drop_in,
    )?;
    rootfs::enable_unit(ctx.root, "sshd.service", MULTI_USER)?;
    Ok(())
}

pub(super) fn no_wifi(ctx: &StageContext<'_>) -> Option<String> {
    ctx.config
        .wifi
        .is_none()
        .then(|| "no WiFi credentials configured".into())
}

pub(super) fn wifi(ctx: &StageContext<'_>) -> Result<()> {
    let Some(wifi) = &ctx.config.wifi else {
        return Ok(());
    };
    let conf = format!(
        "ctrl_interface=/run/wpa_supplicant\n\
         update_config=1\n\
         country={}\n\
         \n\
         network={{\n\
         \tssid={}\n\
         \tpsk=\"{}\"\n\
         }}\n",
        wifi.country,
        wpa_ssid(&wifi.ssid),
        wifi.password
    );
    rootfs::write_file_mode(
        ctx.root,
        "etc/wpa_supplicant/wpa_supplicant-wlan0.conf",
        &conf,
        0o600,
    )?;
    rootfs::write_file(
        ctx.root,
        "etc/systemd/network/25-wireless.network",
        "[Match]\nName=wlan0\n\n[Network]\nDHCP=yes\n",
    )?;
    rootfs::enable_unit(ctx.root, "wpa_supplicant@wlan0.service", MULTI_USER)?;
    Ok(())
}

/// Quoted SSID, or hex when it cannot be quoted.
fn wpa_ssid(ssid: &str) -> String {
    if ssid.chars().all(|c| c.is_ascii_graphic() || c == ' ') && !ssid.contains('"') {
        format!("\"{}\"", ssid)
    } else {
        ssid.bytes().map(|b| format!("{:02x}", b)).collect()
    }
}

pub(super) fn no_zerotier(ctx: &StageContext<'_>) -> Option<String> {
    ctx.config
        .zerotier_network
        .is_none()
        .then(|| "no ZeroTier network configured".into())
}

pub(super) fn zerotier(ctx: &StageContext<'_>) -> Result<()> {
    let Some(network) = &ctx.config.zerotier_network else {
        return Ok(());
    };
    ctx.packages
        .install(&ctx.chroot, &["zerotier-one".to_string()])?;
    // zerotier-one joins every network with a file in networks.d at startup.
    rootfs::write_file(
        ctx.root,
        &format!("var/lib/zerotier-one/networks.d/{}.conf", network),
        "",
    )?;
    rootfs::enable_unit(ctx.root, "zerotier-one.service", MULTI_USER)?;
    Ok(())
}

pub(super) fn usb_console_disabled(ctx: &StageContext<'_>) -> Option<String> {
    (!ctx.config.usb_console).then(|| "USB console disabled".into())
}

pub(super) fn usb_console(ctx: &StageContext<'_>) -> Result<()> {
    rootfs::ensure_line(ctx.root, "boot/config.txt", "dtoverlay=dwc2")?;
    rootfs::write_file(
        ctx.root,
        "etc/modules-load.d/usb-gadget.conf",
        "dwc2\ng_serial\n",
    )?;
    rootfs::enable_unit(ctx.root, "serial-getty@ttyGS0.service", "getty.target")?;
    Ok(())
}
