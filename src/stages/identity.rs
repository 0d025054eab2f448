//! Locale, console, clock, name and credentials.

use anyhow::{bail, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;

use super::StageContext;
use crate::chroot::ChrootCommand;
use crate::rootfs;

const PASSWORD_LEN: usize = 24;

/// Random alphanumeric root password.
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

pub(super) fn locale(ctx: &StageContext<'_>) -> Result<()> {
    let locale = &ctx.config.locale;
    let charset = locale.split_once('.').map(|(_, c)| c).unwrap_or("UTF-8");
    rootfs::ensure_line(ctx.root, "etc/locale.gen", &format!("{} {}", locale, charset))?;
    rootfs::write_file(ctx.root, "etc/locale.conf", &format!("LANG={}\n", locale))?;
    ctx.chroot.run(&ChrootCommand::new("locale-gen"))?;
    Ok(())
}

pub(super) fn keymap(ctx: &StageContext<'_>) -> Result<()> {
    rootfs::write_file(
        ctx.root,
        "etc/vconsole.conf",
        &format!("KEYMAP={}\n", ctx.config.keymap),
    )
}

pub(super) fn timezone(ctx: &StageContext<'_>) -> Result<()> {
    let zone = &ctx.config.timezone;
    let zoneinfo = ctx.root.join("usr/share/zoneinfo");
    if zoneinfo.is_dir() && !zoneinfo.join(zone).exists() {
        bail!("timezone '{}' is not in the image's zoneinfo database", zone);
    }
    rootfs::symlink(
        ctx.root,
        "etc/localtime",
        &format!("/usr/share/zoneinfo/{}", zone),
    )
}

pub(super) fn hostname(ctx: &StageContext<'_>) -> Result<()> {
    let name = &ctx.config.hostname;
    rootfs::write_file(ctx.root, "etc/hostname", &format!("{}\n", name))?;
    rootfs::write_file(
        ctx.root,
        "etc/hosts",
        &format!(
            "127.0.0.1  localhost\n::1        localhost\n127.0.1.1  {}.localdomain {}\n",
            name, name
        ),
    )
}

pub(super) fn root_password(ctx: &StageContext<'_>) -> Result<()> {
    ctx.chroot.run(
        &ChrootCommand::new("chpasswd").stdin(format!("root:{}\n", ctx.root_password)),
    )?;
    Ok(())
}
