//! OS service control seam.

use anyhow::{bail, Context, Result};

/// Control surface over the managed agent service.
///
/// The updater only ever talks to the service manager through this trait;
/// platform specifics stay behind it.
pub(crate) trait ServiceControl {
    /// Start the service.
    fn start(&self) -> Result<()>;
    /// Stop the service; returns once the stop request is accepted.
    fn stop(&self) -> Result<()>;
    /// Whether the service is currently running.
    fn is_running(&self) -> Result<bool>;
    /// Forcefully terminate the service.
    fn kill(&self) -> Result<()>;
}

/// systemd-backed implementation, shelling out to `systemctl`.
#[derive(Clone, Debug)]
pub(crate) struct SystemdService {
    unit: String,
}

impl SystemdService {
    pub(crate) fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }

    fn systemctl(&self, args: &[&str]) -> Result<std::process::Output> {
        let mut cmd = std::process::Command::new("systemctl");
        cmd.args(args).arg(&self.unit);
        let out = cmd.output().context("failed to run 'systemctl' binary")?;
        Ok(out)
    }

    fn systemctl_checked(&self, args: &[&str]) -> Result<()> {
        let out = self.systemctl(args)?;
        if !out.status.success() {
            bail!(
                "systemctl {} {} failed:\n{}",
                args.join(" "),
                self.unit,
                String::from_utf8_lossy(&out.stderr)
            );
        }
        Ok(())
    }
}

impl ServiceControl for SystemdService {
    fn start(&self) -> Result<()> {
        self.systemctl_checked(&["start"])
    }

    fn stop(&self) -> Result<()> {
        self.systemctl_checked(&["stop"])
    }

    fn is_running(&self) -> Result<bool> {
        // `is-active` exits non-zero for any state other than active; that
        // is a verdict, not an error.
        let out = self.systemctl(&["is-active", "--quiet"])?;
        Ok(out.status.success())
    }

    fn kill(&self) -> Result<()> {
        self.systemctl_checked(&["kill", "--signal=SIGKILL"])
    }
}
