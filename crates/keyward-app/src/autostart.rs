//! Per-user autostart and background launch.
//!
//! Registers `keyward run --background` to start with the user session:
//! - Windows: Registry `HKCU\Software\Microsoft\Windows\CurrentVersion\Run`
//! - macOS: LaunchAgent plist in `~/Library/LaunchAgents/`
//! - Linux: `.desktop` file in `~/.config/autostart/`
//!
//! No elevation is needed; the daemon is strictly per user.

use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use auto_launch::{AutoLaunch, AutoLaunchBuilder};
use keyward_core::external::{ExternalError, Result, ServiceInstaller};
use tracing::info;

/// App name used for autostart registration.
const APP_NAME: &str = "Keyward";

/// Arguments the daemon is started with, both at login and on install.
pub const DAEMON_ARGS: &[&str] = &["run", "--background"];

/// Manages autostart registration for Keyward.
pub struct Autostart {
    exe_path: PathBuf,
    launcher: AutoLaunch,
}

impl Autostart {
    /// Creates a manager for the running executable.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::get_executable_path()?)
    }

    /// Creates a manager with a custom executable path.
    pub fn with_path(exe_path: PathBuf) -> Result<Self> {
        let launcher = Self::create_launcher(&exe_path)?;
        Ok(Self { exe_path, launcher })
    }

    /// Gets the path to the current executable.
    pub fn get_executable_path() -> Result<PathBuf> {
        env::current_exe().map_err(|e| ExternalError::InstallFailed(format!("executable path: {e}")))
    }

    fn create_launcher(exe_path: &Path) -> Result<AutoLaunch> {
        let exe_str = exe_path
            .to_str()
            .ok_or_else(|| ExternalError::InstallFailed("executable path is not UTF-8".to_string()))?;

        #[cfg(target_os = "macos")]
        let launcher = AutoLaunchBuilder::new()
            .set_app_name(APP_NAME)
            .set_app_path(exe_str)
            .set_args(DAEMON_ARGS)
            .set_use_launch_agent(true)
            .build();

        #[cfg(not(target_os = "macos"))]
        let launcher = AutoLaunchBuilder::new()
            .set_app_name(APP_NAME)
            .set_app_path(exe_str)
            .set_args(DAEMON_ARGS)
            .build();

        launcher.map_err(|e| ExternalError::InstallFailed(e.to_string()))
    }

    /// The command line registered for login.
    pub fn command(&self) -> String {
        format!("\"{}\" {}", self.exe_path.display(), DAEMON_ARGS.join(" "))
    }
}

impl ServiceInstaller for Autostart {
    fn elevated_install(&self) -> Result<()> {
        self.launcher
            .enable()
            .map_err(|e| ExternalError::InstallFailed(e.to_string()))?;
        info!(command = %self.command(), "Autostart enabled");
        Ok(())
    }

    fn uninstall(&self) -> Result<()> {
        if !self.is_installed() {
            return Ok(());
        }
        self.launcher
            .disable()
            .map_err(|e| ExternalError::InstallFailed(e.to_string()))?;
        info!("Autostart disabled");
        Ok(())
    }

    fn is_installed(&self) -> bool {
        self.launcher.is_enabled().unwrap_or(false)
    }

    fn launch_persistent_process(&self) -> Result<()> {
        let child = Command::new(&self.exe_path)
            .args(DAEMON_ARGS)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ExternalError::LaunchFailed(e.to_string()))?;

        info!(pid = child.id(), "Daemon launched");
        Ok(())
    }
}
