use std::time::Duration;

use derive_builder::Builder;
use nix::sys::signal;
use nix::sys::signal::Signal;
use tokio::process::{Child, Command};

use crate::common::error::GridAllocError;

/// Configuration of the auxiliary controller process that provisioned workers
/// connect back to.
#[derive(Builder, Clone, Debug)]
#[builder(pattern = "owned")]
pub struct ControllerConfig {
    /// Executable that runs the controller.
    program: String,
    /// Address the controller should listen on, passed as `--ip=<addr>`.
    #[builder(default)]
    bind_address: Option<String>,
    /// Additional command-line options.
    #[builder(default)]
    options: Vec<String>,
    /// How long to wait after spawning before the controller is considered
    /// initialized.
    #[builder(default = "Duration::from_secs(5)")]
    startup_grace: Duration,
}

impl ControllerConfig {
    pub fn program(&self) -> &str {
        &self.program
    }
}

/// A long-lived listener process owned by one provider.
///
/// The process runs in its own process group so that stopping it also stops
/// any children it forked.
#[derive(Debug)]
pub struct Controller {
    child: Child,
    program: String,
    stopped: bool,
}

impl Controller {
    /// Spawn the controller and wait briefly so it can initialize before
    /// workers are pointed at it.
    pub async fn start(config: &ControllerConfig) -> crate::Result<Controller> {
        let mut command = Command::new(&config.program);
        if let Some(address) = &config.bind_address {
            command.arg(format!("--ip={address}"));
        }
        command.args(&config.options);
        command.process_group(0);
        command.kill_on_drop(true);

        log::debug!("Starting controller `{}`", config.program);
        let child = command.spawn().map_err(|error| {
            GridAllocError::Channel(format!(
                "controller {} could not be started: {error}",
                config.program
            ))
        })?;

        tokio::time::sleep(config.startup_grace).await;

        Ok(Controller {
            child,
            program: config.program.clone(),
            stopped: false,
        })
    }

    /// Terminate the controller's process group and reap the child. Safe to
    /// call more than once.
    pub async fn stop(&mut self) -> crate::Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        log::debug!("Stopping controller `{}`", self.program);
        if let Some(pid) = self.child.id() {
            let pgid = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(pid as i32)))
                .map_err(|error| {
                    GridAllocError::GenericError(format!("Cannot get PGID for PID {pid}: {error:?}"))
                })?;
            signal::killpg(pgid, Some(Signal::SIGTERM)).map_err(|error| {
                GridAllocError::GenericError(format!(
                    "Cannot send SIGTERM to PGID {pgid}: {error:?}"
                ))
            })?;
        }
        self.child.wait().await?;
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}
