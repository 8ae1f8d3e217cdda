//! Switched-power seam: the ability to power-cycle the modem and the aux
//! board. Power control is platform wiring, so the driver only sees a trait.

use std::process::Command;

use tracing::{info, warn};

/// Power-cycle capability for the two attached devices. Returns whether the
/// cycle was actually performed.
pub trait PowerManager {
    fn power_cycle_modem(&mut self) -> bool;
    fn power_cycle_aux(&mut self) -> bool;
}

/// No switched power available. Every cycle request is refused, which makes
/// the caller fall back to its queue/retry paths.
#[derive(Debug, Default)]
pub struct NullPower;

impl PowerManager for NullPower {
    fn power_cycle_modem(&mut self) -> bool {
        warn!("Power: modem cycle requested but no power control is configured");
        false
    }

    fn power_cycle_aux(&mut self) -> bool {
        warn!("Power: aux cycle requested but no power control is configured");
        false
    }
}

/// Shell-command power control: each device has a configured one-shot command
/// (typically a GPIO poke script). A cycle succeeds when the command exits 0.
pub struct CommandPower {
    modem_cmd: Option<String>,
    aux_cmd: Option<String>,
}

impl CommandPower {
    pub fn new(modem_cmd: Option<String>, aux_cmd: Option<String>) -> Self {
        Self { modem_cmd, aux_cmd }
    }

    fn run(cmd: &str, what: &str) -> bool {
        match Command::new("/bin/sh").arg("-c").arg(cmd).status() {
            Ok(status) if status.success() => {
                info!("Power: {what} cycled");
                true
            }
            Ok(status) => {
                warn!("Power: {what} cycle command exited {status}");
                false
            }
            Err(e) => {
                warn!("Power: {what} cycle command failed to run: {e}");
                false
            }
        }
    }
}

impl PowerManager for CommandPower {
    fn power_cycle_modem(&mut self) -> bool {
        match &self.modem_cmd {
            Some(cmd) => Self::run(cmd, "modem"),
            None => {
                warn!("Power: modem cycle requested but no command configured");
                false
            }
        }
    }

    fn power_cycle_aux(&mut self) -> bool {
        match &self.aux_cmd {
            Some(cmd) => Self::run(cmd, "aux board"),
            None => {
                warn!("Power: aux cycle requested but no command configured");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_power_refuses() {
        let mut p = NullPower;
        assert!(!p.power_cycle_modem());
        assert!(!p.power_cycle_aux());
    }

    #[test]
    fn test_command_power_runs_shell() {
        let mut p = CommandPower::new(Some("true".into()), Some("false".into()));
        assert!(p.power_cycle_modem());
        assert!(!p.power_cycle_aux());
    }

    #[test]
    fn test_command_power_unconfigured() {
        let mut p = CommandPower::new(None, None);
        assert!(!p.power_cycle_modem());
    }
}
