//! Application seam: everything the driver asks the wider system to do.
//!
//! Remote MT commands trigger system actions (reset preparation, ack and
//! report builders, storage formatting, rules purging); initialization
//! persists the modem identity; aux programming pulls configuration lines
//! from the application and commits downloaded images. All of that goes
//! through [`SystemHooks`] so the driver itself stays testable on a desktop.

/// Serial ports whose pending-read indicator the notification policy can
/// clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyPort {
    Port2,
    Port3,
}

/// Failure annotation carried in a remote-command ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    Ok,
    InVoiceCall,
    HardwareNotSupported,
    BadHeaderStart,
    FileDoesNotExist,
    BusDisabled,
}

/// Collaborator surface for the driver. Every method has a safe default so a
/// bare deployment (no rules engine, no watchdog) still runs; implementations
/// override what their platform supports.
#[allow(unused_variables)]
pub trait SystemHooks {
    /// Persist a changed IMEI to stable storage.
    fn persist_imei(&mut self, imei: &str) {}

    /// Previously persisted IMEI, if any.
    fn stored_imei(&self) -> Option<String> {
        None
    }

    /// Feed the hardware watchdog during long transfers.
    fn kick_watchdog(&mut self) {}

    /// Next line of the aux-board configuration to stream during
    /// programming. `None` means the configuration is exhausted.
    fn next_config_line(&mut self) -> Option<String> {
        None
    }

    /// Restart the configuration stream from the first line.
    fn reset_config_index(&mut self) {}

    /// A complete configuration image was downloaded from the aux board.
    fn commit_aux_config(&mut self, image: &[u8]) {}

    /// Write the invalid-extension markers to the configuration EEPROM so a
    /// failed flash is re-attempted on the next boot.
    fn mark_aux_config_invalid(&mut self) {}

    // ── Remote MT command actions ────────────────────────────────────

    fn set_reset_cmd_time(&mut self, date_time: u32) {}

    /// Stage a remote system reset; `graceful` selects the orderly variant.
    fn prepare_remote_reset(&mut self, graceful: bool) {}

    fn build_roi_ack(&mut self, date_time: u32) {}

    fn set_remote_config_file_time(&mut self, date_time: u32) {}

    /// Build the configuration report message (non-persistent option).
    fn build_config_message(&mut self) {}

    /// Build a command ack for `msg_type` with the given outcome.
    fn build_cmd_ack(&mut self, msg_type: u16, ok: bool, code: AckCode, date_time: u32) {}

    /// Format the removable storage; the formatter emits its own ack.
    fn format_storage_remotely(&mut self, date_time: u32) {}

    /// Clear the rules engine's memory image. Returns success.
    fn clear_rules_memory(&mut self) -> bool {
        false
    }

    /// Delete the rules binary file. Returns success.
    fn delete_rules_file(&mut self) -> bool {
        false
    }

    fn build_system_log_message(&mut self, date_time: u32) {}

    fn build_modem_log_message(&mut self, date_time: u32) {}

    fn build_version_message(&mut self, date_time: u32) {}

    fn build_gps_message(&mut self, date_time: u32) {}

    /// Reset the external data bus. Returns success.
    fn reset_data_bus(&mut self) -> bool {
        false
    }

    /// Schedule log transmission; `prompt` requests immediate send.
    fn prepare_log_transmission(&mut self, date_time: u32, prompt: bool, option: u16) {}

    /// Clear a port's pending-read flag after the indicator policy fires.
    fn clear_port_pending_read(&mut self, port: NotifyPort) {}
}

/// Hooks for a bare deployment: every action is a no-op.
#[derive(Debug, Default)]
pub struct NullHooks;

impl SystemHooks for NullHooks {}
