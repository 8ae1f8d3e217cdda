//! Aux-board exchanges (the PROGRAMMING state).
//!
//! Every aux exchange routes the shared port to the programming side first
//! and restores data routing on every exit path — success, failure, or
//! timeout. Commands are echoed back as `CMD: <echo>`; the dual-EOL
//! assembler skips the header and the echo is matched as a subsequence.
//!
//! Flash programming streams configuration lines from the application with a
//! 60 ms safety gap between lines (the board needs the quiet time); each
//! line is answered by a single status byte. Recoverable errors cancel and
//! restart the whole handshake from the version query.

use std::time::Duration;

use tracing::{debug, error as log_error, warn};

use crate::transport::{PortRouting, SerialPort};

use super::command::{
    AuxCommand, AUX_RSP_RELAY_OFF, AUX_RSP_RELAY_ON, AUX_RSP_RINGER_OFF, AUX_RSP_RINGER_ON,
    AUX_RSP_VERSION, MAX_CFG_DOWNLOAD_SIZE, PROG_BAD_CHAR, PROG_BAD_CHECKSUM, PROG_BAD_FORMAT,
    PROG_BAD_HW_ID, PROG_BLOCK_PASSED, PROG_MANUFACTURER_ERROR, PROG_OUT_OF_FLASH,
    PROG_PAGE_ERASE_ERROR, PROG_PAGE_WRITE_ERROR, PROG_UPLOAD_SUCCESSFUL, SATELLITE_RSP_TIMEOUT,
    STANDARD_RSP_TIMEOUT,
};
use super::error::ErrorCode;
use super::info::{RelayState, RELAY_1, RELAY_2};
use super::line::{Assembly, PairMatcher};
use super::{AtState, ProtocolEngine, SubState};

/// Quiet time the aux board needs between streamed configuration lines.
const PROG_LINE_GAP: Duration = Duration::from_millis(60);

impl<P: SerialPort> ProtocolEngine<P> {
    // ── Dispatch API (precondition: IDLE or POWERED_DOWN) ────────────

    /// Ask the aux board to dump its current configuration.
    pub fn download_aux_config(&mut self) -> bool {
        if !self.aux_dispatch_allowed() {
            return false;
        }
        self.aux_cmd = AuxCommand::DownloadConfig;
        if !self.send_aux_command() {
            return false;
        }
        self.sub = SubState::AuxDownloadEcho;
        true
    }

    /// Begin flash programming: version handshake, then line streaming.
    pub fn program_aux(&mut self) -> bool {
        if !self.aux_dispatch_allowed() {
            return false;
        }
        self.aux_cmd = AuxCommand::VersionCheck;
        if !self.send_aux_command() {
            return false;
        }
        self.sub = SubState::AuxVersionQuery;
        true
    }

    /// Soft-reset the aux board.
    pub fn reset_aux_board(&mut self) -> bool {
        if !self.aux_dispatch_allowed() {
            return false;
        }
        self.aux_cmd = AuxCommand::Reset;
        self.send_aux_command()
    }

    /// Switch the ringers; the cache is written at dispatch time and
    /// corrected later by status queries.
    pub fn set_ringer(&mut self, on: bool) -> bool {
        if !self.aux_dispatch_allowed() {
            return false;
        }
        self.aux_cmd = if on {
            AuxCommand::RingerOn
        } else {
            AuxCommand::RingerOff
        };
        self.info.ringers_on = on;
        self.send_aux_command()
    }

    /// Query the ringer state from the board itself.
    pub fn get_ringer_status(&mut self) -> bool {
        if !self.aux_dispatch_allowed() {
            return false;
        }
        self.aux_cmd = AuxCommand::RingerStatus;
        if !self.send_aux_command() {
            return false;
        }
        self.pair = Some(PairMatcher::new(AUX_RSP_RINGER_OFF, AUX_RSP_RINGER_ON));
        self.sub = SubState::AuxRingerStatus;
        true
    }

    /// Switch a relay; the cache is written at dispatch time.
    pub fn set_relay(&mut self, relay: usize, on: bool) -> bool {
        if relay >= self.info.relay_on.len() || !self.aux_dispatch_allowed() {
            return false;
        }
        self.aux_cmd = match (relay, on) {
            (RELAY_1, true) => AuxCommand::Relay1On,
            (RELAY_1, false) => AuxCommand::Relay1Off,
            (RELAY_2, true) => AuxCommand::Relay2On,
            (RELAY_2, false) => AuxCommand::Relay2Off,
            _ => return false,
        };
        self.info.relay_on[relay] = RelayState::from_bool(on);
        self.send_aux_command()
    }

    /// Query a relay state from the board itself.
    pub fn get_relay_status(&mut self, relay: usize) -> bool {
        if relay >= self.info.relay_on.len() || !self.aux_dispatch_allowed() {
            return false;
        }
        self.aux_cmd = if relay == RELAY_1 {
            AuxCommand::Relay1Status
        } else {
            AuxCommand::Relay2Status
        };
        self.info.current_relay = relay;
        if !self.send_aux_command() {
            return false;
        }
        self.pair = Some(PairMatcher::new(
            AUX_RSP_RELAY_OFF[relay],
            AUX_RSP_RELAY_ON[relay],
        ));
        self.sub = SubState::AuxRelayStatus;
        true
    }

    fn aux_dispatch_allowed(&self) -> bool {
        matches!(self.state, AtState::Idle | AtState::PoweredDown)
    }

    /// Route to the programming side, frame the current command with CRs,
    /// and arm the aux deadline. Refused when the board has no power.
    fn send_aux_command(&mut self) -> bool {
        if !self.port.aux_powered() {
            return false;
        }
        self.clear_buffers(PortRouting::Programming);

        self.send_raw(b"\r");
        let bytes = self.aux_cmd.bytes();
        debug!("aux tx: {:?}", self.aux_cmd);
        if let Err(e) = self.port.write(bytes) {
            warn!("aux write failed: {e}");
        }
        self.send_raw(b"\r");

        let now = self.clock.now();
        self.aux_deadline.arm(now, STANDARD_RSP_TIMEOUT);
        self.state = AtState::Programming;
        self.sub = SubState::AuxCmdEcho;
        true
    }

    // ── Tick ─────────────────────────────────────────────────────────

    pub(super) fn tick_programming(&mut self, now: std::time::Instant) {
        match self.sub {
            SubState::AuxCmdEcho => match self.poll_aux_echo() {
                Some(true) => self.finish_aux(AtState::Success),
                Some(false) => self.finish_aux(AtState::Failed),
                None => {}
            },
            SubState::AuxRingerStatus => self.poll_ringer_status(),
            SubState::AuxRelayStatus => self.poll_relay_status(),
            SubState::AuxVersionQuery => {
                if !self.collect_line(b'\r') {
                    return;
                }
                if self.line.as_text().contains(AUX_RSP_VERSION) {
                    self.aux_cmd = AuxCommand::LoadFlash;
                    self.send_aux_command();
                    self.sub = SubState::AuxProgBegin;
                } else {
                    log_error!("aux firmware version mismatch, not programming");
                    self.finish_aux(AtState::Failed);
                }
            }
            SubState::AuxProgBegin => match self.poll_aux_echo() {
                Some(true) => {
                    self.aux_gap.arm(now, PROG_LINE_GAP);
                    self.sub = SubState::AuxProgGap;
                }
                Some(false) => {
                    log_error!("aux board rejected flash reload");
                    self.finish_aux(AtState::Failed);
                }
                None => {}
            },
            SubState::AuxProgGap => {
                if !self.aux_gap.take_expired(now) {
                    return;
                }
                match self.hooks.next_config_line() {
                    Some(cfg_line) => {
                        self.clear_buffers(PortRouting::Programming);
                        if let Err(e) = self.port.write(cfg_line.as_bytes()) {
                            warn!("aux config line write failed: {e}");
                        }
                        self.aux_deadline.arm(now, STANDARD_RSP_TIMEOUT);
                        self.sub = SubState::AuxProgRsp;
                    }
                    None => {
                        // Out of lines with no terminal status byte: the
                        // upload is complete.
                        self.finish_aux(AtState::Success);
                    }
                }
            }
            SubState::AuxProgRsp => {
                let Some(status) = self.port.read_byte() else {
                    return;
                };
                match status {
                    PROG_BAD_CHECKSUM | PROG_BAD_CHAR | PROG_BAD_FORMAT => {
                        // Recoverable: cancel, rewind, redo the handshake.
                        debug!("aux programming error {:?}, restarting", status as char);
                        if let Err(e) = self.port.write(AuxCommand::CancelLoadFlash.bytes()) {
                            warn!("aux cancel write failed: {e}");
                        }
                        self.aux_deadline.arm(now, STANDARD_RSP_TIMEOUT);
                        self.hooks.reset_config_index();
                        self.aux_cmd = AuxCommand::VersionCheck;
                        self.send_aux_command();
                        self.sub = SubState::AuxVersionQuery;
                    }
                    PROG_MANUFACTURER_ERROR
                    | PROG_OUT_OF_FLASH
                    | PROG_PAGE_ERASE_ERROR
                    | PROG_PAGE_WRITE_ERROR
                    | PROG_BAD_HW_ID => {
                        log_error!(
                            "aux programming failed with status {:?}",
                            status as char
                        );
                        self.finish_aux(AtState::Failed);
                    }
                    PROG_BLOCK_PASSED => {
                        if self.port.read_byte() == Some(PROG_UPLOAD_SUCCESSFUL) {
                            self.finish_aux(AtState::Success);
                        } else {
                            self.aux_gap.arm(now, PROG_LINE_GAP);
                            self.sub = SubState::AuxProgGap;
                        }
                    }
                    _ => {}
                }
            }
            SubState::AuxDownloadEcho => match self.poll_aux_echo() {
                Some(true) => {
                    // The dump takes tens of seconds at this baud rate.
                    self.aux_deadline.arm(now, SATELLITE_RSP_TIMEOUT);
                    self.cfg_download.clear();
                    self.sub = SubState::AuxDownloadCapture;
                }
                Some(false) => self.finish_aux(AtState::Failed),
                None => {}
            },
            SubState::AuxDownloadCapture => {
                self.hooks.kick_watchdog();
                while self.cfg_download.len() < MAX_CFG_DOWNLOAD_SIZE {
                    let Some(byte) = self.port.read_byte() else {
                        return;
                    };
                    self.cfg_download.push(byte);
                }
                let image = std::mem::take(&mut self.cfg_download);
                self.hooks.commit_aux_config(&image);
                self.finish_aux(AtState::Success);
            }
            _ => {}
        }
    }

    /// Terminal transition out of PROGRAMMING: data routing restored first.
    fn finish_aux(&mut self, state: AtState) {
        self.port.set_routing(PortRouting::Data);
        self.aux_deadline.stop();
        self.aux_gap.stop();
        self.pair = None;
        self.state = state;
    }

    /// Dual-EOL echo check: `CMD:` header, then the echoed command bytes.
    fn poll_aux_echo(&mut self) -> Option<bool> {
        let terminator = self.aux_cmd.echo_terminator();
        loop {
            let byte = self.port.read_byte()?;
            let done = self.line.feed_dual(byte, b':', terminator) == Assembly::Complete;
            if self.line.take_overflow() {
                self.error_code = ErrorCode::RxBufferOverflow;
            }
            if done {
                let cmd = self.aux_cmd.bytes();
                let echoed = self.line.bytes().windows(cmd.len()).any(|w| w == cmd);
                if !echoed {
                    debug!("aux echo mismatch for {:?}", self.aux_cmd);
                }
                return Some(echoed);
            }
        }
    }

    fn poll_ringer_status(&mut self) {
        while let Some(byte) = self.port.read_byte() {
            let hit = match self.pair.as_mut() {
                Some(pair) => pair.feed(byte),
                None => return,
            };
            if let Some(hit) = hit {
                if hit == 0 {
                    self.error_code = ErrorCode::AuxRingerOff;
                    self.info.ringers_on = false;
                } else {
                    self.error_code = ErrorCode::AuxRingerOn;
                    self.info.ringers_on = true;
                }
                self.finish_aux(AtState::Success);
                return;
            }
        }
    }

    fn poll_relay_status(&mut self) {
        while let Some(byte) = self.port.read_byte() {
            let hit = match self.pair.as_mut() {
                Some(pair) => pair.feed(byte),
                None => return,
            };
            if let Some(hit) = hit {
                let relay = self.info.current_relay;
                let on = hit == 1;
                self.info.relay_on[relay] = RelayState::from_bool(on);
                self.error_code = match (relay, on) {
                    (RELAY_1, false) => ErrorCode::AuxRelay1Off,
                    (RELAY_1, true) => ErrorCode::AuxRelay1On,
                    (_, false) => ErrorCode::AuxRelay2Off,
                    (_, true) => ErrorCode::AuxRelay2On,
                };
                self.finish_aux(AtState::Success);
                return;
            }
        }
    }
}
