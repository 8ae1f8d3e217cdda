//! The protocol engine (middle layer).
//!
//! One command at a time is driven to completion against the modem or the
//! aux board; the upper layer polls `at_state()` for the terminal outcome
//! and acknowledges it with `set_idle()` / `set_initting()`. The engine owns
//! the shared serial line, the line-assembly buffer, the two response
//! deadlines, and the cached device state.
//!
//! Everything happens inside `tick()`; nothing blocks. When the next byte or
//! deadline is not available yet, the tick simply returns.

pub mod command;
pub mod error;
pub mod info;
pub mod line;
pub mod parsers;

mod aux;

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, error as log_error, info as log_info, warn};

use crate::clock::{Clock, Deadline};
use crate::hooks::{AckCode, SystemHooks};
use crate::log::LinkEvent;
use crate::mt::{self, Disposition, MtAction, MtClass, MtReceipt};
use crate::power::PowerManager;
use crate::spool::Spool;
use crate::transport::{PortRouting, SerialPort};
use crate::util::printable;

use command::{
    AtCommand, AuxCommand, TimeoutClass, MAX_RX_LEN, MAX_TX_LEN, RSP_CLEAR_FAIL, RSP_ERROR,
    RSP_OK, RSP_READY, RSP_WB_BAD_CHECKSUM, RSP_WB_BAD_SIZE, RSP_WB_TIMEOUT,
    SATELLITE_RSP_TIMEOUT, STANDARD_RSP_TIMEOUT,
};
use error::ErrorCode;
use info::{CallStatus, MailboxStatus, ModemInfo, RelayState};
use line::{Assembly, LineBuffer, PairMatcher};

const CARRIAGE_RETURN: u8 = b'\r';
const LINE_FEED: u8 = b'\n';

/// IMEI placeholder until the modem reports one.
pub const ERROR_IMEI: &str = "000000000000000";

/// Bytes to drain after the version banner (the `AT+CGMR` response runs to
/// roughly 145 bytes of hardware detail nothing needs).
const REVISION_RSP_LEN: usize = 145;

/// The engine's outer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtState {
    PoweredDown,
    Initting,
    Idle,
    Sending,
    Rcving,
    Programming,
    Success,
    Failed,
    TimedOut,
}

/// The step within the current multi-step exchange. Only meaningful in
/// INITTING / SENDING / RCVING / PROGRAMMING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    None,
    // Initialization sequence
    InitImei,
    InitMtAlertSend,
    InitMtAlert,
    InitAutoRegSend,
    InitAutoReg,
    InitFirstSbdixSend,
    InitFirstSbdix,
    InitFinalOk,
    InitVersion,
    // Modem exchanges
    SendTextMsg,
    WaitReady,
    WaitTrailingOk,
    ClearMoBuffer,
    WaitSbdixResult,
    WaitSbdsx,
    WaitCsq,
    WaitCreg,
    WaitCallStatus,
    WaitHangup,
    HandleFinalOk,
    // MT binary read
    GetData,
    MtFinish,
    // Aux board
    AuxCmdEcho,
    AuxRingerStatus,
    AuxRelayStatus,
    AuxVersionQuery,
    AuxProgBegin,
    AuxProgGap,
    AuxProgRsp,
    AuxDownloadEcho,
    AuxDownloadCapture,
}

/// MT binary read accumulation.
#[derive(Default)]
struct MtRx {
    buf: Vec<u8>,
    expected: usize,
    checksum: u16,
}

pub struct ProtocolEngine<P: SerialPort> {
    port: P,
    clock: Box<dyn Clock>,
    power: Box<dyn PowerManager>,
    hooks: Box<dyn SystemHooks>,
    spool: Spool,

    state: AtState,
    sub: SubState,
    error_code: ErrorCode,
    prev_voice: bool,

    line: LineBuffer,
    pair: Option<PairMatcher>,

    rsp_deadline: Deadline,
    aux_deadline: Deadline,
    aux_gap: Deadline,

    pub(crate) info: ModemInfo,
    tx_buf: Vec<u8>,
    rx: MtRx,
    cfg_download: Vec<u8>,

    imei: String,
    sw_version: String,
    satellite_timeout: Duration,

    aux_cmd: AuxCommand,
    notification_mode: mt::NotificationMode,

    receipt: Option<MtReceipt>,
    log_events: Vec<LinkEvent>,
}

impl<P: SerialPort> ProtocolEngine<P> {
    pub fn new(
        port: P,
        clock: Box<dyn Clock>,
        power: Box<dyn PowerManager>,
        hooks: Box<dyn SystemHooks>,
        spool: Spool,
        notification_mode: mt::NotificationMode,
    ) -> Self {
        let stored_imei = hooks
            .stored_imei()
            .unwrap_or_else(|| ERROR_IMEI.to_string());
        Self {
            port,
            clock,
            power,
            hooks,
            spool,
            // The state machine brings us out once modem power is good.
            state: AtState::PoweredDown,
            sub: SubState::None,
            error_code: ErrorCode::None,
            prev_voice: false,
            line: LineBuffer::new(),
            pair: None,
            rsp_deadline: Deadline::default(),
            aux_deadline: Deadline::default(),
            aux_gap: Deadline::default(),
            info: ModemInfo::default(),
            tx_buf: Vec::new(),
            rx: MtRx::default(),
            cfg_download: Vec::new(),
            // The stored copy is served until the modem reports its own.
            imei: stored_imei,
            sw_version: String::new(),
            satellite_timeout: SATELLITE_RSP_TIMEOUT,
            aux_cmd: AuxCommand::Reset,
            notification_mode,
            receipt: None,
            log_events: Vec::new(),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn at_state(&self) -> AtState {
        self.state
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Reason for the last failure. Read-once: resets to `None`.
    pub fn error_code(&mut self) -> ErrorCode {
        std::mem::take(&mut self.error_code)
    }

    /// MT-buffer status from the last session. Read-once; a failed check
    /// with a pending ring alert bumps the queue count so the alert is not
    /// lost. `mt_length` is preserved — the reader needs it.
    pub fn mailbox_status(&mut self) -> MailboxStatus {
        let status = self.info.mt_status;
        if status == MailboxStatus::Failed && self.info.ra_flag != 0 {
            self.info.mt_queue_nbr = self.info.mt_queue_nbr.saturating_add(1);
        }
        self.info.mt_status = MailboxStatus::None;
        self.info.ra_flag = 0;
        status
    }

    pub fn signal_strength(&self) -> i16 {
        self.info.signal_strength
    }

    /// Clear the cached signal reading; called when the upper layer gives up
    /// on the debounce.
    pub fn clear_signal_strength(&mut self) {
        self.info.signal_strength = -1;
    }

    pub fn call_status(&self) -> CallStatus {
        self.info.call_status
    }

    pub fn ringer_cached(&self) -> bool {
        self.info.ringers_on
    }

    pub fn relay_cached(&self, relay: usize) -> RelayState {
        self.info.relay_on[relay]
    }

    pub fn imei(&self) -> &str {
        &self.imei
    }

    pub fn modem_sw_version(&self) -> &str {
        &self.sw_version
    }

    pub fn mo_msn(&self) -> &str {
        &self.info.mo_msn
    }

    pub fn mt_msn(&self) -> &str {
        &self.info.mt_msn
    }

    /// DSR high — a voice call holds the line. RI is deliberately not part
    /// of this check: a power-cycle glitch or gateway queue can pulse RI
    /// falsely, and the modem reports busy on its own if it matters.
    pub fn in_voice_call(&self) -> bool {
        self.port.dsr()
    }

    pub fn ring_indicator(&self) -> bool {
        self.port.ri()
    }

    pub fn aux_powered(&self) -> bool {
        self.port.aux_powered()
    }

    pub fn set_satellite_timeout(&mut self, timeout: Duration) {
        self.satellite_timeout = timeout;
    }

    pub fn satellite_timeout(&self) -> Duration {
        self.satellite_timeout
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    pub fn take_receipt(&mut self) -> Option<MtReceipt> {
        self.receipt.take()
    }

    /// Events raised inside the engine for the upper layer's log.
    pub fn take_log_events(&mut self) -> Vec<LinkEvent> {
        std::mem::take(&mut self.log_events)
    }

    pub fn power_cycle_aux(&mut self) -> bool {
        self.power.power_cycle_aux()
    }

    pub fn power_cycle_modem(&mut self) -> bool {
        self.power.power_cycle_modem()
    }

    pub(crate) fn hooks_mut(&mut self) -> &mut dyn SystemHooks {
        self.hooks.as_mut()
    }

    // ── Upper-layer state control ────────────────────────────────────

    /// Acknowledge a terminal outcome and return to IDLE.
    pub fn set_idle(&mut self) {
        self.state = AtState::Idle;
        self.sub = SubState::None;
        self.clear_buffers(PortRouting::Data);
        self.rsp_deadline.stop();
        self.aux_deadline.stop();
        self.aux_gap.stop();
    }

    /// Force the engine back through initialization (via POWERED_DOWN, so
    /// the IMEI step runs again once power is seen).
    pub fn set_initting(&mut self) {
        self.state = AtState::PoweredDown;
        self.sub = SubState::None;
        self.clear_buffers(PortRouting::Data);
        self.rsp_deadline.stop();
        self.aux_deadline.stop();
        self.aux_gap.stop();
    }

    /// Power-cycle the modem. Fails (state unchanged) while a voice call is
    /// in progress or when power control refuses.
    pub fn reset(&mut self) -> bool {
        if self.in_voice_call() {
            return false;
        }
        if !self.power.power_cycle_modem() {
            return false;
        }
        self.rsp_deadline.stop();
        self.clear_buffers(PortRouting::Data);
        self.info.clear_preserving_aux();
        self.state = AtState::PoweredDown;
        self.sub = SubState::None;
        self.error_code = ErrorCode::None;
        true
    }

    // ── Dispatch API (precondition: IDLE unless noted) ───────────────

    /// `AT+SBDWT=<text>` — send a short text message. The text must not
    /// contain CR or LF.
    pub fn send_text(&mut self, text: &str) -> bool {
        if self.state != AtState::Idle {
            return false;
        }

        self.clear_buffers(PortRouting::Data);
        let mut cmd = Vec::with_capacity(AtCommand::WriteText.bytes().len() + text.len() + 1);
        cmd.extend_from_slice(AtCommand::WriteText.bytes());
        cmd.extend_from_slice(text.as_bytes());
        cmd.push(CARRIAGE_RETURN);
        self.send_raw(&cmd);

        self.state = AtState::Sending;
        self.sub = SubState::SendTextMsg;
        self.arm_rsp(STANDARD_RSP_TIMEOUT);
        true
    }

    /// Stage a binary payload and begin the upload mini-protocol.
    pub fn send_binary_buffer(&mut self, data: &[u8]) -> bool {
        if self.state != AtState::Idle {
            return false;
        }
        if data.is_empty() {
            self.error_code = ErrorCode::TxBinDataBadSize;
            return false;
        }

        let mut len = data.len();
        if len > MAX_TX_LEN {
            len = MAX_TX_LEN;
            self.error_code = ErrorCode::TruncatedFile;
        }
        self.tx_buf.clear();
        self.tx_buf.extend_from_slice(&data[..len]);
        self.info.tx_msg_len = len;

        self.send_write_binary_cmd();
        self.state = AtState::Sending;
        self.sub = SubState::WaitReady;
        self.arm_rsp(STANDARD_RSP_TIMEOUT);
        true
    }

    /// Read a spooled file and begin the upload mini-protocol.
    pub fn send_binary_file(&mut self, path: &Path) -> bool {
        if self.state != AtState::Idle {
            return false;
        }

        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                self.error_code = ErrorCode::FileOpenErr;
                log_error!("cannot read {}: {e}", path.display());
                return false;
            }
        };

        self.send_binary_buffer(&data)
    }

    /// `AT+SBDSX` — ask the gateway whether MT traffic is waiting.
    pub fn check_gateway(&mut self) -> bool {
        if self.state != AtState::Idle {
            return false;
        }
        self.dispatch_at(AtCommand::SbdStatus);
        self.state = AtState::Sending;
        self.sub = SubState::WaitSbdsx;
        true
    }

    /// `AT+SBDD0` then an empty session — pull queued MT traffic down.
    pub fn check_mailbox(&mut self) -> bool {
        if self.state != AtState::Idle {
            return false;
        }
        self.dispatch_at(AtCommand::ClearMoBuffer);
        self.state = AtState::Sending;
        self.sub = SubState::ClearMoBuffer;
        true
    }

    /// `AT+CSQF` — signal-quality probe.
    pub fn send_csq(&mut self) -> bool {
        if self.state != AtState::Idle {
            return false;
        }
        self.dispatch_at(AtCommand::SignalStrength);
        self.state = AtState::Sending;
        self.sub = SubState::WaitCsq;
        true
    }

    /// `AT+SBDRB` — download the MT message held in the modem buffer.
    pub fn read_binary(&mut self) -> bool {
        if self.state != AtState::Idle {
            return false;
        }
        self.dispatch_at(AtCommand::ReadBinary);
        self.rx.buf.clear();
        self.rx.checksum = 0;
        self.rx.expected = usize::from(self.info.mt_length) + 4;
        self.state = AtState::Rcving;
        self.sub = SubState::GetData;
        true
    }

    /// `AT+CLCC` — current call status probe.
    pub fn send_call_status(&mut self) -> bool {
        if self.state != AtState::Idle {
            return false;
        }
        self.dispatch_at(AtCommand::CallStatus);
        self.info.call_status = CallStatus::Invalid;
        self.state = AtState::Sending;
        self.sub = SubState::WaitCallStatus;
        true
    }

    /// `AT+CHUP` — hang up the voice call.
    pub fn send_hangup(&mut self) -> bool {
        if self.state != AtState::Idle {
            return false;
        }
        self.dispatch_at(AtCommand::Hangup);
        self.state = AtState::Sending;
        self.sub = SubState::WaitHangup;
        true
    }

    /// `AT+CREG?` — network registration probe.
    pub fn send_creg(&mut self) -> bool {
        if self.state != AtState::Idle {
            return false;
        }
        self.dispatch_at(AtCommand::NetworkReg);
        self.state = AtState::Sending;
        self.sub = SubState::WaitCreg;
        true
    }

    // ── Tick ─────────────────────────────────────────────────────────

    pub fn tick(&mut self) {
        let now = self.clock.now();

        // Loss of modem power forces POWERED_DOWN immediately — unless the
        // aux board is mid-exchange; modem and aux are powered separately
        // and the aux conversation can continue.
        if !self.port.modem_powered() && self.state != AtState::Programming {
            if self.state != AtState::PoweredDown {
                debug!("engine: modem power lost");
            }
            self.clear_buffers(PortRouting::Data);
            self.info.clear_preserving_aux();
            self.rx = MtRx::default();
            self.rsp_deadline.stop();
            self.state = AtState::PoweredDown;
            self.sub = SubState::None;
            self.error_code = ErrorCode::None;
        }

        // The response deadline is armed only while a command is in flight,
        // so expiry always means the reply never finished.
        if self.rsp_deadline.expired(now) {
            self.rsp_deadline.stop();
            self.port.set_routing(PortRouting::Data);
            warn!(
                "engine: response timeout in {:?}, buffered {:?}",
                self.sub,
                printable(self.line.bytes())
            );
            if self.sub == SubState::WaitSbdsx {
                self.info.mt_status = MailboxStatus::Failed;
            }
            // The two background probes time out silently.
            if self.sub != SubState::WaitSbdsx && self.sub != SubState::WaitCsq {
                self.error_code = ErrorCode::RspTimedOut;
            }
            self.state = AtState::TimedOut;
        }

        // Loss of aux power aborts a programming exchange the same way.
        if !self.port.aux_powered() && self.state == AtState::Programming {
            debug!("engine: aux power lost during programming");
            self.clear_buffers(PortRouting::Data);
            self.info.clear_preserving_aux();
            self.aux_deadline.stop();
            self.aux_gap.stop();
            self.state = AtState::PoweredDown;
            self.sub = SubState::None;
            self.error_code = ErrorCode::None;
        }

        if self.aux_deadline.expired(now) {
            self.aux_deadline.stop();
            self.aux_gap.stop();
            warn!("engine: aux response timeout ({:?})", self.aux_cmd);
            self.error_code = ErrorCode::RspTimedOut;
            self.port.set_routing(PortRouting::Data);
            self.state = AtState::TimedOut;
        }

        match self.state {
            AtState::PoweredDown => self.tick_powered_down(),
            AtState::Initting => self.tick_initting(),
            AtState::Sending => self.tick_sending(),
            AtState::Rcving => self.tick_rcving(),
            AtState::Programming => self.tick_programming(now),
            // Terminal states wait for the upper layer's acknowledgment.
            AtState::Idle | AtState::Success | AtState::Failed | AtState::TimedOut => {}
        }
    }

    fn tick_powered_down(&mut self) {
        if !self.port.modem_powered() {
            return;
        }
        if self.voice_call_edges() {
            return;
        }
        self.dispatch_at(AtCommand::SerialNumber);
        self.state = AtState::Initting;
        self.sub = SubState::InitImei;
    }

    fn tick_initting(&mut self) {
        match self.sub {
            SubState::InitImei => {
                if !self.collect_line(CARRIAGE_RETURN) {
                    return;
                }
                let text = self.line.as_text();
                if let Some(imei) = parsers::parse_imei(&text) {
                    if self.hooks.stored_imei().as_deref() != Some(imei.as_str()) {
                        log_info!("IMEI changed, persisting {imei}");
                        self.hooks.persist_imei(&imei);
                    }
                    self.imei = imei;
                    self.rsp_deadline.stop();
                    self.sub = SubState::InitMtAlertSend;
                } else {
                    self.imei = ERROR_IMEI.to_string();
                    self.rsp_deadline.stop();
                    self.state = AtState::Failed;
                }
            }
            SubState::InitMtAlertSend => {
                if self.voice_call_edges() {
                    return;
                }
                // Consume the stray 0/4 left over from the IMEI response.
                let _ = self.port.read_byte();
                self.dispatch_at(AtCommand::MtAlert);
                self.sub = SubState::InitMtAlert;
            }
            SubState::InitMtAlert => match self.get_last_rsp() {
                Some(Ok(())) => {
                    self.rsp_deadline.stop();
                    self.sub = SubState::InitAutoRegSend;
                }
                Some(Err(code)) => {
                    self.error_code = code;
                    self.rsp_deadline.stop();
                    self.sub = SubState::InitMtAlertSend;
                }
                None => {}
            },
            SubState::InitAutoRegSend => {
                if self.voice_call_edges() {
                    return;
                }
                self.dispatch_at(AtCommand::AutoReg);
                self.sub = SubState::InitAutoReg;
            }
            SubState::InitAutoReg => match self.get_last_rsp() {
                Some(Ok(())) => {
                    self.rsp_deadline.stop();
                    self.sub = SubState::InitFirstSbdixSend;
                }
                Some(Err(code)) => {
                    // Restart from the MT-alert step.
                    self.error_code = code;
                    self.rsp_deadline.stop();
                    self.sub = SubState::InitMtAlertSend;
                }
                None => {}
            },
            SubState::InitFirstSbdixSend => {
                if self.voice_call_edges() {
                    return;
                }
                // First registration session; also downloads anything queued.
                self.send_session();
                self.sub = SubState::InitFirstSbdix;
            }
            SubState::InitFirstSbdix => match self.poll_sbdix() {
                Some(true) => self.sub = SubState::InitFinalOk,
                Some(false) => {
                    self.rsp_deadline.stop();
                    self.sub = SubState::InitAutoRegSend;
                }
                None => {}
            },
            SubState::InitFinalOk => match self.get_last_rsp() {
                Some(Ok(())) => {
                    self.rsp_deadline.stop();
                    self.dispatch_at(AtCommand::Revision);
                    self.sub = SubState::InitVersion;
                }
                Some(Err(_)) => {
                    self.rsp_deadline.stop();
                    self.sub = SubState::InitFirstSbdixSend;
                }
                None => {}
            },
            SubState::InitVersion => {
                if !self.collect_line(CARRIAGE_RETURN) {
                    return;
                }
                let text = self.line.as_text();
                if let Some(version) = parsers::parse_revision(&text) {
                    self.sw_version = version;
                    // Drain the rest of the hardware banner.
                    for _ in 0..REVISION_RSP_LEN {
                        if self.port.read_byte().is_none() {
                            break;
                        }
                    }
                    self.rsp_deadline.stop();
                    self.state = AtState::Success;
                } else {
                    self.rsp_deadline.stop();
                    self.dispatch_at(AtCommand::Revision);
                }
            }
            _ => {}
        }
    }

    fn tick_sending(&mut self) {
        match self.sub {
            SubState::SendTextMsg | SubState::WaitTrailingOk | SubState::ClearMoBuffer => {
                match self.get_last_rsp() {
                    Some(Ok(())) => {
                        if self.sub == SubState::SendTextMsg && self.voice_call_edges() {
                            // The line is in use; the session would collide
                            // with the call. Report failure, the upper layer
                            // retries.
                            self.rsp_deadline.stop();
                            self.state = AtState::Failed;
                            return;
                        }
                        self.send_session();
                        self.sub = SubState::WaitSbdixResult;
                    }
                    Some(Err(code)) => {
                        self.error_code = code;
                        self.rsp_deadline.stop();
                        self.state = AtState::Failed;
                    }
                    None => {}
                }
            }
            SubState::WaitReady => match self.poll_ready() {
                Some(Ok(())) => {
                    self.send_payload_with_checksum();
                    self.sub = SubState::WaitTrailingOk;
                }
                Some(Err(code)) => {
                    self.error_code = code;
                    self.rsp_deadline.stop();
                    self.state = AtState::Failed;
                }
                None => {}
            },
            SubState::WaitSbdixResult => match self.poll_sbdix() {
                Some(true) => self.sub = SubState::HandleFinalOk,
                Some(false) => {
                    self.rsp_deadline.stop();
                    self.state = AtState::Failed;
                }
                None => {}
            },
            SubState::WaitSbdsx => self.poll_sbdsx(),
            SubState::WaitCsq => self.poll_csq(),
            SubState::WaitCreg => self.poll_creg(),
            SubState::WaitCallStatus => self.poll_call_status(),
            SubState::WaitHangup => match self.get_last_rsp() {
                Some(Ok(())) => {
                    self.rsp_deadline.stop();
                    self.state = AtState::Success;
                }
                Some(Err(code)) => {
                    self.error_code = code;
                    self.rsp_deadline.stop();
                    self.state = AtState::Failed;
                }
                None => {}
            },
            SubState::HandleFinalOk => match self.get_last_rsp() {
                Some(Ok(())) => {
                    self.rsp_deadline.stop();
                    self.state = AtState::Success;
                }
                Some(Err(code)) => {
                    self.error_code = code;
                    self.rsp_deadline.stop();
                    self.state = AtState::Failed;
                }
                None => {}
            },
            _ => {}
        }
    }

    fn tick_rcving(&mut self) {
        match self.sub {
            SubState::GetData => {
                while self.rx.buf.len() < self.rx.expected {
                    let Some(byte) = self.port.read_byte() else {
                        return;
                    };
                    let at = self.rx.buf.len();
                    // Checksum covers the payload only, not the length word
                    // or the trailing checksum itself.
                    if at >= 2 && at < 2 + usize::from(self.info.mt_length) {
                        self.rx.checksum = self.rx.checksum.wrapping_add(u16::from(byte));
                    }
                    self.rx.buf.push(byte);
                }
                self.sub = SubState::MtFinish;
            }
            SubState::MtFinish => {
                // Consume the trailing generic result code; its value does
                // not change the outcome.
                if self.port.read_byte().is_none() {
                    return;
                }
                let outcome = self.finish_mt_read();
                self.rsp_deadline.stop();
                self.state = if outcome {
                    AtState::Success
                } else {
                    AtState::Failed
                };
            }
            _ => {}
        }
    }

    // ── Response polling helpers ─────────────────────────────────────

    /// Generic single-byte result: `0` OK, `1` clear-fail, `4` ERROR.
    fn get_last_rsp(&mut self) -> Option<Result<(), ErrorCode>> {
        match self.port.read_byte()? {
            RSP_OK => Some(Ok(())),
            RSP_CLEAR_FAIL => Some(Err(ErrorCode::ClearModemBufferError)),
            RSP_ERROR => Some(Err(ErrorCode::Error)),
            _ => None,
        }
    }

    /// `AT+SBDWB` first response: `READY`, or a numeric verdict.
    fn poll_ready(&mut self) -> Option<Result<(), ErrorCode>> {
        if !self.collect_line(LINE_FEED) {
            return None;
        }
        let text = self.line.as_text();
        if text.contains(RSP_READY) {
            return Some(Ok(()));
        }
        debug!("waiting for READY, got {:?}", printable(self.line.bytes()));
        match self.line.bytes().first().copied() {
            Some(RSP_OK) => Some(Ok(())),
            Some(RSP_WB_TIMEOUT) => Some(Err(ErrorCode::TxBinDataTimeout)),
            Some(RSP_WB_BAD_CHECKSUM) => Some(Err(ErrorCode::TxBinDataBadChecksum)),
            Some(RSP_WB_BAD_SIZE) => Some(Err(ErrorCode::TxBinDataBadSize)),
            _ => None,
        }
    }

    /// Shared `+SBDIX:` handling. `Some(true)` on a success-class MO status.
    fn poll_sbdix(&mut self) -> Option<bool> {
        if !self.collect_line(LINE_FEED) {
            return None;
        }
        let text = self.line.as_text();
        let fields = parsers::parse_sbdix(&text)?;

        self.info.mo_status = fields.mo_status;
        self.info.mo_msn = fields.mo_msn;
        self.info.mt_msn = fields.mt_msn;
        self.info.mt_status = match fields.mt_status {
            0 => MailboxStatus::None,
            1 => MailboxStatus::Success,
            _ => MailboxStatus::Failed,
        };

        match parsers::classify_mo_status(fields.mo_status) {
            Ok(()) => {
                // Only a successful session reports real values here.
                self.info.mt_length = fields.mt_length;
                self.info.mt_queue_nbr = fields.mt_queue_nbr;
                Some(true)
            }
            Err(code) => {
                if code == ErrorCode::SbdiSbdBlocked {
                    // Hardware-class fault, surfaced beyond the modem log.
                    log_error!("SBD service blocked by the gateway");
                }
                self.error_code = code;
                Some(false)
            }
        }
    }

    fn poll_sbdsx(&mut self) {
        if !self.collect_line(LINE_FEED) {
            return;
        }
        let text = self.line.as_text();
        let Some(fields) = parsers::parse_sbdsx(&text) else {
            return;
        };

        // Only the ring-alert flag is current; the other fields echo the
        // previous session. The queue count is taken when nothing newer is
        // known.
        self.info.ra_flag = fields.ra_flag;

        if fields.ra_flag == 1 || self.info.mt_queue_nbr != 0 {
            self.sub = SubState::HandleFinalOk;
        } else if fields.queued != 0 {
            self.info.mt_queue_nbr = fields.queued;
            self.sub = SubState::HandleFinalOk;
        } else {
            self.rsp_deadline.stop();
            self.state = AtState::Failed;
        }
    }

    fn poll_csq(&mut self) {
        if !self.collect_line(LINE_FEED) {
            // An ERROR verdict arrives with a bare CR terminator, so it
            // never completes the LF-terminated line.
            if self.line.bytes() == b"4" {
                self.error_code = ErrorCode::Error;
                self.rsp_deadline.stop();
                self.state = AtState::Failed;
            }
            return;
        }
        let text = self.line.as_text();
        let Some(level) = parsers::parse_csq(&text) else {
            return;
        };
        self.info.signal_strength = i16::from(level);
        if level == 0 {
            // Level 0 is "no service": the reading is kept, the probe fails.
            self.rsp_deadline.stop();
            self.state = AtState::Failed;
        } else {
            self.sub = SubState::HandleFinalOk;
        }
    }

    fn poll_creg(&mut self) {
        if !self.collect_line(LINE_FEED) {
            return;
        }
        let text = self.line.as_text();
        let Some((_, status)) = parsers::parse_creg(&text) else {
            return;
        };
        match parsers::classify_creg(status) {
            Some(Ok(code)) => {
                self.error_code = code;
                self.sub = SubState::HandleFinalOk;
            }
            Some(Err(code)) => {
                self.error_code = code;
                self.rsp_deadline.stop();
                self.state = AtState::Failed;
            }
            // Unrecognized status byte: keep polling, the timeout decides.
            None => {}
        }
    }

    fn poll_call_status(&mut self) {
        if !self.collect_line(LINE_FEED) {
            return;
        }
        let text = self.line.as_text();
        let Some(code) = parsers::parse_clcc(&text) else {
            return;
        };
        let status = CallStatus::from_code(code);
        if status == CallStatus::Invalid {
            return;
        }
        self.info.call_status = status;
        match status {
            CallStatus::Dialing => {
                // Busy dialing — could mean a hung modem; the upper layer
                // decides.
                self.error_code = ErrorCode::DialingCallStatus;
                self.rsp_deadline.stop();
                self.state = AtState::Failed;
            }
            CallStatus::Active => {
                self.error_code = ErrorCode::ActiveCallStatus;
                self.sub = SubState::HandleFinalOk;
            }
            CallStatus::Held => {
                self.error_code = ErrorCode::HeldCallStatus;
                self.sub = SubState::HandleFinalOk;
            }
            CallStatus::Incoming => {
                self.error_code = ErrorCode::IncomingCallStatus;
                self.sub = SubState::HandleFinalOk;
            }
            CallStatus::Waiting => {
                self.error_code = ErrorCode::WaitingCallStatus;
                self.sub = SubState::HandleFinalOk;
            }
            CallStatus::Idle | CallStatus::Invalid => {
                self.sub = SubState::HandleFinalOk;
            }
        }
    }

    // ── MT read completion ───────────────────────────────────────────

    fn finish_mt_read(&mut self) -> bool {
        let mut ok = true;

        let wire_len = match self.rx.buf.get(0..2) {
            Some(b) => u16::from_be_bytes([b[0], b[1]]),
            None => 0,
        };
        let rx_checksum = if self.rx.buf.len() >= 2 {
            let tail = &self.rx.buf[self.rx.buf.len() - 2..];
            u16::from_be_bytes([tail[0], tail[1]])
        } else {
            0
        };

        if wire_len == 0 {
            self.error_code = ErrorCode::RxNoMsgWaiting;
            ok = false;
            self.log_events.push(LinkEvent::ReceiveFailure);
        } else if usize::from(wire_len) > MAX_RX_LEN {
            // The modem should never let this through; clamp to the length
            // the session reported.
            self.error_code = ErrorCode::RxBadFilelength;
        }

        if self.rx.checksum != rx_checksum {
            self.error_code = ErrorCode::RxBadChecksum;
            warn!(
                "MT checksum mismatch: calculated {:04X}, expected {rx_checksum:04X}",
                self.rx.checksum
            );
            ok = false;
        }

        if self.info.mt_length != 0 {
            let payload_len = usize::from(self.info.mt_length);
            let payload: Vec<u8> = self
                .rx
                .buf
                .get(2..2 + payload_len)
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            let msg_type = mt::message_type(&payload);

            let receipt = match mt::classify(msg_type) {
                MtClass::Action(action) => {
                    self.run_mt_action(action, msg_type, &payload);
                    MtReceipt {
                        msg_type,
                        disposition: Disposition::BufferOnly,
                        ok,
                        label: format!("mt type {msg_type:#06x}"),
                        copy_ok: None,
                        notify: mt::NotifyDecision::default(),
                        start_aux_upload: action == MtAction::DownloadAuxConfig,
                    }
                }
                MtClass::Route(disposition, mut device, mut subdir) => {
                    if !ok {
                        // A damaged message still lands on disk, but in the
                        // error tree where nothing consumes it.
                        device = mt::DeviceDir::Modem;
                        subdir = mt::SubDir::Error;
                    }
                    let system_name = mt::uses_system_filename(msg_type);
                    let mut label = format!("mt type {msg_type:#06x}");
                    let mut copy_ok = None;

                    match self
                        .spool
                        .save_mt(&payload, msg_type, device, subdir, system_name)
                    {
                        Ok(path) => {
                            label = path.display().to_string();
                            if ok && disposition == Disposition::CopyPort3 {
                                copy_ok = Some(self.spool.copy_to_port3(&path, subdir).is_ok());
                            }
                        }
                        Err(e) => {
                            self.error_code = ErrorCode::FileWriteErr;
                            ok = false;
                            log_error!("cannot save MT message: {e}");
                        }
                    }

                    let notify = if ok {
                        mt::notification_decision(
                            self.notification_mode,
                            disposition,
                            device,
                            subdir,
                        )
                    } else {
                        mt::NotifyDecision::default()
                    };

                    MtReceipt {
                        msg_type,
                        disposition,
                        ok,
                        label,
                        copy_ok,
                        notify,
                        start_aux_upload: false,
                    }
                }
            };
            self.receipt = Some(receipt);
        }

        // Stop the read loop from re-triggering on the same length.
        self.info.mt_length = 0;
        ok
    }

    fn run_mt_action(&mut self, action: MtAction, msg_type: u16, payload: &[u8]) {
        let date_time = mt::date_time(payload);
        match action {
            MtAction::PrepareGracefulReset => {
                self.hooks.set_reset_cmd_time(date_time);
                self.hooks.prepare_remote_reset(true);
            }
            MtAction::PrepareAbruptReset => {
                self.hooks.set_reset_cmd_time(date_time);
                self.hooks.prepare_remote_reset(false);
            }
            MtAction::BuildRoiAck => self.hooks.build_roi_ack(date_time),
            MtAction::ConfigRequest => {
                self.hooks.set_remote_config_file_time(date_time);
                self.hooks.build_config_message();
            }
            MtAction::PowerCycleModem => {
                if self.reset() {
                    self.hooks.build_cmd_ack(msg_type, true, AckCode::Ok, date_time);
                } else {
                    self.hooks
                        .build_cmd_ack(msg_type, false, AckCode::InVoiceCall, date_time);
                }
            }
            MtAction::FormatStorage => self.hooks.format_storage_remotely(date_time),
            MtAction::PowerCycleAux => {
                if self.power.power_cycle_aux() {
                    self.hooks.build_cmd_ack(msg_type, true, AckCode::Ok, date_time);
                } else {
                    self.hooks.build_cmd_ack(
                        msg_type,
                        false,
                        AckCode::HardwareNotSupported,
                        date_time,
                    );
                }
            }
            MtAction::PurgeRulesFlash => {
                // The rules engine acks on success by itself.
                if !self.hooks.clear_rules_memory() {
                    self.hooks
                        .build_cmd_ack(msg_type, false, AckCode::BadHeaderStart, date_time);
                }
            }
            MtAction::PurgeRulesFile => {
                if self.hooks.delete_rules_file() {
                    self.hooks.build_cmd_ack(msg_type, true, AckCode::Ok, date_time);
                } else {
                    self.hooks
                        .build_cmd_ack(msg_type, false, AckCode::FileDoesNotExist, date_time);
                }
            }
            MtAction::DownloadAuxConfig => {
                // The upload itself is queued by the upper layer via the
                // receipt; ack right away.
                self.hooks.build_cmd_ack(msg_type, true, AckCode::Ok, date_time);
            }
            MtAction::BuildSystemLogMessage => self.hooks.build_system_log_message(date_time),
            MtAction::BuildModemLogMessage => self.hooks.build_modem_log_message(date_time),
            MtAction::BuildVersionMessage => self.hooks.build_version_message(date_time),
            MtAction::BuildGpsMessage => self.hooks.build_gps_message(date_time),
            MtAction::ResetDataBus => {
                if self.hooks.reset_data_bus() {
                    self.hooks.build_cmd_ack(msg_type, true, AckCode::Ok, date_time);
                } else {
                    self.hooks
                        .build_cmd_ack(msg_type, false, AckCode::BusDisabled, date_time);
                }
            }
            MtAction::LogsImmediately => {
                self.hooks
                    .prepare_log_transmission(date_time, true, mt::option_word(payload));
            }
            MtAction::LogsAfterFdr => {
                self.hooks
                    .prepare_log_transmission(date_time, false, mt::option_word(payload));
            }
        }
    }

    // ── Command transmission ─────────────────────────────────────────

    /// Flush, route to the modem, send a table command, and arm the response
    /// deadline by timeout class. Does not change states.
    fn dispatch_at(&mut self, cmd: AtCommand) {
        self.clear_buffers(PortRouting::Data);
        let lapse = match cmd.timeout_class() {
            TimeoutClass::Local => STANDARD_RSP_TIMEOUT,
            TimeoutClass::Satellite => self.satellite_timeout,
        };
        self.send_raw(cmd.bytes());
        self.arm_rsp(lapse);
    }

    /// Start the satellite session, answering a pending ring alert with the
    /// alert variant.
    fn send_session(&mut self) {
        let cmd = if self.info.ra_flag == 1 {
            AtCommand::InitiateAlertSession
        } else {
            AtCommand::InitiateSession
        };
        self.dispatch_at(cmd);
    }

    /// `AT+SBDWB=<len>` with the staged payload length.
    fn send_write_binary_cmd(&mut self) {
        self.clear_buffers(PortRouting::Data);
        let cmd = format!("AT+SBDWB={}\r", self.info.tx_msg_len);
        self.send_raw(cmd.as_bytes());
    }

    /// Payload plus the 16-bit additive checksum, high byte first.
    fn send_payload_with_checksum(&mut self) {
        let checksum = self
            .tx_buf
            .iter()
            .fold(0u16, |sum, &b| sum.wrapping_add(u16::from(b)));

        self.port.flush_queues();
        self.line.clear();

        let payload = std::mem::take(&mut self.tx_buf);
        let _ = self
            .port
            .write(&payload)
            .and_then(|()| self.port.write(&checksum.to_be_bytes()))
            .map_err(|e| warn!("payload write failed: {e}"));
        self.tx_buf = payload;

        self.arm_rsp(STANDARD_RSP_TIMEOUT);
    }

    pub(crate) fn send_raw(&mut self, bytes: &[u8]) {
        debug!("tx: {}", printable(bytes));
        if let Err(e) = self.port.write(bytes) {
            warn!("serial write failed: {e}");
        }
    }

    fn arm_rsp(&mut self, lapse: Duration) {
        let now = self.clock.now();
        self.rsp_deadline.arm(now, lapse);
    }

    /// Flush both queues, route the port, and reset line assembly.
    fn clear_buffers(&mut self, routing: PortRouting) {
        self.port.flush_queues();
        self.port.set_routing(routing);
        self.line.clear();
        let _ = self.line.take_overflow();
    }

    /// Drain available bytes into the line buffer until the terminator.
    fn collect_line(&mut self, eol: u8) -> bool {
        while let Some(byte) = self.port.read_byte() {
            let done = self.line.feed(byte, eol) == Assembly::Complete;
            if self.line.take_overflow() {
                self.error_code = ErrorCode::RxBufferOverflow;
            }
            if done {
                return true;
            }
        }
        false
    }

    /// Record off-hook / back-on-hook transitions exactly once per edge;
    /// returns true while the call is holding things up.
    fn voice_call_edges(&mut self) -> bool {
        if self.in_voice_call() {
            if !self.prev_voice {
                self.log_events.push(LinkEvent::PhoneOffHook);
                self.prev_voice = true;
            }
            true
        } else {
            if self.prev_voice {
                self.log_events.push(LinkEvent::PhoneBackOnHook);
                self.prev_voice = false;
            }
            false
        }
    }

    // Aux-board entry points and the programming tick live in `aux.rs`.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mt::NotificationMode;
    use crate::sim::{SimClock, SimHooks, SimPort, SimPower};

    fn scratch(tag: &str) -> std::path::PathBuf {
        let dir =
            std::env::temp_dir().join(format!("sbdlink-engine-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn engine(
        tag: &str,
    ) -> (
        ProtocolEngine<SimPort>,
        SimPort,
        SimClock,
        SimPower,
        SimHooks,
    ) {
        let port = SimPort::new();
        let clock = SimClock::new();
        let power = SimPower::new();
        let hooks = SimHooks::new();
        let spool = Spool::new(scratch(tag));
        spool.ensure_tree().unwrap();
        let engine = ProtocolEngine::new(
            port.clone(),
            Box::new(clock.clone()),
            Box::new(power.clone()),
            Box::new(hooks.clone()),
            spool,
            NotificationMode::None,
        );
        (engine, port, clock, power, hooks)
    }

    fn written_text(port: &SimPort) -> String {
        String::from_utf8_lossy(&port.take_written()).into_owned()
    }

    #[test]
    fn test_init_sequence_reaches_success() {
        let (mut eng, port, _clock, _power, hooks) = engine("init");

        eng.tick(); // power good → AT+CGSN
        assert_eq!(eng.at_state(), AtState::Initting);
        assert!(written_text(&port).contains("AT+CGSN"));

        port.push_rx(b"300234010753370\r");
        eng.tick(); // IMEI parsed and persisted
        assert_eq!(eng.imei(), "300234010753370");

        eng.tick(); // stray consumed, AT+SBDMTA=0 sent
        assert!(written_text(&port).contains("AT+SBDMTA=0"));
        port.push_rx(b"0");
        eng.tick();

        eng.tick(); // AT+SBDAREG=1
        assert!(written_text(&port).contains("AT+SBDAREG=1"));
        port.push_rx(b"0");
        eng.tick();

        eng.tick(); // first session
        assert!(written_text(&port).contains("AT+SBDIX"));
        port.push_rx(b"+SBDIX: 0, 00001, 0, 00000, 0, 0\r\n");
        eng.tick();
        port.push_rx(b"0");
        eng.tick(); // AT+CGMR
        assert!(written_text(&port).contains("AT+CGMR"));

        port.push_rx(b"Call Processor Version: IS06002\r");
        eng.tick();

        assert_eq!(eng.at_state(), AtState::Success);
        assert_eq!(eng.modem_sw_version(), "IS06002");
        assert_eq!(hooks.persisted_imeis(), vec!["300234010753370".to_string()]);
    }

    #[test]
    fn test_imei_not_repersisted_when_unchanged() {
        let (mut eng, port, _clock, _power, hooks) = engine("imei");
        hooks.set_stored_imei("300234010753370");

        eng.tick();
        port.push_rx(b"300234010753370\r");
        eng.tick();

        assert!(hooks.persisted_imeis().is_empty());
        assert_eq!(eng.imei(), "300234010753370");
    }

    #[test]
    fn test_empty_mailbox_check() {
        let (mut eng, port, _clock, _power, _hooks) = engine("mbx");
        eng.set_idle();

        assert!(eng.check_mailbox());
        assert!(written_text(&port).contains("AT+SBDD0"));

        port.push_rx(b"0");
        eng.tick(); // clear ack → session dispatched
        assert!(written_text(&port).contains("AT+SBDIX\r\n"));

        port.push_rx(b"+SBDIX: 0, 00123, 0, 00000, 0, 0\r\n");
        eng.tick();
        port.push_rx(b"0");
        eng.tick();

        assert_eq!(eng.at_state(), AtState::Success);
        assert_eq!(eng.mo_msn(), "00123");
        assert_eq!(eng.mailbox_status(), MailboxStatus::None);
    }

    #[test]
    fn test_text_send_runs_session() {
        let (mut eng, port, _clock, _power, _hooks) = engine("text");
        eng.set_idle();

        assert!(eng.send_text("hello"));
        assert_eq!(written_text(&port), "AT+SBDWT=hello\r");

        port.push_rx(b"0");
        eng.tick();
        assert!(written_text(&port).contains("AT+SBDIX"));
    }

    #[test]
    fn test_binary_upload_bad_checksum_fails() {
        let (mut eng, port, _clock, _power, _hooks) = engine("wb-bad");
        eng.set_idle();

        let payload = vec![1u8; 100];
        assert!(eng.send_binary_buffer(&payload));
        assert_eq!(written_text(&port), "AT+SBDWB=100\r");

        port.push_rx(b"2\r\n");
        eng.tick();

        assert_eq!(eng.at_state(), AtState::Failed);
        assert_eq!(eng.error_code(), ErrorCode::TxBinDataBadChecksum);
    }

    #[test]
    fn test_binary_upload_success_appends_checksum() {
        let (mut eng, port, _clock, _power, _hooks) = engine("wb-ok");
        eng.set_idle();

        let payload = vec![1u8; 100]; // sum = 100 = 0x0064
        assert!(eng.send_binary_buffer(&payload));
        let _ = port.take_written();

        port.push_rx(b"READY\r\n");
        eng.tick(); // payload + checksum pushed

        let mut expected = payload.clone();
        expected.extend_from_slice(&[0x00, 0x64]);
        assert_eq!(port.take_written(), expected);

        port.push_rx(b"0");
        eng.tick(); // trailing OK → session
        assert!(written_text(&port).contains("AT+SBDIX\r\n"));

        port.push_rx(b"+SBDIX: 1, 00124, 0, 00000, 0, 0\r\n");
        eng.tick();
        port.push_rx(b"0");
        eng.tick();
        assert_eq!(eng.at_state(), AtState::Success);
    }

    #[test]
    fn test_oversized_buffer_truncates() {
        let (mut eng, _port, _clock, _power, _hooks) = engine("wb-trunc");
        eng.set_idle();

        let payload = vec![0u8; MAX_TX_LEN + 50];
        assert!(eng.send_binary_buffer(&payload));
        assert_eq!(eng.error_code(), ErrorCode::TruncatedFile);
        assert_eq!(eng.info.tx_msg_len, MAX_TX_LEN);
    }

    /// Drive a mailbox check that reports an MT message of `len` bytes.
    fn report_mt_waiting(eng: &mut ProtocolEngine<SimPort>, port: &SimPort, len: u16) {
        assert!(eng.check_mailbox());
        port.push_rx(b"0");
        eng.tick();
        let line = format!("+SBDIX: 0, 00125, 1, 00042, {len}, 1\r\n");
        port.push_rx(line.as_bytes());
        eng.tick();
        port.push_rx(b"0");
        eng.tick();
        assert_eq!(eng.at_state(), AtState::Success);
        assert_eq!(eng.mailbox_status(), MailboxStatus::Success);
        eng.set_idle();
    }

    fn mt_wire(payload: &[u8]) -> Vec<u8> {
        let sum: u16 = payload
            .iter()
            .fold(0u16, |s, &b| s.wrapping_add(u16::from(b)));
        let mut wire = Vec::new();
        wire.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        wire.extend_from_slice(payload);
        wire.extend_from_slice(&sum.to_be_bytes());
        wire.extend_from_slice(b"0");
        wire
    }

    #[test]
    fn test_mt_action_message_stays_buffer_only() {
        let (mut eng, port, _clock, _power, hooks) = engine("mt-action");
        eng.set_idle();
        report_mt_waiting(&mut eng, &port, 12);

        // ROI ack request: checksum word, type word, date/time, padding.
        let mut payload = vec![0xAAu8, 0xBB];
        payload.extend_from_slice(&crate::mt::types::ROIACK_MSG_TYPE.to_be_bytes());
        payload.extend_from_slice(&0x1234_5678u32.to_be_bytes());
        payload.extend_from_slice(&[0u8; 4]);

        assert!(eng.read_binary());
        port.push_rx(&mt_wire(&payload));
        eng.tick(); // data collected
        eng.tick(); // trailing code + dispatch

        assert_eq!(eng.at_state(), AtState::Success);
        let receipt = eng.take_receipt().unwrap();
        assert_eq!(receipt.disposition, Disposition::BufferOnly);
        assert!(receipt.ok);
        assert_eq!(hooks.actions(), vec!["build_roi_ack 305419896".to_string()]);

        // Nothing persisted anywhere in the tree.
        let root = eng.spool().root().to_path_buf();
        let count = walk_files(&root);
        assert_eq!(count, 0);
    }

    fn walk_files(dir: &std::path::Path) -> usize {
        let mut count = 0;
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.filter_map(Result::ok) {
                let path = entry.path();
                if path.is_dir() {
                    count += walk_files(&path);
                } else {
                    count += 1;
                }
            }
        }
        count
    }

    #[test]
    fn test_mt_routed_message_saved_to_file() {
        let (mut eng, port, _clock, _power, _hooks) = engine("mt-save");
        eng.set_idle();
        report_mt_waiting(&mut eng, &port, 12);

        // Type 0x0025 → modem/inbox.
        let mut payload = vec![0u8, 0];
        payload.extend_from_slice(&0x0025u16.to_be_bytes());
        payload.extend_from_slice(&[7u8; 8]);

        assert!(eng.read_binary());
        port.push_rx(&mt_wire(&payload));
        eng.tick();
        eng.tick();

        assert_eq!(eng.at_state(), AtState::Success);
        let receipt = eng.take_receipt().unwrap();
        assert_eq!(receipt.disposition, Disposition::SaveToFile);
        assert!(receipt.label.contains("modem/inbox"));
        let saved = std::fs::read(&receipt.label).unwrap();
        assert_eq!(saved, payload);
    }

    #[test]
    fn test_mt_bad_checksum_redirects_to_error_dir() {
        let (mut eng, port, _clock, _power, _hooks) = engine("mt-chk");
        eng.set_idle();
        report_mt_waiting(&mut eng, &port, 12);

        let mut payload = vec![0u8, 0];
        payload.extend_from_slice(&0x0025u16.to_be_bytes());
        payload.extend_from_slice(&[7u8; 8]);

        let mut wire = mt_wire(&payload);
        let at = wire.len() - 2; // corrupt the checksum low byte
        wire[at] ^= 0xFF;

        assert!(eng.read_binary());
        port.push_rx(&wire);
        eng.tick();
        eng.tick();

        assert_eq!(eng.at_state(), AtState::Failed);
        assert_eq!(eng.error_code(), ErrorCode::RxBadChecksum);
        let receipt = eng.take_receipt().unwrap();
        assert!(!receipt.ok);
        assert!(receipt.label.contains("modem/error"));
    }

    #[test]
    fn test_mt_zero_length_fails() {
        let (mut eng, port, _clock, _power, _hooks) = engine("mt-zero");
        eng.set_idle();

        // No prior session: expected length is zero.
        assert!(eng.read_binary());
        port.push_rx(&[0, 0, 0, 0, b'0']);
        eng.tick();
        eng.tick();

        assert_eq!(eng.at_state(), AtState::Failed);
        assert_eq!(eng.error_code(), ErrorCode::RxNoMsgWaiting);
    }

    #[test]
    fn test_sbdix_blocked_escalates() {
        let (mut eng, port, _clock, _power, _hooks) = engine("blocked");
        eng.set_idle();

        assert!(eng.check_mailbox());
        port.push_rx(b"0");
        eng.tick();
        port.push_rx(b"+SBDIX: 16, 00001, 0, 00000, 0, 0\r\n");
        eng.tick();

        assert_eq!(eng.at_state(), AtState::Failed);
        assert_eq!(eng.error_code(), ErrorCode::SbdiSbdBlocked);
    }

    #[test]
    fn test_ring_alert_switches_to_alert_session() {
        let (mut eng, port, _clock, _power, _hooks) = engine("ra");
        eng.set_idle();

        assert!(eng.check_gateway());
        port.push_rx(b"+SBDSX: 0, 123, 0, -1, 1, 0\r\n");
        eng.tick();
        port.push_rx(b"0");
        eng.tick();
        assert_eq!(eng.at_state(), AtState::Success);

        // The pending alert makes the next session an SBDIXA.
        eng.set_idle();
        assert!(eng.check_mailbox());
        port.push_rx(b"0");
        eng.tick();
        assert!(written_text(&port).contains("AT+SBDIXA\r\n"));
    }

    #[test]
    fn test_gateway_check_without_traffic_fails() {
        let (mut eng, port, _clock, _power, _hooks) = engine("sbdsx-none");
        eng.set_idle();

        assert!(eng.check_gateway());
        port.push_rx(b"+SBDSX: 0, 123, 0, -1, 0, 0\r\n");
        eng.tick();

        assert_eq!(eng.at_state(), AtState::Failed);
        assert_eq!(eng.error_code(), ErrorCode::None);
    }

    #[test]
    fn test_csq_level_zero_fails_but_records() {
        let (mut eng, port, _clock, _power, _hooks) = engine("csq0");
        eng.set_idle();

        assert!(eng.send_csq());
        port.push_rx(b"+CSQF:0\r\n");
        eng.tick();

        assert_eq!(eng.at_state(), AtState::Failed);
        assert_eq!(eng.signal_strength(), 0);
    }

    #[test]
    fn test_csq_level_five_succeeds() {
        let (mut eng, port, _clock, _power, _hooks) = engine("csq5");
        eng.set_idle();

        assert!(eng.send_csq());
        port.push_rx(b"+CSQF:5\r\n");
        eng.tick();
        port.push_rx(b"0");
        eng.tick();

        assert_eq!(eng.at_state(), AtState::Success);
        assert_eq!(eng.signal_strength(), 5);
    }

    #[test]
    fn test_line_overflow_flags_and_recovers() {
        let (mut eng, port, _clock, _power, _hooks) = engine("overflow");
        eng.set_idle();

        assert!(eng.send_csq());
        let noise = vec![b'x'; command::MAX_LINE_LEN + 40];
        port.push_rx(&noise);
        port.push_rx(b"+CSQF:3\r\n");
        eng.tick();
        port.push_rx(b"0");
        eng.tick();

        assert_eq!(eng.at_state(), AtState::Success);
        assert_eq!(eng.signal_strength(), 3);
        assert_eq!(eng.error_code(), ErrorCode::RxBufferOverflow);
    }

    #[test]
    fn test_creg_registered_home_succeeds() {
        let (mut eng, port, _clock, _power, _hooks) = engine("creg-home");
        eng.set_idle();

        assert!(eng.send_creg());
        port.push_rx(b"+CREG:000,001\r\n");
        eng.tick();
        port.push_rx(b"0");
        eng.tick();

        assert_eq!(eng.at_state(), AtState::Success);
        assert_eq!(eng.error_code(), ErrorCode::CregRegisteredHome);
    }

    #[test]
    fn test_creg_unknown_status_keeps_waiting() {
        let (mut eng, port, clock, _power, _hooks) = engine("creg-odd");
        eng.set_idle();

        assert!(eng.send_creg());
        port.push_rx(b"+CREG:000,009\r\n");
        eng.tick();
        // An out-of-table status byte is not a verdict; the probe keeps
        // polling until the response timeout settles it.
        assert_eq!(eng.at_state(), AtState::Sending);

        clock.advance(Duration::from_secs(6));
        eng.tick();
        assert_eq!(eng.at_state(), AtState::TimedOut);
        assert_eq!(eng.error_code(), ErrorCode::RspTimedOut);
    }

    #[test]
    fn test_call_status_dialing_fails() {
        let (mut eng, port, _clock, _power, _hooks) = engine("clcc");
        eng.set_idle();

        assert!(eng.send_call_status());
        port.push_rx(b"+CLCC:002\r\n");
        eng.tick();

        assert_eq!(eng.at_state(), AtState::Failed);
        assert_eq!(eng.call_status(), CallStatus::Dialing);
        assert_eq!(eng.error_code(), ErrorCode::DialingCallStatus);
    }

    #[test]
    fn test_response_timeout_restores_routing() {
        let (mut eng, port, clock, _power, _hooks) = engine("timeout");
        eng.set_idle();

        assert!(eng.send_call_status());
        clock.advance(Duration::from_secs(6));
        eng.tick();

        assert_eq!(eng.at_state(), AtState::TimedOut);
        assert_eq!(eng.error_code(), ErrorCode::RspTimedOut);
        assert_eq!(port.current_routing(), PortRouting::Data);
    }

    #[test]
    fn test_gateway_probe_timeout_is_silent() {
        let (mut eng, _port, clock, _power, _hooks) = engine("sbdsx-to");
        eng.set_idle();

        assert!(eng.check_gateway());
        clock.advance(Duration::from_secs(6));
        eng.tick();

        assert_eq!(eng.at_state(), AtState::TimedOut);
        assert_eq!(eng.error_code(), ErrorCode::None);
        assert_eq!(eng.mailbox_status(), MailboxStatus::Failed);
    }

    #[test]
    fn test_modem_power_loss_forces_powered_down() {
        let (mut eng, port, _clock, _power, _hooks) = engine("powerloss");
        eng.set_idle();
        eng.info.signal_strength = 4;
        eng.info.ringers_on = false;

        port.set_modem_powered(false);
        eng.tick();

        assert_eq!(eng.at_state(), AtState::PoweredDown);
        assert_eq!(eng.signal_strength(), -1);
        // Aux output caches survive a modem power-out.
        assert!(!eng.ringer_cached());
    }

    #[test]
    fn test_voice_call_gates_initialization() {
        let (mut eng, port, _clock, _power, _hooks) = engine("voice");
        port.set_dsr(true);

        eng.tick();
        assert_eq!(eng.at_state(), AtState::PoweredDown);
        assert_eq!(eng.take_log_events(), vec![LinkEvent::PhoneOffHook]);

        eng.tick();
        assert!(eng.take_log_events().is_empty(), "edge logged only once");

        port.set_dsr(false);
        eng.tick();
        assert_eq!(eng.at_state(), AtState::Initting);
        assert_eq!(eng.take_log_events(), vec![LinkEvent::PhoneBackOnHook]);
    }

    #[test]
    fn test_reset_refused_during_voice_call() {
        let (mut eng, port, _clock, power, _hooks) = engine("reset-call");
        eng.set_idle();

        port.set_dsr(true);
        assert!(!eng.reset());
        assert_eq!(eng.at_state(), AtState::Idle);
        assert_eq!(power.modem_cycles(), 0);

        port.set_dsr(false);
        assert!(eng.reset());
        assert_eq!(eng.at_state(), AtState::PoweredDown);
        assert_eq!(power.modem_cycles(), 1);
    }

    // ── Aux board ────────────────────────────────────────────────────

    #[test]
    fn test_aux_set_ringer_echo_roundtrip() {
        let (mut eng, port, _clock, _power, _hooks) = engine("aux-ringer");
        eng.set_idle();

        assert!(eng.set_ringer(true));
        assert_eq!(eng.at_state(), AtState::Programming);
        assert_eq!(port.current_routing(), PortRouting::Programming);
        assert!(written_text(&port).contains("set ringer 0"));

        port.push_rx(b"CMD: set ringer 0");
        eng.tick();

        assert_eq!(eng.at_state(), AtState::Success);
        assert_eq!(port.current_routing(), PortRouting::Data);
        assert!(eng.ringer_cached());
    }

    #[test]
    fn test_aux_echo_mismatch_fails_and_restores_port() {
        let (mut eng, port, _clock, _power, _hooks) = engine("aux-mismatch");
        eng.set_idle();

        assert!(eng.reset_aux_board());
        port.push_rx(b"CMD: unexpected\rt");
        eng.tick();

        assert_eq!(eng.at_state(), AtState::Failed);
        assert_eq!(port.current_routing(), PortRouting::Data);
    }

    #[test]
    fn test_aux_relay_status_updates_cache() {
        let (mut eng, port, _clock, _power, _hooks) = engine("aux-relay");
        eng.set_idle();

        assert!(eng.get_relay_status(info::RELAY_2));
        port.push_rx(b"CMD: set relay 1\r\nRelay[1] On\r");
        eng.tick();

        assert_eq!(eng.at_state(), AtState::Success);
        assert_eq!(eng.relay_cached(info::RELAY_2), RelayState::On);
        assert_eq!(eng.error_code(), ErrorCode::AuxRelay2On);
        assert_eq!(port.current_routing(), PortRouting::Data);
    }

    #[test]
    fn test_aux_timeout_restores_routing() {
        let (mut eng, port, clock, _power, _hooks) = engine("aux-timeout");
        eng.set_idle();

        assert!(eng.get_ringer_status());
        clock.advance(Duration::from_secs(6));
        eng.tick();

        assert_eq!(eng.at_state(), AtState::TimedOut);
        assert_eq!(eng.error_code(), ErrorCode::RspTimedOut);
        assert_eq!(port.current_routing(), PortRouting::Data);
    }

    #[test]
    fn test_aux_programming_cancel_and_retry() {
        let (mut eng, port, clock, _power, hooks) = engine("aux-prog");
        hooks.set_config_lines(&[":10000000AA\r", ":10001000BB\r"]);
        eng.set_idle();

        assert!(eng.program_aux());
        assert!(written_text(&port).contains('~'));
        port.push_rx(b"20400000 1B010000\r");
        eng.tick(); // version ok → reload flash
        assert!(written_text(&port).contains("reload flash"));
        port.push_rx(b"CMD: reload flash");
        eng.tick(); // echo → line gap

        clock.advance(Duration::from_millis(70));
        eng.tick(); // first line out
        assert!(written_text(&port).contains(":10000000AA"));

        // The board reports a bad checksum: cancel, rewind, redo handshake.
        port.push_rx(b"N");
        eng.tick();
        let out = written_text(&port);
        assert!(out.contains("c\r"), "cancel sent, got {out:?}");
        assert!(out.contains('~'), "version re-queried, got {out:?}");
        assert_eq!(hooks.index_resets(), 1);

        port.push_rx(b"20400000 1B010000\r");
        eng.tick();
        port.push_rx(b"CMD: reload flash");
        eng.tick();

        clock.advance(Duration::from_millis(70));
        eng.tick(); // line 0 again, from the top
        assert!(written_text(&port).contains(":10000000AA"));
        port.push_rx(b"a");
        eng.tick(); // block passed → next line

        clock.advance(Duration::from_millis(70));
        eng.tick();
        assert!(written_text(&port).contains(":10001000BB"));
        port.push_rx(b"aC");
        eng.tick(); // upload successful

        assert_eq!(eng.at_state(), AtState::Success);
        assert_eq!(port.current_routing(), PortRouting::Data);
    }

    #[test]
    fn test_aux_programming_hard_error_is_terminal() {
        let (mut eng, port, clock, _power, hooks) = engine("aux-hard");
        hooks.set_config_lines(&[":10000000AA\r"]);
        eng.set_idle();

        assert!(eng.program_aux());
        port.push_rx(b"20400000 1B010000\r");
        eng.tick();
        port.push_rx(b"CMD: reload flash");
        eng.tick();
        clock.advance(Duration::from_millis(70));
        eng.tick();

        port.push_rx(b"M"); // manufacturer error: no recovery
        eng.tick();

        assert_eq!(eng.at_state(), AtState::Failed);
        assert_eq!(port.current_routing(), PortRouting::Data);
    }

    #[test]
    fn test_aux_programming_out_of_lines_is_success() {
        let (mut eng, port, clock, _power, hooks) = engine("aux-empty");
        hooks.set_config_lines(&[":10000000AA\r"]);
        eng.set_idle();

        assert!(eng.program_aux());
        port.push_rx(b"20400000 1B010000\r");
        eng.tick();
        port.push_rx(b"CMD: reload flash");
        eng.tick();
        clock.advance(Duration::from_millis(70));
        eng.tick(); // only line out
        port.push_rx(b"a");
        eng.tick(); // passed, no 'C' yet
        clock.advance(Duration::from_millis(70));
        eng.tick(); // no more lines → done

        assert_eq!(eng.at_state(), AtState::Success);
        assert_eq!(port.current_routing(), PortRouting::Data);
    }

    #[test]
    fn test_aux_config_download_commits_image() {
        let (mut eng, port, _clock, _power, hooks) = engine("aux-dl");
        eng.set_idle();

        assert!(eng.download_aux_config());
        port.push_rx(b"CMD: download config\r\n");
        eng.tick(); // echo → capture

        let image = vec![0x55u8; command::MAX_CFG_DOWNLOAD_SIZE];
        port.push_rx(&image);
        eng.tick();

        assert_eq!(eng.at_state(), AtState::Success);
        assert_eq!(port.current_routing(), PortRouting::Data);
        assert_eq!(
            hooks.committed_config().unwrap().len(),
            command::MAX_CFG_DOWNLOAD_SIZE
        );
        assert!(hooks.watchdog_kicks() >= 1);
    }

    #[test]
    fn test_aux_dispatch_refused_without_power() {
        let (mut eng, port, _clock, _power, _hooks) = engine("aux-nopower");
        eng.set_idle();
        port.set_aux_powered(false);

        assert!(!eng.set_ringer(false));
        assert_eq!(eng.at_state(), AtState::Idle);
    }

    #[test]
    fn test_dispatch_refused_when_not_idle() {
        let (mut eng, _port, _clock, _power, _hooks) = engine("not-idle");
        eng.set_idle();

        assert!(eng.send_csq());
        assert!(!eng.send_csq());
        assert!(!eng.check_mailbox());
        assert!(!eng.send_text("nope"));
        assert!(!eng.read_binary());
    }
}
