//! The API layer (upper tier): workflows on top of the protocol engine.
//!
//! One `process_tick()` per application cycle drives everything: outbound
//! file transmission with retries, mailbox polling, the background probes
//! (signal quality, gateway status, call status), the deferred aux-command
//! queue, and long-term stuck-link recovery by power-cycling. The
//! application talks to this layer through the verbs below and polls
//! per-command responses.

pub mod queue;

use std::path::PathBuf;
use std::time::Duration;

use tracing::{error as log_error, info, warn};

use crate::clock::Deadline;
use crate::config::Config;
use crate::log::{LinkEvent, ModemLogger};
use crate::protocol::info::{MailboxStatus, RelayState, RELAY_1, RELAY_2, TXT_MSG_RELAY};
use crate::protocol::{AtState, ProtocolEngine};
use crate::transport::SerialPort;

use queue::{Admission, AuxCommandQueue};

/// Pause between gateway / call-status probes.
const SBD_STATUS_DELAY: Duration = Duration::from_secs(10);

/// Upper-layer link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    PoweredDown,
    Initting,
    Idle,
    Busy,
}

/// The workflows this layer runs; used to index per-command responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCommand {
    TxingText,
    TxingBuffer,
    TxingFile,
    RxingFile,
    MailboxCheck,
    GatewayCheck,
    GettingCsq,
    CheckingCreg,
    CallStatus,
    CallHangup,
    RingerOn,
    RingerOff,
    RingerStatus,
    Relay1On,
    Relay1Off,
    Relay1Status,
    Relay2On,
    Relay2Off,
    Relay2Status,
    ResetAux,
    UploadAuxConfig,
    ConfigureAux,
}

impl LinkCommand {
    pub const COUNT: usize = 22;
}

/// Per-command response slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CmdResponse {
    #[default]
    NoResp,
    Waiting,
    Success,
    Failed,
}

/// Outcome of a file-send attempt this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileSend {
    NotSending,
    WaitingToSend,
    Sending,
}

/// Runtime-settable knobs (boot values come from the config file).
#[derive(Debug, Clone)]
pub struct Tunables {
    pub wait_for_calls: Duration,
    pub timeout_wait: Duration,
    pub csq_poll_rate: Duration,
    pub csq_retry_delay: Duration,
    pub csq_max_retries: u8,
    pub msg_max_retries: u8,
    pub msg_retry_delay: Duration,
    pub keep_file_list: String,
}

impl Tunables {
    pub fn from_config(config: &Config) -> Self {
        Self {
            wait_for_calls: Duration::from_secs(config.timing.wait_for_calls_secs),
            timeout_wait: Duration::from_secs(config.timing.timeout_wait_secs),
            csq_poll_rate: Duration::from_secs(config.timing.csq_poll_secs),
            csq_retry_delay: Duration::from_secs(config.timing.csq_retry_delay_secs),
            csq_max_retries: config.timing.csq_max_retries,
            msg_max_retries: config.timing.msg_max_retries,
            msg_retry_delay: Duration::from_secs(config.timing.msg_retry_delay_secs),
            keep_file_list: config.spool.keep_file_list.clone(),
        }
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Default)]
struct LinkFlags {
    file_send_retry_count: u8,
    file_receive_retry_count: u8,
    csq_debounce_count: u8,
}

pub struct ModemLink<P: SerialPort> {
    engine: ProtocolEngine<P>,
    logger: ModemLogger,
    tunables: Tunables,
    flags: LinkFlags,

    state: LinkState,
    /// Where to return after an aux command issued from POWERED_DOWN.
    prev_state: LinkState,
    current_cmd: Option<LinkCommand>,
    responses: [CmdResponse; LinkCommand::COUNT],

    sending_enabled: bool,
    storage_error_pending: bool,
    transparent_mode: bool,
    prev_hook_state: bool,
    prev_ri_state: bool,
    aux_action_complete: bool,

    path_being_sent: Option<PathBuf>,
    aux_queue: AuxCommandQueue,

    check_csq: Deadline,
    retry_delay: Deadline,
    wait_for_calls: Deadline,
    check_gateway: Deadline,
    check_call_status: Deadline,
    timeout_escalation: Deadline,
}

impl<P: SerialPort> ModemLink<P> {
    pub fn new(engine: ProtocolEngine<P>, logger: ModemLogger, tunables: Tunables) -> Self {
        let state = if engine.at_state() == AtState::PoweredDown {
            LinkState::PoweredDown
        } else {
            LinkState::Initting
        };
        let now = engine.now();
        let timeout_wait = tunables.timeout_wait;

        let mut link = Self {
            engine,
            logger,
            tunables,
            flags: LinkFlags::default(),
            state,
            prev_state: state,
            current_cmd: None,
            responses: [CmdResponse::NoResp; LinkCommand::COUNT],
            // Enabled only after initialization completes, so the state
            // machine cannot fire mid-init.
            sending_enabled: false,
            storage_error_pending: false,
            transparent_mode: false,
            prev_hook_state: false,
            prev_ri_state: false,
            aux_action_complete: false,
            path_being_sent: None,
            aux_queue: AuxCommandQueue::new(),
            check_csq: Deadline::default(),
            retry_delay: Deadline::default(),
            wait_for_calls: Deadline::default(),
            check_gateway: Deadline::default(),
            check_call_status: Deadline::default(),
            timeout_escalation: Deadline::default(),
        };
        // Detect a dead link from init time as well.
        link.timeout_escalation.arm(now, timeout_wait);
        link
    }

    // ── Public surface ───────────────────────────────────────────────

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn engine(&self) -> &ProtocolEngine<P> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ProtocolEngine<P> {
        &mut self.engine
    }

    pub fn command_response(&self, cmd: LinkCommand) -> CmdResponse {
        self.responses[cmd as usize]
    }

    pub fn signal_strength(&self) -> i16 {
        self.engine.signal_strength()
    }

    pub fn in_voice_call(&self) -> bool {
        self.engine.in_voice_call()
    }

    pub fn is_sending_enabled(&self) -> bool {
        self.sending_enabled
    }

    /// Stop picking outbound files. A transmission in progress completes.
    pub fn disable_sending(&mut self) {
        if self.sending_enabled {
            self.logger.record(LinkEvent::SendDisabled);
        }
        self.sending_enabled = false;
        // Stay disabled until explicitly re-enabled.
        self.wait_for_calls.stop();
    }

    /// Allow outbound transmission. Not needed during initialization —
    /// sending turns on automatically once init completes.
    pub fn enable_sending(&mut self) {
        if !self.sending_enabled {
            self.logger.record(LinkEvent::SendEnabled);
        }
        self.sending_enabled = true;
    }

    /// The core does not touch the port while the application streams
    /// through it directly.
    pub fn set_transparent_mode(&mut self, on: bool) {
        self.transparent_mode = on;
    }

    /// Latch a storage-fault report; sent once, next time the link is idle
    /// with sending enabled.
    pub fn report_storage_error(&mut self, faulted: bool) {
        self.storage_error_pending = faulted;
    }

    /// Send a short text message; an empty message performs a mailbox check
    /// instead. Refused while busy or in a voice call.
    pub fn send_text_msg(&mut self, msg: &str) -> bool {
        if self.state != LinkState::Idle || self.engine.in_voice_call() {
            return false;
        }
        if msg.is_empty() {
            if !self.engine.check_mailbox() {
                return false;
            }
            self.set_busy(LinkCommand::MailboxCheck);
            return true;
        }
        if !self.engine.send_text(msg) {
            return false;
        }
        self.set_busy(LinkCommand::TxingText);
        true
    }

    /// Send a binary buffer; an empty buffer performs a mailbox check.
    pub fn send_bin_msg(&mut self, data: &[u8]) -> bool {
        if self.state != LinkState::Idle || self.engine.in_voice_call() {
            return false;
        }
        if data.is_empty() {
            if !self.engine.check_mailbox() {
                return false;
            }
            self.set_busy(LinkCommand::MailboxCheck);
            return true;
        }
        if !self.engine.send_binary_buffer(data) {
            return false;
        }
        self.set_busy(LinkCommand::TxingBuffer);
        true
    }

    /// Network registration probe.
    pub fn check_registration(&mut self) -> bool {
        if self.state != LinkState::Idle || !self.engine.send_creg() {
            return false;
        }
        self.set_busy(LinkCommand::CheckingCreg);
        true
    }

    /// Pull the aux board's configuration up into the system.
    pub fn upload_aux_config(&mut self) -> bool {
        self.aux_action_complete = false;
        if self.aux_ready() && self.engine.download_aux_config() {
            self.set_busy(LinkCommand::UploadAuxConfig);
            return true;
        }
        self.enqueue_aux(LinkCommand::UploadAuxConfig);
        false
    }

    /// Flash the staged configuration into the aux board.
    pub fn program_aux(&mut self) -> bool {
        self.aux_action_complete = false;
        if self.aux_ready() && self.engine.program_aux() {
            self.set_busy(LinkCommand::ConfigureAux);
            return true;
        }
        self.enqueue_aux(LinkCommand::ConfigureAux);
        false
    }

    /// Poll after `upload_aux_config` / `program_aux`.
    pub fn is_aux_action_complete(&self) -> bool {
        self.aux_action_complete
    }

    /// Soft-reset the aux board, re-enqueueing the cached output states so
    /// the board is restored afterwards. Power-cycles the modem too.
    pub fn reset_aux(&mut self) -> bool {
        if self.aux_ready() && self.engine.reset_aux_board() {
            self.save_aux_state();
            self.set_busy(LinkCommand::ResetAux);
            self.engine.power_cycle_modem();
            return true;
        }
        self.enqueue_aux(LinkCommand::ResetAux);
        false
    }

    pub fn toggle_ringer(&mut self, on: bool) -> bool {
        let cmd = if on {
            LinkCommand::RingerOn
        } else {
            LinkCommand::RingerOff
        };
        if self.aux_ready() && self.engine.set_ringer(on) {
            self.set_busy(cmd);
            return true;
        }
        self.enqueue_aux(cmd);
        false
    }

    /// Query the ringer state directly from the board; poll
    /// `command_response(RingerStatus)` and then the cached value.
    pub fn request_ringer_status(&mut self) -> bool {
        if self.aux_ready() && self.engine.get_ringer_status() {
            self.set_busy(LinkCommand::RingerStatus);
            return true;
        }
        self.enqueue_aux(LinkCommand::RingerStatus);
        false
    }

    pub fn ringer_status(&self) -> bool {
        self.engine.ringer_cached()
    }

    pub fn toggle_relay(&mut self, relay: usize, on: bool) -> bool {
        let cmd = match (relay, on) {
            (RELAY_1, true) => LinkCommand::Relay1On,
            (RELAY_1, false) => LinkCommand::Relay1Off,
            (RELAY_2, true) => LinkCommand::Relay2On,
            (RELAY_2, false) => LinkCommand::Relay2Off,
            _ => return false,
        };
        if self.aux_ready() && self.engine.set_relay(relay, on) {
            self.set_busy(cmd);
            return true;
        }
        self.enqueue_aux(cmd);
        false
    }

    pub fn request_relay_status(&mut self, relay: usize) -> bool {
        let cmd = match relay {
            RELAY_1 => LinkCommand::Relay1Status,
            RELAY_2 => LinkCommand::Relay2Status,
            _ => return false,
        };
        if self.aux_ready() && self.engine.get_relay_status(relay) {
            self.set_busy(cmd);
            return true;
        }
        self.enqueue_aux(cmd);
        false
    }

    pub fn relay_status(&self, relay: usize) -> RelayState {
        self.engine.relay_cached(relay)
    }

    /// Hang up the voice call (queued when the link is busy).
    pub fn hangup_call(&mut self) -> bool {
        if self.engine.send_hangup() {
            self.set_busy(LinkCommand::CallHangup);
            return true;
        }
        self.enqueue_aux(LinkCommand::CallHangup);
        false
    }

    // ── Runtime-settable configuration ───────────────────────────────

    pub fn set_csq_poll_rate(&mut self, secs: u64) {
        if secs != 0 {
            self.tunables.csq_poll_rate = Duration::from_secs(secs);
        }
    }

    pub fn set_csq_retry_count(&mut self, retries: u8) {
        self.tunables.csq_max_retries = retries;
    }

    pub fn set_csq_retry_delay(&mut self, secs: u64) {
        if secs != 0 {
            self.tunables.csq_retry_delay = Duration::from_secs(secs);
        }
    }

    pub fn set_msg_retry_count(&mut self, retries: u8) {
        if retries != 0 {
            self.tunables.msg_max_retries = retries;
        }
    }

    pub fn set_msg_retry_delay(&mut self, secs: u64) {
        self.tunables.msg_retry_delay = Duration::from_secs(secs);
    }

    pub fn set_incoming_call_delay(&mut self, secs: u64) {
        self.tunables.wait_for_calls = Duration::from_secs(secs);
    }

    pub fn set_timeout_wait(&mut self, secs: u64) {
        self.tunables.timeout_wait = Duration::from_secs(secs);
    }

    pub fn set_satellite_timeout(&mut self, secs: u64) {
        if secs != 0 {
            self.engine
                .set_satellite_timeout(Duration::from_secs(secs));
        }
    }

    /// Disposition of sent files: empty deletes everything, `*` keeps
    /// everything (moved to `sent`), anything else keeps files whose name
    /// starts with a listed character.
    pub fn keep_sent_files(&mut self, list: &str) {
        self.tunables.keep_file_list = list.to_string();
    }

    // ── Tick ─────────────────────────────────────────────────────────

    pub fn process_tick(&mut self) {
        if self.transparent_mode {
            // The port belongs to the application right now.
            return;
        }

        self.engine.tick();

        for event in self.engine.take_log_events() {
            self.logger.record(event);
        }
        if let Some(event) = self.logger.take_posted() {
            self.write_log("", event);
        }

        let at = self.engine.at_state();
        let now = self.engine.now();

        // A lower-layer power-down always wins, no matter what we were doing.
        if at == AtState::PoweredDown && self.state != LinkState::PoweredDown {
            self.state = LinkState::PoweredDown;
            self.write_log("", LinkEvent::ModemPoweredDown);
            self.responses = [CmdResponse::NoResp; LinkCommand::COUNT];
        }

        match self.state {
            LinkState::Initting => self.tick_initting(at),
            LinkState::Idle => self.tick_idle(at, now),
            LinkState::Busy => self.tick_busy(at),
            LinkState::PoweredDown => self.tick_powered_down(at, now),
        }
    }

    fn tick_initting(&mut self, at: AtState) {
        let now = self.engine.now();
        match at {
            AtState::Initting => {}
            AtState::Success => {
                self.engine.set_idle();
                self.state = LinkState::Idle;
                self.prev_state = LinkState::Idle;
                self.current_cmd = None;
                self.flags = LinkFlags::default();
                self.responses = [CmdResponse::NoResp; LinkCommand::COUNT];

                // Probe the signal right away, the gateway and call state
                // shortly, and synchronize the aux caches after the power
                // event.
                self.retry_delay.stop();
                self.check_csq.arm(now, Duration::ZERO);
                self.check_gateway.arm(now, SBD_STATUS_DELAY);
                self.check_call_status.arm(now, SBD_STATUS_DELAY);
                self.timeout_escalation.arm(now, self.tunables.timeout_wait);

                self.enqueue_aux(LinkCommand::RingerStatus);
                self.enqueue_aux(LinkCommand::Relay1Status);
                self.enqueue_aux(LinkCommand::Relay2Status);

                info!("modem initialized (imei {})", self.engine.imei());
            }
            AtState::Failed | AtState::TimedOut => {
                self.handle_timeouts(at);
                // A message may have landed during the registration session;
                // pull it down before re-initializing.
                if self.engine.mailbox_status() == MailboxStatus::Success {
                    self.engine.set_idle();
                    if self.engine.read_binary() {
                        self.write_log("", LinkEvent::Receive);
                        self.set_busy(LinkCommand::RxingFile);
                        return;
                    }
                }
                self.engine.set_initting();
                self.state = LinkState::Initting;
            }
            _ => {
                self.engine.set_initting();
                self.state = LinkState::Initting;
            }
        }
    }

    fn tick_idle(&mut self, at: AtState, now: std::time::Instant) {
        match at {
            AtState::Idle => {
                self.drain_aux_queue();

                if self.wait_for_calls.take_expired(now) {
                    self.sending_enabled = true;
                }
            }
            _ => {
                self.unexpected_response(at);
                self.engine.set_initting();
                self.state = LinkState::Initting;
            }
        }

        // An aux command drained from the queue may already have taken us
        // busy.
        if self.state != LinkState::Idle {
            return;
        }

        // Local command, works without a satellite view.
        if self.start_mailbox_download() {
            return;
        }

        // The satellite is off limits during a voice call; poll the call
        // state instead and log the hook edges.
        if self.engine.in_voice_call() {
            self.send_call_status_cmd(now);
            if !self.prev_hook_state {
                self.write_log("", LinkEvent::PhoneOffHook);
                self.prev_hook_state = true;
            }
            return;
        } else if self.prev_hook_state {
            self.write_log("", LinkEvent::PhoneBackOnHook);
            self.prev_hook_state = false;
        }

        if self.engine.ring_indicator() {
            if !self.prev_ri_state {
                self.write_log("", LinkEvent::IncomingCall);
                self.prev_ri_state = true;
            }
            // Keep transmitting: the modem reports busy on its own when the
            // ring matters.
        } else if self.prev_ri_state {
            self.write_log("", LinkEvent::IncomingCallComplete);
            self.prev_ri_state = false;
        }

        if self.check_csq.expired(now) && self.engine.send_csq() {
            self.set_busy(LinkCommand::GettingCsq);
            self.check_csq.arm(now, self.tunables.csq_poll_rate);
            return;
        }

        if self.sending_enabled {
            if self.send_file_to_modem(now) == FileSend::Sending {
                return;
            }
            if self.check_gateway.expired(now) && self.engine.check_gateway() {
                self.set_busy(LinkCommand::GatewayCheck);
                self.check_gateway.arm(now, SBD_STATUS_DELAY);
            }
        }
    }

    fn tick_busy(&mut self, at: AtState) {
        match at {
            AtState::Success | AtState::Failed | AtState::TimedOut => {
                self.engine.set_idle();
                self.state = LinkState::Idle;
                self.clean_up_on_idle(at);
            }
            AtState::Sending | AtState::Rcving | AtState::Programming => {}
            _ => {
                self.unexpected_response(at);
                self.engine.set_initting();
                self.state = LinkState::Initting;
            }
        }
    }

    fn tick_powered_down(&mut self, at: AtState, now: std::time::Instant) {
        match at {
            AtState::Initting => {
                self.write_log("", LinkEvent::ModemIsPowered);
                self.state = LinkState::Initting;
            }
            AtState::PoweredDown => {
                // The aux board keeps its own power; its queue still drains.
                self.drain_aux_queue();
                self.check_csq.stop();
                self.retry_delay.stop();
                self.check_gateway.stop();
                self.check_call_status.stop();
                self.timeout_escalation.arm(now, self.tunables.timeout_wait);
            }
            AtState::TimedOut => {
                // An aux command issued from powered-down timed out; return
                // to where we were.
                self.state = self.prev_state;
                if self.state != LinkState::Idle {
                    self.engine.set_initting();
                }
            }
            _ => {
                self.unexpected_response(at);
                self.engine.set_initting();
                self.state = LinkState::Initting;
            }
        }
    }

    // ── Workflow helpers ─────────────────────────────────────────────

    fn aux_ready(&self) -> bool {
        matches!(self.state, LinkState::Idle | LinkState::PoweredDown)
    }

    fn set_busy(&mut self, cmd: LinkCommand) {
        self.prev_state = self.state;
        self.state = LinkState::Busy;
        self.current_cmd = Some(cmd);
        self.responses[cmd as usize] = CmdResponse::Waiting;
    }

    fn enqueue_aux(&mut self, cmd: LinkCommand) {
        if self.aux_queue.push(cmd) == Admission::Admitted {
            self.responses[cmd as usize] = CmdResponse::Waiting;
        }
    }

    /// Run one deferred command per tick.
    fn drain_aux_queue(&mut self) -> bool {
        let Some(cmd) = self.aux_queue.pop() else {
            return false;
        };

        match cmd {
            LinkCommand::RingerOn => self.toggle_ringer(true),
            LinkCommand::RingerOff => self.toggle_ringer(false),
            LinkCommand::Relay1On => self.toggle_relay(RELAY_1, true),
            LinkCommand::Relay1Off => self.toggle_relay(RELAY_1, false),
            LinkCommand::Relay2On => self.toggle_relay(RELAY_2, true),
            LinkCommand::Relay2Off => self.toggle_relay(RELAY_2, false),
            LinkCommand::RingerStatus => self.request_ringer_status(),
            LinkCommand::Relay1Status => self.request_relay_status(RELAY_1),
            LinkCommand::Relay2Status => self.request_relay_status(RELAY_2),
            LinkCommand::ResetAux => self.reset_aux(),
            LinkCommand::ConfigureAux => self.program_aux(),
            LinkCommand::UploadAuxConfig => self.upload_aux_config(),
            LinkCommand::CallHangup => {
                // Needs the modem powered; otherwise the request is dropped.
                if self.state != LinkState::PoweredDown {
                    self.hangup_call()
                } else {
                    false
                }
            }
            _ => false,
        };
        true
    }

    /// Start the MT download when the last session left a message waiting.
    fn start_mailbox_download(&mut self) -> bool {
        if self.engine.mailbox_status() == MailboxStatus::Success && self.engine.read_binary() {
            self.write_log("", LinkEvent::Receive);
            self.set_busy(LinkCommand::RxingFile);
            return true;
        }
        false
    }

    fn send_call_status_cmd(&mut self, now: std::time::Instant) -> bool {
        if !self.check_call_status.expired(now) {
            return false;
        }
        if self.engine.send_call_status() {
            self.set_busy(LinkCommand::CallStatus);
            self.check_call_status.arm(now, SBD_STATUS_DELAY);
            return true;
        }
        false
    }

    /// Pick (or retry) an outbound file.
    fn send_file_to_modem(&mut self, now: std::time::Instant) -> FileSend {
        // A missing storage card is reported once per power-up as a text
        // buffer instead of a file.
        if self.storage_error_pending {
            let report = format!(
                "storage fault: flash card missing or failed (imei {})\r\n",
                self.engine.imei()
            );
            if self.engine.send_binary_buffer(report.as_bytes()) {
                self.set_busy(LinkCommand::TxingBuffer);
                self.storage_error_pending = false;
                return FileSend::Sending;
            }
        }

        if self.flags.file_send_retry_count == 0 {
            let Some(path) = self.engine.spool().next_outbox_file() else {
                return FileSend::NotSending;
            };
            self.path_being_sent = Some(path.clone());
            self.write_log(&path.display().to_string(), LinkEvent::Send);
        } else {
            if !self.retry_delay.expired(now) {
                return FileSend::WaitingToSend;
            }
            self.retry_delay.stop();
            let label = self.sent_file_label();
            self.write_log(&label, LinkEvent::RetrySend);
        }

        let Some(path) = self.path_being_sent.clone() else {
            return FileSend::NotSending;
        };

        if self.engine.send_binary_file(&path) {
            self.set_busy(LinkCommand::TxingFile);
            return FileSend::Sending;
        }

        // Something is wrong with the file itself; delete it so the rules
        // engine cannot resend it forever.
        if self.engine.spool().delete(&path).is_ok() {
            log_error!("unreadable outbox file deleted: {}", path.display());
        } else if let Err(e) = self.engine.spool().mark_sent(&path) {
            log_error!("unreadable outbox file stuck in place: {e}");
        }
        FileSend::NotSending
    }

    /// Residual work once a command reaches a terminal state: retries, file
    /// disposition, log entries, and the next state.
    fn clean_up_on_idle(&mut self, at: AtState) {
        let Some(cmd) = self.current_cmd else {
            return;
        };
        let now = self.engine.now();

        self.responses[cmd as usize] = if at == AtState::Success {
            CmdResponse::Success
        } else {
            CmdResponse::Failed
        };

        self.handle_timeouts(at);

        match cmd {
            LinkCommand::RxingFile => {
                self.current_cmd = None;
                self.state = LinkState::Idle;
                self.finish_mt_receive(at);
            }

            LinkCommand::TxingFile => match at {
                AtState::Success => {
                    self.flags.file_send_retry_count = 0;
                    self.current_cmd = None;

                    let label = self.sent_file_label();
                    self.write_log(&label, LinkEvent::SendSuccessful);
                    self.dispose_sent_file();

                    if self.engine.in_voice_call() {
                        self.state = LinkState::Idle;
                        self.hangup_call();
                        return;
                    }
                    if !self.start_mailbox_download() {
                        self.wait_for_incoming_calls();
                        self.state = LinkState::Idle;
                    }
                }
                _ => {
                    self.state = LinkState::Idle;
                    self.current_cmd = None;
                    self.flags.file_send_retry_count += 1;

                    if self.flags.file_send_retry_count < self.tunables.msg_max_retries {
                        self.retry_delay.arm(now, self.tunables.msg_retry_delay);
                    } else {
                        self.flags.file_send_retry_count = 0;
                        self.wait_for_incoming_calls();
                        self.give_up_on_file();
                    }
                }
            },

            LinkCommand::TxingBuffer | LinkCommand::TxingText => {
                self.current_cmd = None;
                if at == AtState::Success && self.engine.in_voice_call() {
                    self.state = LinkState::Idle;
                    self.hangup_call();
                    return;
                }
                if !self.start_mailbox_download() {
                    self.wait_for_incoming_calls();
                    self.state = LinkState::Idle;
                }
            }

            LinkCommand::CallStatus => {
                self.current_cmd = None;
                self.state = LinkState::Idle;
                // Let the phone call complete.
                self.wait_for_incoming_calls();
            }

            LinkCommand::MailboxCheck => {
                self.current_cmd = None;
                let event = if at == AtState::Success {
                    LinkEvent::MailboxCheckSuccess
                } else {
                    LinkEvent::MailboxCheckFailure
                };
                self.write_log("", event);

                if !self.start_mailbox_download() {
                    self.wait_for_incoming_calls();
                    self.state = LinkState::Idle;
                }
            }

            LinkCommand::GatewayCheck => {
                self.current_cmd = None;
                self.state = LinkState::Idle;
                if at == AtState::Success {
                    // Traffic is waiting at the gateway; go get it.
                    if self.engine.check_mailbox() {
                        self.set_busy(LinkCommand::MailboxCheck);
                    }
                }
            }

            LinkCommand::GettingCsq => {
                self.current_cmd = None;
                self.state = LinkState::Idle;
                if at == AtState::Success {
                    self.flags.csq_debounce_count = 0;
                } else {
                    self.flags.csq_debounce_count += 1;
                    if self.flags.csq_debounce_count < self.tunables.csq_max_retries {
                        self.check_csq.arm(now, self.tunables.csq_retry_delay);
                    } else {
                        self.flags.csq_debounce_count = 0;
                        self.engine.clear_signal_strength();
                        self.write_log("", LinkEvent::SignalStrengthFailure);
                        log_error!("satellite signal lost beyond debounce");
                    }
                }
            }

            LinkCommand::CheckingCreg => {
                self.current_cmd = None;
                self.state = LinkState::Idle;
            }

            LinkCommand::CallHangup => {
                self.current_cmd = None;
                self.state = LinkState::Idle;
                self.wait_for_incoming_calls();
                let event = if at == AtState::Success {
                    LinkEvent::HangupSuccess
                } else {
                    LinkEvent::HangupFailure
                };
                self.write_log("", event);
            }

            // Aux commands retry through the queue and return to wherever
            // they were issued from — including POWERED_DOWN.
            LinkCommand::RingerOn
            | LinkCommand::RingerOff
            | LinkCommand::Relay1On
            | LinkCommand::Relay1Off
            | LinkCommand::Relay2On
            | LinkCommand::Relay2Off
            | LinkCommand::RingerStatus
            | LinkCommand::Relay1Status
            | LinkCommand::Relay2Status
            | LinkCommand::ResetAux => {
                if at != AtState::Success {
                    self.enqueue_aux(cmd);
                }
                self.current_cmd = None;
                self.state = self.prev_state;
                if self.state != LinkState::Idle {
                    self.engine.set_initting();
                }
            }

            LinkCommand::UploadAuxConfig => {
                self.aux_action_complete = true;
                self.current_cmd = None;
                self.state = self.prev_state;
                if self.state != LinkState::Idle {
                    self.engine.set_initting();
                }
            }

            LinkCommand::ConfigureAux => {
                if at != AtState::Success {
                    // Leave the configuration EEPROM marked invalid so the
                    // flash is retried after the reset below.
                    log_error!("aux board programming failed");
                    self.engine.hooks_mut().mark_aux_config_invalid();
                }
                self.aux_action_complete = true;
                self.current_cmd = None;
                self.state = self.prev_state;
                if self.state != LinkState::Idle {
                    self.engine.set_initting();
                }
                self.engine.power_cycle_aux();
            }
        }
    }

    /// RXING_FILE epilogue: receipt bookkeeping and the receive retry loop.
    fn finish_mt_receive(&mut self, at: AtState) {
        if at == AtState::TimedOut {
            self.write_log("", LinkEvent::ReceiveFailure);

            self.flags.file_receive_retry_count += 1;
            if self.flags.file_receive_retry_count < self.tunables.msg_max_retries {
                if self.engine.read_binary() {
                    self.write_log("", LinkEvent::Receive);
                    self.set_busy(LinkCommand::RxingFile);
                }
                return;
            }
        }

        if let Some(receipt) = self.engine.take_receipt() {
            let event = if receipt.ok {
                LinkEvent::ReceiveSuccessful
            } else {
                LinkEvent::ReceiveFailure
            };
            let label = receipt.label.clone();
            self.write_log(&label, event);

            match receipt.copy_ok {
                Some(true) => self.write_log(&label, LinkEvent::CopySuccess),
                Some(false) => self.write_log(&label, LinkEvent::CopyFailure),
                None => {}
            }

            if let Some(relay_on) = receipt.notify.relay_on {
                // Toggle the indicator only on an actual change; the command
                // goes through the queue like any other aux request.
                if self.engine.relay_cached(TXT_MSG_RELAY).is_on() != relay_on {
                    let cmd = if relay_on {
                        LinkCommand::Relay2On
                    } else {
                        LinkCommand::Relay2Off
                    };
                    self.enqueue_aux(cmd);
                }
                for port in receipt.notify.clear_ports {
                    self.engine.hooks_mut().clear_port_pending_read(port);
                }
            }

            if receipt.start_aux_upload {
                self.enqueue_aux(LinkCommand::UploadAuxConfig);
            }
        } else if at == AtState::Failed {
            self.write_log("", LinkEvent::ReceiveFailure);
        }

        self.wait_for_incoming_calls();
        self.flags.file_receive_retry_count = 0;
    }

    /// Final disposition after too many failed send attempts.
    fn give_up_on_file(&mut self) {
        let Some(path) = self.path_being_sent.clone() else {
            return;
        };
        let label = path.display().to_string();
        match self.engine.spool().mark_error(&path) {
            Ok(_) => self.write_log(&label, LinkEvent::SendFailure),
            Err(_) => {
                self.write_log(&label, LinkEvent::MoveFailure);
                if self.engine.spool().delete(&path).is_err() {
                    log_error!("failed outbox file cannot be removed: {label}");
                }
            }
        }
        self.path_being_sent = None;
    }

    /// Apply the keep-file policy to a successfully sent file.
    fn dispose_sent_file(&mut self) {
        let Some(path) = self.path_being_sent.take() else {
            return;
        };
        let label = path.display().to_string();
        let list = self.tunables.keep_file_list.clone();

        if list.is_empty() {
            if self.engine.spool().delete(&path).is_err() {
                self.write_log(&label, LinkEvent::DeleteFailure);
                let _ = self.engine.spool().mark_sent(&path);
            }
            return;
        }

        let first_char = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.chars().next());
        let keep = list == "*" || first_char.is_some_and(|c| list.contains(c));

        if keep {
            if self.engine.spool().mark_sent(&path).is_err() {
                self.write_log(&label, LinkEvent::MoveFailure);
                if self.engine.spool().delete(&path).is_err() {
                    log_error!("sent file cannot be moved or removed: {label}");
                }
            }
        } else if self.engine.spool().delete(&path).is_err() {
            self.write_log(&label, LinkEvent::DeleteFailure);
            let _ = self.engine.spool().mark_sent(&path);
        }
    }

    /// Quiet window between transmissions so an incoming call can land.
    fn wait_for_incoming_calls(&mut self) {
        if self.sending_enabled {
            self.sending_enabled = false;
            let now = self.engine.now();
            self.wait_for_calls.arm(now, self.tunables.wait_for_calls);
        }
    }

    /// Back-to-back-timeout escalation: a link silent past the threshold
    /// gets its aux board power-cycled (the aux board carries the routing
    /// hardware). Any non-timeout outcome re-arms the threshold.
    fn handle_timeouts(&mut self, at: AtState) {
        let now = self.engine.now();
        if at == AtState::TimedOut {
            if self.timeout_escalation.expired(now) {
                if !self.engine.in_voice_call() {
                    log_error!("modem communications error detected, power cycling aux board");
                    if !self.engine.power_cycle_aux() {
                        self.enqueue_aux(LinkCommand::ResetAux);
                    }
                }
                self.timeout_escalation.arm(now, self.tunables.timeout_wait);
            }
        } else {
            self.timeout_escalation.arm(now, self.tunables.timeout_wait);
        }
    }

    /// Re-enqueue the cached aux output states ahead of a board reset.
    fn save_aux_state(&mut self) {
        if self.engine.ringer_cached() {
            self.enqueue_aux(LinkCommand::RingerOn);
        } else {
            self.enqueue_aux(LinkCommand::RingerOff);
        }
        if self.engine.relay_cached(RELAY_1).is_on() {
            self.enqueue_aux(LinkCommand::Relay1On);
        } else {
            self.enqueue_aux(LinkCommand::Relay1Off);
        }
        if self.engine.relay_cached(RELAY_2).is_on() {
            self.enqueue_aux(LinkCommand::Relay2On);
        } else {
            self.enqueue_aux(LinkCommand::Relay2Off);
        }
    }

    fn unexpected_response(&mut self, at: AtState) {
        warn!(
            "unexpected engine state {at:?} in {:?}, reinitializing",
            self.state
        );
        self.write_log("", LinkEvent::UnexpectedRsp);
    }

    fn sent_file_label(&self) -> String {
        self.path_being_sent
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }

    /// One modem-log entry: the engine's error code is consumed into it.
    fn write_log(&mut self, file: &str, event: LinkEvent) {
        let error = self.engine.error_code();
        let signal = self.engine.signal_strength();
        let momsn = self.engine.mo_msn().to_string();
        let mtmsn = self.engine.mt_msn().to_string();
        self.logger
            .log(file, event, error, signal, Some(&momsn), Some(&mtmsn));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mt::NotificationMode;
    use crate::sim::{SimClock, SimHooks, SimPort, SimPower};
    use crate::spool::Spool;
    use std::path::PathBuf;

    struct Rig {
        link: ModemLink<SimPort>,
        port: SimPort,
        clock: SimClock,
        power: SimPower,
        hooks: SimHooks,
        root: PathBuf,
    }

    fn rig(tag: &str) -> Rig {
        let root = std::env::temp_dir().join(format!("sbdlink-api-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();

        let port = SimPort::new();
        let clock = SimClock::new();
        let power = SimPower::new();
        let hooks = SimHooks::new();
        let spool = Spool::new(&root);
        spool.ensure_tree().unwrap();

        let engine = ProtocolEngine::new(
            port.clone(),
            Box::new(clock.clone()),
            Box::new(power.clone()),
            Box::new(hooks.clone()),
            spool,
            NotificationMode::None,
        );
        let link = ModemLink::new(engine, ModemLogger::new(None), Tunables::default());

        Rig {
            link,
            port,
            clock,
            power,
            hooks,
            root,
        }
    }

    /// Drive the engine's full initialization exchange until the link is
    /// IDLE with the three aux status probes queued.
    fn drive_init(rig: &mut Rig) {
        rig.link.process_tick(); // power seen → AT+CGSN
        assert_eq!(rig.link.state(), LinkState::Initting);

        rig.port.push_rx(b"300234010753370\r");
        rig.link.process_tick();
        rig.link.process_tick(); // AT+SBDMTA=0
        rig.port.push_rx(b"0");
        rig.link.process_tick();
        rig.link.process_tick(); // AT+SBDAREG=1
        rig.port.push_rx(b"0");
        rig.link.process_tick();
        rig.link.process_tick(); // AT+SBDIX
        rig.port.push_rx(b"+SBDIX: 0, 00001, 0, 00000, 0, 0\r\n");
        rig.link.process_tick();
        rig.port.push_rx(b"0");
        rig.link.process_tick(); // AT+CGMR
        rig.port.push_rx(b"Call Processor Version: IS06002\r");
        rig.link.process_tick(); // engine SUCCESS → link IDLE

        assert_eq!(rig.link.state(), LinkState::Idle);
    }

    /// Answer the three queued aux status probes.
    fn settle_aux_probes(rig: &mut Rig) {
        rig.link.process_tick(); // drain ringer status
        rig.port.push_rx(b"Ringer(s) On");
        rig.link.process_tick();

        rig.link.process_tick(); // drain relay 1 status
        rig.port.push_rx(b"Relay[0] Off");
        rig.link.process_tick();

        rig.link.process_tick(); // drain relay 2 status
        rig.port.push_rx(b"Relay[1] Off");
        rig.link.process_tick();

        assert_eq!(rig.link.state(), LinkState::Idle);
    }

    /// Answer the immediate post-init signal-quality poll.
    fn settle_csq(rig: &mut Rig, level: u8) {
        rig.link.process_tick(); // dispatch AT+CSQF
        assert_eq!(
            rig.link.command_response(LinkCommand::GettingCsq),
            CmdResponse::Waiting
        );
        let line = format!("+CSQF:{level}\r\n");
        rig.port.push_rx(line.as_bytes());
        rig.link.process_tick();
        if level != 0 {
            rig.port.push_rx(b"0");
            rig.link.process_tick();
        }
    }

    fn cleanup(rig: &Rig) {
        let _ = std::fs::remove_dir_all(&rig.root);
    }

    #[test]
    fn test_init_to_idle_enqueues_aux_probes() {
        let mut r = rig("init");
        drive_init(&mut r);

        // Cache-sync probes queued, duplicates suppressed.
        assert_eq!(
            r.link.command_response(LinkCommand::RingerStatus),
            CmdResponse::Waiting
        );
        assert_eq!(
            r.link.command_response(LinkCommand::Relay1Status),
            CmdResponse::Waiting
        );

        settle_aux_probes(&mut r);
        assert_eq!(
            r.link.command_response(LinkCommand::RingerStatus),
            CmdResponse::Success
        );
        assert!(r.link.ringer_status());
        assert_eq!(r.link.relay_status(RELAY_1), RelayState::Off);
        assert_eq!(r.link.relay_status(RELAY_2), RelayState::Off);
        cleanup(&r);
    }

    #[test]
    fn test_file_send_retry_then_success() {
        let mut r = rig("file");
        let outbox = r.root.join("modem/outbox");
        std::fs::write(outbox.join("a001.rpt"), vec![1u8; 100]).unwrap();

        drive_init(&mut r);
        settle_aux_probes(&mut r);
        settle_csq(&mut r, 4);
        r.link.enable_sending();

        // First attempt: SBDWB rejected with a bad checksum.
        r.link.process_tick();
        assert_eq!(
            r.link.command_response(LinkCommand::TxingFile),
            CmdResponse::Waiting
        );
        assert!(String::from_utf8_lossy(&r.port.take_written()).contains("AT+SBDWB=100"));
        r.port.push_rx(b"2\r\n");
        r.link.process_tick();
        assert_eq!(
            r.link.command_response(LinkCommand::TxingFile),
            CmdResponse::Failed
        );
        assert!(outbox.join("a001.rpt").exists(), "file kept for retry");

        // Too early to retry.
        r.link.process_tick();
        assert_eq!(r.link.state(), LinkState::Idle);

        // Retry after the delay goes all the way through.
        r.clock.advance(Duration::from_secs(4));
        r.link.process_tick();
        r.port.push_rx(b"READY\r\n");
        r.link.process_tick();
        r.port.push_rx(b"0");
        r.link.process_tick();
        r.port.push_rx(b"+SBDIX: 1, 00124, 0, 00000, 0, 0\r\n");
        r.link.process_tick();
        r.port.push_rx(b"0");
        r.link.process_tick();

        assert_eq!(
            r.link.command_response(LinkCommand::TxingFile),
            CmdResponse::Success
        );
        assert!(!outbox.join("a001.rpt").exists(), "default policy deletes");

        // Sending pauses for the incoming-call window, then resumes.
        assert!(!r.link.is_sending_enabled());
        r.clock.advance(Duration::from_secs(46));
        r.link.process_tick();
        assert!(r.link.is_sending_enabled());
        cleanup(&r);
    }

    #[test]
    fn test_keep_file_list_moves_to_sent() {
        let mut r = rig("keep");
        let outbox = r.root.join("modem/outbox");
        std::fs::write(outbox.join("a001.rpt"), vec![1u8; 10]).unwrap();

        drive_init(&mut r);
        settle_aux_probes(&mut r);
        settle_csq(&mut r, 4);
        r.link.keep_sent_files("*");
        r.link.enable_sending();

        r.link.process_tick();
        r.port.push_rx(b"READY\r\n");
        r.link.process_tick();
        r.port.push_rx(b"0");
        r.link.process_tick();
        r.port.push_rx(b"+SBDIX: 0, 00002, 0, 00000, 0, 0\r\n");
        r.link.process_tick();
        r.port.push_rx(b"0");
        r.link.process_tick();

        assert!(!outbox.join("a001.rpt").exists());
        assert!(r.root.join("modem/sent/a001.rpt").exists());
        cleanup(&r);
    }

    #[test]
    fn test_exhausted_retries_move_file_to_error() {
        let mut r = rig("exhaust");
        let outbox = r.root.join("modem/outbox");
        std::fs::write(outbox.join("a001.rpt"), vec![1u8; 10]).unwrap();

        drive_init(&mut r);
        settle_aux_probes(&mut r);
        settle_csq(&mut r, 4);
        r.link.set_msg_retry_count(2);
        r.link.enable_sending();

        for attempt in 0..2 {
            if attempt > 0 {
                r.clock.advance(Duration::from_secs(4));
            }
            r.link.process_tick(); // dispatch
            r.port.push_rx(b"3\r\n"); // bad size verdict
            r.link.process_tick(); // failed
        }

        assert!(!outbox.join("a001.rpt").exists());
        assert!(r.root.join("modem/error/a001.rpt").exists());
        assert_eq!(
            r.link.command_response(LinkCommand::TxingFile),
            CmdResponse::Failed
        );
        cleanup(&r);
    }

    #[test]
    fn test_csq_debounce_surfaces_once() {
        let mut r = rig("csq");
        drive_init(&mut r);
        settle_aux_probes(&mut r);

        // Three consecutive level-0 readings, spaced by the retry delay.
        settle_csq(&mut r, 0);
        assert_eq!(r.link.signal_strength(), 0, "reading kept during debounce");

        r.clock.advance(Duration::from_secs(26));
        settle_csq(&mut r, 0);
        assert_eq!(r.link.signal_strength(), 0);

        r.clock.advance(Duration::from_secs(26));
        settle_csq(&mut r, 0);
        assert_eq!(r.link.signal_strength(), -1, "fault surfaced, value cleared");
        cleanup(&r);
    }

    #[test]
    fn test_stuck_link_escalates_to_aux_power_cycle() {
        let mut r = rig("stuck");
        drive_init(&mut r);
        settle_aux_probes(&mut r);
        settle_csq(&mut r, 4);
        r.power.set_aux_ok(false);

        // Ten minutes of silence, then one more timeout.
        r.clock.advance(Duration::from_secs(601));
        r.link.process_tick(); // CSQ poll dispatched
        r.clock.advance(Duration::from_secs(6));
        r.link.process_tick(); // times out → escalation

        assert_eq!(r.power.aux_cycles(), 1);
        // The refused power cycle falls back to a queued soft reset.
        assert_eq!(
            r.link.command_response(LinkCommand::ResetAux),
            CmdResponse::Waiting
        );
        cleanup(&r);
    }

    #[test]
    fn test_gateway_check_chains_into_mailbox_check() {
        let mut r = rig("gateway");
        drive_init(&mut r);
        settle_aux_probes(&mut r);
        settle_csq(&mut r, 4);
        r.link.enable_sending();

        r.clock.advance(Duration::from_secs(11));
        r.link.process_tick(); // AT+SBDSX out
        assert_eq!(
            r.link.command_response(LinkCommand::GatewayCheck),
            CmdResponse::Waiting
        );
        r.port.push_rx(b"+SBDSX: 0, 123, 0, -1, 1, 0\r\n");
        r.link.process_tick();
        r.port.push_rx(b"0");
        r.link.process_tick(); // success → mailbox check dispatched

        assert_eq!(
            r.link.command_response(LinkCommand::GatewayCheck),
            CmdResponse::Success
        );
        assert_eq!(
            r.link.command_response(LinkCommand::MailboxCheck),
            CmdResponse::Waiting
        );
        assert!(String::from_utf8_lossy(&r.port.take_written()).contains("AT+SBDD0"));
        cleanup(&r);
    }

    #[test]
    fn test_mt_download_after_session_reports_message() {
        let mut r = rig("mtdl");
        drive_init(&mut r);
        settle_aux_probes(&mut r);
        settle_csq(&mut r, 4);
        r.link.enable_sending();

        // Session reports one 12-byte MT message waiting.
        r.clock.advance(Duration::from_secs(11));
        r.link.process_tick(); // gateway check
        r.port.push_rx(b"+SBDSX: 0, 123, 0, -1, 1, 0\r\n");
        r.link.process_tick();
        r.port.push_rx(b"0");
        r.link.process_tick(); // → mailbox check
        r.port.push_rx(b"0");
        r.link.process_tick(); // → session (alert variant)
        r.port.push_rx(b"+SBDIX: 0, 00125, 1, 00042, 12, 1\r\n");
        r.link.process_tick();
        r.port.push_rx(b"0");
        r.link.process_tick(); // mailbox check completes

        // The pending MT message triggers the binary read.
        r.link.process_tick();
        assert_eq!(
            r.link.command_response(LinkCommand::RxingFile),
            CmdResponse::Waiting
        );
        assert!(String::from_utf8_lossy(&r.port.take_written()).contains("AT+SBDRB"));

        // 12-byte payload routed to modem/inbox.
        let mut payload = vec![0u8, 0];
        payload.extend_from_slice(&0x0025u16.to_be_bytes());
        payload.extend_from_slice(&[3u8; 8]);
        let sum: u16 = payload
            .iter()
            .fold(0u16, |s, &b| s.wrapping_add(u16::from(b)));
        let mut wire = (12u16).to_be_bytes().to_vec();
        wire.extend_from_slice(&payload);
        wire.extend_from_slice(&sum.to_be_bytes());
        wire.extend_from_slice(b"0");
        r.port.push_rx(&wire);
        r.link.process_tick(); // collect
        r.link.process_tick(); // finish

        assert_eq!(
            r.link.command_response(LinkCommand::RxingFile),
            CmdResponse::Success
        );
        let inbox: Vec<_> = std::fs::read_dir(r.root.join("modem/inbox"))
            .unwrap()
            .collect();
        assert_eq!(inbox.len(), 1);
        // A routed message triggers no application actions.
        assert!(r.hooks.actions().is_empty());
        cleanup(&r);
    }

    #[test]
    fn test_commands_queue_while_busy() {
        let mut r = rig("queue");
        drive_init(&mut r);
        settle_aux_probes(&mut r);

        r.link.process_tick(); // CSQ dispatched → busy
        assert!(!r.link.toggle_ringer(true), "busy: queued instead");
        assert_eq!(
            r.link.command_response(LinkCommand::RingerOn),
            CmdResponse::Waiting
        );

        r.port.push_rx(b"+CSQF:4\r\n");
        r.link.process_tick();
        r.port.push_rx(b"0");
        r.link.process_tick(); // CSQ done → idle

        r.link.process_tick(); // queue drained → ringer command out
        r.port.push_rx(b"CMD: set ringer 0");
        r.link.process_tick();

        assert_eq!(
            r.link.command_response(LinkCommand::RingerOn),
            CmdResponse::Success
        );
        assert!(r.link.ringer_status());
        cleanup(&r);
    }

    #[test]
    fn test_aux_command_from_powered_down_returns_there() {
        let mut r = rig("pd-aux");
        r.port.set_modem_powered(false);
        r.link.process_tick();
        assert_eq!(r.link.state(), LinkState::PoweredDown);

        assert!(r.link.toggle_relay(RELAY_1, true));
        assert_eq!(r.link.state(), LinkState::Busy);

        r.port.push_rx(b"CMD: set relay 0 1");
        r.link.process_tick();

        assert_eq!(
            r.link.command_response(LinkCommand::Relay1On),
            CmdResponse::Success
        );
        assert_eq!(r.link.state(), LinkState::PoweredDown);
        assert_eq!(r.link.relay_status(RELAY_1), RelayState::On);
        cleanup(&r);
    }

    #[test]
    fn test_failed_aux_command_requeues() {
        let mut r = rig("requeue");
        drive_init(&mut r);
        settle_aux_probes(&mut r);

        settle_csq(&mut r, 4); // get the background poll out of the way

        assert!(r.link.toggle_relay(RELAY_2, true));
        r.port.push_rx(b"CMD: garbage\r1"); // echo mismatch
        r.link.process_tick();

        assert_eq!(
            r.link.command_response(LinkCommand::Relay2On),
            CmdResponse::Waiting,
            "failed aux command goes back in the queue"
        );
        cleanup(&r);
    }

    #[test]
    fn test_power_down_detection_clears_responses() {
        let mut r = rig("pdown");
        drive_init(&mut r);
        settle_aux_probes(&mut r);
        settle_csq(&mut r, 4);

        r.port.set_modem_powered(false);
        r.link.process_tick();

        assert_eq!(r.link.state(), LinkState::PoweredDown);
        assert_eq!(
            r.link.command_response(LinkCommand::GettingCsq),
            CmdResponse::NoResp
        );

        // Power returns: straight back into initialization.
        r.port.set_modem_powered(true);
        r.link.process_tick();
        assert_eq!(r.link.state(), LinkState::Initting);
        cleanup(&r);
    }

    #[test]
    fn test_transparent_mode_suspends_processing() {
        let mut r = rig("transparent");
        drive_init(&mut r);
        settle_aux_probes(&mut r);

        r.link.set_transparent_mode(true);
        r.port.push_rx(b"+CSQF:5\r\n0");
        for _ in 0..5 {
            r.link.process_tick();
        }
        // Nothing consumed, nothing sent, no state change.
        assert_eq!(r.link.state(), LinkState::Idle);
        assert!(r.port.take_written().is_empty());

        r.link.set_transparent_mode(false);
        r.link.process_tick();
        assert_eq!(r.link.state(), LinkState::Busy); // CSQ poll resumes
        cleanup(&r);
    }

    #[test]
    fn test_voice_call_blocks_sending_and_polls_call_status() {
        let mut r = rig("voice");
        let outbox = r.root.join("modem/outbox");
        std::fs::write(outbox.join("a001.rpt"), vec![1u8; 10]).unwrap();

        drive_init(&mut r);
        settle_aux_probes(&mut r);
        settle_csq(&mut r, 4);
        r.link.enable_sending();

        // Let the call-status probe interval elapse, then go off-hook.
        r.clock.advance(Duration::from_secs(11));
        r.port.set_dsr(true);
        r.link.process_tick(); // call status poll instead of the file
        assert_eq!(
            r.link.command_response(LinkCommand::CallStatus),
            CmdResponse::Waiting
        );
        assert!(outbox.join("a001.rpt").exists());
        assert!(String::from_utf8_lossy(&r.port.take_written()).contains("AT+CLCC"));

        r.port.push_rx(b"+CLCC:000\r\n");
        r.link.process_tick();
        r.port.push_rx(b"0");
        r.link.process_tick();
        assert_eq!(
            r.link.command_response(LinkCommand::CallStatus),
            CmdResponse::Success
        );

        // Call ends; the quiet window runs out and the file goes out.
        r.port.set_dsr(false);
        r.clock.advance(Duration::from_secs(46));
        r.link.process_tick();
        assert!(String::from_utf8_lossy(&r.port.written()).contains("AT+SBDWB=10"));
        cleanup(&r);
    }

    #[test]
    fn test_send_text_verb_refused_when_busy_or_in_call() {
        let mut r = rig("text");
        drive_init(&mut r);
        settle_aux_probes(&mut r);

        r.port.set_dsr(true);
        assert!(!r.link.send_text_msg("hi"));
        r.port.set_dsr(false);

        settle_csq(&mut r, 4);
        assert!(r.link.send_text_msg("hi"));
        assert_eq!(
            r.link.command_response(LinkCommand::TxingText),
            CmdResponse::Waiting
        );
        cleanup(&r);
    }
}
