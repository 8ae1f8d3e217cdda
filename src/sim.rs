//! In-memory doubles for the hardware seams.
//!
//! The driver is single-threaded, so every double is a cheap `Rc` handle:
//! clone one side into the engine, keep the other to script the device and
//! inspect what the driver did. `SimPort` plays the serial line (scripted
//! receive bytes, captured writes, fake control lines), `SimClock` is a
//! hand-advanced clock, `SimPower` counts power cycles, and `SimHooks`
//! records every application call.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::hooks::{AckCode, NotifyPort, SystemHooks};
use crate::power::PowerManager;
use crate::transport::{PortRouting, SerialPort};

// ── Serial port ──────────────────────────────────────────────────────

#[derive(Debug)]
struct SimPortInner {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    routing: PortRouting,
    dsr: bool,
    ri: bool,
    modem_powered: bool,
    aux_powered: bool,
    flushes: u32,
}

/// Scripted serial line. `flush_queues` drops pending receive bytes (like
/// the real queue flush), so script replies after dispatching the command.
#[derive(Clone)]
pub struct SimPort(Rc<RefCell<SimPortInner>>);

impl Default for SimPort {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPort {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(SimPortInner {
            rx: VecDeque::new(),
            tx: Vec::new(),
            routing: PortRouting::Data,
            dsr: false,
            ri: false,
            modem_powered: true,
            aux_powered: true,
            flushes: 0,
        })))
    }

    /// Queue bytes for the driver to read.
    pub fn push_rx(&self, bytes: &[u8]) {
        self.0.borrow_mut().rx.extend(bytes);
    }

    /// Everything the driver wrote since the last `take_written`.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.borrow_mut().tx)
    }

    pub fn written(&self) -> Vec<u8> {
        self.0.borrow().tx.clone()
    }

    pub fn set_dsr(&self, high: bool) {
        self.0.borrow_mut().dsr = high;
    }

    pub fn set_ri(&self, high: bool) {
        self.0.borrow_mut().ri = high;
    }

    pub fn set_modem_powered(&self, powered: bool) {
        self.0.borrow_mut().modem_powered = powered;
    }

    pub fn set_aux_powered(&self, powered: bool) {
        self.0.borrow_mut().aux_powered = powered;
    }

    pub fn current_routing(&self) -> PortRouting {
        self.0.borrow().routing
    }

    pub fn flush_count(&self) -> u32 {
        self.0.borrow().flushes
    }
}

impl SerialPort for SimPort {
    fn read_byte(&mut self) -> Option<u8> {
        self.0.borrow_mut().rx.pop_front()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), String> {
        self.0.borrow_mut().tx.extend_from_slice(bytes);
        Ok(())
    }

    fn flush_queues(&mut self) {
        let mut inner = self.0.borrow_mut();
        inner.rx.clear();
        inner.flushes += 1;
    }

    fn set_routing(&mut self, routing: PortRouting) {
        self.0.borrow_mut().routing = routing;
    }

    fn routing(&self) -> PortRouting {
        self.0.borrow().routing
    }

    fn dsr(&self) -> bool {
        self.0.borrow().dsr
    }

    fn ri(&self) -> bool {
        self.0.borrow().ri
    }

    fn modem_powered(&self) -> bool {
        self.0.borrow().modem_powered
    }

    fn aux_powered(&self) -> bool {
        self.0.borrow().aux_powered
    }
}

// ── Clock ────────────────────────────────────────────────────────────

/// Hand-advanced monotonic clock.
#[derive(Clone)]
pub struct SimClock(Rc<Cell<Instant>>);

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SimClock {
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(Instant::now())))
    }

    pub fn advance(&self, by: Duration) {
        self.0.set(self.0.get() + by);
    }
}

impl Clock for SimClock {
    fn now(&self) -> Instant {
        self.0.get()
    }
}

// ── Power manager ────────────────────────────────────────────────────

#[derive(Debug)]
struct SimPowerInner {
    modem_cycles: u32,
    aux_cycles: u32,
    modem_ok: bool,
    aux_ok: bool,
}

/// Power-cycle recorder with scriptable success.
#[derive(Clone)]
pub struct SimPower(Rc<RefCell<SimPowerInner>>);

impl Default for SimPower {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPower {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(SimPowerInner {
            modem_cycles: 0,
            aux_cycles: 0,
            modem_ok: true,
            aux_ok: true,
        })))
    }

    pub fn set_modem_ok(&self, ok: bool) {
        self.0.borrow_mut().modem_ok = ok;
    }

    pub fn set_aux_ok(&self, ok: bool) {
        self.0.borrow_mut().aux_ok = ok;
    }

    pub fn modem_cycles(&self) -> u32 {
        self.0.borrow().modem_cycles
    }

    pub fn aux_cycles(&self) -> u32 {
        self.0.borrow().aux_cycles
    }
}

impl PowerManager for SimPower {
    fn power_cycle_modem(&mut self) -> bool {
        let mut inner = self.0.borrow_mut();
        inner.modem_cycles += 1;
        inner.modem_ok
    }

    fn power_cycle_aux(&mut self) -> bool {
        let mut inner = self.0.borrow_mut();
        inner.aux_cycles += 1;
        inner.aux_ok
    }
}

// ── System hooks ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimHooksInner {
    stored_imei: Option<String>,
    persisted_imeis: Vec<String>,
    config_lines: Vec<String>,
    line_index: usize,
    index_resets: u32,
    committed_config: Option<Vec<u8>>,
    config_marked_invalid: bool,
    acks: Vec<(u16, bool, AckCode)>,
    actions: Vec<String>,
    watchdog_kicks: u32,
    cleared_ports: Vec<NotifyPort>,
    rules_memory_ok: bool,
    rules_file_ok: bool,
    bus_ok: bool,
}

/// Recording application hooks.
#[derive(Clone, Default)]
pub struct SimHooks(Rc<RefCell<SimHooksInner>>);

impl SimHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_config_lines(&self, lines: &[&str]) {
        let mut inner = self.0.borrow_mut();
        inner.config_lines = lines.iter().map(|s| (*s).to_string()).collect();
        inner.line_index = 0;
    }

    pub fn set_stored_imei(&self, imei: &str) {
        self.0.borrow_mut().stored_imei = Some(imei.to_string());
    }

    pub fn set_rules_ok(&self, memory: bool, file: bool) {
        let mut inner = self.0.borrow_mut();
        inner.rules_memory_ok = memory;
        inner.rules_file_ok = file;
    }

    pub fn persisted_imeis(&self) -> Vec<String> {
        self.0.borrow().persisted_imeis.clone()
    }

    pub fn committed_config(&self) -> Option<Vec<u8>> {
        self.0.borrow().committed_config.clone()
    }

    pub fn config_marked_invalid(&self) -> bool {
        self.0.borrow().config_marked_invalid
    }

    pub fn index_resets(&self) -> u32 {
        self.0.borrow().index_resets
    }

    pub fn acks(&self) -> Vec<(u16, bool, AckCode)> {
        self.0.borrow().acks.clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.0.borrow().actions.clone()
    }

    pub fn watchdog_kicks(&self) -> u32 {
        self.0.borrow().watchdog_kicks
    }

    pub fn cleared_ports(&self) -> Vec<NotifyPort> {
        self.0.borrow().cleared_ports.clone()
    }
}

impl SystemHooks for SimHooks {
    fn persist_imei(&mut self, imei: &str) {
        let mut inner = self.0.borrow_mut();
        inner.stored_imei = Some(imei.to_string());
        inner.persisted_imeis.push(imei.to_string());
    }

    fn stored_imei(&self) -> Option<String> {
        self.0.borrow().stored_imei.clone()
    }

    fn kick_watchdog(&mut self) {
        self.0.borrow_mut().watchdog_kicks += 1;
    }

    fn next_config_line(&mut self) -> Option<String> {
        let mut inner = self.0.borrow_mut();
        let line = inner.config_lines.get(inner.line_index).cloned();
        if line.is_some() {
            inner.line_index += 1;
        }
        line
    }

    fn reset_config_index(&mut self) {
        let mut inner = self.0.borrow_mut();
        inner.line_index = 0;
        inner.index_resets += 1;
    }

    fn commit_aux_config(&mut self, image: &[u8]) {
        self.0.borrow_mut().committed_config = Some(image.to_vec());
    }

    fn mark_aux_config_invalid(&mut self) {
        self.0.borrow_mut().config_marked_invalid = true;
    }

    fn set_reset_cmd_time(&mut self, date_time: u32) {
        self.0
            .borrow_mut()
            .actions
            .push(format!("set_reset_cmd_time {date_time}"));
    }

    fn prepare_remote_reset(&mut self, graceful: bool) {
        self.0
            .borrow_mut()
            .actions
            .push(format!("prepare_remote_reset graceful={graceful}"));
    }

    fn build_roi_ack(&mut self, date_time: u32) {
        self.0
            .borrow_mut()
            .actions
            .push(format!("build_roi_ack {date_time}"));
    }

    fn set_remote_config_file_time(&mut self, date_time: u32) {
        self.0
            .borrow_mut()
            .actions
            .push(format!("set_remote_config_file_time {date_time}"));
    }

    fn build_config_message(&mut self) {
        self.0.borrow_mut().actions.push("build_config_message".into());
    }

    fn build_cmd_ack(&mut self, msg_type: u16, ok: bool, code: AckCode, _date_time: u32) {
        self.0.borrow_mut().acks.push((msg_type, ok, code));
    }

    fn format_storage_remotely(&mut self, _date_time: u32) {
        self.0.borrow_mut().actions.push("format_storage".into());
    }

    fn clear_rules_memory(&mut self) -> bool {
        let mut inner = self.0.borrow_mut();
        inner.actions.push("clear_rules_memory".into());
        inner.rules_memory_ok
    }

    fn delete_rules_file(&mut self) -> bool {
        let mut inner = self.0.borrow_mut();
        inner.actions.push("delete_rules_file".into());
        inner.rules_file_ok
    }

    fn build_system_log_message(&mut self, _date_time: u32) {
        self.0.borrow_mut().actions.push("build_system_log".into());
    }

    fn build_modem_log_message(&mut self, _date_time: u32) {
        self.0.borrow_mut().actions.push("build_modem_log".into());
    }

    fn build_version_message(&mut self, _date_time: u32) {
        self.0.borrow_mut().actions.push("build_version".into());
    }

    fn build_gps_message(&mut self, _date_time: u32) {
        self.0.borrow_mut().actions.push("build_gps".into());
    }

    fn reset_data_bus(&mut self) -> bool {
        let mut inner = self.0.borrow_mut();
        inner.actions.push("reset_data_bus".into());
        inner.bus_ok
    }

    fn prepare_log_transmission(&mut self, _date_time: u32, prompt: bool, option: u16) {
        self.0
            .borrow_mut()
            .actions
            .push(format!("prepare_log_transmission prompt={prompt} option={option}"));
    }

    fn clear_port_pending_read(&mut self, port: NotifyPort) {
        self.0.borrow_mut().cleared_ports.push(port);
    }
}
