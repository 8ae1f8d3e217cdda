//! The modem log: a structured record of link activity.
//!
//! Entries are JSON lines appended to `<data_dir>/modem.log` and mirrored to
//! `tracing`. Two small rings support the rest of the system:
//!
//! - a **post queue** for events raised outside the tick (duplicate-
//!   suppressed; drained one entry per tick so a burst cannot starve the
//!   state machine);
//! - a **recent ring** of the last distinct events with frequency counts and
//!   last-seen timestamps, used to build the remote modem-log report.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{info, warn};

use crate::protocol::error::ErrorCode;

const POST_Q_LEN: usize = 8;
const RECENT_LEN: usize = 16;

/// Link lifecycle events recorded in the modem log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkEvent {
    ModemIsPowered,
    ModemPoweredDown,
    Send,
    RetrySend,
    SendSuccessful,
    SendFailure,
    SendEnabled,
    SendDisabled,
    Receive,
    ReceiveSuccessful,
    ReceiveFailure,
    UnexpectedRsp,
    MoveFailure,
    DeleteFailure,
    CopySuccess,
    CopyFailure,
    MailboxCheckSuccess,
    MailboxCheckFailure,
    SignalStrengthFailure,
    HangupSuccess,
    HangupFailure,
    PhoneOffHook,
    PhoneBackOnHook,
    IncomingCall,
    IncomingCallComplete,
}

impl LinkEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ModemIsPowered => "modem is powered",
            Self::ModemPoweredDown => "modem powered down",
            Self::Send => "sending",
            Self::RetrySend => "retrying send",
            Self::SendSuccessful => "send successful",
            Self::SendFailure => "send failure",
            Self::SendEnabled => "sending enabled",
            Self::SendDisabled => "sending disabled",
            Self::Receive => "receiving",
            Self::ReceiveSuccessful => "receive successful",
            Self::ReceiveFailure => "receive failure",
            Self::UnexpectedRsp => "unexpected response",
            Self::MoveFailure => "move failure",
            Self::DeleteFailure => "delete failure",
            Self::CopySuccess => "copy successful",
            Self::CopyFailure => "copy failure",
            Self::MailboxCheckSuccess => "mailbox check successful",
            Self::MailboxCheckFailure => "mailbox check failure",
            Self::SignalStrengthFailure => "signal strength failure",
            Self::HangupSuccess => "hung up call",
            Self::HangupFailure => "hang up failed",
            Self::PhoneOffHook => "phone off hook",
            Self::PhoneBackOnHook => "phone back on hook",
            Self::IncomingCall => "incoming call",
            Self::IncomingCallComplete => "incoming call complete",
        }
    }
}

/// One persisted log line.
#[derive(Debug, Serialize)]
struct LogLine<'a> {
    ts_ms: u64,
    signal: i16,
    event: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    file: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    momsn: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mtmsn: Option<&'a str>,
}

/// Frequency-counted recent event.
#[derive(Debug, Clone, Serialize)]
pub struct RecentEvent {
    pub event: LinkEvent,
    pub frequency: u32,
    pub last_ts_ms: u64,
}

pub struct ModemLogger {
    path: Option<PathBuf>,
    posted: Vec<LinkEvent>,
    recent: Vec<RecentEvent>,
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

impl ModemLogger {
    /// Logger writing to `modem.log` under `data_dir`; pass `None` to keep
    /// entries in tracing only (tests).
    pub fn new(data_dir: Option<&std::path::Path>) -> Self {
        Self {
            path: data_dir.map(|d| d.join("modem.log")),
            posted: Vec::with_capacity(POST_Q_LEN),
            recent: Vec::with_capacity(RECENT_LEN),
        }
    }

    /// Post an event from outside the tick. Duplicates already waiting are
    /// suppressed; a full queue drops the event (the recent ring still sees
    /// it when an equivalent entry eventually lands).
    pub fn record(&mut self, event: LinkEvent) {
        if self.posted.len() >= POST_Q_LEN || self.posted.contains(&event) {
            return;
        }
        self.posted.push(event);
    }

    /// Drain one posted event per tick. Returns the event so the caller can
    /// attach the current error code and signal level.
    pub fn take_posted(&mut self) -> Option<LinkEvent> {
        if self.posted.is_empty() {
            None
        } else {
            Some(self.posted.remove(0))
        }
    }

    /// Write one entry.
    pub fn log(
        &mut self,
        file: &str,
        event: LinkEvent,
        error: ErrorCode,
        signal: i16,
        momsn: Option<&str>,
        mtmsn: Option<&str>,
    ) {
        let ts_ms = epoch_ms();
        self.bump_recent(event, ts_ms);

        let line = LogLine {
            ts_ms,
            signal,
            event: event.as_str(),
            file,
            error: error.as_str(),
            momsn: (event == LinkEvent::SendSuccessful).then_some(()).and(momsn),
            mtmsn: (event == LinkEvent::ReceiveSuccessful)
                .then_some(())
                .and(mtmsn),
        };

        info!(
            "modemlog: {} {}{}{}",
            line.event,
            line.file,
            if line.error.is_empty() { "" } else { " — " },
            line.error
        );

        if let Some(ref path) = self.path {
            match serde_json::to_string(&line) {
                Ok(json) => {
                    let res = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .and_then(|mut f| writeln!(f, "{json}"));
                    if let Err(e) = res {
                        warn!("modemlog: cannot append {}: {e}", path.display());
                    }
                }
                Err(e) => warn!("modemlog: serialize failed: {e}"),
            }
        }
    }

    fn bump_recent(&mut self, event: LinkEvent, ts_ms: u64) {
        if let Some(entry) = self.recent.iter_mut().find(|r| r.event == event) {
            entry.frequency += 1;
            entry.last_ts_ms = ts_ms;
            return;
        }
        if self.recent.len() >= RECENT_LEN {
            self.recent.remove(0);
        }
        self.recent.push(RecentEvent {
            event,
            frequency: 1,
            last_ts_ms: ts_ms,
        });
    }

    /// The frequency-counted recent events, oldest first.
    pub fn recent_events(&self) -> &[RecentEvent] {
        &self.recent
    }
}
