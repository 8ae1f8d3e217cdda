//! Snapshot state the protocol engine maintains about the two devices.

/// Voice-call status as reported by `+CLCC:`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallStatus {
    Active,
    Held,
    Dialing,
    /// No valid reading yet (boot value, or reset before each probe).
    #[default]
    Invalid,
    Incoming,
    Waiting,
    Idle,
}

impl CallStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Active,
            1 => Self::Held,
            2 => Self::Dialing,
            4 => Self::Incoming,
            5 => Self::Waiting,
            6 => Self::Idle,
            _ => Self::Invalid,
        }
    }
}

/// Mailbox / MT-buffer status distilled from a session response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MailboxStatus {
    /// Nothing waiting.
    #[default]
    None,
    /// A message landed in the MT buffer.
    Success,
    /// The check or the receive failed.
    Failed,
}

/// Cached output state on the aux board. Three-valued: the cache starts
/// unknown and is corrected by status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayState {
    On,
    Off,
    #[default]
    Unknown,
}

impl RelayState {
    pub fn from_bool(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }
}

pub const RELAY_1: usize = 0;
pub const RELAY_2: usize = 1;
pub const NBR_RELAYS: usize = 2;

/// Relay wired to the text-message indicator.
pub const TXT_MSG_RELAY: usize = RELAY_2;

/// Device state the engine owns and the API layer snapshot-reads through
/// accessors.
#[derive(Debug, Clone)]
pub struct ModemInfo {
    /// MO status field from the last `+SBDIX:`.
    pub mo_status: u8,
    /// MT buffer status, read-once through the engine accessor.
    pub mt_status: MailboxStatus,
    /// MO message serial number, kept as the gateway's text.
    pub mo_msn: String,
    /// MT message serial number, kept as the gateway's text.
    pub mt_msn: String,
    /// Expected MT payload length from the last successful session.
    pub mt_length: u16,
    /// Messages queued at the gateway.
    pub mt_queue_nbr: u8,
    /// Ring-alert flag from `+SBDSX:`.
    pub ra_flag: u8,
    /// Length of the MO payload currently staged for upload.
    pub tx_msg_len: usize,
    /// -1 = no value / failed beyond debounce, 0..=5 = last reading.
    pub signal_strength: i16,
    pub call_status: CallStatus,
    pub ringers_on: bool,
    pub relay_on: [RelayState; NBR_RELAYS],
    pub current_relay: usize,
}

impl Default for ModemInfo {
    fn default() -> Self {
        Self {
            mo_status: 0,
            mt_status: MailboxStatus::None,
            mo_msn: String::new(),
            mt_msn: String::new(),
            mt_length: 0,
            mt_queue_nbr: 0,
            ra_flag: 0,
            tx_msg_len: 0,
            signal_strength: -1,
            call_status: CallStatus::Invalid,
            // Ringers default on; relay 1 boots unknown so the first status
            // probe always produces an edge, relay 2 is off at power-up.
            ringers_on: true,
            relay_on: [RelayState::Unknown, RelayState::Off],
            current_relay: RELAY_1,
        }
    }
}

impl ModemInfo {
    /// Reset transient session state after a power-out, preserving the aux
    /// output caches (the aux board keeps its own power).
    pub fn clear_preserving_aux(&mut self) {
        let ringers = self.ringers_on;
        let relays = self.relay_on;
        *self = Self::default();
        self.ringers_on = ringers;
        self.relay_on = relays;
    }
}
