//! The command tables: one sum type per device, each variant carrying its
//! canonical wire bytes, timeout class, and (for the aux board) the echoed
//! terminator the response parser waits for.

use std::time::Duration;

/// Local commands answer from the modem itself; satellite commands wait on a
/// gateway round trip and use the (runtime-settable) long timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    Local,
    Satellite,
}

/// Standard response timeout for local commands.
pub const STANDARD_RSP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default satellite-session timeout.
pub const SATELLITE_RSP_TIMEOUT: Duration = Duration::from_secs(65);

/// Longest possible response line; overflow wraps (see `line`).
pub const MAX_LINE_LEN: usize = 256;

/// MO payload cap, excluding the 2-byte checksum.
pub const MAX_TX_LEN: usize = 1960;

/// MT payload cap.
pub const MAX_RX_LEN: usize = 1890;

/// Cap on an aux-board configuration download.
pub const MAX_CFG_DOWNLOAD_SIZE: usize = 8192;

/// IMEI digits (excluding terminator).
pub const IMEI_LEN: usize = 15;

/// Significant bytes kept from the modem software version string.
pub const MODEM_SW_VER_LEN: usize = 7;

/// The modem AT verb set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtCommand {
    /// `AT+SBDMTA=0` — RI line reserved for incoming calls.
    MtAlert,
    /// `AT+SBDAREG=1` — automatic gateway registration.
    AutoReg,
    /// `AT+CREG?` — network registration probe.
    NetworkReg,
    /// `AT+CSQF` — fast signal quality probe.
    SignalStrength,
    /// `AT+CGSN` — IMEI.
    SerialNumber,
    /// `AT+SBDWT=` prefix — write text message.
    WriteText,
    /// `AT+SBDWB=` prefix — write binary message.
    WriteBinary,
    /// `AT+SBDRB` — read binary MT message.
    ReadBinary,
    /// `AT+CLCC` — current call status.
    CallStatus,
    /// `AT+SBDD0` — clear the MO buffer.
    ClearMoBuffer,
    /// `AT+CGMR` — software revision (~145 byte response).
    Revision,
    /// `AT+CHUP` — hang up the voice call.
    Hangup,
    /// `AT+SBDSX` — gateway/ring-alert status.
    SbdStatus,
    /// `AT+SBDIX` — satellite session.
    InitiateSession,
    /// `AT+SBDIXA` — satellite session answering a ring alert.
    InitiateAlertSession,
}

impl AtCommand {
    /// Canonical request bytes. `WriteText`/`WriteBinary` are prefixes the
    /// caller completes with the payload argument and `\r`.
    pub fn bytes(self) -> &'static [u8] {
        match self {
            Self::MtAlert => b"AT+SBDMTA=0\r",
            Self::AutoReg => b"AT+SBDAREG=1\r",
            Self::NetworkReg => b"AT+CREG?\r",
            Self::SignalStrength => b"AT+CSQF\r",
            Self::SerialNumber => b"AT+CGSN\r",
            Self::WriteText => b"AT+SBDWT=",
            Self::WriteBinary => b"AT+SBDWB=",
            Self::ReadBinary => b"AT+SBDRB\r",
            Self::CallStatus => b"AT+CLCC\r",
            Self::ClearMoBuffer => b"AT+SBDD0\r",
            Self::Revision => b"AT+CGMR\r",
            Self::Hangup => b"AT+CHUP\r",
            Self::SbdStatus => b"AT+SBDSX\r",
            Self::InitiateSession => b"AT+SBDIX\r\n",
            Self::InitiateAlertSession => b"AT+SBDIXA\r\n",
        }
    }

    pub fn timeout_class(self) -> TimeoutClass {
        match self {
            Self::InitiateSession | Self::InitiateAlertSession => TimeoutClass::Satellite,
            _ => TimeoutClass::Local,
        }
    }
}

/// Expected response prefixes.
pub const RSP_READY: &str = "READY\r";
pub const RSP_SBDIX_PREFIX: &str = "+SBDIX:";
pub const RSP_SBDSX_PREFIX: &str = "+SBDSX:";
pub const RSP_CSQ_PREFIX: &str = "+CSQF:";
pub const RSP_CLCC_PREFIX: &str = "+CLCC:";
pub const RSP_CREG_PREFIX: &str = "+CREG:";
pub const RSP_REVISION_PREFIX: &str = "Call Processor Version: ";

/// Generic single-byte result codes.
pub const RSP_OK: u8 = b'0';
pub const RSP_ERROR: u8 = b'4';
/// `AT+SBDD0` failure.
pub const RSP_CLEAR_FAIL: u8 = b'1';
/// `AT+SBDWB` verb-specific codes.
pub const RSP_WB_TIMEOUT: u8 = b'1';
pub const RSP_WB_BAD_CHECKSUM: u8 = b'2';
pub const RSP_WB_BAD_SIZE: u8 = b'3';

/// The aux-board verb set. Relays are zero-based on the wire while the
/// hardware labels are one-based; the ringer command polarity is reversed
/// (`set ringer 0` turns the ringers ON).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxCommand {
    Relay1Off,
    Relay1On,
    Relay1Status,
    Relay2Off,
    Relay2On,
    Relay2Status,
    RingerOff,
    RingerOn,
    RingerStatus,
    Reset,
    DownloadConfig,
    VersionCheck,
    LoadFlash,
    CancelLoadFlash,
    /// F1 function key, aux style (`ESC O P`).
    FnKey1,
    /// F4 function key, aux style (`ESC O S`).
    FnKey4,
}

impl AuxCommand {
    pub fn bytes(self) -> &'static [u8] {
        match self {
            Self::Relay1Off => b"set relay 0 0",
            Self::Relay1On => b"set relay 0 1",
            Self::Relay1Status => b"set relay 0\r",
            Self::Relay2Off => b"set relay 1 0",
            Self::Relay2On => b"set relay 1 1",
            Self::Relay2Status => b"set relay 1\r",
            Self::RingerOff => b"set ringer 1",
            Self::RingerOn => b"set ringer 0",
            Self::RingerStatus => b"set ringer\r",
            Self::Reset => b"reset",
            Self::DownloadConfig => b"download config\r\n",
            Self::VersionCheck => b"~",
            Self::LoadFlash => b"reload flash",
            Self::CancelLoadFlash => b"c\r",
            Self::FnKey1 => &[0x1B, 0x4F, 0x50],
            Self::FnKey4 => &[0x1B, 0x4F, 0x53],
        }
    }

    /// Last byte of the command — the dual-EOL assembler's second terminator
    /// when matching the `CMD: <echo>` reply.
    pub fn echo_terminator(self) -> u8 {
        *self.bytes().last().expect("aux commands are non-empty")
    }
}

/// Aux status reply strings (substring matches; relays are zero-based in the
/// reply as well).
pub const AUX_RSP_RINGER_OFF: &str = "Ringer(s) Off";
pub const AUX_RSP_RINGER_ON: &str = "Ringer(s) On";
pub const AUX_RSP_RELAY_OFF: [&str; 2] = ["Relay[0] Off", "Relay[1] Off"];
pub const AUX_RSP_RELAY_ON: [&str; 2] = ["Relay[0] On", "Relay[1] On"];
/// Expected aux firmware version banner.
pub const AUX_RSP_VERSION: &str = "20400000 1B010000";

/// Single-byte aux programming status grammar.
pub const PROG_BLOCK_PASSED: u8 = b'a';
pub const PROG_UPLOAD_SUCCESSFUL: u8 = b'C';
pub const PROG_BAD_CHECKSUM: u8 = b'N';
pub const PROG_BAD_CHAR: u8 = b'n';
pub const PROG_BAD_FORMAT: u8 = b'F';
pub const PROG_MANUFACTURER_ERROR: u8 = b'M';
pub const PROG_OUT_OF_FLASH: u8 = b'O';
pub const PROG_PAGE_ERASE_ERROR: u8 = b'E';
pub const PROG_PAGE_WRITE_ERROR: u8 = b'e';
pub const PROG_BAD_HW_ID: u8 = b'H';
