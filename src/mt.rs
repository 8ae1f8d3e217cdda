//! Mobile-terminated message classification.
//!
//! Every MT message carries a 16-bit type in its second word. A closed table
//! maps specific types to system actions (the message is consumed, nothing is
//! persisted); every other type falls through to directory routing, which
//! sweeps the type space in consecutive 32-wide blocks across the device
//! directories.
//!
//! Payload layout (after the 2-byte length, before the 2-byte checksum):
//!
//! ```text
//! [0..2]  header checksum (verified upstream by the message-format module)
//! [2..4]  MT type, big-endian
//! [4..8]  command date/time, big-endian (command types only)
//! [8..10] option word, big-endian (the log-request types only)
//! ```

use crate::hooks::NotifyPort;

/// Width of one routing block minus one.
pub const TYPE_RANGE: u16 = 0x001F;

/// Remote-command MT types. The numeric values are deployment-private; the
/// block sits outside the routing sweep and the root override.
pub mod types {
    /// Graceful remote system reset.
    pub const A_ARF: u16 = 0x0601;
    /// Abrupt remote system reset.
    pub const B_ARF: u16 = 0x0602;
    pub const ROIACK_MSG_TYPE: u16 = 0x0603;
    pub const EEPROM_CFG_REQ: u16 = 0x0604;
    pub const POWER_CYCLE_MODEM: u16 = 0x0605;
    pub const FORMAT_FLASH_CARD: u16 = 0x0606;
    pub const POWER_CYCLE_AUX: u16 = 0x0607;
    pub const PURGE_RULES_FLASH: u16 = 0x0608;
    pub const PURGE_RULES_FILE: u16 = 0x0609;
    pub const DOWNLOAD_AUX_CONFIG: u16 = 0x060A;
    pub const FWACK3_MSG_TYPE: u16 = 0x060B;
    pub const MODEMLOG_MSG_TYPE: u16 = 0x060C;
    pub const VERSION_SN_TYPE: u16 = 0x060D;
    pub const LOCATION_TYPE: u16 = 0x060E;
    pub const RESET_DATA_BUS: u16 = 0x060F;
    pub const GET_LOGS_IMMEDIATELY: u16 = 0x0610;
    pub const GET_LOGS_AFTER_FDR: u16 = 0x0611;

    /// Types that get a system filename instead of a time-sequenced one.
    pub const DELETE_DIR_FILES_BASE: u16 = 0x0480; // one per device directory
    pub const EEPROM_CFG_MSG_TYPE: u16 = 0x0488;
    pub const STORAGE_STATUS_MSG_TYPE: u16 = 0x0489;
}

/// Destination device directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceDir {
    Modem,
    Rs422Port2,
    Rs422Port3,
    Ela,
    Compress,
    Decomp,
    Firmware,
    System,
    Root,
}

impl DeviceDir {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Modem => "modem",
            Self::Rs422Port2 => "port2",
            Self::Rs422Port3 => "port3",
            Self::Ela => "ela",
            Self::Compress => "compress",
            Self::Decomp => "decomp",
            Self::Firmware => "firmware",
            Self::System => "system",
            Self::Root => "",
        }
    }
}

/// Destination subdirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubDir {
    None,
    Inbox,
    Outbox,
    Error,
    Working,
    Sent,
    Fdr,
}

impl SubDir {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Inbox => "inbox",
            Self::Outbox => "outbox",
            Self::Error => "error",
            Self::Working => "working",
            Self::Sent => "sent",
            Self::Fdr => "fdrlogs",
        }
    }
}

/// What to do with a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Action-only; nothing persisted.
    BufferOnly,
    SaveToFile,
    /// Save, then mirror the file into the port-3 tree.
    CopyPort3,
}

/// System actions triggered by specific MT types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtAction {
    PrepareGracefulReset,
    PrepareAbruptReset,
    BuildRoiAck,
    ConfigRequest,
    PowerCycleModem,
    FormatStorage,
    PowerCycleAux,
    PurgeRulesFlash,
    PurgeRulesFile,
    DownloadAuxConfig,
    BuildSystemLogMessage,
    BuildModemLogMessage,
    BuildVersionMessage,
    BuildGpsMessage,
    ResetDataBus,
    LogsImmediately,
    LogsAfterFdr,
}

/// Classification result for one MT type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtClass {
    Action(MtAction),
    Route(Disposition, DeviceDir, SubDir),
}

/// Classify an MT type: action table first, directory routing otherwise.
pub fn classify(msg_type: u16) -> MtClass {
    use types::{
        A_ARF, B_ARF, DOWNLOAD_AUX_CONFIG, EEPROM_CFG_REQ, FORMAT_FLASH_CARD, FWACK3_MSG_TYPE,
        GET_LOGS_AFTER_FDR, GET_LOGS_IMMEDIATELY, LOCATION_TYPE, MODEMLOG_MSG_TYPE,
        POWER_CYCLE_AUX, POWER_CYCLE_MODEM, PURGE_RULES_FILE, PURGE_RULES_FLASH, RESET_DATA_BUS,
        ROIACK_MSG_TYPE, VERSION_SN_TYPE,
    };

    let action = match msg_type {
        A_ARF => Some(MtAction::PrepareGracefulReset),
        B_ARF => Some(MtAction::PrepareAbruptReset),
        ROIACK_MSG_TYPE => Some(MtAction::BuildRoiAck),
        EEPROM_CFG_REQ => Some(MtAction::ConfigRequest),
        POWER_CYCLE_MODEM => Some(MtAction::PowerCycleModem),
        FORMAT_FLASH_CARD => Some(MtAction::FormatStorage),
        POWER_CYCLE_AUX => Some(MtAction::PowerCycleAux),
        PURGE_RULES_FLASH => Some(MtAction::PurgeRulesFlash),
        PURGE_RULES_FILE => Some(MtAction::PurgeRulesFile),
        DOWNLOAD_AUX_CONFIG => Some(MtAction::DownloadAuxConfig),
        FWACK3_MSG_TYPE => Some(MtAction::BuildSystemLogMessage),
        MODEMLOG_MSG_TYPE => Some(MtAction::BuildModemLogMessage),
        VERSION_SN_TYPE => Some(MtAction::BuildVersionMessage),
        LOCATION_TYPE => Some(MtAction::BuildGpsMessage),
        RESET_DATA_BUS => Some(MtAction::ResetDataBus),
        GET_LOGS_IMMEDIATELY => Some(MtAction::LogsImmediately),
        GET_LOGS_AFTER_FDR => Some(MtAction::LogsAfterFdr),
        _ => None,
    };

    match action {
        Some(a) => MtClass::Action(a),
        None => {
            let (disposition, device, subdir) = route(msg_type);
            MtClass::Route(disposition, device, subdir)
        }
    }
}

/// The routing sweep: 32-wide blocks over the device/subdir order below. The
/// Modem block skips the error and working subdirs; the System block has
/// only the bare and FDR-log subdirs; `0x0700..=0x071F` overrides to the
/// device root; anything unmatched lands in the modem inbox.
fn route(msg_type: u16) -> (Disposition, DeviceDir, SubDir) {
    if (0x0700..=0x0700 + TYPE_RANGE).contains(&msg_type) {
        return (Disposition::SaveToFile, DeviceDir::Root, SubDir::None);
    }

    const FULL: [SubDir; 5] = [
        SubDir::None,
        SubDir::Inbox,
        SubDir::Outbox,
        SubDir::Error,
        SubDir::Working,
    ];

    let mut block = msg_type / (TYPE_RANGE + 1);

    let modem: [SubDir; 4] = [SubDir::None, SubDir::Inbox, SubDir::Outbox, SubDir::Sent];
    if (block as usize) < modem.len() {
        return (
            Disposition::SaveToFile,
            DeviceDir::Modem,
            modem[block as usize],
        );
    }
    block -= modem.len() as u16;

    for (device, disposition) in [
        (DeviceDir::Rs422Port2, Disposition::CopyPort3),
        (DeviceDir::Rs422Port3, Disposition::SaveToFile),
        (DeviceDir::Ela, Disposition::SaveToFile),
        (DeviceDir::Compress, Disposition::SaveToFile),
        (DeviceDir::Decomp, Disposition::SaveToFile),
        (DeviceDir::Firmware, Disposition::SaveToFile),
    ] {
        if (block as usize) < FULL.len() {
            return (disposition, device, FULL[block as usize]);
        }
        block -= FULL.len() as u16;
    }

    let system: [SubDir; 2] = [SubDir::None, SubDir::Fdr];
    if (block as usize) < system.len() {
        return (
            Disposition::SaveToFile,
            DeviceDir::System,
            system[block as usize],
        );
    }

    (Disposition::SaveToFile, DeviceDir::Modem, SubDir::Inbox)
}

/// True when the type gets a system filename keyed off the type value.
pub fn uses_system_filename(msg_type: u16) -> bool {
    (types::DELETE_DIR_FILES_BASE..=types::STORAGE_STATUS_MSG_TYPE).contains(&msg_type)
}

/// Command date/time field, big-endian at payload offset 4.
pub fn date_time(payload: &[u8]) -> u32 {
    match payload.get(4..8) {
        Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        None => 0,
    }
}

/// Option word, big-endian at payload offset 8.
pub fn option_word(payload: &[u8]) -> u16 {
    match payload.get(8..10) {
        Some(b) => u16::from_be_bytes([b[0], b[1]]),
        None => 0,
    }
}

/// MT type word, big-endian at payload offset 2.
pub fn message_type(payload: &[u8]) -> u16 {
    match payload.get(2..4) {
        Some(b) => u16::from_be_bytes([b[0], b[1]]),
        None => 0,
    }
}

/// Hand-off from the engine to the upper layer after an MT read completes.
#[derive(Debug, Clone)]
pub struct MtReceipt {
    pub msg_type: u16,
    pub disposition: Disposition,
    pub ok: bool,
    /// Saved path, or a type tag for buffer-only messages — used as the
    /// modem-log label.
    pub label: String,
    /// Outcome of the port-3 mirror copy, when one was attempted.
    pub copy_ok: Option<bool>,
    pub notify: NotifyDecision,
    /// The remote command asked for an aux-config upload to start.
    pub start_aux_upload: bool,
}

/// Which inboxes light the text-message indicator relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationMode {
    None,
    Port2,
    Port3,
    Both,
    Either,
}

impl NotificationMode {
    pub fn from_name(name: &str) -> Self {
        match name {
            "port2" => Self::Port2,
            "port3" => Self::Port3,
            "both" => Self::Both,
            "either" => Self::Either,
            _ => Self::None,
        }
    }
}

/// What the notification policy wants done after a successful save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyDecision {
    /// Desired indicator relay state, `None` to leave it alone.
    pub relay_on: Option<bool>,
    /// Ports whose pending-read flag should be cleared.
    pub clear_ports: Vec<NotifyPort>,
}

/// Apply the notification policy for a message saved to `device`/`subdir`.
pub fn notification_decision(
    mode: NotificationMode,
    disposition: Disposition,
    device: DeviceDir,
    subdir: SubDir,
) -> NotifyDecision {
    let copied = disposition == Disposition::CopyPort3;
    let outbox = subdir == SubDir::Outbox;

    match mode {
        NotificationMode::None => NotifyDecision {
            relay_on: Some(false),
            clear_ports: Vec::new(),
        },
        NotificationMode::Port2 => {
            if outbox && device == DeviceDir::Rs422Port2 {
                NotifyDecision {
                    relay_on: Some(true),
                    clear_ports: vec![NotifyPort::Port2],
                }
            } else {
                NotifyDecision::default()
            }
        }
        NotificationMode::Port3 => {
            if outbox && (copied || device == DeviceDir::Rs422Port3) {
                NotifyDecision {
                    relay_on: Some(true),
                    clear_ports: vec![NotifyPort::Port3],
                }
            } else {
                NotifyDecision::default()
            }
        }
        NotificationMode::Both | NotificationMode::Either => {
            if outbox
                && (copied
                    || device == DeviceDir::Rs422Port2
                    || device == DeviceDir::Rs422Port3)
            {
                NotifyDecision {
                    relay_on: Some(true),
                    clear_ports: vec![NotifyPort::Port2, NotifyPort::Port3],
                }
            } else {
                NotifyDecision::default()
            }
        }
    }
}
