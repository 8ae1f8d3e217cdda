//! The closed error-code taxonomy recorded by the protocol engine.
//!
//! One code is recorded per command; the API layer copies it into the modem
//! log and decides whether to retry or surface it. The variant order is part
//! of the external contract for log readers — append only.

use serde::Serialize;

/// Reason a command failed (or an informational annotation for probes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ErrorCode {
    #[default]
    None,
    Error,
    HwError,
    RxBufferOverflow,
    RspTimedOut,
    TxBinDataTimeout,
    TxBinDataBadChecksum,
    TxBinDataBadSize,
    SbdiGssTimeout,
    SbdiGssQueueFull,
    SbdiMoSegmentErr,
    SbdiIncompleteSession,
    SbdiSegmentSizeErr,
    SbdiGssAccessDenied,
    SbdiSbdBlocked,
    SbdiIsuTimeout,
    SbdiRfDrop,
    SbdiProtocolErr,
    SbdiNoNetworkService,
    SbdiIsuBusy,
    SbdiFail,
    ClearModemBufferError,
    FileOpenErr,
    FileReadErr,
    FileWriteErr,
    TruncatedFile,
    CregNotRegistered,
    CregRegisteredHome,
    CregSearching,
    CregDenied,
    CregUnknown,
    CregRegisteredRoaming,
    CsqError,
    ActiveCallStatus,
    HeldCallStatus,
    DialingCallStatus,
    IncomingCallStatus,
    WaitingCallStatus,
    IdleCallStatus,
    RxNoMsgWaiting,
    RxBadChecksum,
    RxBadFilelength,
    ModemPoweredDown,
    AuxRingerOff,
    AuxRingerOn,
    AuxRelay1Off,
    AuxRelay1On,
    AuxRelay2Off,
    AuxRelay2On,
}

impl ErrorCode {
    /// Short log string. Empty for `None` so clean entries stay clean.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Error => "modem error response",
            Self::HwError => "modem hardware error",
            Self::RxBufferOverflow => "rx buffer overflow",
            Self::RspTimedOut => "response timed out",
            Self::TxBinDataTimeout => "binary write local timeout",
            Self::TxBinDataBadChecksum => "binary write bad checksum",
            Self::TxBinDataBadSize => "binary write bad size",
            Self::SbdiGssTimeout => "session: gateway timeout",
            Self::SbdiGssQueueFull => "session: gateway queue full",
            Self::SbdiMoSegmentErr => "session: MO segment error",
            Self::SbdiIncompleteSession => "session: incomplete",
            Self::SbdiSegmentSizeErr => "session: segment size error",
            Self::SbdiGssAccessDenied => "session: access denied",
            Self::SbdiSbdBlocked => "session: SBD blocked",
            Self::SbdiIsuTimeout => "session: ISU timeout",
            Self::SbdiRfDrop => "session: RF drop",
            Self::SbdiProtocolErr => "session: protocol error",
            Self::SbdiNoNetworkService => "session: no network service",
            Self::SbdiIsuBusy => "session: ISU busy",
            Self::SbdiFail => "session: failed",
            Self::ClearModemBufferError => "clear buffer error",
            Self::FileOpenErr => "file open error",
            Self::FileReadErr => "file read error",
            Self::FileWriteErr => "file write error",
            Self::TruncatedFile => "file truncated",
            Self::CregNotRegistered => "creg: not registered",
            Self::CregRegisteredHome => "creg: registered home",
            Self::CregSearching => "creg: searching",
            Self::CregDenied => "creg: denied",
            Self::CregUnknown => "creg: unknown",
            Self::CregRegisteredRoaming => "creg: registered roaming",
            Self::CsqError => "csq error",
            Self::ActiveCallStatus => "call: active",
            Self::HeldCallStatus => "call: held",
            Self::DialingCallStatus => "call: dialing",
            Self::IncomingCallStatus => "call: incoming",
            Self::WaitingCallStatus => "call: waiting",
            Self::IdleCallStatus => "call: idle",
            Self::RxNoMsgWaiting => "rx: no message waiting",
            Self::RxBadChecksum => "rx: bad checksum",
            Self::RxBadFilelength => "rx: bad file length",
            Self::ModemPoweredDown => "modem powered down",
            Self::AuxRingerOff => "aux: ringers off",
            Self::AuxRingerOn => "aux: ringers on",
            Self::AuxRelay1Off => "aux: relay 1 off",
            Self::AuxRelay1On => "aux: relay 1 on",
            Self::AuxRelay2Off => "aux: relay 2 off",
            Self::AuxRelay2On => "aux: relay 2 on",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_renders_empty() {
        assert_eq!(ErrorCode::None.as_str(), "");
        assert!(!ErrorCode::SbdiSbdBlocked.as_str().is_empty());
    }
}
