//! Pure parsers for the modem's line responses.
//!
//! Each parser takes the assembled line as text and returns `None` when the
//! expected prefix is absent (the engine keeps polling until the timeout
//! fires). Numeric fields that fail to parse degrade to 0, matching the
//! tolerance of the device's sometimes space-padded field formatting.

use super::command::{
    IMEI_LEN, MODEM_SW_VER_LEN, RSP_CLCC_PREFIX, RSP_CREG_PREFIX, RSP_CSQ_PREFIX,
    RSP_REVISION_PREFIX, RSP_SBDIX_PREFIX, RSP_SBDSX_PREFIX,
};
use super::error::ErrorCode;

/// The six `+SBDIX:` fields. MSNs stay text — they are five-digit decimals
/// reported verbatim in the modem log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbdixFields {
    pub mo_status: u8,
    pub mo_msn: String,
    pub mt_status: u8,
    pub mt_msn: String,
    pub mt_length: u16,
    pub mt_queue_nbr: u8,
}

/// Parse `+SBDIX: a, bbbbb, c, ddddd, eeee, ff`.
pub fn parse_sbdix(line: &str) -> Option<SbdixFields> {
    let rest = strip_after_prefix(line, RSP_SBDIX_PREFIX)?;
    let mut fields = rest.split(',').map(str::trim);

    Some(SbdixFields {
        mo_status: num(fields.next()?),
        mo_msn: fields.next()?.to_string(),
        mt_status: num(fields.next()?),
        mt_msn: fields.next()?.to_string(),
        mt_length: num(fields.next()?),
        mt_queue_nbr: num(fields.next()?),
    })
}

/// Map an `+SBDIX:` MO status to the command outcome. `Ok(())` covers the
/// success classes 0..=4 (0 ok, 1 MT truncated, 2 no location update, 3/4
/// reserved-but-success); everything else is the session error taxonomy.
pub fn classify_mo_status(mo_status: u8) -> Result<(), ErrorCode> {
    match mo_status {
        0..=4 => Ok(()),
        10 => Err(ErrorCode::SbdiGssTimeout),
        11 => Err(ErrorCode::SbdiGssQueueFull),
        12 => Err(ErrorCode::SbdiMoSegmentErr),
        13 => Err(ErrorCode::SbdiIncompleteSession),
        14 => Err(ErrorCode::SbdiSegmentSizeErr),
        15 => Err(ErrorCode::SbdiGssAccessDenied),
        // Hardware-class fault; the engine escalates this one to the system log.
        16 => Err(ErrorCode::SbdiSbdBlocked),
        17 => Err(ErrorCode::SbdiIsuTimeout),
        18 => Err(ErrorCode::SbdiRfDrop),
        19 => Err(ErrorCode::SbdiProtocolErr),
        32 => Err(ErrorCode::SbdiNoNetworkService),
        35 => Err(ErrorCode::SbdiIsuBusy),
        // 5..=9, 20..=31, 33..=34, 36.. are reserved-for-future-use failures.
        _ => Err(ErrorCode::SbdiFail),
    }
}

/// The six `+SBDSX:` fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbdsxFields {
    pub mo_flag: u8,
    pub mo_msn: String,
    pub mt_flag: u8,
    pub mt_msn: String,
    pub ra_flag: u8,
    pub queued: u8,
}

/// Parse `+SBDSX: a, bbbbb, c, ddddd, e, f`.
pub fn parse_sbdsx(line: &str) -> Option<SbdsxFields> {
    let rest = strip_after_prefix(line, RSP_SBDSX_PREFIX)?;
    let mut fields = rest.split(',').map(str::trim);

    Some(SbdsxFields {
        mo_flag: num(fields.next()?),
        mo_msn: fields.next()?.to_string(),
        mt_flag: num(fields.next()?),
        mt_msn: fields.next()?.to_string(),
        ra_flag: num(fields.next()?),
        queued: num(fields.next()?),
    })
}

/// Parse `+CSQF:n` → signal level 0..=5.
pub fn parse_csq(line: &str) -> Option<u8> {
    let rest = strip_after_prefix(line, RSP_CSQ_PREFIX)?;
    let level = num::<u8>(rest.trim());
    (level <= 5).then_some(level)
}

/// Parse `+CREG:aaa,bbb` → (setting, status).
pub fn parse_creg(line: &str) -> Option<(u16, u16)> {
    let rest = strip_after_prefix(line, RSP_CREG_PREFIX)?;
    let mut fields = rest.split(',').map(str::trim);
    let setting = num(fields.next()?);
    let status = num(fields.next()?);
    Some((setting, status))
}

/// Map a CREG status field to its log annotation; `Err` marks the statuses
/// that are an Iridium-side fault. A value outside the documented set
/// returns `None` — the caller keeps polling and the response timeout
/// decides, like the unknown-code handling in the CLCC parser.
pub fn classify_creg(status: u16) -> Option<Result<ErrorCode, ErrorCode>> {
    match status {
        0 => Some(Err(ErrorCode::CregNotRegistered)),
        1 => Some(Ok(ErrorCode::CregRegisteredHome)),
        2 => Some(Ok(ErrorCode::CregSearching)),
        3 => Some(Ok(ErrorCode::CregDenied)),
        4 => Some(Ok(ErrorCode::CregUnknown)),
        5 => Some(Ok(ErrorCode::CregRegisteredRoaming)),
        _ => None,
    }
}

/// Parse `+CLCC:nnn` → call status code.
pub fn parse_clcc(line: &str) -> Option<u8> {
    let rest = strip_after_prefix(line, RSP_CLCC_PREFIX)?;
    Some(num(rest.trim()))
}

/// Validate and extract a 15-digit IMEI from the response line.
pub fn parse_imei(line: &str) -> Option<String> {
    let bytes = line.trim().as_bytes();
    if bytes.len() >= IMEI_LEN && bytes[..IMEI_LEN].iter().all(u8::is_ascii_digit) {
        Some(String::from_utf8_lossy(&bytes[..IMEI_LEN]).into_owned())
    } else {
        None
    }
}

/// Extract the software version following `Call Processor Version: `,
/// truncated to the significant width.
pub fn parse_revision(line: &str) -> Option<String> {
    let rest = strip_after_prefix(line, RSP_REVISION_PREFIX)?;
    let end = rest.len().min(MODEM_SW_VER_LEN);
    Some(rest[..end].trim_end().to_string())
}

/// Locate `prefix` anywhere in `line` (stray bytes may precede it) and
/// return the text after it.
fn strip_after_prefix<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let at = line.find(prefix)?;
    Some(&line[at + prefix.len()..])
}

fn num<T: std::str::FromStr + Default>(field: &str) -> T {
    field.trim().parse().unwrap_or_default()
}
