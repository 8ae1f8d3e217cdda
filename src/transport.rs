//! Serial transport seam: the shared UART behind the modem/aux port-routing
//! toggle, plus the modem control lines the driver watches.
//!
//! [`TtyPort`] owns the fd for a real serial device (raw 19200 8N1 via
//! termios). The driver reads one byte at a time from the kernel's receive
//! queue and never blocks: `read_byte` uses the non-blocking fd and returns
//! `None` when the queue is empty.
//!
//! Port routing selects which physical board the UART reaches:
//! `Data` = modem, `Programming` = aux board. On this rig the routing bit is
//! driven by RTS; DSR is high while a voice call holds the line off-hook and
//! RI pulses during an incoming ring.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use nix::unistd;
use tracing::{debug, info};

/// Which physical device the shared UART is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRouting {
    /// The SBD modem (default).
    Data,
    /// The aux board's programming/control side.
    Programming,
}

/// Byte-level access to the shared serial line plus the out-of-band bits the
/// driver needs. All calls are non-blocking.
pub trait SerialPort {
    /// Pop one byte from the receive queue, `None` when empty.
    fn read_byte(&mut self) -> Option<u8>;

    /// Queue bytes for transmission.
    fn write(&mut self, bytes: &[u8]) -> Result<(), String>;

    /// Drop anything pending in both directions.
    fn flush_queues(&mut self);

    /// Switch the line between the modem and the aux board.
    fn set_routing(&mut self, routing: PortRouting);

    fn routing(&self) -> PortRouting;

    /// DSR — high while a voice call is in progress (phone off-hook).
    fn dsr(&self) -> bool;

    /// RI — high during an incoming-call ring.
    fn ri(&self) -> bool;

    /// Whether the modem currently has power.
    fn modem_powered(&self) -> bool;

    /// Whether the aux board currently has power.
    fn aux_powered(&self) -> bool;
}

/// A real serial device.
pub struct TtyPort {
    fd: OwnedFd,
    device: String,
    routing: PortRouting,
    read_buf: [u8; 1],
}

impl TtyPort {
    /// Open a serial device path (e.g. `/dev/ttyS1`) and configure it raw.
    ///
    /// Returns `Err` if the device cannot be opened or termios configuration
    /// fails.
    pub fn open(device: &str, baud: u32) -> Result<Self, String> {
        let fd = fcntl::open(
            device,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(|e| format!("open {device}: {e}"))?;

        // SAFETY: fd was just returned by open and is owned from here on.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        configure_termios(fd.as_raw_fd(), baud)?;

        // Flush any stale data before the state machine starts.
        termios::tcflush(&fd, termios::FlushArg::TCIOFLUSH)
            .map_err(|e| format!("tcflush: {e}"))?;

        let mut port = Self {
            fd,
            device: device.to_string(),
            routing: PortRouting::Programming, // forced to Data just below
            read_buf: [0u8; 1],
        };
        port.set_routing(PortRouting::Data);

        info!("Serial {device}: opened ({baud} 8N1, raw)");

        Ok(port)
    }

    /// Device path this port is connected to.
    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    fn modem_bits(&self) -> libc::c_int {
        let mut bits: libc::c_int = 0;
        // SAFETY: fd is valid for the life of self; TIOCMGET writes one int.
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::TIOCMGET, &mut bits) };
        if rc < 0 {
            0
        } else {
            bits
        }
    }

    fn set_modem_bit(&self, bit: libc::c_int, on: bool) {
        let req = if on { libc::TIOCMBIS } else { libc::TIOCMBIC };
        // SAFETY: fd is valid; TIOCMBIS/TIOCMBIC read one int.
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), req, &bit) };
        if rc < 0 {
            debug!("Serial {}: modem bit ioctl failed", self.device);
        }
    }
}

impl SerialPort for TtyPort {
    fn read_byte(&mut self) -> Option<u8> {
        match unistd::read(self.fd.as_raw_fd(), &mut self.read_buf) {
            Ok(1) => Some(self.read_buf[0]),
            _ => None,
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), String> {
        let mut sent = 0;
        // Short writes are possible on a small kernel tx queue; push the rest.
        while sent < bytes.len() {
            // SAFETY: fd outlives this call.
            let bfd = unsafe { BorrowedFd::borrow_raw(self.fd.as_raw_fd()) };
            match unistd::write(bfd, &bytes[sent..]) {
                Ok(n) => sent += n,
                Err(nix::errno::Errno::EAGAIN) => continue,
                Err(e) => return Err(format!("write {}: {e}", self.device)),
            }
        }
        Ok(())
    }

    fn flush_queues(&mut self) {
        let _ = termios::tcflush(&self.fd, termios::FlushArg::TCIOFLUSH);
    }

    fn set_routing(&mut self, routing: PortRouting) {
        if self.routing == routing {
            return;
        }
        self.routing = routing;
        self.set_modem_bit(libc::TIOCM_RTS, routing == PortRouting::Programming);
        debug!("Serial {}: routing -> {routing:?}", self.device);
    }

    fn routing(&self) -> PortRouting {
        self.routing
    }

    fn dsr(&self) -> bool {
        self.modem_bits() & libc::TIOCM_DSR != 0
    }

    fn ri(&self) -> bool {
        self.modem_bits() & libc::TIOCM_RI != 0
    }

    fn modem_powered(&self) -> bool {
        // CTS is strapped to the modem's power-good output on this rig.
        self.modem_bits() & libc::TIOCM_CTS != 0
    }

    fn aux_powered(&self) -> bool {
        // CD is strapped to the aux board's power-good output.
        self.modem_bits() & libc::TIOCM_CAR != 0
    }
}

/// Configure termios: raw mode, requested baud, 8N1, no flow control.
/// VMIN=0, VTIME=0 — reads never block; the tick polls.
fn configure_termios(fd: RawFd, baud: u32) -> Result<(), String> {
    // SAFETY: fd is valid — caller just opened it.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };

    let mut tio = termios::tcgetattr(borrowed).map_err(|e| format!("tcgetattr: {e}"))?;

    termios::cfmakeraw(&mut tio);

    let rate = baud_rate(baud)?;
    termios::cfsetispeed(&mut tio, rate).map_err(|e| format!("cfsetispeed: {e}"))?;
    termios::cfsetospeed(&mut tio, rate).map_err(|e| format!("cfsetospeed: {e}"))?;

    // 8N1, CLOCAL (we read DSR/RI ourselves), CREAD (enable receiver)
    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS; // RTS is the routing bit

    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio).map_err(|e| format!("tcsetattr: {e}"))?;

    Ok(())
}

fn baud_rate(baud: u32) -> Result<BaudRate, String> {
    match baud {
        9600 => Ok(BaudRate::B9600),
        19200 => Ok(BaudRate::B19200),
        38400 => Ok(BaudRate::B38400),
        57600 => Ok(BaudRate::B57600),
        115_200 => Ok(BaudRate::B115200),
        other => Err(format!("unsupported baud rate {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_rate_table() {
        assert!(baud_rate(19200).is_ok());
        assert!(baud_rate(115_200).is_ok());
        assert!(baud_rate(12345).is_err());
    }
}
