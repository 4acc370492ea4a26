//! Raw serial port setup
//!
//! Configures a tty for 8N1 raw input with a short read timeout, so a
//! blocking reader wakes up regularly even when the receiver is silent.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Read timeout in deciseconds (termios VTIME)
const READ_TIMEOUT_DS: libc::cc_t = 5;

/// Open `path` as a raw serial port at `baud`
pub fn open_serial(path: &Path, baud: u32) -> io::Result<File> {
    let speed = baud_constant(baud).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("unsupported baud rate {baud}"))
    })?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(path)?;
    let fd = file.as_raw_fd();

    // SAFETY: `tty` is fully initialized by tcgetattr before use and `fd`
    // stays open for the duration of these calls.
    unsafe {
        let mut tty: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut tty) != 0 {
            return Err(io::Error::last_os_error());
        }

        libc::cfmakeraw(&mut tty);
        tty.c_cflag |= libc::CLOCAL | libc::CREAD;
        tty.c_cc[libc::VMIN] = 0;
        tty.c_cc[libc::VTIME] = READ_TIMEOUT_DS;

        if libc::cfsetispeed(&mut tty, speed) != 0 || libc::cfsetospeed(&mut tty, speed) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::tcsetattr(fd, libc::TCSANOW, &tty) != 0 {
            return Err(io::Error::last_os_error());
        }
        libc::tcflush(fd, libc::TCIFLUSH);
    }

    tracing::info!("Opened serial port {:?} at {} baud", path, baud);
    Ok(file)
}

fn baud_constant(baud: u32) -> Option<libc::speed_t> {
    let speed = match baud {
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        _ => return None,
    };
    Some(speed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_rates() {
        assert_eq!(baud_constant(9600), Some(libc::B9600));
        assert_eq!(baud_constant(12345), None);
    }

    #[test]
    fn test_open_errors() {
        let missing = open_serial(Path::new("/dev/definitely-not-a-gps"), 9600).unwrap_err();
        assert_eq!(missing.kind(), io::ErrorKind::NotFound);

        let bad_baud = open_serial(Path::new("/dev/null"), 12345).unwrap_err();
        assert_eq!(bad_baud.kind(), io::ErrorKind::InvalidInput);

        // Not a terminal
        assert!(open_serial(Path::new("/dev/null"), 9600).is_err());
    }
}
