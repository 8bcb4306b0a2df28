use anyhow::{Context, Result};
use nix::libc;
use nix::sys::termios::{self, SetArg, Termios};
use std::os::fd::{AsFd, AsRawFd};

/// Holds a tty in raw mode. The saved settings come back on drop.
#[cfg(unix)]
pub struct RawMode<F: AsFd> {
    fd: F,
    saved: Termios,
}

#[cfg(unix)]
impl<F: AsFd> RawMode<F> {
    /// Switch `fd` to raw mode. Fails when `fd` is not a terminal.
    pub fn enter(fd: F) -> Result<Self> {
        let saved = termios::tcgetattr(fd.as_fd()).context("not a terminal")?;
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(fd.as_fd(), SetArg::TCSANOW, &raw)
            .context("failed to enter raw mode")?;
        Ok(Self { fd, saved })
    }
}

#[cfg(unix)]
impl<F: AsFd> Drop for RawMode<F> {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(self.fd.as_fd(), SetArg::TCSANOW, &self.saved);
    }
}

/// Window size of the tty behind `fd` as `(cols, rows)`. `None` for a pipe,
/// a file, or a terminal that reports zero size.
#[cfg(unix)]
pub fn window_size(fd: impl AsFd) -> Option<(u16, u16)> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let ret = unsafe { libc::ioctl(fd.as_fd().as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
    if ret == -1 || ws.ws_col == 0 || ws.ws_row == 0 {
        return None;
    }
    Some((ws.ws_col, ws.ws_row))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use nix::pty::{Winsize, openpty};
    use nix::sys::termios::LocalFlags;

    fn is_cooked(fd: impl AsFd) -> bool {
        termios::tcgetattr(fd.as_fd())
            .map(|t| t.local_flags.contains(LocalFlags::ICANON | LocalFlags::ECHO))
            .unwrap_or(false)
    }

    fn pty(cols: u16, rows: u16) -> nix::pty::OpenptyResult {
        let size = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        openpty(&size, None).unwrap()
    }

    #[test]
    fn window_size_reads_pty_geometry() {
        let pair = pty(132, 43);
        assert_eq!(window_size(&pair.slave), Some((132, 43)));

        let zero = pty(0, 0);
        assert_eq!(window_size(&zero.slave), None);
    }

    #[test]
    fn window_size_of_plain_file_is_none() {
        let file = tempfile::tempfile().unwrap();
        assert_eq!(window_size(&file), None);
    }

    #[test]
    fn raw_mode_restores_on_drop() {
        let pair = pty(80, 24);
        assert!(is_cooked(&pair.slave));
        {
            let _raw = RawMode::enter(&pair.slave).unwrap();
            assert!(!is_cooked(&pair.slave));
        }
        assert!(is_cooked(&pair.slave));
    }

    #[test]
    fn raw_mode_refuses_non_terminal() {
        let file = tempfile::tempfile().unwrap();
        let err = RawMode::enter(&file).err().unwrap();
        assert!(err.to_string().contains("not a terminal"));
    }
}
