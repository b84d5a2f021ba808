//! Local terminal capability.
//!
//! The resize loop needs four things from the terminal it is attached to:
//! its size, a way to change that size, a way to write escape sequences to
//! it, and a notification whenever the operating system reports a window
//! change. [`LocalTerminal`] captures exactly that; [`Tty`] is the Unix
//! implementation on top of `ioctl` and `SIGWINCH`.

use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Mutex;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::transport::TerminalSize;

/// Escape sequence asking a terminal emulator to resize its window.
pub fn resize_escape(size: TerminalSize) -> String {
    format!("\x1b[8;{};{}t", size.height, size.width)
}

pub trait LocalTerminal: Send + Sync {
    fn size(&self) -> io::Result<TerminalSize>;

    fn set_size(&self, size: TerminalSize) -> io::Result<()>;

    /// Write raw bytes (escape sequences) straight to the terminal.
    fn echo(&self, bytes: &[u8]) -> io::Result<()>;

    /// Receive one message per window-size-changed notification.
    ///
    /// Notifications may be coalesced. Dropping the receiver unsubscribes.
    fn subscribe_resize(&self) -> io::Result<mpsc::Receiver<()>>;
}

/// The controlling terminal of this process (stdin/stdout).
#[derive(Debug, Default)]
pub struct Tty;

impl Tty {
    pub fn new() -> Self {
        Self
    }

    /// Whether stdin is attached to a terminal.
    pub fn is_attached() -> bool {
        unsafe { libc::isatty(io::stdin().as_raw_fd()) == 1 }
    }
}

impl LocalTerminal for Tty {
    fn size(&self) -> io::Result<TerminalSize> {
        let fd = io::stdout().as_raw_fd();
        let mut winsize = std::mem::MaybeUninit::<libc::winsize>::uninit();
        let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, winsize.as_mut_ptr()) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        let winsize = unsafe { winsize.assume_init() };
        Ok(TerminalSize::new(winsize.ws_col, winsize.ws_row))
    }

    fn set_size(&self, size: TerminalSize) -> io::Result<()> {
        let fd = io::stdout().as_raw_fd();
        let winsize = libc::winsize {
            ws_row: size.height,
            ws_col: size.width,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let result = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &winsize) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn echo(&self, bytes: &[u8]) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(bytes)?;
        stdout.flush()
    }

    fn subscribe_resize(&self) -> io::Result<mpsc::Receiver<()>> {
        let mut winch = signal(SignalKind::window_change())?;
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    received = winch.recv() => {
                        if received.is_none() {
                            break;
                        }
                        // A full channel already carries a pending notification.
                        let _ = tx.try_send(());
                    }
                }
            }
            debug!("Window change subscription ended");
        });

        Ok(rx)
    }
}

/// Original terminal settings to restore on exit.
static ORIGINAL_TERMIOS: Mutex<Option<libc::termios>> = Mutex::new(None);

/// Puts stdin into raw mode and restores the original settings on drop.
pub struct RawModeGuard {
    fd: RawFd,
}

impl RawModeGuard {
    pub fn enter() -> io::Result<Self> {
        let fd = io::stdin().as_raw_fd();

        let mut termios = std::mem::MaybeUninit::<libc::termios>::uninit();
        let result = unsafe { libc::tcgetattr(fd, termios.as_mut_ptr()) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        let original = unsafe { termios.assume_init() };

        if let Ok(mut guard) = ORIGINAL_TERMIOS.lock() {
            *guard = Some(original);
        }

        let mut raw = original;
        unsafe { libc::cfmakeraw(&mut raw) };

        let result = unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &raw) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }

        debug!("Entered raw terminal mode");
        Ok(Self { fd })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Ok(mut guard) = ORIGINAL_TERMIOS.lock()
            && let Some(original) = guard.take()
        {
            let result = unsafe { libc::tcsetattr(self.fd, libc::TCSAFLUSH, &original) };
            if result != 0 {
                warn!("Failed to restore terminal settings");
            } else {
                debug!("Restored terminal settings");
            }
        }
    }
}
