//! Kernel console output.
//!
//! The concrete UART is an external collaborator (board-specific driver);
//! this module only owns the trait contract and the global instance the
//! `kernel_putc`/`kernel_puts` syscalls and panic handler write through.

use spin::Mutex;

use crate::sync::once_lock::GlobalState;

/// Contract a board's concrete UART driver must satisfy to back the kernel
/// console.
pub trait Console: Sync {
    fn write_byte(&self, byte: u8);

    fn write_str(&self, s: &str) {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
    }
}

static CONSOLE: GlobalState<Mutex<&'static dyn Console>> = GlobalState::new();

/// Install the board's concrete console. Must run once, at boot, before any
/// `print!`/`println!` use.
pub fn init(console: &'static dyn Console) {
    let _ = CONSOLE.init(Mutex::new(console));
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    use core::fmt::Write;

    struct Writer;
    impl Write for Writer {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            let _ = CONSOLE.with(|mtx| mtx.lock().write_str(s));
            Ok(())
        }
    }
    let _ = Writer.write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::print::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct CountingConsole(AtomicUsize);
    impl Console for CountingConsole {
        fn write_byte(&self, _byte: u8) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn write_str_counts_every_byte() {
        static CONSOLE: CountingConsole = CountingConsole(AtomicUsize::new(0));
        CONSOLE.write_str("hello");
        assert_eq!(CONSOLE.0.load(Ordering::Relaxed), 5);
    }
}
