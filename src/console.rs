//! Debug console for the boot service.
//!
//! Provides leveled text output for boot progress and error reporting.
//! Output goes to the monitor UART; under test it is captured into a
//! fixed-size buffer instead.

use core::fmt::{self, Write};
use spin::Mutex;

// Monitor UART base on the reference platform
#[cfg(not(test))]
const UART_BASE: usize = 0x1000_0000;

#[cfg(not(test))]
struct Uart {
    base: usize,
}

#[cfg(not(test))]
impl Uart {
    const fn new(base: usize) -> Self {
        Self { base }
    }

    unsafe fn putc(&self, c: u8) {
        let ptr = self.base as *mut u8;
        ptr.write_volatile(c);
    }
}

/// Severity of a console message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Fatal and unexpected conditions
    Error = 0,
    /// Recoverable oddities (skipped chunks, fallbacks)
    Warn = 1,
    /// Progress milestones
    Status = 2,
    /// Everything else
    Normal = 3,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR: ",
            LogLevel::Warn => "WARN:  ",
            LogLevel::Status | LogLevel::Normal => "",
        }
    }
}

/// Console writer interface
pub struct Console {
    threshold: LogLevel,
    #[cfg(test)]
    buffer: heapless::String<16384>,
}

impl Console {
    /// Create a new console instance
    pub const fn new() -> Self {
        Console {
            threshold: LogLevel::Normal,
            #[cfg(test)]
            buffer: heapless::String::new(),
        }
    }

    /// Write a byte to the console
    pub fn write_byte(&mut self, byte: u8) {
        #[cfg(test)]
        {
            if byte.is_ascii() {
                let _ = self.buffer.push(byte as char);
            }
        }

        #[cfg(not(test))]
        {
            unsafe {
                Uart::new(UART_BASE).putc(byte);
            }
        }
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                // CRLF for serial output
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }

    /// Drop messages less severe than `level`
    pub fn set_threshold(&mut self, level: LogLevel) {
        self.threshold = level;
    }

    /// Clear the console
    pub fn clear(&mut self) {
        #[cfg(test)]
        self.buffer.clear();
    }

    #[cfg(test)]
    pub fn captured(&self) -> &str {
        &self.buffer
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_str(s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Initialise the console subsystem
pub fn init() {
    CONSOLE.lock().clear();
}

/// Set the global message threshold
pub fn set_threshold(level: LogLevel) {
    CONSOLE.lock().set_threshold(level);
}

/// Print a leveled, formatted message to the console
pub fn log(level: LogLevel, args: fmt::Arguments) {
    let mut console = CONSOLE.lock();
    if level > console.threshold {
        return;
    }
    let _ = console.write_fmt(format_args!("{}{}\n", level.tag(), args));
}

/// Leveled print macro for the boot service
#[macro_export]
macro_rules! boot_log {
    ($lvl:ident, $($arg:tt)*) => {
        $crate::console::log($crate::console::LogLevel::$lvl, format_args!($($arg)*))
    };
}
