// COM1 serial output -- logger backend and test channel

use core::fmt;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use lazy_static::lazy_static;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use spin::Mutex;

/// COM1 I/O base.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
const COM1_BASE: u16 = 0x3F8;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
lazy_static! {
    pub static ref SERIAL1: Mutex<uart_16550::SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 I/O base. The port is
        // initialised before first use and only accessed through the Mutex.
        let mut port = unsafe { uart_16550::SerialPort::new(COM1_BASE) };
        port.init();
        Mutex::new(port)
    };
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_serial_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*))
    };
}

#[doc(hidden)]
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn _serial_print(args: fmt::Arguments) {
    use core::fmt::Write;

    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        let _ = SERIAL1.lock().write_fmt(args);
    });
}

#[doc(hidden)]
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn _serial_print(args: fmt::Arguments) {
    let _ = args;
}
