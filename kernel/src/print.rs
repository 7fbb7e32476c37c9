// Print macros for kernel output

#[cfg(target_os = "none")]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::arch::x86::vga::_print(format_args!($($arg)*)));
}

#[cfg(target_os = "none")]
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

// Host builds route kernel output through the standard library so unit
// tests can run under the normal harness.
#[cfg(not(target_os = "none"))]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        extern crate std;
        std::print!($($arg)*);
    }};
}

#[cfg(not(target_os = "none"))]
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
