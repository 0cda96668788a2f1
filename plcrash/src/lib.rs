//! `plcrash` captures the state of a process when it receives a fatal signal
//! and writes it to disk as a crash report that can be decoded later, possibly
//! on another machine.
//!
//! Everything on the capture path runs inside a signal handler, on a thread
//! whose state may be corrupted, and possibly after its stack was exhausted.
//! So the capture path never allocates, never takes a lock, and only calls
//! functions that are [async signal safe](https://man7.org/linux/man-pages/man7/signal-safety.7.html).
//!
//! # Signals
//!
//! The following signals are handled
//!
//! ## `SIGABRT`
//!
//! Signal sent to a process to tell it to abort, i.e. to terminate. The signal
//! is usually initiated by the process itself when it calls `std::process::abort`
//! or `libc::abort`, but it can be sent to the process from outside like any
//! other signal.
//!
//! ## `SIGBUS`
//!
//! Signal sent to a process when it causes a [bus error](https://en.wikipedia.org/wiki/Bus_error).
//!
//! ## `SIGFPE`
//!
//! Signal sent to a process when it executes an erroneous arithmetic operation.
//! Though it stands for **f**loating **p**oint **e**xception this signal covers
//! integer operations as well.
//!
//! ## `SIGILL`
//!
//! Signal sent to a process when it attempts to execute an **illegal**, malformed,
//! unknown, or privileged, instruction.
//!
//! ## `SIGSEGV`
//!
//! Signal sent to a process when it makes an invalid virtual memory reference,
//! a [segmentation fault](https://en.wikipedia.org/wiki/Segmentation_fault).
//! This covers infamous `null` pointer access, out of bounds access, use after
//! free, stack overflows, etc.
//!
//! ## `SIGTRAP`
//!
//! Signal sent to a process when a trap is raised, eg. a breakpoint or debug
//! assertion.
//!
//! An [alternate signal stack](https://man7.org/linux/man-pages/man2/sigaltstack.2.html)
//! is installed on the thread that registers the handler, as signals are
//! otherwise handled on the same stack that raised them, which is of little
//! use when the signal was raised by overflowing that very stack.
//!
//! # Report format
//!
//! See [`report`] for the layout of the files that are written.

#![allow(unsafe_code)]

mod error;

pub use error::Error;

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!("[plcrash] ", $s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
pub fn write_stderr(s: &'static str) {
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}

pub mod async_file;
pub mod report;
pub mod signal_info;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        pub mod frame;
        mod linux;

        pub use linux::{Config, Signal, SignalHandler, install_sigaltstack, shared_handler};
        pub use plcrash_context::ucontext_t;
    }
}
