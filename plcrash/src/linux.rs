mod capture;
mod maps;
mod state;

use crate::Error;
use std::{
    path::PathBuf,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

pub use state::install_sigaltstack;

/// The signals that we support catching and raising
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Signal {
    Abort = libc::SIGABRT,
    Bus = libc::SIGBUS,
    Fpe = libc::SIGFPE,
    Illegal = libc::SIGILL,
    Segv = libc::SIGSEGV,
    Trap = libc::SIGTRAP,
}

impl Signal {
    /// Every signal the handler is installed for
    pub const ALL: [Self; 6] = [
        Self::Abort,
        Self::Bus,
        Self::Fpe,
        Self::Illegal,
        Self::Segv,
        Self::Trap,
    ];

    #[inline]
    pub fn from_raw(signo: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|sig| *sig as i32 == signo)
    }

    /// The `SIG*` name of the signal
    #[inline]
    pub fn name(self) -> &'static str {
        crate::signal_info::signal_name(self as i32).unwrap_or("UNKNOWN")
    }
}

/// Configures what is written to a crash report
#[derive(Clone, Debug)]
pub struct Config {
    report_path: PathBuf,
    app_identifier: Option<String>,
    app_version: Option<String>,
}

impl Config {
    /// Creates a configuration that writes the crash report to `report_path`,
    /// truncating the file if it already exists
    pub fn new(report_path: impl Into<PathBuf>) -> Self {
        Self {
            report_path: report_path.into(),
            app_identifier: None,
            app_version: None,
        }
    }

    /// Sets the identifier of the application, defaults to the file name of
    /// the current executable
    pub fn app_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.app_identifier = Some(identifier.into());
        self
    }

    /// Sets the version of the application, defaults to empty
    pub fn app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = Some(version.into());
        self
    }

    #[inline]
    pub fn report_path(&self) -> &std::path::Path {
        &self.report_path
    }
}

/// The process wide crash handler, see [`shared_handler`]
pub struct SignalHandler {
    /// Set once registration succeeds, and never freed afterwards. Read
    /// without locking from within the signal handler.
    capture: AtomicPtr<capture::CaptureState>,
    /// Serializes registration, never touched from signal context
    register_lock: parking_lot::Mutex<()>,
}

impl SignalHandler {
    const fn new() -> Self {
        Self {
            capture: AtomicPtr::new(ptr::null_mut()),
            register_lock: parking_lot::const_mutex(()),
        }
    }

    #[inline]
    fn capture_state(&self) -> Option<&capture::CaptureState> {
        // SAFETY: the pointer is either null, or was leaked by a successful
        // registration
        unsafe { self.capture.load(Ordering::Acquire).as_ref() }
    }

    /// Installs the handler for every [`Signal`].
    ///
    /// An alternate signal stack is installed for the calling thread, other
    /// threads that want to survive overflowing their own stack long enough to
    /// write a report need to call [`install_sigaltstack`] themselves.
    ///
    /// The handler can only be registered once per process, subsequent calls
    /// fail with [`Error::HandlerAlreadyInstalled`].
    pub fn register_handler(&self, config: &Config) -> Result<(), Error> {
        self.register_with(config, || {
            install_sigaltstack()?;
            // SAFETY: syscalls
            unsafe { state::install_handlers() }
        })
    }

    fn register_with(
        &self,
        config: &Config,
        install: impl FnOnce() -> Result<(), Error>,
    ) -> Result<(), Error> {
        let _lock = self.register_lock.lock();

        if self.capture_state().is_some() {
            return Err(Error::HandlerAlreadyInstalled);
        }

        let capture: &'static capture::CaptureState =
            Box::leak(Box::new(capture::CaptureState::new(config)?));

        // The state has to be visible before the first signal can arrive
        let capture = ptr::from_ref(capture).cast_mut();
        self.capture.store(capture, Ordering::Release);

        if let Err(err) = install() {
            // The state is leaked rather than freed, a handler that was
            // briefly installed might still be reading it
            self.capture.store(ptr::null_mut(), Ordering::Release);
            return Err(err);
        }

        log::debug!(
            "crash handler registered, reports will be written to '{}'",
            config.report_path().display()
        );

        Ok(())
    }

    /// Writes a crash report as if `signal` had been raised with the
    /// specified code and fault address in the caller's frame.
    ///
    /// Unlike an actual crash, the process keeps running afterwards. This is
    /// mainly useful to verify that reports can be written to the configured
    /// location.
    #[inline(never)]
    pub fn test_handler(&self, signal: i32, code: i32, address: usize) -> Result<(), Error> {
        let capture = self.capture_state().ok_or(Error::HandlerNotInstalled)?;

        let context = plcrash_context::ucontext_t::from_frame(plcrash_context::current_frame());
        let details = capture::SignalDetails {
            signo: signal,
            code,
            address,
        };

        let res = state::with_capture_guard(|| capture.write_report(&details, &context));
        if let Err(err) = &res {
            log::warn!("failed to write test crash report: {err}");
        }
        res
    }

    /// True if [`Self::register_handler`] has succeeded
    #[inline]
    pub fn is_registered(&self) -> bool {
        self.capture_state().is_some()
    }
}

/// The process wide [`SignalHandler`]
#[inline]
pub fn shared_handler() -> &'static SignalHandler {
    static HANDLER: SignalHandler = SignalHandler::new();
    &HANDLER
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_is_visible_during_install() {
        let handler = SignalHandler::new();
        let config = Config::new("/tmp/unused.plcrash");

        handler
            .register_with(&config, || {
                assert!(handler.capture_state().is_some());
                Ok(())
            })
            .unwrap();
        assert!(handler.is_registered());
        assert!(matches!(
            handler.register_with(&config, || Ok(())),
            Err(Error::HandlerAlreadyInstalled)
        ));
    }

    #[test]
    fn failed_install_can_be_retried() {
        let handler = SignalHandler::new();
        let config = Config::new("/tmp/unused.plcrash");

        assert!(matches!(
            handler.register_with(&config, || Err(Error::NotSupported)),
            Err(Error::NotSupported)
        ));
        assert!(!handler.is_registered());
        assert!(matches!(
            handler.test_handler(libc::SIGSEGV, 1, 0),
            Err(Error::HandlerNotInstalled)
        ));

        handler.register_with(&config, || Ok(())).unwrap();
        assert!(handler.is_registered());
    }
}
