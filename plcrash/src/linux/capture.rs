use super::{Config, maps};
use crate::{
    Error,
    async_file::{AsyncFile, Fd},
    frame::{Backend, Cursor, Native, StackTrace},
    report::{self, Encoder, FieldValue, Message, Sink, fields},
    signal_info,
};
use plcrash_context::ucontext_t;
use std::{ffi::CString, io, os::unix::ffi::OsStrExt};

/// The maximum number of frames written for a thread, so that a corrupted but
/// apparently valid frame chain can't make us spin forever. The frames are
/// held on the alternate signal stack while the report is written.
pub const MAX_FRAMES: usize = 256;

/// Everything about a signal that ends up in a report
pub(super) struct SignalDetails {
    pub(super) signo: i32,
    pub(super) code: i32,
    pub(super) address: usize,
}

impl SignalDetails {
    /// # Safety
    ///
    /// `info` must be the siginfo the kernel delivered for `signo`
    pub(super) unsafe fn from_siginfo(signo: i32, info: &libc::siginfo_t) -> Self {
        // The address is only meaningful for faults raised by the kernel, a
        // signal sent by a process stores its pid in the same place
        let faulted = info.si_code > 0
            && matches!(
                signo,
                libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE | libc::SIGTRAP
            );

        Self {
            signo,
            code: info.si_code,
            // SAFETY: the union is always at least as large as the address
            address: if faulted {
                unsafe { info.si_addr() as usize }
            } else {
                0
            },
        }
    }
}

/// The parts of a report that are known up front, prepared at registration
/// time since none of this can be gathered safely from within a signal handler
pub(super) struct CaptureState {
    report_path: CString,
    app_identifier: String,
    app_version: String,
    os_name: String,
    os_version: String,
    architecture: String,
    process_path: String,
}

impl CaptureState {
    pub(super) fn new(config: &Config) -> Result<Self, Error> {
        let report_path = CString::new(config.report_path().as_os_str().as_bytes())
            .map_err(|_nul| Error::InvalidArgument)?;

        let process_path = std::env::current_exe()
            .map(|exe| exe.display().to_string())
            .unwrap_or_default();

        let app_identifier = config.app_identifier.clone().unwrap_or_else(|| {
            std::path::Path::new(&process_path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        });

        let (os_name, os_version, architecture) = uname()?;

        log::debug!(
            "capturing crash reports for '{app_identifier}' on {os_name} {os_version} ({architecture})"
        );

        Ok(Self {
            report_path,
            app_identifier,
            app_version: config.app_version.clone().unwrap_or_default(),
            os_name,
            os_version,
            architecture,
            process_path,
        })
    }

    /// Writes a complete report for the thread executing `context`.
    ///
    /// This is called from the signal handler, so it must not allocate or
    /// lock, which is why errors are collapsed into [`Error::Output`] rather
    /// than carrying the underlying I/O error.
    pub(super) fn write_report(
        &self,
        signal: &SignalDetails,
        context: &ucontext_t,
    ) -> Result<(), Error> {
        // SAFETY: syscall, the path is nul terminated
        let fd = unsafe {
            libc::open(
                self.report_path.as_ptr(),
                libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
                0o644,
            )
        };
        if fd < 0 {
            debug_print!("unable to open crash report");
            return Err(Error::Output);
        }

        let mut file = AsyncFile::<Fd>::new(Fd::new(fd));
        let written = self
            .write_contents(&mut file, signal, context)
            .and_then(|()| file.flush());
        let closed = file.close();

        written.and(closed).map_err(|_err| Error::Output)
    }

    fn write_contents<S: Sink>(
        &self,
        sink: &mut S,
        signal: &SignalDetails,
        context: &ucontext_t,
    ) -> io::Result<()> {
        use fields::crash_report as f;

        sink.write(&report::header())?;

        let mut encoder = Encoder::new(sink);
        encoder.message(
            f::SYSTEM_INFO,
            &SystemInfo {
                state: self,
                timestamp: timestamp(),
            },
        )?;
        encoder.message(f::APPLICATION_INFO, &ApplicationInfo { state: self })?;
        encoder.message(f::PROCESS_INFO, &ProcessInfo { state: self })?;
        encoder.message(f::SIGNAL, signal)?;

        // The stack is walked once, the thread message is encoded twice
        let trace = walk_stack(context);
        encoder.message(
            f::THREAD,
            &CrashedThread {
                // SAFETY: syscall
                tid: unsafe { libc::syscall(libc::SYS_gettid) } as u64,
                context,
                trace: &trace,
            },
        )?;

        // SAFETY: syscall, the path is nul terminated
        let maps = unsafe {
            libc::open(
                maps::MAPS_PATH.as_ptr(),
                libc::O_RDONLY | libc::O_CLOEXEC,
            )
        };
        if maps < 0 {
            debug_print!("unable to open maps, no images are written");
            return Ok(());
        }

        let res = maps::write_images(&mut encoder, maps);
        // SAFETY: syscall
        unsafe { libc::close(maps) };
        res
    }
}

fn walk_stack(context: &ucontext_t) -> StackTrace<MAX_FRAMES> {
    match Cursor::<Native>::new(context) {
        Ok(mut cursor) => StackTrace::walk(&mut cursor),
        Err(err) => StackTrace::failed(Some(err)),
    }
}

/// Retrieves the OS name, release and machine of the system
fn uname() -> Result<(String, String, String), Error> {
    // SAFETY: utsname is plain c strings, and is filled in by the syscall
    let uts = unsafe {
        let mut uts: libc::utsname = std::mem::zeroed();
        if libc::uname(&mut uts) != 0 {
            return Err(io::Error::last_os_error().into());
        }
        uts
    };

    let field = |chars: &[libc::c_char]| {
        let bytes: Vec<u8> = chars
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    };

    Ok((
        field(&uts.sysname[..]),
        field(&uts.release[..]),
        field(&uts.machine[..]),
    ))
}

/// Seconds since the unix epoch
fn timestamp() -> u64 {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: syscall, clock_gettime is async signal safe
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return 0;
    }
    now.tv_sec as u64
}

struct SystemInfo<'s> {
    state: &'s CaptureState,
    timestamp: u64,
}

impl Message for SystemInfo<'_> {
    fn encode<S: Sink>(&self, encoder: &mut Encoder<'_, S>) -> io::Result<()> {
        use fields::system_info as f;

        encoder.field(f::OS_NAME, FieldValue::Str(&self.state.os_name))?;
        encoder.field(f::OS_VERSION, FieldValue::Str(&self.state.os_version))?;
        encoder.field(f::ARCHITECTURE, FieldValue::Str(&self.state.architecture))?;
        encoder.field(f::TIMESTAMP, FieldValue::Uint64(self.timestamp))
    }
}

struct ApplicationInfo<'s> {
    state: &'s CaptureState,
}

impl Message for ApplicationInfo<'_> {
    fn encode<S: Sink>(&self, encoder: &mut Encoder<'_, S>) -> io::Result<()> {
        use fields::application_info as f;

        encoder.field(f::IDENTIFIER, FieldValue::Str(&self.state.app_identifier))?;
        encoder.field(f::VERSION, FieldValue::Str(&self.state.app_version))
    }
}

struct ProcessInfo<'s> {
    state: &'s CaptureState,
}

impl Message for ProcessInfo<'_> {
    fn encode<S: Sink>(&self, encoder: &mut Encoder<'_, S>) -> io::Result<()> {
        use fields::process_info as f;

        // SAFETY: syscalls
        let (pid, ppid) = unsafe { (libc::getpid(), libc::getppid()) };

        encoder.field(f::PID, FieldValue::Uint64(pid as u64))?;
        encoder.field(f::PARENT_PID, FieldValue::Uint64(ppid as u64))?;
        encoder.field(f::PATH, FieldValue::Str(&self.state.process_path))
    }
}

impl Message for SignalDetails {
    fn encode<S: Sink>(&self, encoder: &mut Encoder<'_, S>) -> io::Result<()> {
        use fields::signal as f;

        encoder.field(f::SIGNO, FieldValue::Uint64(self.signo as u64))?;
        encoder.field(
            f::NAME,
            FieldValue::Str(signal_info::signal_name(self.signo).unwrap_or("UNKNOWN")),
        )?;
        encoder.field(f::CODE, FieldValue::Int64(self.code.into()))?;
        encoder.field(
            f::CODE_NAME,
            FieldValue::Str(signal_info::signal_code_name(self.signo, self.code).unwrap_or("UNKNOWN")),
        )?;
        encoder.field(f::ADDRESS, FieldValue::Uint64(self.address as u64))
    }
}

/// The thread that received the signal
struct CrashedThread<'c> {
    tid: u64,
    context: &'c ucontext_t,
    trace: &'c StackTrace<MAX_FRAMES>,
}

struct Register {
    name: &'static str,
    value: u64,
}

impl Message for Register {
    fn encode<S: Sink>(&self, encoder: &mut Encoder<'_, S>) -> io::Result<()> {
        encoder.field(fields::register::NAME, FieldValue::Str(self.name))?;
        encoder.field(fields::register::VALUE, FieldValue::Uint64(self.value))
    }
}

struct Frame(u64);

impl Message for Frame {
    fn encode<S: Sink>(&self, encoder: &mut Encoder<'_, S>) -> io::Result<()> {
        encoder.field(fields::frame::PC, FieldValue::Uint64(self.0))
    }
}

impl Message for CrashedThread<'_> {
    fn encode<S: Sink>(&self, encoder: &mut Encoder<'_, S>) -> io::Result<()> {
        use fields::thread as f;

        encoder.field(f::TID, FieldValue::Uint64(self.tid))?;
        encoder.field(f::CRASHED, FieldValue::Bool(true))?;

        if let Ok(cursor) = Cursor::<Native>::new(self.context) {
            for reg in 0..Native::REG_COUNT {
                let (Some(name), Ok(value)) = (Native::register_name(reg), cursor.register(reg))
                else {
                    continue;
                };

                encoder.message(
                    f::REGISTER,
                    &Register {
                        name,
                        value: value as u64,
                    },
                )?;
            }
        }

        for ip in self.trace.frames() {
            encoder.message(f::FRAME, &Frame(*ip as u64))?;
        }

        if let Some(err) = self.trace.error() {
            encoder.field(f::WALK_ERROR, FieldValue::Str(err.as_str()))?;
        }

        if self.trace.is_truncated() {
            encoder.field(f::TRUNCATED, FieldValue::Bool(true))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::report::CrashReport;

    fn state(config: &Config) -> CaptureState {
        CaptureState::new(config).unwrap()
    }

    #[test]
    fn defaults_identifier_to_executable() {
        let capture = state(&Config::new("/tmp/unused.plcrash"));
        let exe = std::env::current_exe().unwrap();

        assert_eq!(
            capture.app_identifier,
            exe.file_name().unwrap().to_string_lossy()
        );
        assert!(capture.app_version.is_empty());
        assert_eq!(capture.os_name, "Linux");
    }

    #[test]
    fn rejects_nul_in_path() {
        assert!(matches!(
            CaptureState::new(&Config::new("/tmp/nul\0.plcrash")),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn writes_decodable_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.plcrash");

        let capture = state(
            &Config::new(&path)
                .app_identifier("com.example.capture")
                .app_version("1.2.3"),
        );

        let context = ucontext_t::from_frame(plcrash_context::current_frame());
        let details = SignalDetails {
            signo: libc::SIGBUS,
            code: signal_info::BUS_ADRERR,
            address: 0xdead_0000,
        };
        capture.write_report(&details, &context).unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[..report::HEADER_LEN], b"plcrash\x01");

        let report = CrashReport::decode(&data).unwrap();

        let app = report.application_info.as_ref().unwrap();
        assert_eq!(app.identifier, "com.example.capture");
        assert_eq!(app.version, "1.2.3");

        let process = report.process_info.as_ref().unwrap();
        assert_eq!(process.pid, std::process::id());

        let system = report.system_info.as_ref().unwrap();
        assert_eq!(system.os_name, "Linux");
        assert!(system.timestamp > 0);

        let signal = report.signal.as_ref().unwrap();
        assert_eq!(signal.signo, libc::SIGBUS);
        assert_eq!(signal.name, "SIGBUS");
        assert_eq!(signal.code_name, "BUS_ADRERR");
        assert_eq!(signal.address, 0xdead_0000);

        assert_eq!(report.threads.len(), 1);
        let thread = report.crashed_thread().unwrap();

        if cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
            assert_eq!(thread.frames[0].pc, context.instruction_pointer() as u64);
            assert_eq!(thread.registers.len(), Native::REG_COUNT as usize);
        } else {
            assert_eq!(thread.walk_error.as_deref(), Some("operation not supported"));
        }

        // The test binary itself is one of the images
        let exe = std::env::current_exe().unwrap();
        assert!(
            report
                .images
                .iter()
                .any(|image| std::path::Path::new(&image.path) == exe)
        );
    }

    /// Calls `f` with the context of a frame `depth` calls below the caller
    #[inline(never)]
    fn with_nested_context(depth: u32, f: &mut dyn FnMut(&ucontext_t)) {
        if depth == 0 {
            let context = ucontext_t::from_frame(plcrash_context::current_frame());
            f(&context);
        } else {
            with_nested_context(depth - 1, f);
            std::hint::black_box(depth);
        }
    }

    #[test]
    fn sizes_thread_from_single_walk() {
        with_nested_context(3, &mut |context| encodes_thread_consistently(context));
    }

    fn encodes_thread_consistently(context: &ucontext_t) {
        let trace = walk_stack(context);
        let thread = CrashedThread {
            tid: 1,
            context,
            trace: &trace,
        };

        let mut size = report::SizeCounter::default();
        thread.encode(&mut Encoder::new(&mut size)).unwrap();

        let mut written = Vec::new();
        thread.encode(&mut Encoder::new(&mut written)).unwrap();

        assert_eq!(size.0, written.len());

        let mut payload = Vec::new();
        Encoder::new(&mut payload)
            .message(fields::crash_report::THREAD, &thread)
            .unwrap();
        let report = CrashReport::decode_payload(&payload).unwrap();
        let decoded = report.crashed_thread().unwrap();

        assert_eq!(decoded.frames.len(), trace.frames().len());
        assert_eq!(
            decoded.walk_error.as_deref(),
            trace.error().map(|err| err.as_str())
        );
    }

    #[test]
    fn reports_unopenable_path() {
        let capture = state(&Config::new("/nonexistent/dir/report.plcrash"));
        let context = ucontext_t::from_frame(Default::default());
        let details = SignalDetails {
            signo: libc::SIGSEGV,
            code: 1,
            address: 0,
        };

        assert!(matches!(
            capture.write_report(&details, &context),
            Err(Error::Output)
        ));
    }
}
