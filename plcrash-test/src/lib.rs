pub mod faults;

use plcrash::report::CrashReport;
use std::{fmt, path::PathBuf};

#[inline]
pub fn run_test(signal: Signal, counter: u32, use_thread: bool) -> CrashReport {
    let id = format!(
        "{}-{}-{}",
        signal,
        counter,
        if use_thread { "threaded" } else { "simple" }
    );
    let report = generate_report(&id, signal, use_thread);
    assert_report(&report, signal)
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Abort,
    Bus,
    Fpe,
    Illegal,
    Segv,
    StackOverflow,
    Trap,
}

impl Signal {
    /// The signal the crash client is expected to die with
    pub fn signo(self) -> i32 {
        match self {
            Self::Abort => libc::SIGABRT,
            Self::Bus => libc::SIGBUS,
            Self::Fpe => libc::SIGFPE,
            Self::Illegal => libc::SIGILL,
            Self::Segv | Self::StackOverflow => libc::SIGSEGV,
            Self::Trap => libc::SIGTRAP,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Illegal => "illegal",
            Self::Trap => "trap",
            Self::Abort => "abort",
            Self::Bus => "bus",
            Self::Fpe => "fpe",
            Self::Segv => "segv",
            Self::StackOverflow => "stack-overflow",
        })
    }
}

/// The location the crash client with the specified id writes its report to
#[inline]
pub fn make_report_path(id: &str) -> PathBuf {
    PathBuf::from(format!(".reports/{id}.plcrash"))
}

/// Raises the specified signal in the calling thread
pub fn raise(signal: Signal, id: &str) {
    // SAFETY: we're about to intentionally crash ourselves via shenanigans,
    // none of this is safe
    unsafe {
        match signal {
            Signal::Abort => faults::raise_abort(),
            Signal::Bus => {
                let path = std::env::temp_dir().join(format!("plcrash-bus-{id}"));
                faults::raise_bus(&path);
            }
            Signal::Fpe => faults::raise_floating_point_exception(),
            Signal::Illegal => faults::raise_illegal_instruction(),
            Signal::Segv => faults::raise_segfault(),
            Signal::StackOverflow => faults::raise_stack_overflow(),
            Signal::Trap => faults::raise_trap(),
        }
    }
}

pub fn run_client(id: &str, signal: Signal, use_thread: bool) {
    use std::{env, os::unix::process::ExitStatusExt};

    // Adapted from
    // https://github.com/rust-lang/cargo/blob/485670b3983b52289a2f353d589c57fae2f60f82/tests/testsuite/support/mod.rs#L507
    let mut cmd_path = env::current_exe().expect("failed to get exe path");
    cmd_path.pop();
    if cmd_path.ends_with("deps") {
        cmd_path.pop();
    }

    cmd_path.push("crash-client");

    let mut cmd = std::process::Command::new(&cmd_path);
    cmd.stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    cmd.args(["--id", id, "--signal", &signal.to_string()]);
    if use_thread {
        cmd.arg("--use-thread");
    }

    let child = cmd.spawn().expect("failed to run crash-client");
    let output = child.wait_with_output().expect("failed to wait for output");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    println!("{stdout}");
    eprintln!("{stderr}");

    // Ensure it was killed by the signal we raised, and did not exit properly,
    // the handler re-raises the original signal once the report is written
    assert_eq!(
        output.status.signal(),
        Some(signal.signo()),
        "crash-client exited with {:?}",
        output.status
    );
}

#[inline]
pub fn capture_output() {
    static SUB: std::sync::Once = std::sync::Once::new();

    SUB.call_once(|| {
        tracing_subscriber::fmt().with_test_writer().init();
    });
}

pub fn generate_report(id: &str, signal: Signal, use_thread: bool) -> Vec<u8> {
    capture_output();

    let report_path = make_report_path(id);

    if report_path.exists() {
        if let Err(e) = std::fs::remove_file(&report_path) {
            panic!(
                "failed to remove existing report {}: {e}",
                report_path.display()
            );
        }
    }

    run_client(id, signal, use_thread);

    match std::fs::read(&report_path) {
        Ok(buf) => buf,
        Err(e) => {
            panic!(
                "failed to read crash report from {}: {e}",
                report_path.display()
            );
        }
    }
}

pub fn assert_report(report: &[u8], signal: Signal) -> CrashReport {
    use plcrash::signal_info as si;

    assert_eq!(&report[..plcrash::report::HEADER_LEN], b"plcrash\x01");

    let report = CrashReport::decode(report).expect("failed to decode crash report");

    let app = report
        .application_info
        .as_ref()
        .expect("missing application info");
    assert_eq!(app.identifier, "crash-client");

    let process = report.process_info.as_ref().expect("missing process info");
    assert!(process.path.ends_with("crash-client"), "{}", process.path);

    let sig = report.signal.as_ref().expect("missing signal info");
    assert_eq!(sig.signo, signal.signo());
    assert_eq!(Some(sig.name.as_str()), si::signal_name(signal.signo()));

    let code = sig.code as i32;
    match signal {
        Signal::Bus => assert_eq!(code, si::BUS_ADRERR),
        Signal::Segv => {
            assert_eq!(code, si::SEGV_MAPERR);
            assert_eq!(sig.address, faults::SEGFAULT_ADDRESS as u64);
        }
        Signal::StackOverflow => {
            // Not sure if there is a way to work around this, but on Linux it seems that a stack overflow
            // on the main thread is always reported as a SEGV_MAPERR rather than a SEGV_ACCERR like for
            // non-main threads, so we just accept either ¯\_(ツ)_/¯
            assert!(
                code == si::SEGV_MAPERR || code == si::SEGV_ACCERR,
                "unexpected code {}",
                sig.code_name
            );
        }
        Signal::Fpe if cfg!(target_arch = "x86_64") => assert_eq!(code, si::FPE_INTDIV),
        Signal::Illegal if cfg!(target_arch = "x86_64") => assert_eq!(code, si::ILL_ILLOPN),
        _ => {}
    }

    let thread = report.crashed_thread().expect("missing crashed thread");
    if cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
        assert!(!thread.frames.is_empty(), "no frames were captured");
        assert_eq!(
            thread.register(if cfg!(target_arch = "x86_64") { "rip" } else { "pc" }),
            thread.pcs().next()
        );

        // These are raised from our own code, which keeps its frame pointers,
        // so the walk must get all the way back to the thread's entry point
        if matches!(signal, Signal::Segv | Signal::Trap) {
            assert!(thread.frames.len() > 1, "only the crashing frame was walked");
            assert_eq!(thread.walk_error, None);
        }

        let crashing = thread.pcs().next().unwrap_or_default();
        let image = report
            .image_for_address(crashing)
            .expect("crashing frame is not within any image");
        if matches!(signal, Signal::Segv | Signal::Trap | Signal::Illegal) {
            assert!(image.path.ends_with("crash-client"), "{}", image.path);
        }
    }

    report
}

pub fn run_threaded_test(signal: Signal, count: u32) {
    use rayon::prelude::*;

    (0..count).into_par_iter().for_each(|i| {
        run_test(signal, i, true);
    });
}
