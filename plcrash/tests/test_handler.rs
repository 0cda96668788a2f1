#![cfg(any(target_os = "linux", target_os = "android"))]

mod shared;

use shared::*;

#[test]
fn writes_test_report() {
    let handler = shared_handler();
    let report = report_path("test_handler");

    handler
        .register_handler(
            &Config::new(&report.path)
                .app_identifier("com.example.test-handler")
                .app_version("0.1.0"),
        )
        .expect("failed to register handler");

    write_nested(3);

    let (data, decoded) = read_report(&report.path);
    assert_eq!(&data[..8], b"plcrash\x01");

    let signal = decoded.signal.as_ref().expect("signal info is missing");
    assert_eq!(signal.signo, 11);
    assert_eq!(signal.name, "SIGSEGV");
    assert_eq!(signal.code, 1);
    assert_eq!(signal.code_name, "SEGV_MAPERR");
    assert_eq!(signal.address, 0);

    let app = decoded
        .application_info
        .as_ref()
        .expect("application info is missing");
    assert_eq!(app.identifier, "com.example.test-handler");
    assert_eq!(app.version, "0.1.0");

    let process = decoded
        .process_info
        .as_ref()
        .expect("process info is missing");
    assert_eq!(process.pid, std::process::id());

    let thread = decoded.crashed_thread().expect("crashed thread is missing");
    if cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
        assert!(!thread.registers.is_empty());

        // The walk has to make it through every nested call, and end cleanly
        assert!(thread.frames.len() > 4, "only {} frames", thread.frames.len());
        assert_eq!(thread.walk_error, None);
        assert!(!thread.truncated);

        let exe = std::env::current_exe().expect("failed to get exe path");
        for pc in thread.pcs().take(4) {
            let image = decoded
                .image_for_address(pc)
                .expect("frame is not within any image");
            assert_eq!(std::path::Path::new(&image.path), exe);
        }
    }

    // Each report replaces the previous one
    handler
        .test_handler(libc::SIGTRAP, -6, 0)
        .expect("failed to write second test report");

    let (_data, decoded) = read_report(&report.path);
    let signal = decoded.signal.as_ref().expect("signal info is missing");
    assert_eq!(signal.name, "SIGTRAP");
    assert_eq!(signal.code, -6);
    assert_eq!(signal.code_name, "SI_TKILL");
}

/// Writes a test report from `depth` calls below the caller
#[inline(never)]
fn write_nested(depth: u32) {
    if depth == 0 {
        shared_handler()
            .test_handler(libc::SIGSEGV, 1, 0)
            .expect("failed to write test report");
    } else {
        write_nested(depth - 1);
        std::hint::black_box(depth);
    }
}
