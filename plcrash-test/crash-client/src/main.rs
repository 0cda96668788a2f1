use plcrash_test::Signal;

use anyhow::Context as _;
use clap::Parser;

#[derive(Parser)]
struct Command {
    /// The unique identifier of the crash report that should be produced when
    /// this client crashes
    #[clap(long)]
    id: String,
    /// The signal/exception to raise
    #[clap(long, value_enum)]
    signal: Signal,
    /// Raises the signal on a separate thread rather than the main thread
    #[clap(long)]
    use_thread: bool,
}

fn real_main() -> anyhow::Result<()> {
    let cmd = Command::parse();

    println!("pid: {}", std::process::id());

    let report_path = plcrash_test::make_report_path(&cmd.id);
    if let Some(parent) = report_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    plcrash::shared_handler()
        .register_handler(&plcrash::Config::new(&report_path).app_version(env!("CARGO_PKG_VERSION")))
        .context("failed to register crash handler")?;

    let signal = cmd.signal;
    let id = cmd.id.clone();

    let mut threads = Vec::new();

    for _ in 0..10 {
        threads.push(std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::MAX);
        }));
    }

    if cmd.use_thread {
        std::thread::spawn(move || {
            // The alternate stack is only installed for the thread that
            // registered the handler
            if let Err(e) = plcrash::install_sigaltstack() {
                eprintln!("failed to install alternate stack: {e}");
            }

            plcrash_test::raise(signal, &id);
        })
        .join()
        .map_err(|_panic| anyhow::anyhow!("crashing thread panicked"))?;
    } else {
        plcrash_test::raise(signal, &id);
    }

    anyhow::bail!("we should have raised a signal and exited");
}

fn main() {
    // We want this program to crash and have a report written, it _shouldn't_
    // have errors that prevent that from happening, so emit an error code if we
    // do encounter an error so that we can fail the test
    if let Err(e) = real_main() {
        eprintln!("error: {e:#}");

        // When exiting due to a crash, the process is killed by the signal
        // rather than exiting with a code
        #[allow(clippy::exit)]
        std::process::exit(222);
    }
}
