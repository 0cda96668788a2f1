use clap::{Parser, ValueEnum};
use plcrash_test::*;

#[derive(Parser)]
struct Command {
    /// The signal/exception to raise
    #[clap(long, value_enum)]
    signal: Option<Signal>,
    /// Raises the signal on a separate thread rather than the main thread
    #[clap(long)]
    use_thread: bool,
    /// Lists the signals that can be raised
    #[clap(long)]
    list: bool,
}

fn main() {
    let cli = Command::parse();

    if cli.list {
        for variant in Signal::value_variants() {
            println!("{variant}");
        }
    } else if let Some(signal) = cli.signal {
        let report = run_test(signal, 0, cli.use_thread);

        if let Some(sig) = &report.signal {
            println!("signal: {} ({}) at {:#x}", sig.name, sig.code_name, sig.address);
        }

        if let Some(thread) = report.crashed_thread() {
            println!("thread {}: {} frames", thread.tid, thread.frames.len());
            for (i, pc) in thread.pcs().enumerate() {
                match report.image_for_address(pc) {
                    Some(image) => {
                        println!("{i:>4}: {pc:#018x} {}+{:#x}", image.path, pc - image.base);
                    }
                    None => println!("{i:>4}: {pc:#018x}"),
                }
            }

            if thread.truncated {
                println!("stack truncated");
            }

            if let Some(err) = &thread.walk_error {
                println!("walk stopped: {err}");
            }
        }
    } else {
        println!("must pass --signal (see available choices with --list)");
    }
}
