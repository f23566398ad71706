//! Command-line self-test driver for crashlog.
//!
//! Crashing can't really be unit tested, so this starts monitoring and then
//! deliberately dies in the requested way.

use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use log::info;

/// Top-level argument parser describing the driver interface.
#[derive(Parser, Debug)]
#[command(name = "crashlog", version, about = "Manually exercise crashlog's fault hooks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

/// Subcommands exposed by the driver.
#[derive(Subcommand, Debug)]
enum Command {
    /// Begin crash monitoring, then fail in the chosen way.
    Trigger {
        #[arg(value_enum, ignore_case = true)]
        fault: Fault,
        /// Folder the crash log is written to.
        #[arg(long, default_value = "./test_logs")]
        folder: PathBuf,
        /// Crash log filename template.
        #[arg(long)]
        filename: Option<String>,
        /// First line of the crash log.
        #[arg(long)]
        header: Option<String>,
    },
    /// Display version information for diagnostics.
    Version,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Fault {
    /// Write through an unmapped address.
    Segfault,
    /// Abort the process.
    Abort,
    /// Panic out of a function that cannot unwind.
    Terminate,
    /// Raise SIGILL.
    #[value(name = "illegalinstruction")]
    IllegalInstruction,
    /// Panic and never catch it.
    #[value(name = "unhandledexception")]
    UnhandledException,
    /// Recurse until the stack runs out.
    #[value(name = "stackoverflow")]
    StackOverflow,
    /// Exit normally; no crash log should appear.
    #[value(name = "none")]
    Exit,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.cmd {
        Command::Trigger {
            fault,
            folder,
            filename,
            header,
        } => trigger(fault, folder, filename, header),
        Command::Version => {
            println!("crashlog {}", libcrashlog::version());
            Ok(())
        }
    }
}

fn trigger(
    fault: Fault,
    folder: PathBuf,
    filename: Option<String>,
    header: Option<String>,
) -> Result<()> {
    println!("Initializing crashlogs");
    info!("Writing crash logs to {}", folder.display());
    libcrashlog::set_crashlog_folder(folder);
    if let Some(filename) = filename {
        libcrashlog::set_crashlog_filename(filename);
    }
    if let Some(header) = header {
        libcrashlog::set_crashlog_header_message(header);
    }
    libcrashlog::set_on_write_crashlog_callback(|path| {
        eprintln!("Crash log written to {}", path.display());
    });
    libcrashlog::begin_monitoring()?;

    print!("Gonna wait a second");
    for _ in 0..10 {
        print!(".");
        std::io::stdout().flush()?;
        thread::sleep(Duration::from_millis(100));
    }
    println!();

    println!("Causing {fault:?}");
    std::io::stdout().flush()?;
    match fault {
        Fault::Segfault => {
            // SAFETY: not sound on purpose; the first page is never mapped.
            unsafe { std::ptr::write_volatile(0x8 as *mut u32, 0xdead_beef) };
        }
        Fault::Abort => std::process::abort(),
        Fault::Terminate => panic_without_unwinding(),
        Fault::IllegalInstruction => {
            // SAFETY: raise has no preconditions.
            unsafe { libc::raise(libc::SIGILL) };
        }
        Fault::UnhandledException => panic!("Whoops"),
        Fault::StackOverflow => {
            let depth = overflow_stack(0);
            println!("{depth}");
        }
        Fault::Exit => println!("Exiting normally"),
    }
    Ok(())
}

/// The runtime would abort when this panic reaches the `extern "C"` boundary,
/// but the panic hook runs first and handles it like any other panic.
extern "C" fn panic_without_unwinding() {
    panic!("terminate-path");
}

#[allow(unconditional_recursion)]
#[inline(never)]
fn overflow_stack(depth: u64) -> u64 {
    let frame = std::hint::black_box([depth; 64]);
    overflow_stack(depth + 1) + frame[0]
}
