use alloctrace::{cli::Cli, reporter::Reporter, transport::CollectorSink};
use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Connect to the collector named on the command line
fn connect(args: &Cli) -> Result<CollectorSink> {
    match (&args.unix, &args.tcp) {
        (Some(path), None) => CollectorSink::connect_unix(path)
            .context(format!("Failed to connect to collector at {}", path.display())),
        (None, Some(addr)) => CollectorSink::connect_tcp(addr.as_str())
            .context(format!("Failed to connect to collector at {addr}")),
        (Some(_), Some(_)) => {
            anyhow::bail!("Cannot specify both -u PATH and -t HOST:PORT. Choose one.");
        }
        (None, None) => {
            anyhow::bail!("Must specify a collector with -u PATH or -t HOST:PORT");
        }
    }
}

/// What to trace: a running process or a command to launch
enum Target {
    Pid(i32),
    Command(Vec<String>),
}

impl Target {
    fn from_args(pid: Option<i32>, command: Option<Vec<String>>) -> Result<Self> {
        match (pid, command) {
            (Some(pid), None) => Ok(Target::Pid(pid)),
            (None, Some(command)) => Ok(Target::Command(command)),
            (Some(_), Some(_)) => {
                anyhow::bail!("Cannot specify both -p PID and command. Choose one.");
            }
            (None, None) => {
                anyhow::bail!("Must specify either -p PID or command. Usage: alloctrace -u PATH -p PID or alloctrace -u PATH -- COMMAND [ARGS...]");
            }
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn run_tracer(target: Target, reporter: &mut Reporter<CollectorSink>) -> Result<i32> {
    use alloctrace::ptrace::PtraceTask;
    use alloctrace::task::Task;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::Pid;

    match target {
        Target::Pid(pid) => {
            let task = PtraceTask::attach(pid)?;
            eprintln!("[alloctrace: Attached to process {}]", pid);

            reporter.report_processes([&task])?;
            reporter.report_detach(&task)?;
            task.detach()?;
            Ok(0)
        }
        Target::Command(command) => {
            let task = PtraceTask::spawn(&command)?;

            reporter.report_attach(&task, false)?;
            for lib in task.libraries() {
                reporter.report_add_map(&task, lib)?;
            }
            task.detach()?;

            let child = Pid::from_raw(task.pid());
            let exit_code = loop {
                match waitpid(child, None).context("Failed to waitpid")? {
                    WaitStatus::Exited(_, code) => break code,
                    WaitStatus::Signaled(_, sig, _) => {
                        eprintln!("Child killed by signal: {:?}", sig);
                        break 128 + sig as i32;
                    }
                    _ => continue,
                }
            };

            reporter.report_exit(&task)?;
            Ok(exit_code)
        }
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn run_tracer(_target: Target, _reporter: &mut Reporter<CollectorSink>) -> Result<i32> {
    anyhow::bail!("Tracing is only supported on x86_64 Linux");
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    let target = Target::from_args(args.pid, args.command.clone())?;
    let sink = connect(&args)?;
    let mut reporter = Reporter::new(args.report_options(), sink);

    reporter.report_info(false)?;
    let exit_code = run_tracer(target, &mut reporter)?;
    reporter.report_disconnect()?;

    // Exit with traced program's exit code
    std::process::exit(exit_code);
}
