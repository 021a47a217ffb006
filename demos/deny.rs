use std::fs::File;
use std::path::PathBuf;

use structopt::StructOpt;
use syshook::{HandlerRegistry, LoadOptions, Response, Syshook};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Load a supervisor into this process, deny one syscall, then try to open a file.
#[derive(StructOpt, Debug)]
#[structopt(name = "deny")]
struct Opt {
    /// Path to the supervisor shared library.
    #[structopt(short, long, parse(from_os_str))]
    supervisor: PathBuf,

    /// Name of the syscall to deny.
    #[structopt(short = "c", long, default_value = "openat")]
    syscall: String,

    /// Error code to fail the syscall with.
    #[structopt(short, long, default_value = "13")]
    errno: i32,

    /// File to open once interception is active.
    #[structopt(parse(from_os_str), default_value = "/etc/hostname")]
    path: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opt = Opt::from_args();

    let hook = Syshook::load(&LoadOptions::new(&opt.supervisor))?;

    let nr = hook
        .syscalls()
        .number(&opt.syscall)
        .ok_or_else(|| anyhow::anyhow!("unknown syscall: {}", opt.syscall))?;
    let errno = opt.errno;
    if errno <= 0 {
        anyhow::bail!("error code must be positive: {errno}");
    }

    let mut registry = HandlerRegistry::new();
    registry.register(nr, move |syscall| {
        info!(pid = syscall.pid.as_raw(), nr = syscall.nr, errno, "denying syscall");
        Ok(Response::Fail(errno))
    })?;

    hook.setup(registry)?;

    match File::open(&opt.path) {
        Ok(_) => println!("opened {:?}", opt.path),
        Err(err) => println!("could not open {:?}: {}", opt.path, err),
    }

    Ok(())
}
