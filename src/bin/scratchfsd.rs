//! The scratchfs daemon.
//!
//! One instance runs per node taking part in a job. At startup it binds
//! its listen address, appends itself to the shared hosts file and waits
//! until the expected number of daemons has registered; its line index in
//! that file becomes its host id for the distributor. State (metadata DB
//! and chunk tree) lives under `--rootdir` and is expected to be wiped
//! between jobs.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use clap::Parser;

use scratchfs::config;
use scratchfs::daemon::{self, DaemonContext, DaemonSettings};
use scratchfs::distributor::Distributor;
use scratchfs::hosts;

#[derive(Parser, Debug)]
#[command(name = "scratchfsd", about = "scratchfs daemon", version)]
struct Opts {
    /// Directory for this daemon's metadata DB and chunk tree.
    #[arg(long)]
    rootdir: PathBuf,

    /// Separate location for the metadata DB (defaults to rootdir/metadata).
    #[arg(long)]
    metadir: Option<PathBuf>,

    /// Mount prefix advertised to clients.
    #[arg(long, default_value = "/")]
    mountdir: String,

    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:4433")]
    listen: String,

    /// Shared hosts file; every daemon of the job registers itself here.
    #[arg(long)]
    hosts_file: Option<PathBuf>,

    /// Number of daemons taking part in the job.
    #[arg(long, default_value_t = 1)]
    expected_hosts: usize,

    /// Chunk size in bytes; must be a power of two.
    #[arg(long, default_value_t = config::rpc::CHUNK_SIZE)]
    chunk_size: u64,
}

fn init_logging() -> Result<(), Error> {
    let env = env_logger::Env::new()
        .filter_or(format!("{}LOG", config::DAEMON_ENV_PREFIX), "info")
        .write_style(format!("{}LOG_STYLE", config::DAEMON_ENV_PREFIX));
    let mut builder = env_logger::Builder::from_env(env);

    if let Some(path) = config::env_var(config::DAEMON_ENV_PREFIX, "LOG_OUTPUT") {
        let truncate = config::env_var(config::DAEMON_ENV_PREFIX, "LOG_OUTPUT_TRUNC")
            .map(|v| v != "0")
            .unwrap_or(false);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(truncate)
            .append(!truncate)
            .open(&path)
            .map_err(|err| format_err!("cannot open log output '{}': {}", path, err))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn main() -> Result<(), Error> {
    init_logging()?;
    let opts = Opts::parse();

    if !opts.chunk_size.is_power_of_two() {
        bail!("chunk size {} is not a power of two", opts.chunk_size);
    }

    // RPC handlers get a fixed-width runtime; chunk I/O runs on its own
    // pool inside the daemon context
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config::rpc::DAEMON_HANDLER_STREAMS)
        .thread_name("scratchfsd-handler")
        .enable_all()
        .build()?;
    runtime.block_on(run(opts))
}

async fn run(opts: Opts) -> Result<(), Error> {
    let hosts_file = opts
        .hosts_file
        .or_else(|| config::env_var(config::DAEMON_ENV_PREFIX, "HOSTS_FILE").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_HOSTS_FILE));

    // bind before registering so the advertised address is live
    let listener = tokio::net::TcpListener::bind(&opts.listen).await?;
    let listen_addr = listener.local_addr()?.to_string();

    let hostname = hosts::get_my_hostname(true)?;
    hosts::register_daemon(&hosts_file, &hostname, &listen_addr)?;
    log::info!(
        "registered {} {} in {:?}, waiting for {} host(s)",
        hostname,
        listen_addr,
        hosts_file,
        opts.expected_hosts
    );

    let hosts = await_hosts(&hosts_file, opts.expected_hosts).await?;
    let host_id = hosts
        .iter()
        .position(|h| h.addr == listen_addr)
        .ok_or_else(|| format_err!("own address {} missing from hosts file", listen_addr))?;

    let settings = DaemonSettings {
        rootdir: opts.rootdir,
        metadir: opts.metadir,
        mountdir: opts.mountdir,
        chunk_size: opts.chunk_size,
    };
    let distributor = Distributor::hash(host_id as u64, hosts.len() as u64);
    let ctx = DaemonContext::init(settings, distributor)?;
    log::info!(
        "daemon {}/{} up, chunk size {}",
        host_id,
        hosts.len(),
        ctx.settings().chunk_size
    );

    tokio::select! {
        result = daemon::serve(listener, ctx.clone()) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down");
        }
    }

    ctx.shutdown()?;
    hosts::destroy_hosts_file(&hosts_file)?;
    Ok(())
}

/// Poll the hosts file until all daemons of the job have registered.
async fn await_hosts(path: &PathBuf, expected: usize) -> Result<Vec<hosts::Host>, Error> {
    loop {
        match hosts::parse_hosts_file(path) {
            Ok(hosts) if hosts.len() >= expected => return Ok(hosts),
            Ok(_) => {}
            Err(scratchfs::FsError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
