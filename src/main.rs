use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::fcntl::{flock, FlockArg};

use pps_client::clock::{ClockAdjust, PlatformClock};
use pps_client::config::DaemonConfig;
use pps_client::controller::{Controller, LossAction};
use pps_client::driver::{CaptureDriver, LinuxCaptureDriver};
use pps_client::pacer;
use pps_client::refclock::serial::SerialPoller;
use pps_client::refclock::sntp::SntpPoller;
use pps_client::refclock::ConsensusWord;
use pps_client::status::{RecordStore, STATUS_FILE};

const LOCK_PATH: &str = "/var/run/pps-client.pid";
const LOG_PATH: &str = "/var/log/pps-client.log";
const LOG_ROTATE_BYTES: u64 = 100_000;
const DUMP_LABELS: [&str; 4] = ["rawError", "intrptError", "frequency-vars", "pps-offsets"];

#[derive(Parser, Debug)]
#[command(author, version, about = "PPS hardware clock discipline daemon", long_about = None)]
struct Args {
    /// Print live status lines from the status file until interrupted.
    #[arg(short = 'v', long)]
    view: bool,

    /// Request the running daemon to dump a named buffer to a file.
    #[arg(short = 's', long, value_name = "LABEL")]
    dump: Option<String>,

    /// Destination path for `-s` (defaults to `./<label>.txt`).
    #[arg(short = 'f', long, value_name = "PATH")]
    file: Option<String>,
}

fn init_logging() {
    if let Ok(metadata) = std::fs::metadata(LOG_PATH) {
        if metadata.len() > LOG_ROTATE_BYTES {
            let _ = std::fs::rename(LOG_PATH, format!("{LOG_PATH}.old"));
        }
    }

    let target = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOG_PATH)
        .map(|f| env_logger::Target::Pipe(Box::new(f)));

    let mut builder = env_logger::Builder::new();
    builder.filter_level(log::LevelFilter::Info);
    if let Ok(target) = target {
        builder.target(target);
    }
    builder.init();
}

fn acquire_singleton_lock() -> Result<File> {
    let file = File::create(LOCK_PATH)
        .with_context(|| format!("creating lock/pid file {LOCK_PATH}"))?;
    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(_) => Ok(file),
        Err(nix::errno::Errno::EAGAIN) => Err(anyhow!(
            "another instance of pps-client is already running (lock file: {LOCK_PATH})"
        )),
        Err(e) => Err(e.into()),
    }
}

fn write_pid_file(file: &mut File) -> Result<()> {
    use std::io::Seek;
    file.set_len(0)?;
    file.seek(std::io::SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}

fn enable_realtime_priority() {
    unsafe {
        let policy = libc::SCHED_FIFO;
        let param = libc::sched_param { sched_priority: 99 };
        if libc::sched_setscheduler(0, policy, &param) == 0 {
            info!("realtime priority (SCHED_FIFO, 99) enabled");
        } else {
            warn!(
                "failed to set realtime priority: {}. Jitter may suffer.",
                std::io::Error::last_os_error()
            );
        }

        if libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) != 0 {
            warn!(
                "mlockall failed: {}. Pages may be swapped out.",
                std::io::Error::last_os_error()
            );
        }
    }
}

fn install_signal_handlers(exit_flag: Arc<AtomicBool>, dump_flag: Arc<AtomicBool>) -> Result<()> {
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }
    signal_hook::flag::register(signal_hook::consts::SIGTERM, exit_flag)
        .context("registering SIGTERM handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGUSR1, dump_flag)
        .context("registering SIGUSR1 handler")?;
    Ok(())
}

fn run_viewer() -> Result<()> {
    let exit = Arc::new(AtomicBool::new(false));
    let e = exit.clone();
    ctrlc::set_handler(move || e.store(true, Ordering::SeqCst))?;

    let mut last_len = 0u64;
    while !exit.load(Ordering::SeqCst) {
        if let Ok(metadata) = std::fs::metadata(STATUS_FILE) {
            if metadata.len() != last_len {
                if let Ok(file) = File::open(STATUS_FILE) {
                    let reader = BufReader::new(file);
                    for line in reader.lines().map_while(|l| l.ok()) {
                        println!("{line}");
                    }
                }
                last_len = metadata.len();
            }
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    Ok(())
}

fn request_dump(label: &str, dest: &str) -> Result<()> {
    if !DUMP_LABELS.contains(&label) {
        return Err(anyhow!(
            "unknown buffer label '{label}'; expected one of {DUMP_LABELS:?}"
        ));
    }
    let pid: i32 = std::fs::read_to_string(LOCK_PATH)
        .with_context(|| format!("reading pid file {LOCK_PATH} (is the daemon running?)"))?
        .trim()
        .parse()
        .context("parsing daemon pid")?;

    std::fs::write(dump_request_path(), format!("{label}\n{dest}\n"))
        .context("writing dump request")?;

    let ret = unsafe { libc::kill(pid, libc::SIGUSR1) };
    if ret != 0 {
        return Err(anyhow!(
            "failed to signal daemon pid {pid}: {}",
            std::io::Error::last_os_error()
        ));
    }
    info!("requested dump of '{label}' to {dest}");
    Ok(())
}

fn dump_request_path() -> &'static str {
    "/run/shm/pps-client-dump-request"
}

fn format_distribution(bins: &[f64], zero_bin: usize) -> String {
    let mut out = String::new();
    for (i, count) in bins.iter().enumerate() {
        out.push_str(&format!("{} {}\n", i as isize - zero_bin as isize, count));
    }
    out
}

fn service_dump_request(controller: &Controller) {
    let Ok(contents) = std::fs::read_to_string(dump_request_path()) else {
        return;
    };
    let _ = std::fs::remove_file(dump_request_path());

    let mut lines = contents.lines();
    let (Some(label), Some(dest)) = (lines.next(), lines.next()) else {
        return;
    };

    // Matches the bin layout baked into `NoisePipeline`/`Calibrator`'s
    // histograms: raw_error + 20 indexes the 121-bin array.
    const DISTRIB_ZERO: usize = 20;

    let body = match label {
        "pps-offsets" => controller.records().dump_pps_offsets(),
        "frequency-vars" => controller.records().dump_frequency_vars(),
        "rawError" => format_distribution(controller.raw_error_distribution(), DISTRIB_ZERO),
        "intrptError" => format_distribution(controller.intrpt_error_distribution(), DISTRIB_ZERO),
        other => {
            warn!("dump request for unknown label '{other}' ignored");
            return;
        }
    };

    if let Err(e) = std::fs::write(dest, body) {
        warn!("failed writing dump to {dest}: {e}");
    } else {
        info!("dumped '{label}' to {dest}");
    }
}

fn run_daemon() -> Result<()> {
    info!("pps-client v{} starting", env!("CARGO_PKG_VERSION"));

    let mut lock_file = acquire_singleton_lock()?;
    write_pid_file(&mut lock_file)?;

    enable_realtime_priority();

    let exit_flag = Arc::new(AtomicBool::new(false));
    let dump_flag = Arc::new(AtomicBool::new(false));
    install_signal_handlers(exit_flag.clone(), dump_flag.clone())?;

    let mut config = DaemonConfig::load_default().unwrap_or_else(|e| {
        warn!("using default configuration: {e:#}");
        DaemonConfig::default()
    });

    let mut driver = LinuxCaptureDriver::open().context("opening capture driver")?;
    let mut clock = PlatformClock::new().context("initializing clock-adjust interface")?;
    let mut controller = Controller::new(config.calibrate);

    let consensus = ConsensusWord::new();
    let mut join_handles = Vec::new();
    if config.sntp {
        let poller = SntpPoller::with_default_servers();
        join_handles.push(poller.spawn(consensus.clone(), exit_flag.clone()));
    }
    if config.serial {
        let poller = SerialPoller::new(config.serial_port.clone());
        let handle = poller.spawn(consensus.clone(), exit_flag.clone(), || {
            use std::time::{SystemTime, UNIX_EPOCH};
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            (now % 86400) as u32
        });
        join_handles.push(handle);
    }

    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]);
    info!("entering discipline loop");

    while !exit_flag.load(Ordering::SeqCst) {
        if dump_flag.swap(false, Ordering::SeqCst) {
            service_dump_request(&controller);
        }

        match driver.await_edge(Duration::from_millis(200)) {
            Ok(capture) => {
                let timestamp = format_timestamp(capture.tv_sec, capture.tv_usec);
                let consensus_time_error = consensus.take();
                match controller.process_edge(
                    capture,
                    timestamp,
                    &mut driver,
                    &mut clock,
                    consensus_time_error,
                ) {
                    Ok(outcome) => {
                        if let Err(e) = outcome.status.write_to(Path::new(STATUS_FILE)) {
                            warn!("failed to write status file: {e:#}");
                        }
                        if outcome.restarted {
                            match DaemonConfig::load_default() {
                                Ok(reloaded) => {
                                    controller.set_calibrate_enabled(reloaded.calibrate);
                                    config = reloaded;
                                    info!("re-read configuration after controller restart");
                                }
                                Err(e) => warn!(
                                    "failed to re-read configuration after restart, \
                                     keeping previous config: {e:#}"
                                ),
                            }
                        }
                    }
                    Err(e) => warn!("error processing edge: {e:#}"),
                }

                let frac = if capture.tv_usec < 0 {
                    capture.tv_usec + 1_000_000
                } else {
                    capture.tv_usec
                };
                std::thread::sleep(pacer::sleep_duration(frac as i64));
            }
            Err(e) => {
                warn!("capture read failed: {e:#}");
                match controller.record_timeout() {
                    LossAction::Continue => {}
                    LossAction::Warn => {
                        warn!("PPS signal lost for 15 consecutive seconds");
                        if config.alert_pps_lost {
                            warn!(
                                "alert-pps-lost is enabled but no external alert line is wired \
                                 to the capture driver yet"
                            );
                        }
                    }
                    LossAction::ExitRequested => {
                        if config.exit_lost_pps {
                            error!("PPS signal lost for one hour; exiting (exit-lost-pps enabled)");
                            exit_flag.store(true, Ordering::SeqCst);
                        } else {
                            error!(
                                "PPS signal lost for one hour; continuing (exit-lost-pps disabled)"
                            );
                        }
                    }
                }
            }
        }
    }

    info!("shutting down");
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
    Ok(())
}

fn format_timestamp(tv_sec: i64, tv_usec: i32) -> String {
    let (secs, usec) = if tv_usec < 0 {
        (tv_sec - 1, tv_usec + 1_000_000)
    } else {
        (tv_sec, tv_usec)
    };
    match chrono::DateTime::from_timestamp(secs, usec as u32 * 1000) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        None => format!("{secs}.{usec:06}"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(label) = &args.dump {
        env_logger::builder()
            .format_timestamp(None)
            .format_target(false)
            .filter_level(log::LevelFilter::Info)
            .init();
        let dest = args
            .file
            .clone()
            .unwrap_or_else(|| format!("./{label}.txt"));
        return request_dump(label, &dest);
    }

    if args.view {
        return run_viewer();
    }

    init_logging();
    run_daemon()
}
