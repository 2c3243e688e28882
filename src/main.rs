//! screenrec daemon
//!
//! Records the device display into a video file. A controlling process
//! starts the daemon, writes the recording parameters on stdin and waits
//! for status lines on stdout. Any further input on stdin stops the
//! recording gracefully.

mod capture;
mod config;
mod encoder;
mod logging;
mod output;
mod pipeline;
#[cfg(test)]
mod test_support;

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use config::Settings;
use pipeline::{exit, DeviceFactory, LifecycleController, PipelineConfig, Recorder, StatusWriter, StopOrigin};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return;
    }
    let test_mode = args.iter().any(|a| a == "--test");

    let code = {
        // Dropped before exiting so buffered log lines are flushed
        let _log_guard = logging::init_logging();
        run(test_mode)
    };
    std::process::exit(code);
}

fn run(test_mode: bool) -> i32 {
    info!("screenrec {} starting", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load().unwrap_or_else(|e| {
        warn!("Ignoring settings file: {:#}", e);
        Settings::default()
    });
    if let Some(path) = settings.config_path() {
        info!("Settings loaded from {:?}", path);
    }

    set_parent_death_signal();

    let controller = Arc::new(LifecycleController::new());
    let recording = Arc::new(AtomicBool::new(false));
    install_signal_handler(Arc::clone(&controller), Arc::clone(&recording));

    let mut status = StatusWriter::stdout();
    let config = match handshake(&mut status, &mut std::io::stdin().lock(), &controller) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let factory = DeviceFactory {
        settings: &settings,
        test_mode,
    };
    recording.store(true, Ordering::SeqCst);
    // tokio's stdin shares std's buffer, so nothing read ahead during
    // configuration is lost to the listener
    Recorder::new(config, controller, status).run(&factory, tokio::io::stdin())
}

/// Print `ready`, read the configuration and print `configured`. On
/// failure the stop is recorded and the exit code returned.
fn handshake<W: Write, R: BufRead>(
    status: &mut StatusWriter<W>,
    input: &mut R,
    controller: &LifecycleController,
) -> Result<PipelineConfig, i32> {
    let fail = |code: i32, message: &str| {
        controller.request_stop(code, StopOrigin::Main, message);
        controller.exit_code()
    };

    status.ready().map_err(|e| fail(e.exit_code(), &e.to_string()))?;
    let config = PipelineConfig::read_from(input).map_err(|e| fail(e.exit_code(), &e.to_string()))?;
    status
        .configured()
        .map_err(|e| fail(e.exit_code(), &e.to_string()))?;
    Ok(config)
}

/// SIGINT/SIGTERM/SIGHUP request a stop
fn install_signal_handler(controller: Arc<LifecycleController>, recording: Arc<AtomicBool>) {
    let result = ctrlc::set_handler(move || {
        if let Some(code) = on_termination_signal(&controller, &recording) {
            std::process::exit(code);
        }
    });
    if let Err(e) = result {
        warn!("Failed to install signal handler: {}", e);
    }
}

/// Record the stop. Before the recording starts there is nothing to
/// release, so the first signal returns the code to exit with right away.
fn on_termination_signal(controller: &LifecycleController, recording: &AtomicBool) -> Option<i32> {
    let first = controller.request_stop(exit::TERMINATED, StopOrigin::Signal, "termination signal");
    (first && !recording.load(Ordering::SeqCst)).then_some(exit::TERMINATED)
}

/// Die together with the controlling process
#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_parent_death_signal() {
    // SAFETY: PR_SET_PDEATHSIG only changes the signal this process gets when its parent exits
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) };
    if rc != 0 {
        warn!(
            "Failed to set parent death signal: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_parent_death_signal() {}

fn print_help() {
    println!("screenrec - display recorder daemon");
    println!();
    println!("USAGE:");
    println!("    screenrec [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help    Print this help message");
    println!("        --test    Record a synthetic test pattern instead of the display");
    println!();
    println!("PROTOCOL:");
    println!("    Recording parameters are read from stdin, one per line: output path,");
    println!("    rotation, audio source, width, height, padding width, padding height,");
    println!("    frame rate, render mode, color format, video bitrate, audio sample rate,");
    println!("    video encoder, allow vertical frames.");
    println!("    Status lines on stdout: ready, configured, recording, fps <value>.");
    println!("    Any further input on stdin stops the recording.");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG            Set log level (e.g., debug, info, warn)");
    println!("    SCREENREC_CONFIG    Settings file location");
    println!("    SCREENREC_LOG_PATH  Log directory");
}
