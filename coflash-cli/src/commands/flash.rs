//! Flash command implementation.

use anyhow::{Context, Result};
use coflash::{
    AssumeBootloader, BootloaderClient, FailureAction, FirmwareImage, HostAction, HostControl,
    Phase, ProgressSink, UpdateOrchestrator, UpdateOutcome,
};
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info};
use std::path::Path;

use crate::config::Config;
use crate::{Cli, CliError, resolve_baud, use_fancy_output};

/// Flash options taken from the command line.
pub(crate) struct FlashOptions {
    /// Overrides `update.max_sync_attempts`.
    pub max_sync_attempts: Option<u32>,
    /// Overrides `update.restart_on_seal_failure` when set.
    pub restart_on_seal_failure: bool,
}

/// Load the image named on the command line.
pub(crate) fn load_image(path: &Path) -> Result<FirmwareImage> {
    FirmwareImage::from_file(path)
        .with_context(|| format!("Failed to load image {}", path.display()))
}

/// Progress bar fed by the update phases.
struct ProgressBarSink {
    pb: ProgressBar,
    quiet: bool,
}

impl ProgressBarSink {
    fn new(quiet: bool) -> Self {
        let pb = if quiet || !use_fancy_output() {
            ProgressBar::hidden()
        } else {
            let pb = ProgressBar::new(100);
            #[allow(clippy::unwrap_used)] // Static template string
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            pb.set_draw_target(ProgressDrawTarget::stderr());
            pb
        };
        Self { pb, quiet }
    }
}

impl ProgressSink for ProgressBarSink {
    fn report(&mut self, phase: Phase, message: &str, percentage: Option<u8>) {
        if let Some(percentage) = percentage {
            self.pb
                .set_position(u64::from(percentage));
        }

        match phase {
            Phase::Writing => self
                .pb
                .set_message(message.to_string()),
            Phase::Done => self
                .pb
                .finish_with_message(message.to_string()),
            Phase::Failed => self
                .pb
                .abandon_with_message(message.to_string()),
            _ => {
                self.pb
                    .set_message(message.to_string());
                if !self.quiet && self.pb.is_hidden() {
                    eprintln!("{} {message}", style("•").dim());
                }
            },
        }
    }
}

/// Host reactions for a desktop run.
///
/// A restart cannot happen from here, so it is recorded and turned into an
/// exit code instead.
#[derive(Debug, Default)]
struct CliHost {
    restart_requested: bool,
}

impl HostControl for CliHost {
    fn restart(&mut self) {
        debug!("Restart requested");
        self.restart_requested = true;
    }

    fn hold(&mut self) {
        debug!("Holding");
    }
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    port: &str,
    image: &FirmwareImage,
    options: &FlashOptions,
) -> Result<()> {
    let baud = resolve_baud(cli, config);
    let mut update_config = config.to_update_config();
    if options.max_sync_attempts.is_some() {
        update_config.session.sync = update_config
            .session
            .sync
            .with_max_attempts(options.max_sync_attempts);
    }
    if options.restart_on_seal_failure {
        update_config.failure_policy.seal = FailureAction::Restart;
    }

    if !cli.quiet {
        eprintln!(
            "{} Image: {} bytes (CRC-32 0x{:08X})",
            style("ℹ").blue(),
            image.len(),
            image.crc32()
        );
        eprintln!("{} Using port {port} at {baud} baud", style("🔌").cyan());
    }

    let bootloader = BootloaderClient::open(port, baud)
        .with_context(|| format!("Failed to open serial port {port}"))?;

    // Without a control channel the device must already be in its bootloader
    let mut orchestrator = UpdateOrchestrator::new(
        AssumeBootloader::default(),
        bootloader,
        ProgressBarSink::new(cli.quiet),
        CliHost::default(),
        update_config,
    );
    let report = orchestrator.run(image);

    if let Some(session) = &report.session {
        debug!(
            "Session: {} sync attempt(s), {} block write(s), {} resync(s)",
            session.sync_attempts, session.write_attempts, session.resyncs
        );
    }

    match report.outcome {
        UpdateOutcome::Updated => {
            if !cli.quiet {
                eprintln!("{} Coprocessor updated", style("✓").green());
            }
            Ok(())
        },
        UpdateOutcome::NotRequired { firmware_version } => {
            info!("Coprocessor runs firmware version {firmware_version}, nothing to do");
            Ok(())
        },
        UpdateOutcome::Failed(reason) => {
            let message = format!("{}: {reason}", reason.summary());
            if report.action == HostAction::Restart
                && orchestrator
                    .host()
                    .restart_requested
            {
                Err(CliError::RestartRequested(message).into())
            } else {
                Err(anyhow::anyhow!(message))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_host_records_restart() {
        let mut host = CliHost::default();
        host.hold();
        assert!(!host.restart_requested);
        host.restart();
        assert!(host.restart_requested);
    }

    #[test]
    fn test_hidden_sink_accepts_all_phases() {
        let mut sink = ProgressBarSink::new(true);
        sink.report(Phase::Syncing, "Waiting for bootloader sync", None);
        sink.report(Phase::Writing, "Writing @ 0x10010000", Some(40));
        assert_eq!(sink.pb.position(), 40);
        sink.report(Phase::Done, "Update complete", Some(100));
        assert_eq!(sink.pb.position(), 100);
    }

    #[test]
    fn test_load_missing_image() {
        let err = load_image(Path::new("/nonexistent/coflash/app.bin")).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to load image"));
    }
}
