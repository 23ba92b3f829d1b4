//! Update orchestration.
//!
//! [`UpdateOrchestrator`] decides whether an update is needed, waits for the
//! bootloader, runs a [`BootloaderSession`] and turns the outcome into a
//! host action. All device handles are passed in; it owns no protocol logic.

use crate::coprocessor::{BOOTLOADER_READY, BOOTLOADER_SENTINEL, Coprocessor};
use crate::image::FirmwareImage;
use crate::progress::{Phase, ProgressSink};
use crate::protocol::client::Bootloader;
use crate::session::retry::RetryPolicy;
use crate::session::{BootloaderSession, FailureReason, SessionConfig, SessionOutcome, SessionReport};
use log::{debug, error, info};
use std::thread;
use std::time::Duration;

/// Interval between bootloader state reads.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Pause before restarting after a failure, so the message stays readable.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Host-side reactions to the update result.
pub trait HostControl {
    /// Restart the host so the update is attempted again.
    fn restart(&mut self);

    /// Stay idle, keeping the last message on screen.
    fn hold(&mut self);
}

impl<H: HostControl + ?Sized> HostControl for &mut H {
    fn restart(&mut self) {
        (**self).restart();
    }

    fn hold(&mut self) {
        (**self).hold();
    }
}

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FailureAction {
    /// Restart the host.
    Restart,
    /// Show the failure and hold.
    Report,
}

/// Failure action per failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FailurePolicy {
    /// Firmware version, bootloader version or state could not be read.
    pub probe: FailureAction,
    /// The bootloader never answered `SYNC`.
    pub sync: FailureAction,
    /// Geometry query failed or the image does not fit.
    pub info: FailureAction,
    /// Erase rejected.
    pub erase: FailureAction,
    /// Block write could not be verified.
    pub write: FailureAction,
    /// Seal rejected.
    pub seal: FailureAction,
}

impl Default for FailurePolicy {
    /// Restart on everything except a rejected seal, which is only reported.
    fn default() -> Self {
        Self {
            probe: FailureAction::Restart,
            sync: FailureAction::Restart,
            info: FailureAction::Restart,
            erase: FailureAction::Restart,
            write: FailureAction::Restart,
            seal: FailureAction::Report,
        }
    }
}

impl FailurePolicy {
    /// Action for a failure reason.
    pub fn action_for(&self, reason: &FailureReason) -> FailureAction {
        match reason {
            FailureReason::FirmwareVersion
            | FailureReason::BootloaderVersion
            | FailureReason::BootloaderState
            | FailureReason::UnknownBootloaderState(_) => self.probe,
            FailureReason::SyncExhausted { .. } => self.sync,
            FailureReason::InfoQuery | FailureReason::ImageTooLarge { .. } => self.info,
            FailureReason::Erase => self.erase,
            FailureReason::WriteCrcMismatch { .. } => self.write,
            FailureReason::Seal => self.seal,
        }
    }
}

/// Orchestrator tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateConfig {
    /// Session tuning.
    pub session: SessionConfig,
    /// Policy for waiting until the bootloader reports ready.
    pub ready_poll: RetryPolicy,
    /// Reaction per failure kind.
    pub failure_policy: FailurePolicy,
    /// Pause before a restart.
    pub restart_delay: Duration,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            ready_poll: RetryPolicy::fixed(READY_POLL_INTERVAL),
            failure_policy: FailurePolicy::default(),
            restart_delay: RESTART_DELAY,
        }
    }
}

/// Action taken on the host after the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum HostAction {
    /// The application is running; boot continues normally.
    Continue,
    /// The host holds and shows the last message.
    Hold,
    /// The host was asked to restart.
    Restart,
}

/// Result of an update run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The coprocessor runs its application.
    NotRequired {
        /// Reported application firmware version.
        firmware_version: u8,
    },
    /// The new image was sealed and started.
    Updated,
    /// The update failed.
    Failed(FailureReason),
}

/// Summary of an update run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    /// How the run ended.
    pub outcome: UpdateOutcome,
    /// Action taken on the host.
    pub action: HostAction,
    /// Bootloader version, if it was read.
    pub bootloader_version: Option<u8>,
    /// Session details, if a session ran.
    pub session: Option<SessionReport>,
}

/// Drives a coprocessor update with explicitly passed collaborators.
pub struct UpdateOrchestrator<C, B, S, H>
where
    C: Coprocessor,
    B: Bootloader,
    S: ProgressSink,
    H: HostControl,
{
    coprocessor: C,
    bootloader: B,
    progress: S,
    host: H,
    config: UpdateConfig,
}

impl<C, B, S, H> UpdateOrchestrator<C, B, S, H>
where
    C: Coprocessor,
    B: Bootloader,
    S: ProgressSink,
    H: HostControl,
{
    /// Create an orchestrator.
    pub fn new(coprocessor: C, bootloader: B, progress: S, host: H, config: UpdateConfig) -> Self {
        Self {
            coprocessor,
            bootloader,
            progress,
            host,
            config,
        }
    }

    /// Check the coprocessor and update it with `image` if it runs its
    /// bootloader.
    pub fn run(&mut self, image: &FirmwareImage) -> UpdateReport {
        self.progress
            .report(Phase::Detecting, "Reading coprocessor firmware version", None);

        let firmware_version = match self
            .coprocessor
            .firmware_version()
        {
            Ok(version) => version,
            Err(e) => {
                debug!("Firmware version read failed: {e}");
                return self.fail(FailureReason::FirmwareVersion, None, None);
            },
        };

        if firmware_version != BOOTLOADER_SENTINEL {
            info!("Coprocessor runs firmware version {firmware_version}, no update needed");
            self.progress.report(
                Phase::Done,
                &format!("Firmware version {firmware_version}"),
                None,
            );
            return UpdateReport {
                outcome: UpdateOutcome::NotRequired { firmware_version },
                action: HostAction::Continue,
                bootloader_version: None,
                session: None,
            };
        }

        info!("Coprocessor is in bootloader mode, updating");
        self.progress
            .report(Phase::Detecting, "Updating RP2040...", None);

        let bootloader_version = match self
            .coprocessor
            .bootloader_version()
        {
            Ok(version) => version,
            Err(e) => {
                debug!("Bootloader version read failed: {e}");
                return self.fail(FailureReason::BootloaderVersion, None, None);
            },
        };
        debug!("Bootloader version {bootloader_version}");

        if let Err(reason) = self.wait_until_ready() {
            return self.fail(reason, Some(bootloader_version), None);
        }

        let report = BootloaderSession::new(
            &mut self.bootloader,
            &mut self.progress,
            image,
            self.config.session,
        )
        .run();

        match report.outcome.clone() {
            SessionOutcome::Success => {
                self.host.hold();
                UpdateReport {
                    outcome: UpdateOutcome::Updated,
                    action: HostAction::Hold,
                    bootloader_version: Some(bootloader_version),
                    session: Some(report),
                }
            },
            // The session already reported its failure
            SessionOutcome::Failed(reason) => {
                let action = self.apply_policy(&reason);
                UpdateReport {
                    outcome: UpdateOutcome::Failed(reason),
                    action,
                    bootloader_version: Some(bootloader_version),
                    session: Some(report),
                }
            },
        }
    }

    /// Get a reference to the host control.
    pub fn host(&self) -> &H {
        &self.host
    }

    fn wait_until_ready(&mut self) -> Result<(), FailureReason> {
        self.progress
            .report(Phase::Detecting, "Waiting for bootloader", None);

        let policy = self.config.ready_poll;
        let coprocessor = &mut self.coprocessor;
        let polled = policy.poll(|_| match coprocessor.bootloader_state() {
            Ok(BOOTLOADER_READY) => Some(Ok(())),
            Ok(state) if state > BOOTLOADER_READY => {
                Some(Err(FailureReason::UnknownBootloaderState(state)))
            },
            Ok(_) => None,
            Err(e) => {
                debug!("Bootloader state read failed: {e}");
                Some(Err(FailureReason::BootloaderState))
            },
        });

        match polled {
            Ok((result, attempts)) => {
                if result.is_ok() {
                    debug!("Bootloader ready after {attempts} poll(s)");
                }
                result
            },
            Err(exhausted) => {
                debug!("Bootloader not ready after {} polls", exhausted.attempts);
                Err(FailureReason::BootloaderState)
            },
        }
    }

    fn fail(
        &mut self,
        reason: FailureReason,
        bootloader_version: Option<u8>,
        session: Option<SessionReport>,
    ) -> UpdateReport {
        error!("{}: {reason}", reason.summary());
        self.progress
            .report(Phase::Failed, &reason.cause(), None);
        let action = self.apply_policy(&reason);
        UpdateReport {
            outcome: UpdateOutcome::Failed(reason),
            action,
            bootloader_version,
            session,
        }
    }

    fn apply_policy(&mut self, reason: &FailureReason) -> HostAction {
        match self
            .config
            .failure_policy
            .action_for(reason)
        {
            FailureAction::Restart => {
                if !self
                    .config
                    .restart_delay
                    .is_zero()
                {
                    thread::sleep(self.config.restart_delay);
                }
                info!("Restarting host");
                self.host.restart();
                HostAction::Restart
            },
            FailureAction::Report => {
                self.host.hold();
                HostAction::Hold
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coprocessor::APP_BASE;
    use crate::error::{Error, Result};
    use crate::progress::NullProgress;
    use crate::protocol::geometry::FlashGeometry;
    use crate::session::fake::FakeBootloader;
    use std::collections::VecDeque;

    struct FakeCoprocessor {
        firmware_version: Option<u8>,
        bootloader_version: Option<u8>,
        states: VecDeque<Option<u8>>,
        state_reads: u32,
    }

    impl FakeCoprocessor {
        fn in_bootloader() -> Self {
            Self {
                firmware_version: Some(BOOTLOADER_SENTINEL),
                bootloader_version: Some(1),
                states: VecDeque::new(),
                state_reads: 0,
            }
        }
    }

    fn read(value: Option<u8>) -> Result<u8> {
        value.ok_or_else(|| Error::Timeout("control channel".into()))
    }

    impl Coprocessor for FakeCoprocessor {
        fn firmware_version(&mut self) -> Result<u8> {
            read(self.firmware_version)
        }

        fn bootloader_version(&mut self) -> Result<u8> {
            read(self.bootloader_version)
        }

        fn bootloader_state(&mut self) -> Result<u8> {
            self.state_reads += 1;
            read(
                self.states
                    .pop_front()
                    .unwrap_or(Some(BOOTLOADER_READY)),
            )
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        restarts: u32,
        holds: u32,
    }

    impl HostControl for RecordingHost {
        fn restart(&mut self) {
            self.restarts += 1;
        }

        fn hold(&mut self) {
            self.holds += 1;
        }
    }

    fn geometry() -> FlashGeometry {
        FlashGeometry {
            flash_start: APP_BASE,
            flash_size: 0x10000,
            erase_size: 4096,
            write_size: 256,
            max_data_len: 1024,
        }
    }

    fn fast_config() -> UpdateConfig {
        UpdateConfig {
            session: SessionConfig {
                sync: RetryPolicy::fixed(Duration::ZERO),
                resync: RetryPolicy::fixed(Duration::ZERO),
                jump_delay: Duration::ZERO,
            },
            ready_poll: RetryPolicy::fixed(Duration::ZERO),
            failure_policy: FailurePolicy::default(),
            restart_delay: Duration::ZERO,
        }
    }

    fn image() -> FirmwareImage {
        FirmwareImage::from_bytes(vec![0x42; 1000]).unwrap()
    }

    fn run(
        coprocessor: &mut FakeCoprocessor,
        bootloader: &mut FakeBootloader,
        host: &mut RecordingHost,
        config: UpdateConfig,
    ) -> UpdateReport {
        UpdateOrchestrator::new(coprocessor, bootloader, NullProgress, host, config).run(&image())
    }

    #[test]
    fn test_application_running_skips_update() {
        let mut cop = FakeCoprocessor {
            firmware_version: Some(3),
            ..FakeCoprocessor::in_bootloader()
        };
        let mut bl = FakeBootloader::new(geometry());
        let mut host = RecordingHost::default();

        let report = run(&mut cop, &mut bl, &mut host, fast_config());

        assert_eq!(report.outcome, UpdateOutcome::NotRequired { firmware_version: 3 });
        assert_eq!(report.action, HostAction::Continue);
        assert!(report.session.is_none());
        assert_eq!(bl.sync_calls, 0);
        assert_eq!(cop.state_reads, 0);
        assert_eq!((host.restarts, host.holds), (0, 0));
    }

    #[test]
    fn test_successful_update_holds() {
        let mut cop = FakeCoprocessor::in_bootloader();
        cop.states = [Some(0x00), Some(0xA0), Some(BOOTLOADER_READY)]
            .into_iter()
            .collect();
        let mut bl = FakeBootloader::new(geometry());
        let mut host = RecordingHost::default();

        let report = run(&mut cop, &mut bl, &mut host, fast_config());

        assert_eq!(report.outcome, UpdateOutcome::Updated);
        assert_eq!(report.action, HostAction::Hold);
        assert_eq!(report.bootloader_version, Some(1));
        assert_eq!(cop.state_reads, 3);
        assert_eq!(bl.jumps, vec![APP_BASE]);
        assert_eq!((host.restarts, host.holds), (0, 1));
    }

    #[test]
    fn test_firmware_version_failure_restarts() {
        let mut cop = FakeCoprocessor {
            firmware_version: None,
            ..FakeCoprocessor::in_bootloader()
        };
        let mut bl = FakeBootloader::new(geometry());
        let mut host = RecordingHost::default();

        let report = run(&mut cop, &mut bl, &mut host, fast_config());

        assert_eq!(report.outcome, UpdateOutcome::Failed(FailureReason::FirmwareVersion));
        assert_eq!(host.restarts, 1);
    }

    #[test]
    fn test_bootloader_version_failure() {
        let mut cop = FakeCoprocessor {
            bootloader_version: None,
            ..FakeCoprocessor::in_bootloader()
        };
        let mut bl = FakeBootloader::new(geometry());
        let mut host = RecordingHost::default();

        let report = run(&mut cop, &mut bl, &mut host, fast_config());

        assert_eq!(report.outcome, UpdateOutcome::Failed(FailureReason::BootloaderVersion));
        assert_eq!(report.action, HostAction::Restart);
        assert_eq!(bl.sync_calls, 0);
    }

    #[test]
    fn test_bootloader_state_errors() {
        let mut cop = FakeCoprocessor::in_bootloader();
        cop.states = [Some(0x10), None].into_iter().collect();
        let mut bl = FakeBootloader::new(geometry());
        let mut host = RecordingHost::default();
        let report = run(&mut cop, &mut bl, &mut host, fast_config());
        assert_eq!(report.outcome, UpdateOutcome::Failed(FailureReason::BootloaderState));

        let mut cop = FakeCoprocessor::in_bootloader();
        cop.states = [Some(0xB3)].into_iter().collect();
        let report = run(&mut cop, &mut bl, &mut host, fast_config());
        assert_eq!(
            report.outcome,
            UpdateOutcome::Failed(FailureReason::UnknownBootloaderState(0xB3))
        );
        assert_eq!(host.restarts, 2);
        assert_eq!(bl.sync_calls, 0);
    }

    #[test]
    fn test_seal_failure_is_reported_not_restarted() {
        let mut cop = FakeCoprocessor::in_bootloader();
        let mut bl = FakeBootloader::new(geometry());
        bl.seal_ok = false;
        let mut host = RecordingHost::default();

        let report = run(&mut cop, &mut bl, &mut host, fast_config());

        assert_eq!(report.outcome, UpdateOutcome::Failed(FailureReason::Seal));
        assert_eq!(report.action, HostAction::Hold);
        assert_eq!((host.restarts, host.holds), (0, 1));
    }

    #[test]
    fn test_erase_failure_restarts() {
        let mut cop = FakeCoprocessor::in_bootloader();
        let mut bl = FakeBootloader::new(geometry());
        bl.erase_ok = false;
        let mut host = RecordingHost::default();

        let report = run(&mut cop, &mut bl, &mut host, fast_config());

        assert_eq!(report.outcome, UpdateOutcome::Failed(FailureReason::Erase));
        assert_eq!(report.action, HostAction::Restart);
        assert_eq!((host.restarts, host.holds), (1, 0));
    }

    #[test]
    fn test_seal_policy_can_restart() {
        let mut cop = FakeCoprocessor::in_bootloader();
        let mut bl = FakeBootloader::new(geometry());
        bl.seal_ok = false;
        let mut host = RecordingHost::default();
        let mut config = fast_config();
        config.failure_policy.seal = FailureAction::Restart;

        let report = run(&mut cop, &mut bl, &mut host, config);

        assert_eq!(report.action, HostAction::Restart);
        assert_eq!(host.restarts, 1);
    }

    #[test]
    fn test_default_policy() {
        let policy = FailurePolicy::default();
        assert_eq!(policy.action_for(&FailureReason::Seal), FailureAction::Report);
        assert_eq!(policy.action_for(&FailureReason::Erase), FailureAction::Restart);
        assert_eq!(policy.action_for(&FailureReason::InfoQuery), FailureAction::Restart);
        assert_eq!(
            policy.action_for(&FailureReason::WriteCrcMismatch {
                address: APP_BASE,
                attempts: 1
            }),
            FailureAction::Restart
        );
    }
}
