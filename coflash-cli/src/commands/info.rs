//! Device info and port listing command implementations.

use {
    crate::{Cli, config::Config, resolve_baud},
    anyhow::{Context, Result},
    coflash::{
        Bootloader, BootloaderClient, FlashGeometry, RetryPolicy, auto_detect_port, detect_ports,
        session::SYNC_INTERVAL,
    },
    console::style,
    log::debug,
};

/// SYNC attempts before `info` gives up.
const INFO_SYNC_ATTEMPTS: u32 = 10;

/// List ports command implementation.
pub(crate) fn cmd_list_ports(cli: &Cli, json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "device": p.device.name(),
                    "known": p.device.is_known(),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    if !cli.quiet {
        eprintln!("{}", style("Serial ports").bold().underlined());
    }

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let marker = if port.is_likely_coprocessor() {
            style("•").green()
        } else {
            style("•").dim()
        };
        println!("  {marker} {}", port.describe());
    }

    if let Ok(auto_port) = auto_detect_port() {
        if !cli.quiet {
            eprintln!(
                "\n{} Auto-detected: {}",
                style("→").green().bold(),
                style(&auto_port.name).cyan().bold()
            );
        }
    }

    Ok(())
}

/// Sync with the bootloader and read its flash geometry.
fn query_geometry<B: Bootloader>(bootloader: &mut B, policy: RetryPolicy) -> Result<FlashGeometry> {
    let (_, attempts) = policy
        .poll(|attempt| match bootloader.sync() {
            Ok(true) => Some(()),
            Ok(false) => None,
            Err(e) => {
                debug!("SYNC attempt {attempt} failed: {e}");
                None
            },
        })
        .context("Bootloader did not answer SYNC; is the coprocessor in its bootloader?")?;
    debug!("Synced after {attempts} attempt(s)");

    let geometry = bootloader
        .get_info()
        .context("Failed to read information")?;
    geometry
        .validate()
        .with_context(|| format!("Bootloader reported an unusable layout ({geometry})"))?;
    Ok(geometry)
}

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &Config, port: &str, json: bool) -> Result<()> {
    let baud = resolve_baud(cli, config);
    let mut bootloader = BootloaderClient::open(port, baud)
        .with_context(|| format!("Failed to open serial port {port}"))?;

    if !json && !cli.quiet {
        eprintln!("{} Waiting for bootloader sync on {port}", style("⏳").yellow());
    }

    let policy = RetryPolicy::fixed(SYNC_INTERVAL).with_max_attempts(Some(INFO_SYNC_ATTEMPTS));
    let geometry = query_geometry(&mut bootloader, policy)?;

    if json {
        let output = serde_json::json!({
            "port": port,
            "geometry": geometry,
            "capacity": geometry.aligned_capacity(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}", style("Bootloader flash geometry").bold().underlined());
    println!("  Flash start:  0x{:08X}", geometry.flash_start);
    println!(
        "  Flash size:   {} bytes ({} KiB)",
        geometry.flash_size,
        geometry.flash_size / 1024
    );
    println!("  Erase size:   {} bytes", geometry.erase_size);
    println!("  Write size:   {} bytes", geometry.write_size);
    println!("  Max data:     {} bytes", geometry.max_data_len);
    println!("  Max image:    {} bytes", geometry.aligned_capacity());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coflash::Result as CoResult;
    use std::time::Duration;

    fn no_delay(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(Duration::ZERO).with_max_attempts(Some(max_attempts))
    }

    struct ScriptedBootloader {
        syncs_before_ok: u32,
        sync_calls: u32,
        geometry: FlashGeometry,
    }

    impl Bootloader for ScriptedBootloader {
        fn sync(&mut self) -> CoResult<bool> {
            self.sync_calls += 1;
            Ok(self.sync_calls > self.syncs_before_ok)
        }

        fn get_info(&mut self) -> CoResult<FlashGeometry> {
            Ok(self.geometry)
        }

        fn erase(&mut self, _addr: u32, _len: u32) -> CoResult<bool> {
            unreachable!()
        }

        fn write(&mut self, _addr: u32, _block: &[u8]) -> CoResult<Option<u32>> {
            unreachable!()
        }

        fn seal(&mut self, _load: u32, _entry: u32, _len: u32, _crc: u32) -> CoResult<bool> {
            unreachable!()
        }

        fn go(&mut self, _entry: u32) -> CoResult<()> {
            unreachable!()
        }
    }

    fn geometry() -> FlashGeometry {
        FlashGeometry {
            flash_start: 0x1001_0000,
            flash_size: 0x1F_0000,
            erase_size: 4096,
            write_size: 256,
            max_data_len: 256,
        }
    }

    #[test]
    fn test_query_geometry_after_first_sync() {
        let mut bootloader = ScriptedBootloader {
            syncs_before_ok: 0,
            sync_calls: 0,
            geometry: geometry(),
        };
        assert_eq!(query_geometry(&mut bootloader, no_delay(3)).unwrap(), geometry());
        assert_eq!(bootloader.sync_calls, 1);
    }

    #[test]
    fn test_query_geometry_after_retries() {
        let mut bootloader = ScriptedBootloader {
            syncs_before_ok: 2,
            sync_calls: 0,
            geometry: geometry(),
        };
        assert!(query_geometry(&mut bootloader, no_delay(3)).is_ok());
        assert_eq!(bootloader.sync_calls, 3);
    }

    #[test]
    fn test_query_geometry_rejects_unusable_layout() {
        let mut bootloader = ScriptedBootloader {
            syncs_before_ok: 0,
            sync_calls: 0,
            geometry: FlashGeometry {
                write_size: 0,
                ..geometry()
            },
        };
        let err = query_geometry(&mut bootloader, no_delay(3)).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("unusable layout"), "{message}");
        assert!(message.contains("write size is zero"), "{message}");
    }

    #[test]
    fn test_query_geometry_gives_up() {
        let mut bootloader = ScriptedBootloader {
            syncs_before_ok: u32::MAX,
            sync_calls: 0,
            geometry: geometry(),
        };
        let err = query_geometry(&mut bootloader, no_delay(4)).unwrap_err();
        assert!(format!("{err:#}").contains("SYNC"));
        assert_eq!(bootloader.sync_calls, 4);
    }
}
