//! mtpkit CLI: a thin front end over the engine.
//!
//! With `MTPKIT_DEMO_MODE=1` (or `--demo`) every command runs against the
//! virtual Pixel 7, so the whole surface works offline. Real hardware needs
//! a platform transport backend wired into the engine; this build only
//! enumerates real devices.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::debug;

use mtpkit::device::WriteOptions;
use mtpkit::testing::VirtualDevice;
use mtpkit::{
    Device, DeviceConfig, DeviceSummary, EngineOptions, Error, ObjectHandle, QuirkDatabase,
    StorageId,
};

// BSD sysexits, shared with every other implementation of this tool.
const EX_OK: u8 = 0;
const EX_USAGE: u8 = 64;
const EX_UNAVAILABLE: u8 = 69;
const EX_SOFTWARE: u8 = 70;
const EX_TEMPFAIL: u8 = 75;

#[derive(Parser)]
#[command(name = "mtpkit", version, about = "Browse and transfer files on MTP devices")]
struct Cli {
    /// Emit machine-readable JSON.
    #[arg(long, global = true)]
    json: bool,
    /// Chatty logging plus profiling output after transfers.
    #[arg(long, global = true)]
    verbose: bool,
    /// Conservative tuning, partial transfers off.
    #[arg(long, global = true)]
    safe_mode: bool,
    /// Run against the built-in virtual device.
    #[arg(long, global = true)]
    demo: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List attached MTP-capable devices.
    Devices,
    /// Device identity, capabilities, and the resolved policy.
    Info { device: String },
    /// List the device's storages.
    Storages { device: String },
    /// List a directory.
    Ls {
        device: String,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Download a file.
    Get {
        device: String,
        remote: String,
        local: PathBuf,
        /// Resume from an existing .part file.
        #[arg(long)]
        resume: bool,
    },
    /// Upload a file into a directory on the device.
    Put {
        device: String,
        local: PathBuf,
        #[arg(default_value = "/")]
        remote_dir: String,
    },
    /// Delete a file or (with -r) a directory tree.
    Rm {
        device: String,
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Create a directory.
    Mkdir { device: String, path: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap prints its own message; help/version are not errors.
            let code = if e.use_stderr() { EX_USAGE } else { EX_OK };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(if cli.verbose { "mtpkit=debug" } else { "warn" }),
    )
    .init();

    let mut options = EngineOptions::from_env();
    options.demo_mode |= cli.demo;
    options.safe_mode |= cli.safe_mode;

    match run(&cli, options).await {
        Ok(()) => ExitCode::from(EX_OK),
        Err(e) => {
            report_error(&cli, &e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(e: &Error) -> u8 {
    match e {
        Error::DeviceDisconnected | Error::PermissionDenied | Error::ObjectNotFound => {
            EX_UNAVAILABLE
        }
        Error::Busy | Error::SessionBusy | Error::Timeout | Error::SessionNotOpen => EX_TEMPFAIL,
        Error::Transport(t) if t.is_transient() => EX_TEMPFAIL,
        _ => EX_SOFTWARE,
    }
}

fn report_error(cli: &Cli, e: &Error) {
    if cli.json {
        let envelope = serde_json::json!({
            "schemaVersion": "1.0",
            "type": "error",
            "error": e.to_string(),
            "details": { "hint": e.user_message() },
            "mode": "cli",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        println!("{envelope}");
    } else {
        eprintln!("mtpkit: {e}");
        eprintln!("  {}", e.user_message());
    }
}

async fn run(cli: &Cli, options: EngineOptions) -> Result<(), Error> {
    if let Command::Devices = cli.command {
        return list_devices(cli, &options).await;
    }

    if !options.demo_mode {
        return Err(Error::PreconditionFailed(
            "this build has no hardware transport backend; set MTPKIT_DEMO_MODE=1 or pass --demo"
                .to_string(),
        ));
    }

    let device = demo_device(&options).await?;
    let storage = primary_storage(&device).await?;

    match &cli.command {
        Command::Devices => unreachable!("handled above"),
        Command::Info { .. } => {
            let info = device.device_info().await?;
            let receipt = device.probe_receipt();
            if cli.json {
                let mut out = serde_json::json!({
                    "manufacturer": info.manufacturer,
                    "model": info.model,
                    "version": info.device_version,
                    "serial": info.serial_number,
                    "operations": info.operations.len(),
                });
                if let Some(receipt) = receipt {
                    out["probe"] = serde_json::to_value(&receipt)
                        .map_err(|e| Error::Io(e.to_string()))?;
                }
                println!("{out}");
            } else {
                println!("{} {} ({})", info.manufacturer, info.model, info.device_version);
                if let Some(serial) = &info.serial_number {
                    println!("serial: {serial}");
                }
                if let Some(receipt) = receipt {
                    println!("fingerprint: {}", receipt.fingerprint);
                    println!("policy layers: {}", receipt.policy.layers.join(", "));
                    println!(
                        "chunk: {} bytes, io timeout: {} ms",
                        receipt.policy.max_chunk_bytes, receipt.policy.io_timeout_ms
                    );
                }
            }
        }
        Command::Storages { .. } => {
            let storages = device.storages().await?;
            for s in &storages {
                if cli.json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "id": s.id.0,
                            "name": s.description,
                            "capacityBytes": s.capacity_bytes,
                            "freeBytes": s.free_bytes,
                            "readOnly": s.read_only,
                        })
                    );
                } else {
                    println!(
                        "{}  {}  {} free of {}{}",
                        s.id,
                        s.description,
                        human_bytes(s.free_bytes),
                        human_bytes(s.capacity_bytes),
                        if s.read_only { "  [read-only]" } else { "" },
                    );
                }
            }
        }
        Command::Ls { path, .. } => {
            let parent = resolve_dir(&device, storage, path).await?;
            let mut objects = device.list(storage, parent).await?;
            objects.sort_by(|a, b| a.name.cmp(&b.name));
            for o in &objects {
                if cli.json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "handle": o.handle.0,
                            "name": o.name,
                            "isDirectory": o.is_directory(),
                            "size": o.size,
                        })
                    );
                } else if o.is_directory() {
                    println!("{:>10}  {}/", "-", o.name);
                } else {
                    println!("{:>10}  {}", o.size.unwrap_or(0), o.name);
                }
            }
        }
        Command::Get { remote, local, resume, .. } => {
            let handle = resolve_file(&device, storage, remote).await?;
            let bytes = if *resume {
                device.resume_download(handle, local).await?
            } else {
                device.download(handle, local).await?
            };
            if !cli.json {
                println!("{remote} -> {} ({bytes} bytes)", local.display());
            }
            maybe_print_profile(cli, &device);
        }
        Command::Put { local, remote_dir, .. } => {
            let parent = resolve_dir(&device, storage, remote_dir).await?;
            let name = local
                .file_name()
                .ok_or_else(|| Error::PreconditionFailed("local path has no filename".to_string()))?
                .to_string_lossy()
                .to_string();
            let handle = device
                .upload_from_path(storage, parent, &name, local, WriteOptions::default())
                .await?;
            if !cli.json {
                println!("{} -> {remote_dir} (handle {handle})", local.display());
            }
            maybe_print_profile(cli, &device);
        }
        Command::Rm { path, recursive, .. } => {
            let handle = resolve_any(&device, storage, path).await?;
            device.delete(handle, *recursive).await?;
            if !cli.json {
                println!("deleted {path}");
            }
        }
        Command::Mkdir { path, .. } => {
            let (dir, name) = split_parent(path)?;
            let parent = resolve_dir(&device, storage, &dir).await?;
            let handle = device.create_folder(storage, parent, &name).await?;
            if !cli.json {
                println!("created {path} (handle {handle})");
            }
        }
    }
    Ok(())
}

async fn list_devices(cli: &Cli, options: &EngineOptions) -> Result<(), Error> {
    let devices: Vec<DeviceSummary> = if options.demo_mode {
        vec![demo_summary()]
    } else {
        #[cfg(any(target_os = "macos", target_os = "linux"))]
        {
            mtpkit::hotplug::list_devices()
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            Vec::new()
        }
    };

    for d in &devices {
        if cli.json {
            println!("{}", serde_json::to_string(d).map_err(|e| Error::Io(e.to_string()))?);
        } else {
            println!("{}  {}  [{}]", d.id, d.display_name(), d.fingerprint());
        }
    }
    if devices.is_empty() && !cli.json {
        eprintln!("no devices found");
    }
    Ok(())
}

fn demo_summary() -> DeviceSummary {
    DeviceSummary {
        id: "mtp-demo-1".to_string(),
        manufacturer: Some("Google".to_string()),
        model: Some("Pixel 7".to_string()),
        vendor_id: Some(0x18D1),
        product_id: Some(0x4EE1),
        bus: "demo".to_string(),
        address: 1,
        usb_serial: Some("8AXX0P1X7".to_string()),
    }
}

/// Builds the demo device: a virtual Pixel 7 with a familiar Android layout.
async fn demo_device(options: &EngineOptions) -> Result<Arc<Device<VirtualDevice>>, Error> {
    let transport = Arc::new(VirtualDevice::pixel7());
    let dcim = transport.add_folder(0, "DCIM");
    let camera = transport.add_folder(dcim, "Camera");
    transport.add_file(camera, "IMG_0001.JPG", vec![0xFF; 256 * 1024]);
    transport.add_file(camera, "IMG_0002.JPG", vec![0xD8; 512 * 1024]);
    transport.add_folder(0, "Download");
    transport.add_file(0, "notes.txt", b"demo device scratchpad\n".to_vec());

    let quirk_db = match &options.quirks_path {
        Some(path) => Arc::new(QuirkDatabase::load(path).await?),
        None => Arc::new(QuirkDatabase::builtin()),
    };
    debug!("quirk database: {} entries", quirk_db.len());

    let config = DeviceConfig::new(quirk_db).with_options(options.clone());
    let device = Arc::new(Device::new(demo_summary(), transport, config));
    device.open_if_needed().await?;
    Ok(device)
}

async fn primary_storage(device: &Arc<Device<VirtualDevice>>) -> Result<StorageId, Error> {
    let storages = device.storages().await?;
    storages
        .first()
        .map(|s| s.id)
        .ok_or_else(|| Error::PreconditionFailed("device reports no storage".to_string()))
}

/// Walks `path` segment by segment. `Ok(None)` is the storage root.
async fn resolve_dir(
    device: &Arc<Device<VirtualDevice>>,
    storage: StorageId,
    path: &str,
) -> Result<Option<ObjectHandle>, Error> {
    let mut parent: Option<ObjectHandle> = None;
    for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
        let children = device.list(storage, parent).await?;
        let next = children
            .iter()
            .find(|o| o.is_directory() && o.name == segment)
            .ok_or(Error::ObjectNotFound)?;
        parent = Some(next.handle);
    }
    Ok(parent)
}

async fn resolve_any(
    device: &Arc<Device<VirtualDevice>>,
    storage: StorageId,
    path: &str,
) -> Result<ObjectHandle, Error> {
    let (dir, name) = split_parent(path)?;
    let parent = resolve_dir(device, storage, &dir).await?;
    let children = device.list(storage, parent).await?;
    children
        .iter()
        .find(|o| o.name == name)
        .map(|o| o.handle)
        .ok_or(Error::ObjectNotFound)
}

async fn resolve_file(
    device: &Arc<Device<VirtualDevice>>,
    storage: StorageId,
    path: &str,
) -> Result<ObjectHandle, Error> {
    let (dir, name) = split_parent(path)?;
    let parent = resolve_dir(device, storage, &dir).await?;
    let children = device.list(storage, parent).await?;
    children
        .iter()
        .find(|o| !o.is_directory() && o.name == name)
        .map(|o| o.handle)
        .ok_or(Error::ObjectNotFound)
}

/// Splits `/DCIM/Camera/IMG.JPG` into (`/DCIM/Camera`, `IMG.JPG`).
fn split_parent(path: &str) -> Result<(String, String), Error> {
    let trimmed = path.trim_end_matches('/');
    let Some((dir, name)) = trimmed.rsplit_once('/') else {
        if trimmed.is_empty() {
            return Err(Error::PreconditionFailed("empty path".to_string()));
        }
        return Ok((String::new(), trimmed.to_string()));
    };
    if name.is_empty() {
        return Err(Error::PreconditionFailed(format!("{path:?} has no final component")));
    }
    Ok((dir.to_string(), name.to_string()))
}

fn maybe_print_profile(cli: &Cli, device: &Arc<Device<VirtualDevice>>) {
    if !cli.verbose {
        return;
    }
    let report = device.profiler().report(None);
    for op in &report.operations {
        eprintln!(
            "{:<20} n={:<4} avg={:.1}ms min={}ms max={}ms p95={}ms",
            op.name, op.count, op.avg_ms, op.min_ms, op.max_ms, op.p95_ms
        );
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 { format!("{bytes} {}", UNITS[0]) } else { format!("{value:.1} {}", UNITS[unit]) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_parent() {
        assert_eq!(
            split_parent("/DCIM/Camera/IMG.JPG").unwrap(),
            ("/DCIM/Camera".to_string(), "IMG.JPG".to_string())
        );
        assert_eq!(split_parent("notes.txt").unwrap(), (String::new(), "notes.txt".to_string()));
        assert_eq!(split_parent("/notes.txt").unwrap(), (String::new(), "notes.txt".to_string()));
        assert!(split_parent("/").is_err());
        assert!(split_parent("").is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&Error::DeviceDisconnected), EX_UNAVAILABLE);
        assert_eq!(exit_code_for(&Error::ObjectNotFound), EX_UNAVAILABLE);
        assert_eq!(exit_code_for(&Error::Busy), EX_TEMPFAIL);
        assert_eq!(exit_code_for(&Error::Timeout), EX_TEMPFAIL);
        assert_eq!(exit_code_for(&Error::Protocol { code: 0x2002, message: None }), EX_SOFTWARE);
        assert_eq!(
            exit_code_for(&Error::VerificationFailed { expected: 1, actual: 0 }),
            EX_SOFTWARE
        );
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(64 * 1024 * 1024 * 1024), "64.0 GiB");
    }

    #[tokio::test]
    async fn test_demo_device_end_to_end() {
        let options = EngineOptions { demo_mode: true, ..Default::default() };
        let device = demo_device(&options).await.unwrap();
        let storage = primary_storage(&device).await.unwrap();

        let camera = resolve_dir(&device, storage, "/DCIM/Camera").await.unwrap();
        assert!(camera.is_some());
        let listing = device.list(storage, camera).await.unwrap();
        assert_eq!(listing.len(), 2);

        let handle = resolve_file(&device, storage, "/notes.txt").await.unwrap();
        let data = device.read(handle, 0, 1024).await.unwrap();
        assert_eq!(data, b"demo device scratchpad\n");
    }
}
