mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing_subscriber::EnvFilter;
use vblk_bus::control::{IOCTL_DUMMY, IOCTL_FILE_ATTACH, IOCTL_FILE_DETACH};
use vblk_bus::irp::DeviceTextType;
use vblk_bus::{
    BusConfig, CompletedIrp, DeviceControlRequest, MainBus, PnpMinor, RelationType, Request,
    RootPdo, Status,
};

use crate::config::Config;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn submit(bus: &MainBus, request: Request) -> anyhow::Result<CompletedIrp> {
    bus.submit(request)
        .wait_timeout(REQUEST_TIMEOUT)
        .context("request timed out")
}

fn control(bus: &MainBus, code: u32, input: Vec<u8>) -> anyhow::Result<CompletedIrp> {
    submit(bus, Request::DeviceControl(DeviceControlRequest::new(code, input)))
}

fn print_relations(bus: &MainBus) -> anyhow::Result<()> {
    let done = submit(
        bus,
        Request::Pnp(PnpMinor::QueryDeviceRelations(RelationType::Bus)),
    )?;
    let Some(relations) = done.relations() else {
        println!("bus has no children");
        return Ok(());
    };
    println!("bus children ({}):", relations.count());
    for device in relations.objects() {
        println!("  #{:<4} {:<40} {:?}", device.id(), device.name(), device.kind());
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let config = Config::load();

    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let bus = MainBus::new(
        BusConfig::default().with_product(config.product.clone()),
        Arc::new(RootPdo::default()),
    )?;

    if let Some(path) = &config.memdisk_image {
        let memory =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        match bus.attach_memdisk(&memory, config.memdisk_base)? {
            Some(unit) => tracing::info!(unit, "MEMDISK attached"),
            None => tracing::info!(image = %path.display(), "no MEMDISK in image"),
        }
    }

    let started = submit(&bus, Request::Pnp(PnpMinor::StartDevice))?;
    if started.status != Status::Success {
        bail!("bus failed to start: {:?}", started.status);
    }
    let text = submit(
        &bus,
        Request::Pnp(PnpMinor::QueryDeviceText(DeviceTextType::Description)),
    )?;
    tracing::info!(name = text.text().as_deref().unwrap_or("?"), "bus started");

    for path in &config.files {
        let mut input = path
            .to_str()
            .with_context(|| format!("{} is not valid UTF-8", path.display()))?
            .as_bytes()
            .to_vec();
        input.push(0);
        let done = control(&bus, IOCTL_FILE_ATTACH, input)?;
        match done.unit() {
            Some(unit) => tracing::info!(unit, path = %path.display(), "file disk attached"),
            None => tracing::warn!(status = ?done.status, path = %path.display(), "file attach failed"),
        }
    }

    for size in &config.dummy_sizes {
        let done = control(&bus, IOCTL_DUMMY, size.to_le_bytes().to_vec())?;
        match done.unit() {
            Some(unit) => tracing::info!(unit, size, "dummy disk attached"),
            None => tracing::warn!(status = ?done.status, size, "dummy attach failed"),
        }
    }

    print_relations(&bus)?;

    if let Some(unit) = config.detach {
        let done = control(&bus, IOCTL_FILE_DETACH, unit.to_le_bytes().to_vec())?;
        println!("detach unit {unit}: {:?}", done.status);
        print_relations(&bus)?;
    }

    let removed = submit(&bus, Request::Pnp(PnpMinor::RemoveDevice))?;
    tracing::info!(status = ?removed.status, "bus removed");
    Ok(())
}
