//! usb-probe
//!
//! Lists connected USB devices or dumps one device's descriptor tree. All
//! native access goes through the USB worker thread.

use anyhow::{Context as _, Result, anyhow};
use clap::Parser;
use common::{HostConfig, UsbBridge, create_usb_bridge, setup_logging};
use host::usb::{Context, ContextOptions, EnumerationPolicy, UsbDeviceInfo, spawn_usb_worker};
use protocol::DeviceKey;
use protocol::uvc::{find_video_control, scan_video_control};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "usb-probe")]
#[command(author, version, about = "Inspect USB devices and their descriptors")]
#[command(long_about = "
Lists the USB devices visible to this host, or dumps the full descriptor
tree of one device.

EXAMPLES:
    # One line per device
    usb-probe

    # Include manufacturer, product and serial strings
    usb-probe --strings

    # Machine readable output
    usb-probe --json

    # Descriptor tree of one device
    usb-probe --key 1234_5678_3_17

CONFIGURATION:
    The probe looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-host/host.toml
    3. /etc/usb-host/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    /// Only show the device with this key (VVVV_PPPP_BUS_ADDR)
    #[arg(short, long, value_name = "KEY")]
    key: Option<DeviceKey>,

    /// Open devices to read their string descriptors
    #[arg(long)]
    strings: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        HostConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.strings {
        config.usb.read_strings = true;
    }

    setup_logging(&config.logging).context("Failed to setup logging")?;
    info!("usb-probe v{}", env!("CARGO_PKG_VERSION"));

    let context = Context::libusb(ContextOptions::from_config(&config))
        .context("Failed to initialise libusb")?;
    let (usb_bridge, worker) = create_usb_bridge();
    let usb_worker_handle = spawn_usb_worker(
        worker,
        context,
        EnumerationPolicy::from_config(&config),
    )
    .context("Failed to spawn USB worker thread")?;

    let result = probe(&usb_bridge, &args).await;

    info!("Shutting down USB subsystem...");
    if let Err(e) = usb_bridge.shutdown().await {
        error!("Error shutting down USB worker: {:#}", e);
    }
    if let Err(e) = usb_worker_handle.join() {
        error!("USB worker thread panicked: {:?}", e);
    }

    result
}

async fn probe(usb_bridge: &UsbBridge, args: &Args) -> Result<()> {
    let devices = usb_bridge
        .list_devices()
        .await
        .context("Failed to list devices")?;

    if let Some(key) = &args.key {
        let device = devices
            .iter()
            .find(|d| d.key == *key)
            .ok_or_else(|| anyhow!("No device with key {}", key))?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(device)?);
        } else {
            print_tree(device);
        }
        return Ok(());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        for device in &devices {
            print_summary(device);
        }
    }
    Ok(())
}

fn print_summary(device: &UsbDeviceInfo) {
    println!(
        "Bus {:03} Device {:03}: ID {:04x}:{:04x} {:<10?} {}  {} {}",
        device.bus_number,
        device.address,
        device.vendor_id(),
        device.product_id(),
        device.speed,
        device.key,
        device.manufacturer.as_deref().unwrap_or(""),
        device.product.as_deref().unwrap_or("")
    );
}

fn print_tree(device: &UsbDeviceInfo) {
    let d = &device.descriptor;
    println!("Device {} (bus {} address {})", device.key, device.bus_number, device.address);
    println!("  bcdUSB             {:x}.{:02x}", d.usb_version >> 8, d.usb_version & 0xff);
    println!("  class              {:#04x}/{:#04x}/{:#04x}", d.class, d.subclass, d.protocol);
    println!("  bMaxPacketSize0    {}", d.max_packet_size0);
    println!("  port path          {:?}", device.port_path);
    println!("  speed              {:?}", device.speed);
    if let Some(s) = &device.manufacturer {
        println!("  manufacturer       {}", s);
    }
    if let Some(s) = &device.product {
        println!("  product            {}", s);
    }
    if let Some(s) = &device.serial_number {
        println!("  serial             {}", s);
    }

    for config in &device.configurations {
        println!(
            "  Configuration {} ({} interfaces, {} mA{})",
            config.configuration_value,
            config.num_interfaces,
            u32::from(config.max_power) * 2,
            if config.self_powered() { ", self powered" } else { "" }
        );
        for alt in config.alt_settings() {
            println!(
                "    Interface {} alt {}: class {:#04x}/{:#04x}/{:#04x}, {} extra bytes",
                alt.interface_number,
                alt.alternate_setting,
                alt.class,
                alt.subclass,
                alt.protocol,
                alt.extra.len()
            );
            for ep in &alt.endpoints {
                println!(
                    "      Endpoint {:#04x} {:?} {:?}, max packet {}, interval {}",
                    ep.address,
                    ep.direction(),
                    ep.transfer_type(),
                    ep.max_packet_size,
                    ep.interval
                );
            }
        }

        if let Some(vc) = find_video_control(config) {
            let units = scan_video_control(&vc.extra);
            println!("    Video control units: {:?}", units);
        }
    }
}
