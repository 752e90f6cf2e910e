// ucomms: offline tooling for the unified comms wire formats
//
// Encodes and decodes every frame format a node speaks, builds multi-hop
// routing instructions for a base station, and manages the node config.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use unified_comms_core::crypto::{AesKey, KeyLookup, NoKeys, StaticKeys};
use unified_comms_core::encoding::csiro85;
use unified_comms_core::routing::{IncomingPath, OutgoingRoute, RouteRecord};
use unified_comms_core::transport::ble::{
    AdvertisingCodec, AdvertisingDriver, AdvertisingPacket, BluetoothInterface, GattCodec, ScanReport,
};
use unified_comms_core::transport::serial::{SerialDriver, SerialFrame, SerialInterface};
use unified_comms_core::{
    Address, Channel, CommsError, CommsInterface, CommsNode, IncomingRoute, InterfaceKind,
    ListenDuration, Message, PayloadKind, PayloadType, ReceiveHandler,
};

#[derive(Parser)]
#[command(name = "ucomms")]
#[command(about = "Unified Comms: serial, BLE advertising and GATT frame tooling", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file to use instead of the platform default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Base-85 text encoding used inside advertisements
    Csiro85 {
        #[command(subcommand)]
        action: Csiro85Action,
    },
    /// Serial frames
    Serial {
        #[command(subcommand)]
        action: SerialAction,
    },
    /// BLE advertising packets
    Adv {
        #[command(subcommand)]
        action: AdvAction,
    },
    /// GATT frames
    Gatt {
        #[command(subcommand)]
        action: GattAction,
    },
    /// Routing stacks
    Route {
        #[command(subcommand)]
        action: RouteAction,
    },
    /// Node configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run a gateway and a sensor node in memory and relay one reading
    Simulate {
        /// Gateway listen window in milliseconds
        #[arg(long, default_value = "500")]
        listen_ms: u64,
    },
}

#[derive(Subcommand)]
enum Csiro85Action {
    /// Hex bytes (a multiple of 4) to CSIRO85 text
    Encode { hex: String },
    /// CSIRO85 text to hex bytes
    Decode { text: String },
}

#[derive(Subcommand)]
enum SerialAction {
    Encode {
        /// Sender address
        #[arg(long)]
        source: Address,
        #[arg(long, default_value = "0")]
        sequence: u8,
        #[arg(long = "type", default_value = "tdf3")]
        payload_type: String,
        /// Payload as hex
        payload: String,
    },
    Decode { hex: String },
}

#[derive(Subcommand)]
enum AdvAction {
    Encode {
        #[arg(long)]
        destination: Address,
        #[arg(long = "type", default_value = "tdf3")]
        payload_type: String,
        #[arg(long, default_value = "0")]
        sequence: u8,
        /// AES-128 key as hex; encrypts when given
        #[arg(long)]
        key: Option<String>,
        payload: String,
    },
    /// Decode one 31-byte advertisement
    Decode {
        /// Radio address of the advertiser
        #[arg(long)]
        sender: Address,
        #[arg(long)]
        key: Option<String>,
        hex: String,
    },
}

#[derive(Subcommand)]
enum GattAction {
    Encode {
        #[arg(long)]
        destination: Address,
        #[arg(long = "type", default_value = "tdf3")]
        payload_type: String,
        #[arg(long)]
        key: Option<String>,
        payload: String,
    },
    Decode {
        /// Connected peer
        #[arg(long)]
        peer: Address,
        #[arg(long)]
        key: Option<String>,
        hex: String,
    },
}

#[derive(Subcommand)]
enum RouteAction {
    /// Build an OUTGOING stack
    Outgoing {
        /// Hop as ADDRESS/INTERFACE[/CHANNEL], in forwarding order; repeatable
        #[arg(long = "hop", required = true)]
        hops: Vec<String>,
        #[arg(long = "type", default_value = "tdf3")]
        payload_type: String,
        payload: String,
    },
    /// Parse an OUTGOING or INCOMING stack
    Inspect {
        /// Parse as INCOMING instead of OUTGOING
        #[arg(long)]
        incoming: bool,
        hex: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write the default configuration
    Init {
        #[arg(long)]
        local_address: Option<Address>,
    },
    Set { key: String, value: String },
    Get { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Csiro85 { action } => cmd_csiro85(action),
        Commands::Serial { action } => cmd_serial(action),
        Commands::Adv { action } => cmd_adv(action, config_path),
        Commands::Gatt { action } => cmd_gatt(action, config_path),
        Commands::Route { action } => cmd_route(action),
        Commands::Config { action } => cmd_config(action, config_path),
        Commands::Simulate { listen_ms } => cmd_simulate(listen_ms).await,
    }
}

fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(cleaned).with_context(|| format!("Invalid hex: {}", input))
}

fn parse_payload_type(input: &str) -> Result<PayloadType> {
    let kind = match input.to_ascii_lowercase().as_str() {
        "tdf3" => PayloadKind::Tdf3,
        "oti" => PayloadKind::Oti,
        "vti" => PayloadKind::Vti,
        "rpc" => PayloadKind::Rpc,
        "rpc-response" | "rpc_response" => PayloadKind::RpcResponse,
        "incoming" => PayloadKind::Incoming,
        "outgoing" => PayloadKind::Outgoing,
        other => {
            let raw = match other.strip_prefix("0x") {
                Some(hex) => u8::from_str_radix(hex, 16),
                None => other.parse::<u8>(),
            }
            .with_context(|| format!("Unknown payload type: {}", input))?;
            return Ok(PayloadType::from_u8(raw));
        }
    };
    Ok(PayloadType::from_kind(kind))
}

fn parse_interface(input: &str) -> Result<InterfaceKind> {
    Ok(match input.to_ascii_lowercase().as_str() {
        "serial" => InterfaceKind::Serial,
        "ble" | "bluetooth" => InterfaceKind::Bluetooth,
        "gatt" => InterfaceKind::Gatt,
        "lora" => InterfaceKind::Lora,
        "lorawan" => InterfaceKind::LoraWan,
        other => anyhow::bail!("Unknown interface: {}", other),
    })
}

fn parse_hop(input: &str) -> Result<RouteRecord> {
    let mut parts = input.split('/');
    let address = parts
        .next()
        .context("Hop needs an address")?
        .parse::<Address>()
        .with_context(|| format!("Invalid hop address in {}", input))?;
    let interface = parse_interface(parts.next().context("Hop needs an interface")?)?;
    let channel = match parts.next() {
        Some(raw) => raw.parse::<u8>().context("Invalid channel")?,
        None => 0,
    };
    if parts.next().is_some() {
        anyhow::bail!("Too many fields in hop {}", input);
    }
    Ok(RouteRecord::new(address, interface, Channel::new(channel)))
}

fn key_lookup(key: Option<&str>) -> Result<Arc<dyn KeyLookup>> {
    let Some(key) = key else {
        let keys: Arc<dyn KeyLookup> = Arc::new(NoKeys);
        return Ok(keys);
    };
    let bytes: [u8; 16] = parse_hex(key)?
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("Key must be 16 bytes, got {}", b.len()))?;
    let keys: Arc<dyn KeyLookup> = Arc::new(StaticKeys::shared(AesKey::new(bytes)));
    Ok(keys)
}

fn print_message(message: &Message) {
    println!("  Source:      {}", message.source.to_string().bright_cyan());
    println!("  Destination: {}", message.destination.to_string().bright_cyan());
    println!("  Type:        {}", message.payload_type.to_string().bright_yellow());
    println!("  Payload:     {} ({} bytes)", hex::encode(&message.payload), message.payload.len());
}

fn cmd_csiro85(action: Csiro85Action) -> Result<()> {
    match action {
        Csiro85Action::Encode { hex } => {
            let encoded = csiro85::encode(&parse_hex(&hex)?)?;
            println!("{}", String::from_utf8_lossy(&encoded));
        }
        Csiro85Action::Decode { text } => {
            if !csiro85::is_valid(text.as_bytes()) {
                anyhow::bail!("Not valid CSIRO85 text");
            }
            println!("{}", hex::encode(csiro85::decode(text.as_bytes())?));
        }
    }
    Ok(())
}

fn cmd_serial(action: SerialAction) -> Result<()> {
    match action {
        SerialAction::Encode {
            source,
            sequence,
            payload_type,
            payload,
        } => {
            let frame = SerialFrame {
                address: source,
                sequence,
                payload_type: parse_payload_type(&payload_type)?,
                payload: parse_hex(&payload)?,
            };
            println!("{}", hex::encode(frame.to_bytes()?));
        }
        SerialAction::Decode { hex } => {
            let frame = SerialFrame::from_bytes(&parse_hex(&hex)?).context("Not a serial frame")?;
            println!("{}", "Serial frame".bold());
            println!("  Address:  {}", frame.address.to_string().bright_cyan());
            println!("  Sequence: {}", frame.sequence);
            println!("  Type:     {}", frame.payload_type.to_string().bright_yellow());
            println!("  Payload:  {} ({} bytes)", hex::encode(&frame.payload), frame.payload.len());
        }
    }
    Ok(())
}

fn cmd_adv(action: AdvAction, config_path: Option<&std::path::Path>) -> Result<()> {
    let config = config::load(config_path)?;
    let local = config.local_address;
    match action {
        AdvAction::Encode {
            destination,
            payload_type,
            sequence,
            key,
            payload,
        } => {
            let codec = AdvertisingCodec::new(local)
                .with_iv_tail(config.bluetooth.iv_tail)
                .with_keys(key_lookup(key.as_deref())?);
            let message = Message::new(local, destination, parse_payload_type(&payload_type)?, parse_hex(&payload)?);
            for packet in codec.encode(&message, sequence)? {
                println!("{}", hex::encode(packet));
            }
        }
        AdvAction::Decode { sender, key, hex } => {
            let codec = AdvertisingCodec::new(local)
                .with_iv_tail(config.bluetooth.iv_tail)
                .with_keys(key_lookup(key.as_deref())?);
            let packet = codec
                .decode(sender, &parse_hex(&hex)?)
                .context("Not a unified comms advertisement")?;
            println!("{}", "Advertisement".bold());
            println!(
                "  Packet:      {}/{} (sequence {})",
                packet.sequence.index + 1,
                packet.sequence.num_packets,
                packet.sequence.sequence
            );
            println!("  On air:      {}", if packet.encrypted_on_air { "encrypted" } else { "clear" });
            print_message(&packet.into_message());
        }
    }
    Ok(())
}

fn cmd_gatt(action: GattAction, config_path: Option<&std::path::Path>) -> Result<()> {
    let config = config::load(config_path)?;
    let local = config.local_address;
    match action {
        GattAction::Encode {
            destination,
            payload_type,
            key,
            payload,
        } => {
            let codec = GattCodec::new(config.gatt.mtu).with_keys(key_lookup(key.as_deref())?);
            let message = Message::new(local, destination, parse_payload_type(&payload_type)?, parse_hex(&payload)?);
            println!("{}", hex::encode(codec.encode(&message)?));
        }
        GattAction::Decode { peer, key, hex } => {
            let codec = GattCodec::new(config.gatt.mtu).with_keys(key_lookup(key.as_deref())?);
            let (payload_type, payload) = codec
                .decode(peer, &parse_hex(&hex)?)
                .context("Malformed GATT frame")?;
            println!("{}", "GATT frame".bold());
            print_message(&Message::new(peer, local, payload_type, payload));
        }
    }
    Ok(())
}

fn print_incoming_route(label: &str, route: &IncomingRoute) {
    println!(
        "  {} {} via {} ch {} (seq {}, rssi {} dBm, age {} ms)",
        label,
        route.record.hop.to_string().bright_cyan(),
        route.record.interface,
        route.record.channel,
        route.metadata.sequence,
        route.metadata.rssi_dbm(),
        route.metadata.age_ms
    );
}

fn cmd_route(action: RouteAction) -> Result<()> {
    match action {
        RouteAction::Outgoing {
            hops,
            payload_type,
            payload,
        } => {
            let mut route = OutgoingRoute::new(parse_payload_type(&payload_type)?, parse_hex(&payload)?);
            for hop in &hops {
                route = route.via(parse_hop(hop)?);
            }
            println!("{}", hex::encode(route.to_bytes()?));
        }
        RouteAction::Inspect { incoming: false, hex } => {
            let route = OutgoingRoute::from_bytes(&parse_hex(&hex)?)?;
            println!("{} ({} hops)", "OUTGOING route".bold(), route.hops.len());
            for (i, hop) in route.hops.iter().enumerate() {
                println!(
                    "  {}. {} via {} ch {}",
                    i + 1,
                    hop.hop.to_string().bright_cyan(),
                    hop.interface,
                    hop.channel
                );
            }
            println!("  Type:    {}", route.payload_type.to_string().bright_yellow());
            println!("  Payload: {}", hex::encode(&route.payload));
        }
        RouteAction::Inspect { incoming: true, hex } => {
            let path = IncomingPath::from_bytes(&parse_hex(&hex)?)?;
            println!("{} ({} hops)", "INCOMING path".bold(), path.num_hops());
            for relay in &path.relays {
                print_incoming_route("relay", relay);
            }
            print_incoming_route("first", &path.first_hop);
            println!("  Type:    {}", path.payload_type.to_string().bright_yellow());
            println!("  Payload: {}", hex::encode(&path.payload));
        }
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, config_path: Option<&std::path::Path>) -> Result<()> {
    match action {
        ConfigAction::Show { json } => {
            let config = config::load(config_path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
                return Ok(());
            }
            println!("{}", "Configuration".bold());
            println!("  {}", config::config_file(config_path)?.display().to_string().dimmed());
            println!();
            for (key, value) in config::list(&config) {
                println!("  {:<36} {}", key.bright_cyan(), value);
            }
        }
        ConfigAction::Init { local_address } => {
            let mut config = unified_comms_core::CommsConfig::default();
            if let Some(address) = local_address {
                config = config.with_local_address(address);
            }
            let path = config::save(&config, config_path)?;
            println!("{} Wrote {}", "✓".green(), path.display());
        }
        ConfigAction::Set { key, value } => {
            let mut config = config::load(config_path)?;
            config::set(&mut config, &key, &value)?;
            config::save(&config, config_path)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Get { key } => {
            let config = config::load(config_path)?;
            match config::get(&config, &key) {
                Some(value) => println!("{} = {}", key.bright_cyan(), value),
                None => anyhow::bail!("Unknown config key: {}", key),
            }
        }
    }
    Ok(())
}

// ============================================================================
// SIMULATION
// ============================================================================

#[derive(Default)]
struct MemoryRadio {
    outbox: Mutex<Vec<AdvertisingPacket>>,
}

impl AdvertisingDriver for MemoryRadio {
    fn advertise(&self, packet: &AdvertisingPacket) -> Result<(), CommsError> {
        self.outbox.lock().push(packet.clone());
        Ok(())
    }

    fn set_scanning(&self, enabled: bool) -> Result<(), CommsError> {
        println!("  {} gateway scanning {}", "•".bright_green(), if enabled { "on" } else { "off" });
        Ok(())
    }
}

#[derive(Default)]
struct MemoryUart {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl SerialDriver for MemoryUart {
    fn max_frame_len(&self) -> usize {
        256
    }

    fn transmit(&self, frame: &[u8]) -> Result<(), CommsError> {
        self.frames.lock().push(frame.to_vec());
        Ok(())
    }

    fn set_enabled(&self, _enabled: bool) -> Result<(), CommsError> {
        Ok(())
    }
}

async fn cmd_simulate(listen_ms: u64) -> Result<()> {
    println!("{}", "Simulating a gateway and a sensor".bold());

    let gateway_address: Address = "C0:00:00:00:00:01".parse()?;
    let sensor_address: Address = "C0:00:00:00:00:02".parse()?;
    let config = unified_comms_core::CommsConfig::default().with_local_address(gateway_address);

    let gateway = CommsNode::new(config.clone())?;
    let radio = Arc::new(MemoryRadio::default());
    let ble = Arc::new(BluetoothInterface::new(
        radio,
        AdvertisingCodec::new(gateway_address),
        &config.bluetooth,
    ));
    let uart = Arc::new(MemoryUart::default());
    gateway.register(ble.clone())?;
    gateway.register(Arc::new(SerialInterface::new(
        uart.clone(),
        config.serial.max_frame_len,
    )))?;
    let heard: ReceiveHandler = Arc::new(|kind: InterfaceKind, _: &IncomingRoute, message: &Message| {
        println!(
            "  {} heard {} from {} on {}",
            "•".bright_green(),
            message.payload_type,
            message.source,
            kind
        );
    });
    gateway.start(Some(heard));
    gateway.listen(InterfaceKind::Bluetooth, ListenDuration::For(Duration::from_millis(listen_ms)))?;

    let sensor_radio = Arc::new(MemoryRadio::default());
    let sensor = BluetoothInterface::new(
        sensor_radio.clone(),
        AdvertisingCodec::new(sensor_address),
        &config.bluetooth,
    );
    let reading = Message::new(sensor_address, Address::BROADCAST, PayloadKind::Tdf3, vec![0x01, 0x17, 0x2A]);
    sensor.send(Channel::DEFAULT, &reading)?;
    for packet in sensor_radio.outbox.lock().iter() {
        println!("  {} sensor advertised {}", "•".bright_green(), hex::encode(packet.data));
        ble.scan_received(&ScanReport {
            address: sensor_address,
            rssi: -72,
            connectable: packet.connectable,
            data: packet.data.to_vec(),
        });
    }

    for frame in uart.frames.lock().iter() {
        println!("  {} gateway serial {}", "•".bright_green(), hex::encode(frame));
    }

    tokio::time::sleep(Duration::from_millis(listen_ms + 50)).await;
    println!("{} Simulation complete", "✓".green());
    Ok(())
}
