//! PrinterTransport middleware for monitoring CTAPHID traffic
//!
//! Wraps any Transport implementation and prints every frame passing
//! through it to stderr.
//!
//! # Example
//!
//! ```ignore
//! use seedkey_transport::{HidTransport, PrinterTransport, PrinterConfig, PacketFilter};
//!
//! let transport = Arc::new(HidTransport::new(device));
//! let config = PrinterConfig::default().with_filter(PacketFilter::Cmd(0x06));
//! let monitored = PrinterTransport::wrap(transport, config);
//! // INIT frames in both directions are now printed
//! ```

use crate::protocol::{self, cmd, Channel, DecodedFrame};
use crate::{Report, Transport, TransportDeviceInfo, TransportError};
use async_trait::async_trait;
use crossterm::style::Stylize;
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Packet filter for selective display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketFilter {
    #[default]
    All,
    Sent,
    Received,
    /// Only initialization frames carrying this command
    Cmd(u8),
}

impl FromStr for PacketFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" | "" => Ok(Self::All),
            "sent" | "out" | "tx" => Ok(Self::Sent),
            "received" | "in" | "rx" => Ok(Self::Received),
            s if s.starts_with("cmd=") || s.starts_with("0x") => {
                let hex_str = s.strip_prefix("cmd=").unwrap_or(s);
                let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
                u8::from_str_radix(hex_str, 16)
                    .map(|c| Self::Cmd(c & 0x7F))
                    .map_err(|e| format!("Invalid command byte: {}", e))
            }
            _ => Err(format!("Unknown filter: {}", s)),
        }
    }
}

/// Traffic direction of a printed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Sent,
    Received,
}

/// Configuration for the PrinterTransport
#[derive(Debug, Clone, Default)]
pub struct PrinterConfig {
    /// Show raw hex dump alongside decoded output
    pub show_hex: bool,
    /// Filter for selective display
    pub filter: PacketFilter,
}

impl PrinterConfig {
    /// Create config with hex output setting
    pub fn with_hex(mut self, show: bool) -> Self {
        self.show_hex = show;
        self
    }

    /// Create config with filter
    pub fn with_filter(mut self, filter: PacketFilter) -> Self {
        self.filter = filter;
        self
    }

    fn should_show(&self, direction: Direction, report: &Report) -> bool {
        match self.filter {
            PacketFilter::All => true,
            PacketFilter::Sent => direction == Direction::Sent,
            PacketFilter::Received => direction == Direction::Received,
            PacketFilter::Cmd(c) => {
                let frame = protocol::decode(report);
                frame.is_initialization && frame.command == c
            }
        }
    }
}

/// Transport middleware that prints all frames
pub struct PrinterTransport {
    inner: Arc<dyn Transport>,
    config: PrinterConfig,
    /// Task printing inbound reports while the device is open
    receive_printer: Mutex<Option<JoinHandle<()>>>,
    sent: Mutex<Redactor>,
}

impl PrinterTransport {
    /// Wrap a transport with printing middleware
    pub fn wrap(transport: Arc<dyn Transport>, config: PrinterConfig) -> Arc<dyn Transport> {
        Arc::new(Self {
            inner: transport,
            config,
            receive_printer: Mutex::new(None),
            sent: Mutex::new(Redactor::default()),
        })
    }

    fn stop_receive_printer(&self) {
        if let Some(task) = self.receive_printer.lock().take() {
            task.abort();
        }
    }
}

/// Tracks outbound LOADKEY messages so their continuation frames, which
/// carry the rest of the seed, are redacted too
#[derive(Debug, Default)]
struct Redactor {
    loadkey_channel: Option<Channel>,
}

impl Redactor {
    fn is_sensitive(&mut self, frame: &DecodedFrame<'_>) -> bool {
        if frame.is_initialization {
            self.loadkey_channel =
                (frame.command == cmd::LOADKEY).then_some(frame.channel);
            self.loadkey_channel.is_some()
        } else {
            self.loadkey_channel == Some(frame.channel)
        }
    }
}

/// Lines printed for one frame (empty when filtered out)
fn format_frame(
    config: &PrinterConfig,
    direction: Direction,
    report: &Report,
    redact: bool,
) -> Vec<String> {
    if !config.should_show(direction, report) {
        return Vec::new();
    }

    let frame = protocol::decode(report);
    let arrow = match direction {
        Direction::Sent => ">>>".cyan(),
        Direction::Received => "<<<".green(),
    };

    let mut lines = Vec::new();
    if frame.is_initialization {
        let payload = if redact {
            "[redacted]".to_string()
        } else {
            format!("{:02x?}", &frame.payload()[..frame.payload().len().min(16)])
        };
        lines.push(format!(
            "{} {}  cid={} 0x{:02x} {} len={} {}",
            arrow,
            "INIT".bold(),
            frame.channel,
            frame.command,
            cmd::name(frame.command).yellow(),
            frame.declared_length,
            payload
        ));
    } else {
        lines.push(format!(
            "{} {}  cid={} seq={}",
            arrow,
            "CONT".bold(),
            frame.channel,
            frame.command
        ));
    }

    if config.show_hex {
        if redact {
            lines.push(format!(
                "    {}  {:02x?} [payload redacted]",
                "HEX".dim(),
                &report[..frame.header_size()]
            ));
        } else {
            lines.push(format!("    {}  {:02x?}", "HEX".dim(), report));
        }
    }
    lines
}

fn print_frame(config: &PrinterConfig, direction: Direction, report: &Report, redact: bool) {
    for line in format_frame(config, direction, report, redact) {
        eprintln!("{line}");
    }
}

#[async_trait]
impl Transport for PrinterTransport {
    fn device_info(&self) -> &TransportDeviceInfo {
        self.inner.device_info()
    }

    async fn open(&self) -> Result<(), TransportError> {
        self.inner.open().await?;

        // Subscribe before returning so no response to the first request is missed
        let mut reports = self.inner.subscribe_reports()?;
        let config = self.config.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let task = runtime.spawn(async move {
                loop {
                    match reports.recv().await {
                        Ok(report) => {
                            let frame = protocol::decode(&report);
                            let redact =
                                frame.is_initialization && frame.command == cmd::LOADKEY;
                            print_frame(&config, Direction::Received, &report, redact)
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            eprintln!("{}  {} frames not shown", "<<<".green(), n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            if let Some(previous) = self.receive_printer.lock().replace(task) {
                previous.abort();
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    async fn send_report(&self, report: &Report) -> Result<(), TransportError> {
        let redact = self.sent.lock().is_sensitive(&protocol::decode(report));
        print_frame(&self.config, Direction::Sent, report, redact);
        self.inner.send_report(report).await
    }

    fn subscribe_reports(&self) -> Result<broadcast::Receiver<Report>, TransportError> {
        self.inner.subscribe_reports()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.stop_receive_printer();
        self.inner.close().await
    }
}

impl Drop for PrinterTransport {
    fn drop(&mut self) {
        self.stop_receive_printer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_filter_parse() {
        assert_eq!(PacketFilter::from_str("all").unwrap(), PacketFilter::All);
        assert_eq!(PacketFilter::from_str("sent").unwrap(), PacketFilter::Sent);
        assert_eq!(
            PacketFilter::from_str("Received").unwrap(),
            PacketFilter::Received
        );
        assert_eq!(
            PacketFilter::from_str("cmd=0x62").unwrap(),
            PacketFilter::Cmd(0x62)
        );
        // Type bit is ignored so both spellings of INIT match
        assert_eq!(
            PacketFilter::from_str("0x86").unwrap(),
            PacketFilter::Cmd(0x06)
        );
        assert!(PacketFilter::from_str("events").is_err());
        assert!(PacketFilter::from_str("cmd=zz").is_err());
    }

    #[test]
    fn test_cmd_filter_matches_init_frames_only() {
        let config = PrinterConfig::default().with_filter(PacketFilter::Cmd(cmd::LOADKEY));
        let frames = protocol::encode(Channel(7), cmd::LOADKEY, &[0u8; 100]).unwrap();

        assert!(config.should_show(Direction::Sent, &frames[0]));
        assert!(config.should_show(Direction::Received, &frames[0]));
        assert!(!config.should_show(Direction::Sent, &frames[1]));

        let init = protocol::encode(Channel::BROADCAST, cmd::INIT, &[0u8; 8]).unwrap();
        assert!(!config.should_show(Direction::Sent, &init[0]));
    }

    #[test]
    fn test_direction_filters() {
        let frame = protocol::encode(Channel(1), cmd::PING, b"hi").unwrap()[0];

        let sent = PrinterConfig::default().with_filter(PacketFilter::Sent);
        assert!(sent.should_show(Direction::Sent, &frame));
        assert!(!sent.should_show(Direction::Received, &frame));

        let received = PrinterConfig::default().with_filter(PacketFilter::Received);
        assert!(!received.should_show(Direction::Sent, &frame));
        assert!(received.should_show(Direction::Received, &frame));
    }

    #[test]
    fn test_loadkey_frames_are_redacted() {
        let mut payload = vec![1u8];
        payload.extend_from_slice(&[0xAB; 32]);
        payload.extend_from_slice(&[0xAB; 40]);
        let frames = protocol::encode(Channel(7), cmd::LOADKEY, &payload).unwrap();
        assert_eq!(frames.len(), 2);

        let config = PrinterConfig::default().with_hex(true);
        let mut redactor = Redactor::default();
        for frame in &frames {
            let redact = redactor.is_sensitive(&protocol::decode(frame));
            assert!(redact);
            let printed = format_frame(&config, Direction::Sent, frame, redact).join("\n");
            assert!(!printed.contains("ab"), "seed bytes printed: {printed}");
            assert!(printed.contains("redacted"));
        }

        // The next message on the channel is printed in full again
        let ping = protocol::encode(Channel(7), cmd::PING, &[0xAB; 4]).unwrap()[0];
        let redact = redactor.is_sensitive(&protocol::decode(&ping));
        assert!(!redact);
        let printed = format_frame(&config, Direction::Sent, &ping, redact).join("\n");
        assert!(printed.contains("ab, ab, ab, ab"));
    }

    #[test]
    fn test_continuations_of_other_channels_not_redacted() {
        let mut redactor = Redactor::default();
        let loadkey = protocol::encode(Channel(7), cmd::LOADKEY, &[0u8; 100]).unwrap();
        let other = protocol::encode(Channel(9), cmd::MSG, &[0u8; 100]).unwrap();

        assert!(redactor.is_sensitive(&protocol::decode(&loadkey[0])));
        assert!(!redactor.is_sensitive(&protocol::decode(&other[1])));
        assert!(redactor.is_sensitive(&protocol::decode(&loadkey[1])));
    }
}
