//! # Transport Layer
//!
//! A transport moves one request/response pair over a point-to-point link.
//! It knows nothing about register maps. Two implementations exist:
//!
//! - [`TcpTransport`]: MBAP framing over a socket. The socket is kept open
//!   across acquisition cycles ([`LinkPolicy::KeepAlive`]).
//! - [`RtuTransport`]: slave address + PDU + CRC-16 over a serial line
//!   (requires the `rtu` feature). The port is released after every cycle
//!   ([`LinkPolicy::ReleaseAfterCycle`]) because other devices and the
//!   scanner share the same wire.
//!
//! [`Link`] wraps either one when the choice is made at runtime from the
//! installer configuration.
//!
//! Every request is bounded by the transport's timeout; a timeout is an
//! ordinary error, there is no separate cancellation path.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN};
use crate::device_limits::DeviceLimits;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusRequest, ModbusResponse};

#[cfg(feature = "rtu")]
use crc::{Crc, CRC_16_MODBUS};

#[cfg(feature = "rtu")]
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// How the acquisition cycle treats the link once a poll finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPolicy {
    /// Leave the link open after a successful cycle, close it on error.
    KeepAlive,
    /// Connect at the start of every cycle and always close at the end.
    ReleaseAfterCycle,
}

/// Serial parity as written in installer files and scan results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    #[serde(rename = "N", alias = "None", alias = "none", alias = "n")]
    None,
    #[serde(rename = "E", alias = "Even", alias = "even", alias = "e")]
    Even,
    #[serde(rename = "O", alias = "Odd", alias = "odd", alias = "o")]
    Odd,
}

impl Parity {
    pub fn as_char(&self) -> char {
        match self {
            Self::None => 'N',
            Self::Even => 'E',
            Self::Odd => 'O',
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

impl std::str::FromStr for Parity {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "N" | "NONE" => Ok(Self::None),
            "E" | "EVEN" => Ok(Self::Even),
            "O" | "ODD" => Ok(Self::Odd),
            other => Err(ModbusError::configuration(format!("unknown parity {:?}", other))),
        }
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Point-to-point Modbus link.
///
/// Implementations must be `Send + Sync` so a device and its link can move
/// into a polling task.
pub trait ModbusTransport: Send + Sync {
    /// Open the link. Opening an already open link re-opens it.
    fn connect(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    /// One request/response transaction. Exception replies come back as
    /// [`ModbusError::Exception`].
    fn request(
        &mut self,
        request: &ModbusRequest,
    ) -> impl Future<Output = ModbusResult<ModbusResponse>> + Send;

    fn is_connected(&self) -> bool;

    fn close(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    fn get_stats(&self) -> TransportStats;

    fn link_policy(&self) -> LinkPolicy;

    /// Chunking ceilings used when the installer does not override them.
    fn default_limits(&self) -> DeviceLimits {
        DeviceLimits::default()
    }

    /// Identifier of a shared physical medium. Links reporting the same key
    /// must never be driven concurrently.
    fn shared_bus(&self) -> Option<String> {
        None
    }

    /// Short human readable endpoint, used in logs.
    fn endpoint(&self) -> String;
}

fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn log_packet(direction: &str, data: &[u8], protocol: &str, slave_id: u8) {
    info!(
        "[MODBUS-{}] {} slave:{} {}",
        protocol,
        direction,
        slave_id,
        format_hex_packet(data)
    );
}

// ============================================================================
// TCP
// ============================================================================

/// Modbus TCP transport.
///
/// Construction does not touch the network; [`ModbusTransport::connect`]
/// opens the socket.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    address: String,
    timeout: Duration,
    transaction_id: u16,
    stats: TransportStats,
    packet_logging: bool,
}

impl TcpTransport {
    /// `address` is `host:port`.
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            stream: None,
            address: address.into(),
            timeout,
            transaction_id: 0,
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        if self.transaction_id == 0 {
            self.transaction_id = 1;
        }
        self.transaction_id
    }

    fn encode_frame(&mut self, request: &ModbusRequest) -> ModbusResult<BytesMut> {
        let pdu = request.encode_pdu()?;
        let transaction_id = self.next_transaction_id();
        let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
        frame.put_u16(transaction_id);
        frame.put_u16(0);
        frame.put_u16((pdu.len() + 1) as u16);
        frame.put_u8(request.slave_id);
        frame.extend_from_slice(&pdu);
        Ok(frame)
    }

    fn fail(&mut self, err: ModbusError) -> ModbusError {
        self.stats.errors += 1;
        if matches!(err, ModbusError::Timeout { .. }) {
            self.stats.timeouts += 1;
        }
        if !matches!(err, ModbusError::Exception { .. }) {
            // the stream position is unknown after a failed exchange
            self.stream = None;
        }
        err
    }

    async fn exchange(&mut self, frame: &[u8]) -> ModbusResult<(u16, u8, Vec<u8>)> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("TCP link not open"))?;

        timeout(self.timeout, stream.write_all(frame))
            .await
            .map_err(|_| ModbusError::timeout("send request", timeout_ms))??;

        let mut header = [0u8; MBAP_HEADER_LEN + 1];
        timeout(self.timeout, stream.read_exact(&mut header))
            .await
            .map_err(|_| ModbusError::timeout("read response header", timeout_ms))??;

        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if protocol_id != 0 {
            return Err(ModbusError::frame(format!("Unexpected protocol id {}", protocol_id)));
        }
        if !(2..=MAX_MBAP_LENGTH).contains(&length) {
            return Err(ModbusError::frame(format!("Invalid MBAP length {}", length)));
        }

        let mut pdu = vec![0u8; length - 1];
        timeout(self.timeout, stream.read_exact(&mut pdu))
            .await
            .map_err(|_| ModbusError::timeout("read response data", timeout_ms))??;

        Ok((transaction_id, header[6], pdu))
    }
}

impl ModbusTransport for TcpTransport {
    async fn connect(&mut self) -> ModbusResult<()> {
        self.stream = None;
        let stream = timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                ModbusError::timeout(
                    format!("connect to {}", self.address),
                    self.timeout.as_millis() as u64,
                )
            })?
            .map_err(|e| ModbusError::connection(format!("{}: {}", self.address, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("TCP_NODELAY on {}: {}", self.address, e);
        }
        info!("TCP connected: {}", self.address);
        self.stream = Some(stream);
        Ok(())
    }

    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        let frame = self.encode_frame(request)?;
        let expected_tid = self.transaction_id;
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        if self.packet_logging {
            log_packet("send", &frame, "TCP", request.slave_id);
        }
        debug!("TCP TX: {}B", frame.len());

        let (tid, unit, pdu) = match self.exchange(&frame).await {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail(e)),
        };
        self.stats.responses_received += 1;
        self.stats.bytes_received += (MBAP_HEADER_LEN + 1 + pdu.len()) as u64;
        if self.packet_logging {
            log_packet("receive", &pdu, "TCP", unit);
        }
        debug!("TCP RX: {}B", MBAP_HEADER_LEN + 1 + pdu.len());

        if tid != expected_tid {
            let err = ModbusError::protocol(format!(
                "Transaction id mismatch: expected {}, got {}",
                expected_tid, tid
            ));
            return Err(self.fail(err));
        }
        let response = match ModbusResponse::from_pdu(unit, &pdu) {
            Ok(response) => response,
            Err(e) => return Err(self.fail(e)),
        };
        if let Some(err) = response.get_exception() {
            return Err(self.fail(err));
        }
        Ok(response)
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("TCP closed: {}", self.address);
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }

    fn link_policy(&self) -> LinkPolicy {
        LinkPolicy::KeepAlive
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

// ============================================================================
// RTU
// ============================================================================

/// Serial line settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub port: String,
    pub baud: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

fn default_stop_bits() -> u8 {
    1
}

impl SerialSettings {
    pub fn new(port: impl Into<String>, baud: u32, parity: Parity) -> Self {
        Self {
            port: port.into(),
            baud,
            parity,
            stop_bits: 1,
        }
    }

    /// 3.5 character times at 11 bits per character.
    pub fn frame_gap(&self) -> Duration {
        let char_time_us = 11_000_000 / u64::from(self.baud.max(1));
        Duration::from_micros(char_time_us * 35 / 10)
    }
}

/// Modbus RTU transport over a serial port.
#[cfg(feature = "rtu")]
pub struct RtuTransport {
    port: Option<tokio_serial::SerialStream>,
    settings: SerialSettings,
    timeout: Duration,
    frame_gap: Duration,
    stats: TransportStats,
    packet_logging: bool,
}

#[cfg(feature = "rtu")]
impl RtuTransport {
    /// Construction does not open the port.
    pub fn new(settings: SerialSettings, timeout: Duration) -> Self {
        let frame_gap = settings.frame_gap();
        Self {
            port: None,
            settings,
            timeout,
            frame_gap,
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    fn encode_frame(request: &ModbusRequest) -> ModbusResult<Vec<u8>> {
        let pdu = request.encode_pdu()?;
        let mut frame = Vec::with_capacity(pdu.len() + 3);
        frame.push(request.slave_id);
        frame.extend_from_slice(&pdu);
        let crc = CRC_MODBUS.checksum(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }

    /// Bytes still to read once slave id and function code are known.
    fn remaining_len(function_code: u8, third_byte: u8) -> usize {
        if function_code & 0x80 != 0 {
            // exception code already read, CRC left
            return 2;
        }
        match function_code {
            0x01..=0x04 => third_byte as usize + 2,
            // echo: address(2) + value/quantity(2) + CRC(2), third byte consumed
            _ => 5,
        }
    }

    async fn read_frame(port: &mut tokio_serial::SerialStream) -> ModbusResult<Vec<u8>> {
        let mut head = [0u8; 3];
        port.read_exact(&mut head).await?;
        let rest = Self::remaining_len(head[1], head[2]);
        let mut frame = Vec::with_capacity(3 + rest);
        frame.extend_from_slice(&head);
        frame.resize(3 + rest, 0);
        port.read_exact(&mut frame[3..]).await?;
        Ok(frame)
    }

    fn decode_frame(frame: &[u8]) -> ModbusResult<ModbusResponse> {
        if frame.len() < crate::constants::MIN_RTU_FRAME_SIZE {
            return Err(ModbusError::frame("RTU frame too short"));
        }
        let body = frame.len() - 2;
        let received = u16::from_le_bytes([frame[body], frame[body + 1]]);
        let calculated = CRC_MODBUS.checksum(&frame[..body]);
        if received != calculated {
            return Err(ModbusError::frame(format!(
                "CRC mismatch: expected 0x{:04X}, got 0x{:04X}",
                calculated, received
            )));
        }
        ModbusResponse::from_pdu(frame[0], &frame[1..body])
    }

    fn fail(&mut self, err: ModbusError) -> ModbusError {
        self.stats.errors += 1;
        if matches!(err, ModbusError::Timeout { .. }) {
            self.stats.timeouts += 1;
        }
        err
    }
}

#[cfg(feature = "rtu")]
impl ModbusTransport for RtuTransport {
    async fn connect(&mut self) -> ModbusResult<()> {
        use tokio_serial::SerialPortBuilderExt;

        self.port = None;
        let stop_bits = if self.settings.stop_bits == 2 {
            tokio_serial::StopBits::Two
        } else {
            tokio_serial::StopBits::One
        };
        let parity = match self.settings.parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        };
        let port = tokio_serial::new(&self.settings.port, self.settings.baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(|e| ModbusError::connection(format!("{}: {}", self.settings.port, e)))?;
        debug!(
            "RTU opened: {} {}{}{}",
            self.settings.port, self.settings.baud, self.settings.parity, self.settings.stop_bits
        );
        self.port = Some(port);
        Ok(())
    }

    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        use tokio_serial::SerialPort;

        let frame = Self::encode_frame(request)?;
        let timeout_ms = self.timeout.as_millis() as u64;
        tokio::time::sleep(self.frame_gap).await;

        let port = match self.port.as_mut() {
            Some(port) => port,
            None => return Err(self.fail(ModbusError::connection("Serial port not open"))),
        };
        // drop stale bytes from a previous timed-out exchange
        let _ = port.clear(tokio_serial::ClearBuffer::Input);

        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        if self.packet_logging {
            log_packet("send", &frame, "RTU", request.slave_id);
        }

        let exchange = async {
            port.write_all(&frame).await?;
            port.flush().await?;
            Self::read_frame(port).await
        };
        let reply = match timeout(self.timeout, exchange).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => return Err(self.fail(e)),
            Err(_) => {
                let err = ModbusError::timeout(
                    format!("slave {} FC{:02X}", request.slave_id, request.function.to_u8()),
                    timeout_ms,
                );
                return Err(self.fail(err));
            }
        };

        self.stats.responses_received += 1;
        self.stats.bytes_received += reply.len() as u64;
        if self.packet_logging {
            log_packet("receive", &reply, "RTU", request.slave_id);
        }

        let response = match Self::decode_frame(&reply) {
            Ok(response) => response,
            Err(e) => return Err(self.fail(e)),
        };
        if response.slave_id != request.slave_id {
            let err = ModbusError::protocol(format!(
                "Response slave ID mismatch: expected {}, got {}",
                request.slave_id, response.slave_id
            ));
            return Err(self.fail(err));
        }
        if let Some(err) = response.get_exception() {
            return Err(self.fail(err));
        }
        Ok(response)
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if self.port.take().is_some() {
            debug!("RTU released: {}", self.settings.port);
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }

    fn link_policy(&self) -> LinkPolicy {
        LinkPolicy::ReleaseAfterCycle
    }

    fn shared_bus(&self) -> Option<String> {
        Some(self.settings.port.clone())
    }

    fn endpoint(&self) -> String {
        format!(
            "rtu://{}@{}{}{}",
            self.settings.port, self.settings.baud, self.settings.parity, self.settings.stop_bits
        )
    }
}

// ============================================================================
// Runtime selection
// ============================================================================

/// A transport chosen from configuration at runtime.
pub enum Link {
    Tcp(TcpTransport),
    #[cfg(feature = "rtu")]
    Rtu(RtuTransport),
}

impl ModbusTransport for Link {
    async fn connect(&mut self) -> ModbusResult<()> {
        match self {
            Self::Tcp(t) => t.connect().await,
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.connect().await,
        }
    }

    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        match self {
            Self::Tcp(t) => t.request(request).await,
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.request(request).await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Self::Tcp(t) => t.is_connected(),
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.is_connected(),
        }
    }

    async fn close(&mut self) -> ModbusResult<()> {
        match self {
            Self::Tcp(t) => t.close().await,
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.close().await,
        }
    }

    fn get_stats(&self) -> TransportStats {
        match self {
            Self::Tcp(t) => t.get_stats(),
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.get_stats(),
        }
    }

    fn link_policy(&self) -> LinkPolicy {
        match self {
            Self::Tcp(t) => t.link_policy(),
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.link_policy(),
        }
    }

    fn shared_bus(&self) -> Option<String> {
        match self {
            Self::Tcp(t) => t.shared_bus(),
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.shared_bus(),
        }
    }

    fn endpoint(&self) -> String {
        match self {
            Self::Tcp(t) => t.endpoint(),
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.endpoint(),
        }
    }
}
