//! In-memory Modbus bus for tests, demos and dry runs
//!
//! A [`SimulatedBus`] holds the register images of any number of slaves.
//! [`SimulatedTransport`] links opened on it behave like TCP sockets or
//! like serial lines: a serial link only gets answers when its baud rate and
//! parity match the bus line settings, and only from slaves that exist.
//! Everything else times out, as it would on a real wire.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::constants::EXCEPTION_ILLEGAL_DATA_ADDRESS;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};
use crate::scanner::LinkOpener;
use crate::transport::{LinkPolicy, ModbusTransport, Parity, TransportStats};

/// Register image of one slave.
#[derive(Debug, Clone, Default)]
pub struct SlaveImage {
    holding_registers: HashMap<u16, u16>,
    input_registers: HashMap<u16, u16>,
    coils: HashMap<u16, bool>,
    discrete_inputs: HashMap<u16, bool>,
    /// Unmapped addresses answer with an exception instead of zero.
    strict: bool,
}

impl SlaveImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn with_holding(mut self, address: u16, values: &[u16]) -> Self {
        self.set_holding(address, values);
        self
    }

    pub fn with_input(mut self, address: u16, values: &[u16]) -> Self {
        for (i, v) in values.iter().enumerate() {
            self.input_registers.insert(address.wrapping_add(i as u16), *v);
        }
        self
    }

    pub fn with_coils(mut self, address: u16, values: &[bool]) -> Self {
        for (i, v) in values.iter().enumerate() {
            self.coils.insert(address.wrapping_add(i as u16), *v);
        }
        self
    }

    pub fn with_discrete_inputs(mut self, address: u16, values: &[bool]) -> Self {
        for (i, v) in values.iter().enumerate() {
            self.discrete_inputs.insert(address.wrapping_add(i as u16), *v);
        }
        self
    }

    pub fn set_holding(&mut self, address: u16, values: &[u16]) {
        for (i, v) in values.iter().enumerate() {
            self.holding_registers.insert(address.wrapping_add(i as u16), *v);
        }
    }

    pub fn holding(&self, address: u16) -> Option<u16> {
        self.holding_registers.get(&address).copied()
    }

    fn read_words(table: &HashMap<u16, u16>, strict: bool, address: u16, quantity: u16) -> Option<Vec<u16>> {
        (0..quantity)
            .map(|i| {
                let a = address.wrapping_add(i);
                match table.get(&a) {
                    Some(v) => Some(*v),
                    None if strict => None,
                    None => Some(0),
                }
            })
            .collect()
    }

    fn read_flags(table: &HashMap<u16, bool>, strict: bool, address: u16, quantity: u16) -> Option<Vec<bool>> {
        (0..quantity)
            .map(|i| {
                let a = address.wrapping_add(i);
                match table.get(&a) {
                    Some(v) => Some(*v),
                    None if strict => None,
                    None => Some(false),
                }
            })
            .collect()
    }
}

/// One request as seen by the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub baud: u32,
    pub parity: Parity,
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub address: u16,
    pub quantity: u16,
}

#[derive(Debug, Default)]
struct BusState {
    line: Option<(u32, Parity)>,
    slaves: HashMap<SlaveId, SlaveImage>,
    faulty: HashSet<(SlaveId, u16)>,
    offline: bool,
    requests: Vec<RequestRecord>,
    writes: Vec<(SlaveId, u16, Vec<u16>)>,
    open_links: usize,
}

/// Shared bus; cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    name: String,
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::default(),
        }
    }

    /// Only answer serial links configured with these settings.
    pub fn with_line(self, baud: u32, parity: Parity) -> Self {
        self.lock().line = Some((baud, parity));
        self
    }

    pub fn with_slave(self, slave_id: SlaveId, image: SlaveImage) -> Self {
        self.lock().slaves.insert(slave_id, image);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reads touching this address answer with an exception.
    pub fn inject_exception(&self, slave_id: SlaveId, address: u16) {
        self.lock().faulty.insert((slave_id, address));
    }

    pub fn clear_exceptions(&self) {
        self.lock().faulty.clear();
    }

    /// Stop answering altogether.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn update_slave(&self, slave_id: SlaveId, update: impl FnOnce(&mut SlaveImage)) {
        update(self.lock().slaves.entry(slave_id).or_default());
    }

    pub fn holding(&self, slave_id: SlaveId, address: u16) -> Option<u16> {
        self.lock().slaves.get(&slave_id).and_then(|s| s.holding(address))
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.lock().requests.clone()
    }

    /// `(slave, address, values)` of every accepted write, in order.
    pub fn writes(&self) -> Vec<(SlaveId, u16, Vec<u16>)> {
        self.lock().writes.clone()
    }

    pub fn clear_log(&self) {
        let mut state = self.lock();
        state.requests.clear();
        state.writes.clear();
    }

    /// Links currently holding the bus open.
    pub fn open_links(&self) -> usize {
        self.lock().open_links
    }

    /// A socket-like link that stays open across cycles.
    pub fn tcp_link(&self) -> SimulatedTransport {
        SimulatedTransport::new(self.clone(), None, LinkPolicy::KeepAlive)
    }

    /// A serial-like link with the given line settings.
    pub fn rtu_link(&self, baud: u32, parity: Parity) -> SimulatedTransport {
        SimulatedTransport::new(self.clone(), Some((baud, parity)), LinkPolicy::ReleaseAfterCycle)
    }

    fn handle(&self, line: Option<(u32, Parity)>, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let (baud, parity) = line.unwrap_or((0, Parity::None));
        state.requests.push(RequestRecord {
            baud,
            parity,
            slave_id: request.slave_id,
            function: request.function,
            address: request.address,
            quantity: request.quantity,
        });

        let silent = || ModbusError::timeout(format!("slave {}", request.slave_id), 0);
        if state.offline {
            return Err(silent());
        }
        if let (Some(link), Some(bus)) = (line, state.line) {
            if link != bus {
                return Err(silent());
            }
        }
        let faulty = (0..request.quantity.max(1))
            .any(|i| state.faulty.contains(&(request.slave_id, request.address.wrapping_add(i))));
        let slave_id = request.slave_id;
        let Some(slave) = state.slaves.get_mut(&slave_id) else {
            return Err(silent());
        };

        let fc = request.function;
        let exception = || {
            Ok(ModbusResponse::new_exception(
                slave_id,
                fc,
                EXCEPTION_ILLEGAL_DATA_ADDRESS,
            ))
        };
        if faulty {
            return exception();
        }

        let response = match fc {
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                let table = if fc == ModbusFunction::ReadHoldingRegisters {
                    &slave.holding_registers
                } else {
                    &slave.input_registers
                };
                match SlaveImage::read_words(table, slave.strict, request.address, request.quantity) {
                    Some(values) => {
                        let mut data = vec![(values.len() * 2) as u8];
                        for v in values {
                            data.extend_from_slice(&v.to_be_bytes());
                        }
                        ModbusResponse::new_success(slave_id, fc, data)
                    }
                    None => return exception(),
                }
            }
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
                let table = if fc == ModbusFunction::ReadCoils {
                    &slave.coils
                } else {
                    &slave.discrete_inputs
                };
                match SlaveImage::read_flags(table, slave.strict, request.address, request.quantity) {
                    Some(flags) => {
                        let mut data = vec![flags.len().div_ceil(8) as u8];
                        for chunk in flags.chunks(8) {
                            data.push(
                                chunk
                                    .iter()
                                    .enumerate()
                                    .fold(0u8, |acc, (i, &b)| acc | (u8::from(b) << i)),
                            );
                        }
                        ModbusResponse::new_success(slave_id, fc, data)
                    }
                    None => return exception(),
                }
            }
            ModbusFunction::WriteSingleRegister | ModbusFunction::WriteMultipleRegisters => {
                let values: Vec<u16> = request
                    .data
                    .chunks_exact(2)
                    .map(|p| u16::from_be_bytes([p[0], p[1]]))
                    .collect();
                slave.set_holding(request.address, &values);
                state.writes.push((slave_id, request.address, values));
                let mut echo = request.address.to_be_bytes().to_vec();
                echo.extend_from_slice(&request.quantity.to_be_bytes());
                ModbusResponse::new_success(slave_id, fc, echo)
            }
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteMultipleCoils => {
                let on = request.data.first().copied().unwrap_or(0) != 0;
                slave.coils.insert(request.address, on);
                state.writes.push((slave_id, request.address, vec![u16::from(on)]));
                ModbusResponse::new_success(slave_id, fc, request.address.to_be_bytes().to_vec())
            }
        };
        Ok(response)
    }
}

/// A link opened on a [`SimulatedBus`].
#[derive(Debug)]
pub struct SimulatedTransport {
    bus: SimulatedBus,
    line: Option<(u32, Parity)>,
    policy: LinkPolicy,
    connected: bool,
    stats: TransportStats,
}

impl SimulatedTransport {
    fn new(bus: SimulatedBus, line: Option<(u32, Parity)>, policy: LinkPolicy) -> Self {
        Self {
            bus,
            line,
            policy,
            connected: false,
            stats: TransportStats::default(),
        }
    }

    pub fn bus(&self) -> &SimulatedBus {
        &self.bus
    }

    fn set_connected(&mut self, connected: bool) {
        if self.connected != connected {
            let mut state = self.bus.lock();
            if connected {
                state.open_links += 1;
            } else {
                state.open_links = state.open_links.saturating_sub(1);
            }
        }
        self.connected = connected;
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        self.set_connected(false);
    }
}

impl ModbusTransport for SimulatedTransport {
    async fn connect(&mut self) -> ModbusResult<()> {
        if self.bus.lock().offline && self.policy == LinkPolicy::KeepAlive {
            return Err(ModbusError::connection(format!("{} unreachable", self.bus.name)));
        }
        self.set_connected(true);
        Ok(())
    }

    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        if !self.connected {
            self.stats.errors += 1;
            return Err(ModbusError::connection("link not open"));
        }
        self.stats.requests_sent += 1;
        let result = self.bus.handle(self.line, request).and_then(|response| {
            match response.get_exception() {
                Some(err) => Err(err),
                None => Ok(response),
            }
        });
        match &result {
            Ok(_) => self.stats.responses_received += 1,
            Err(e) => {
                debug!("{}: {}", self.bus.name, e);
                self.stats.errors += 1;
                if matches!(e, ModbusError::Timeout { .. }) {
                    self.stats.timeouts += 1;
                } else {
                    self.stats.responses_received += 1;
                }
            }
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.set_connected(false);
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }

    fn link_policy(&self) -> LinkPolicy {
        self.policy
    }

    fn shared_bus(&self) -> Option<String> {
        self.line.map(|_| self.bus.name.clone())
    }

    fn endpoint(&self) -> String {
        match self.line {
            Some((baud, parity)) => format!("sim://{}@{}{}", self.bus.name, baud, parity),
            None => format!("sim://{}", self.bus.name),
        }
    }
}

impl LinkOpener for SimulatedBus {
    type Link = SimulatedTransport;

    /// Ports other than the bus name lead to an empty bus.
    fn open(&self, port: &str, baud: u32, parity: Parity, _timeout: Duration) -> SimulatedTransport {
        if port == self.name {
            self.rtu_link(baud, parity)
        } else {
            SimulatedBus::new(port).rtu_link(baud, parity)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{GenericModbusClient, ModbusClient};

    #[tokio::test]
    async fn test_reads_and_writes() {
        let bus = SimulatedBus::new("bus").with_slave(1, SlaveImage::new().with_holding(10, &[1, 2, 3]));
        let mut client = GenericModbusClient::new(bus.tcp_link());
        client.connect().await.unwrap();
        assert_eq!(client.read_03(1, 10, 3).await.unwrap(), vec![1, 2, 3]);
        // lenient slave reads unmapped registers as zero
        assert_eq!(client.read_04(1, 0, 2).await.unwrap(), vec![0, 0]);

        client.write_06(1, 11, 99).await.unwrap();
        assert_eq!(bus.holding(1, 11), Some(99));
        assert_eq!(bus.writes(), vec![(1, 11, vec![99])]);
    }

    #[tokio::test]
    async fn test_line_settings_must_match() {
        let bus = SimulatedBus::new("/dev/ttySIM0")
            .with_line(9600, Parity::Even)
            .with_slave(7, SlaveImage::new());
        let mut wrong = GenericModbusClient::new(bus.rtu_link(9600, Parity::None));
        wrong.connect().await.unwrap();
        assert!(matches!(
            wrong.read_03(7, 0, 1).await,
            Err(ModbusError::Timeout { .. })
        ));

        let mut right = GenericModbusClient::new(bus.rtu_link(9600, Parity::Even));
        right.connect().await.unwrap();
        assert!(right.read_03(7, 0, 1).await.is_ok());
        assert!(right.read_03(8, 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_strict_slave_and_injected_exception() {
        let bus = SimulatedBus::new("bus").with_slave(2, SlaveImage::new().strict().with_input(0, &[5]));
        let mut client = GenericModbusClient::new(bus.tcp_link());
        client.connect().await.unwrap();
        assert!(matches!(
            client.read_04(2, 0, 2).await,
            Err(ModbusError::Exception { code: 0x02, .. })
        ));
        assert_eq!(client.read_04(2, 0, 1).await.unwrap(), vec![5]);

        bus.inject_exception(2, 0);
        assert!(client.read_04(2, 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_open_link_accounting() {
        let bus = SimulatedBus::new("bus");
        let mut link = bus.rtu_link(9600, Parity::None);
        link.connect().await.unwrap();
        assert_eq!(bus.open_links(), 1);
        link.close().await.unwrap();
        assert_eq!(bus.open_links(), 0);
        link.connect().await.unwrap();
        drop(link);
        assert_eq!(bus.open_links(), 0);
    }
}
