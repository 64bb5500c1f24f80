//! Function-code level Modbus client
//!
//! Modbus TCP and RTU share the same application layer (PDU) and differ only
//! in transport encapsulation, so the request logic lives once in
//! [`GenericModbusClient`] over any [`ModbusTransport`].
//!
//! | Function Code | Method |
//! |---------------|--------|
//! | 0x01 | `read_01()` |
//! | 0x02 | `read_02()` |
//! | 0x03 | `read_03()` |
//! | 0x04 | `read_04()` |
//! | 0x05 | `write_05()` |
//! | 0x06 | `write_06()` |
//! | 0x10 | `write_10()` |
//!
//! On top of the single requests, [`ModbusClient::read_chunked`] reads one
//! register block of any length by splitting it along the device's chunk
//! ceiling, and [`ModbusClient::write_registers`] performs one bounded write.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::constants::{MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};
use crate::device_limits::DeviceLimits;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};
use crate::schema::RegisterKind;
use crate::transport::{LinkPolicy, ModbusTransport, TransportStats};

/// Modbus client operations.
///
/// # Protocol Limits
///
/// | Operation | Limit |
/// |-----------|-------|
/// | Read Coils (0x01) | 2000 coils |
/// | Read Discrete Inputs (0x02) | 2000 bits |
/// | Read Holding Registers (0x03) | 125 registers |
/// | Read Input Registers (0x04) | 125 registers |
/// | Write Multiple Registers (0x10) | 123 registers |
pub trait ModbusClient: Send + Sync {
    /// Read coils (function code 0x01).
    fn read_01(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send;

    /// Read discrete inputs (function code 0x02).
    fn read_02(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send;

    /// Read holding registers (function code 0x03).
    fn read_03(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send;

    /// Read input registers (function code 0x04).
    fn read_04(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send;

    /// Write single coil (function code 0x05).
    fn write_05(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: bool,
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Write single register (function code 0x06).
    fn write_06(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: u16,
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Write multiple registers (function code 0x10).
    fn write_10(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Read one register block of any length.
    ///
    /// The block is split into requests of at most the device's ceiling, each
    /// starting where the previous one ended, and the results concatenated.
    /// Coil and discrete-input blocks come back as 0/1 registers. Any failed
    /// chunk fails the whole block; partial data is never returned.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use voltage_gateway::{DeviceLimits, GenericModbusClient, ModbusClient, RegisterKind, TcpTransport};
    /// use voltage_gateway::transport::ModbusTransport;
    /// use std::time::Duration;
    ///
    /// # async fn example() -> voltage_gateway::ModbusResult<()> {
    /// let mut transport = TcpTransport::new("127.0.0.1:502", Duration::from_secs(1));
    /// transport.connect().await?;
    /// let mut client = GenericModbusClient::new(transport);
    ///
    /// // 300 registers at the default ceiling: three requests
    /// let regs = client
    ///     .read_chunked(1, RegisterKind::Holding, 0, 300, &DeviceLimits::new())
    ///     .await?;
    /// assert_eq!(regs.len(), 300);
    /// # Ok(())
    /// # }
    /// ```
    fn read_chunked(
        &mut self,
        slave_id: SlaveId,
        kind: RegisterKind,
        address: u16,
        length: u16,
        limits: &DeviceLimits,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send
    where
        Self: Sized,
    {
        let chunks = match kind {
            RegisterKind::Coil | RegisterKind::DiscreteInput => limits.coil_chunks(address, length),
            RegisterKind::Input | RegisterKind::Holding => limits.register_chunks(address, length),
        };
        let inter_request_delay_ms = limits.inter_request_delay_ms;
        async move {
            let mut result = Vec::with_capacity(length as usize);
            let mut chunks = chunks.peekable();

            while let Some((chunk_address, count)) = chunks.next() {
                debug!(
                    "slave {} {:?} chunk {}+{}",
                    slave_id, kind, chunk_address, count
                );
                match kind {
                    RegisterKind::Holding => {
                        result.extend(self.read_03(slave_id, chunk_address, count).await?)
                    }
                    RegisterKind::Input => {
                        result.extend(self.read_04(slave_id, chunk_address, count).await?)
                    }
                    RegisterKind::Coil => result.extend(
                        self.read_01(slave_id, chunk_address, count)
                            .await?
                            .into_iter()
                            .map(u16::from),
                    ),
                    RegisterKind::DiscreteInput => result.extend(
                        self.read_02(slave_id, chunk_address, count)
                            .await?
                            .into_iter()
                            .map(u16::from),
                    ),
                }

                if inter_request_delay_ms > 0 && chunks.peek().is_some() {
                    tokio::time::sleep(Duration::from_millis(inter_request_delay_ms)).await;
                }
            }

            if result.len() != length as usize {
                return Err(ModbusError::frame(format!(
                    "Block read returned {} registers, expected {}",
                    result.len(),
                    length
                )));
            }
            Ok(result)
        }
    }

    /// One bounded register write, always FC16, single values included.
    /// Lists longer than the device's write ceiling are refused.
    fn write_registers(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
        limits: &DeviceLimits,
    ) -> impl Future<Output = ModbusResult<()>> + Send
    where
        Self: Sized,
    {
        let within_limits = limits.is_write_within_limits(values.len());
        async move {
            if !within_limits {
                return Err(ModbusError::invalid_data(format!(
                    "Write of {} registers exceeds device limit",
                    values.len()
                )));
            }
            if values.is_empty() {
                return Err(ModbusError::invalid_data("Empty register write"));
            }
            self.write_10(slave_id, address, values).await
        }
    }

    fn is_connected(&self) -> bool;

    fn connect(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    fn close(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    fn get_stats(&self) -> TransportStats;
}

/// Client over any transport.
pub struct GenericModbusClient<T: ModbusTransport> {
    transport: T,
}

impl<T: ModbusTransport> GenericModbusClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn link_policy(&self) -> LinkPolicy {
        self.transport.link_policy()
    }

    /// Execute a raw request
    pub async fn execute_request(&mut self, request: ModbusRequest) -> ModbusResult<ModbusResponse> {
        debug!(
            "-> slave {} FC{:02X} addr {} qty {}",
            request.slave_id,
            request.function.to_u8(),
            request.address,
            request.quantity
        );
        let response = self.transport.request(&request).await?;
        debug!(
            "<- slave {} FC{:02X} {}B",
            response.slave_id,
            response.function.to_u8(),
            response.data().len()
        );
        Ok(response)
    }

    async fn read_bits(
        &mut self,
        function: ModbusFunction,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        if quantity == 0 || quantity > MAX_READ_COILS {
            return Err(ModbusError::invalid_data("Invalid quantity"));
        }
        let request = ModbusRequest::new_read(slave_id, function, address, quantity);
        let response = self.execute_request(request).await?;
        let bits = response.parse_bits()?;
        if bits.len() < quantity as usize {
            return Err(ModbusError::frame(format!(
                "Expected {} bits, got {}",
                quantity,
                bits.len()
            )));
        }
        Ok(bits.into_iter().take(quantity as usize).collect())
    }

    async fn read_words(
        &mut self,
        function: ModbusFunction,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        if quantity == 0 || quantity > MAX_READ_REGISTERS {
            return Err(ModbusError::invalid_data("Invalid quantity"));
        }
        let request = ModbusRequest::new_read(slave_id, function, address, quantity);
        let response = self.execute_request(request).await?;
        let registers = response.parse_registers()?;
        if registers.len() != quantity as usize {
            return Err(ModbusError::frame(format!(
                "Expected {} registers, got {}",
                quantity,
                registers.len()
            )));
        }
        Ok(registers)
    }
}

impl<T: ModbusTransport + Send + Sync> ModbusClient for GenericModbusClient<T> {
    async fn read_01(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_bits(ModbusFunction::ReadCoils, slave_id, address, quantity)
            .await
    }

    async fn read_02(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_bits(ModbusFunction::ReadDiscreteInputs, slave_id, address, quantity)
            .await
    }

    async fn read_03(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.read_words(ModbusFunction::ReadHoldingRegisters, slave_id, address, quantity)
            .await
    }

    async fn read_04(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.read_words(ModbusFunction::ReadInputRegisters, slave_id, address, quantity)
            .await
    }

    async fn write_05(&mut self, slave_id: SlaveId, address: u16, value: bool) -> ModbusResult<()> {
        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::WriteSingleCoil,
            address,
            quantity: 1,
            data: vec![u8::from(value)],
        };
        self.execute_request(request).await?;
        Ok(())
    }

    async fn write_06(&mut self, slave_id: SlaveId, address: u16, value: u16) -> ModbusResult<()> {
        let request = ModbusRequest::new_write_registers(slave_id, address, &[value]);
        self.execute_request(request).await?;
        Ok(())
    }

    async fn write_10(&mut self, slave_id: SlaveId, address: u16, values: &[u16]) -> ModbusResult<()> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
            return Err(ModbusError::invalid_data("Invalid quantity"));
        }
        let mut request = ModbusRequest::new_write_registers(slave_id, address, values);
        request.function = ModbusFunction::WriteMultipleRegisters;
        self.execute_request(request).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn connect(&mut self) -> ModbusResult<()> {
        self.transport.connect().await
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.transport.close().await
    }

    fn get_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Records requests and replays queued responses in order.
    struct MockTransport {
        requests: Mutex<Vec<ModbusRequest>>,
        responses: Mutex<VecDeque<ModbusResult<ModbusResponse>>>,
        connected: Mutex<bool>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                responses: Mutex::new(VecDeque::new()),
                connected: Mutex::new(true),
            }
        }

        fn add_response(&self, response: ModbusResult<ModbusResponse>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn get_requests(&self) -> Vec<ModbusRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl ModbusTransport for MockTransport {
        fn connect(&mut self) -> impl Future<Output = ModbusResult<()>> + Send {
            *self.connected.lock().unwrap() = true;
            async { Ok(()) }
        }

        fn request(
            &mut self,
            request: &ModbusRequest,
        ) -> impl Future<Output = ModbusResult<ModbusResponse>> + Send {
            self.requests.lock().unwrap().push(request.clone());
            let response = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ModbusError::connection("No response prepared in mock")));
            async move { response }
        }

        fn is_connected(&self) -> bool {
            *self.connected.lock().unwrap()
        }

        fn close(&mut self) -> impl Future<Output = ModbusResult<()>> + Send {
            *self.connected.lock().unwrap() = false;
            async { Ok(()) }
        }

        fn get_stats(&self) -> TransportStats {
            TransportStats::default()
        }

        fn link_policy(&self) -> LinkPolicy {
            LinkPolicy::KeepAlive
        }

        fn endpoint(&self) -> String {
            "mock".to_string()
        }
    }

    fn create_register_response(slave_id: SlaveId, values: &[u16]) -> ModbusResponse {
        let mut data = Vec::with_capacity(1 + values.len() * 2);
        data.push((values.len() * 2) as u8);
        for &val in values {
            data.extend_from_slice(&val.to_be_bytes());
        }
        ModbusResponse::new_success(slave_id, ModbusFunction::ReadHoldingRegisters, data)
    }

    fn create_coil_response(slave_id: SlaveId, coils: &[bool]) -> ModbusResponse {
        let mut data = vec![coils.len().div_ceil(8) as u8];
        for chunk in coils.chunks(8) {
            let byte = chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &c)| if c { acc | (1 << i) } else { acc });
            data.push(byte);
        }
        ModbusResponse::new_success(slave_id, ModbusFunction::ReadCoils, data)
    }

    #[tokio::test]
    async fn test_read_chunked_splits_at_ceiling() {
        let mock = MockTransport::new();
        let first: Vec<u16> = (0..125).collect();
        let second: Vec<u16> = (125..250).collect();
        let third: Vec<u16> = (250..300).collect();
        mock.add_response(Ok(create_register_response(1, &first)));
        mock.add_response(Ok(create_register_response(1, &second)));
        mock.add_response(Ok(create_register_response(1, &third)));

        let mut client = GenericModbusClient::new(mock);
        let regs = client
            .read_chunked(1, RegisterKind::Holding, 1000, 300, &DeviceLimits::new())
            .await
            .unwrap();
        assert_eq!(regs, (0..300).collect::<Vec<u16>>());

        let requests = client.transport().get_requests();
        let plan: Vec<_> = requests.iter().map(|r| (r.address, r.quantity)).collect();
        assert_eq!(plan, vec![(1000, 125), (1125, 125), (1250, 50)]);
        assert!(requests
            .iter()
            .all(|r| r.function == ModbusFunction::ReadHoldingRegisters));
    }

    #[tokio::test]
    async fn test_read_chunked_uses_fc04_for_input_blocks() {
        let mock = MockTransport::new();
        mock.add_response(Ok(create_register_response(3, &[7, 8])));
        let mut client = GenericModbusClient::new(mock);
        let regs = client
            .read_chunked(3, RegisterKind::Input, 30000, 2, &DeviceLimits::new())
            .await
            .unwrap();
        assert_eq!(regs, vec![7, 8]);
        assert_eq!(
            client.transport().get_requests()[0].function,
            ModbusFunction::ReadInputRegisters
        );
    }

    #[tokio::test]
    async fn test_read_chunked_aborts_on_exception() {
        let mock = MockTransport::new();
        mock.add_response(Ok(create_register_response(1, &[0; 125])));
        mock.add_response(Err(ModbusError::exception(0x03, 0x02)));
        mock.add_response(Ok(create_register_response(1, &[0; 50])));

        let mut client = GenericModbusClient::new(mock);
        let err = client
            .read_chunked(1, RegisterKind::Holding, 0, 300, &DeviceLimits::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Exception { code: 0x02, .. }));
        // third chunk never requested
        assert_eq!(client.transport().get_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_read_chunked_rejects_short_reply() {
        let mock = MockTransport::new();
        mock.add_response(Ok(create_register_response(1, &[1, 2])));
        let mut client = GenericModbusClient::new(mock);
        let result = client
            .read_chunked(1, RegisterKind::Holding, 0, 3, &DeviceLimits::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_read_chunked_coils_expand_to_registers() {
        let mock = MockTransport::new();
        mock.add_response(Ok(create_coil_response(1, &[true, false, true])));
        let mut client = GenericModbusClient::new(mock);
        let regs = client
            .read_chunked(1, RegisterKind::Coil, 0, 3, &DeviceLimits::new())
            .await
            .unwrap();
        assert_eq!(regs, vec![1, 0, 1]);
    }

    #[tokio::test]
    async fn test_read_chunked_custom_ceiling() {
        let mock = MockTransport::new();
        mock.add_response(Ok(create_register_response(1, &[1; 40])));
        mock.add_response(Ok(create_register_response(1, &[2; 20])));
        let limits = DeviceLimits::new().with_max_read_registers(40);
        let mut client = GenericModbusClient::new(mock);
        let regs = client
            .read_chunked(1, RegisterKind::Holding, 0, 60, &limits)
            .await
            .unwrap();
        assert_eq!(regs.len(), 60);
        assert_eq!(client.transport().get_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_write_registers_bounded() {
        let mock = MockTransport::new();
        let echo = ModbusResponse::new_success(1, ModbusFunction::WriteMultipleRegisters, vec![0, 40, 0, 1]);
        mock.add_response(Ok(echo));
        let mut client = GenericModbusClient::new(mock);
        let limits = DeviceLimits::new();

        client.write_registers(1, 40, &[5], &limits).await.unwrap();
        let req = &client.transport().get_requests()[0];
        assert_eq!(req.function, ModbusFunction::WriteMultipleRegisters);
        assert_eq!(req.quantity, 1);
        assert_eq!(req.data, vec![0, 5]);

        let too_many = vec![0u16; 124];
        assert!(client.write_registers(1, 0, &too_many, &limits).await.is_err());
        assert!(client.write_registers(1, 0, &[], &limits).await.is_err());
        assert_eq!(client.transport().get_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_write_10_uses_multiple_registers() {
        let mock = MockTransport::new();
        let echo = ModbusResponse::new_success(1, ModbusFunction::WriteMultipleRegisters, vec![0, 0, 0, 2]);
        mock.add_response(Ok(echo));
        let mut client = GenericModbusClient::new(mock);
        client.write_10(1, 0, &[1, 2]).await.unwrap();
        let req = &client.transport().get_requests()[0];
        assert_eq!(req.function, ModbusFunction::WriteMultipleRegisters);
        assert_eq!(req.data, vec![0, 1, 0, 2]);
    }

    #[tokio::test]
    async fn test_invalid_quantity_never_reaches_transport() {
        let mut client = GenericModbusClient::new(MockTransport::new());
        assert!(client.read_03(1, 0, 126).await.is_err());
        assert!(client.read_01(1, 0, 0).await.is_err());
        assert!(client.transport().get_requests().is_empty());
    }

    #[tokio::test]
    async fn test_close_clears_connection() {
        let mut client = GenericModbusClient::new(MockTransport::new());
        assert!(client.is_connected());
        client.close().await.unwrap();
        assert!(!client.is_connected());
    }
}
