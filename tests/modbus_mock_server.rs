//! Modbus-TCP polling against an in-process MBAP server.
#![cfg(feature = "modbus")]

use async_trait::async_trait;
use field_gateway::config::PollingConfig;
use field_gateway::discovery::{NetworkProbe, TcpProbe};
use field_gateway::domain::{Connection, DeviceConfig};
use field_gateway::modbus::ModbusTcpClient;
use field_gateway::polling::{ContinuousPollingTester, PollingState, RegisterReader, TcpTarget};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const MBAP_HEADER_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
}

/// Holding-register server for one or more unit IDs.
struct MockModbusServer {
    holding_registers: RwLock<HashMap<u16, u16>>,
    requests: AtomicUsize,
}

impl MockModbusServer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            holding_registers: RwLock::new(HashMap::new()),
            requests: AtomicUsize::new(0),
        })
    }

    async fn set_holding_registers(&self, start: u16, values: &[u16]) {
        let mut registers = self.holding_registers.write().await;
        for (offset, value) in values.iter().enumerate() {
            registers.insert(start + offset as u16, *value);
        }
    }

    fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Bind an ephemeral localhost port and serve until the test ends.
    async fn start(self: Arc<Self>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let server = Arc::clone(&self);
                tokio::spawn(async move {
                    let _ = server.handle_connection(stream).await;
                });
            }
        });
        addr
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        loop {
            let mut header = [0u8; MBAP_HEADER_LEN];
            if stream.read_exact(&mut header).await.is_err() {
                return Ok(());
            }
            let length = u16::from_be_bytes([header[4], header[5]]) as usize;
            // length counts the unit ID already read
            let mut pdu = vec![0u8; length.saturating_sub(1)];
            stream.read_exact(&mut pdu).await?;
            self.requests.fetch_add(1, Ordering::SeqCst);

            let response_pdu = self.process_pdu(&pdu).await;
            let mut response = Vec::with_capacity(MBAP_HEADER_LEN + response_pdu.len());
            response.extend_from_slice(&header[0..4]);
            response.extend_from_slice(&((response_pdu.len() + 1) as u16).to_be_bytes());
            response.push(header[6]);
            response.extend_from_slice(&response_pdu);
            stream.write_all(&response).await?;
        }
    }

    async fn process_pdu(&self, pdu: &[u8]) -> Vec<u8> {
        let Some((&function_code, data)) = pdu.split_first() else {
            return exception(0, ExceptionCode::IllegalFunction);
        };
        if function_code != 0x03 {
            return exception(function_code, ExceptionCode::IllegalFunction);
        }
        if data.len() < 4 {
            return exception(function_code, ExceptionCode::IllegalDataValue);
        }

        let start = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        if quantity == 0 || quantity > 125 {
            return exception(function_code, ExceptionCode::IllegalDataValue);
        }

        let registers = self.holding_registers.read().await;
        let mut response = vec![function_code, (quantity * 2) as u8];
        for address in start..start.saturating_add(quantity) {
            match registers.get(&address) {
                Some(value) => response.extend_from_slice(&value.to_be_bytes()),
                None => return exception(function_code, ExceptionCode::IllegalDataAddress),
            }
        }
        response
    }
}

fn exception(function_code: u8, code: ExceptionCode) -> Vec<u8> {
    vec![function_code | 0x80, code as u8]
}

fn device_at(addr: SocketAddr, register_count: u16) -> DeviceConfig {
    let mut config = DeviceConfig::tcp(addr.ip(), 1);
    config.connection = Connection::Tcp {
        host: addr.ip(),
        port: addr.port(),
    };
    config.register_count = register_count;
    config
}

fn target(config: &DeviceConfig) -> TcpTarget {
    let probe: Arc<dyn NetworkProbe> = Arc::new(TcpProbe::new(Duration::from_millis(500)));
    TcpTarget::from_config("network_test", config, probe, Duration::from_secs(1)).unwrap()
}

fn quick_polling() -> PollingConfig {
    PollingConfig {
        window_secs: 1,
        interval_secs: 1,
        readings_samples: 3,
        sample_interval_ms: 10,
        ..PollingConfig::default()
    }
}

/// Probe that answers from a fixed verdict.
struct FixedProbe(bool);

#[async_trait]
impl NetworkProbe for FixedProbe {
    async fn probe(&self, _addr: SocketAddr) -> bool {
        self.0
    }
}

#[tokio::test]
async fn test_client_reads_holding_registers() {
    let server = MockModbusServer::new();
    server.set_holding_registers(0, &[230, 5000, 12]).await;
    let addr = Arc::clone(&server).start().await;

    let client = ModbusTcpClient::connect(addr, 1).await.unwrap();
    assert_eq!(client.read_holding_registers(0, 3).await.unwrap(), vec![230, 5000, 12]);
    assert_eq!(client.read_holding_registers(1, 1).await.unwrap(), vec![5000]);
    client.health_check().await.unwrap();
    assert_eq!(server.request_count(), 3);
}

#[tokio::test]
async fn test_exception_reply_is_an_error() {
    let server = MockModbusServer::new();
    server.set_holding_registers(0, &[1]).await;
    let addr = Arc::clone(&server).start().await;

    let client = ModbusTcpClient::connect(addr, 1).await.unwrap().with_attempts(2);
    assert!(client.read_holding_registers(40, 2).await.is_err());
    assert_eq!(server.request_count(), 2);
}

#[tokio::test]
async fn test_tcp_target_reuses_one_session() {
    let server = MockModbusServer::new();
    server.set_holding_registers(0, &[7, 8, 9, 10]).await;
    let addr = Arc::clone(&server).start().await;

    let config = device_at(addr, 4);
    let target = target(&config);
    assert!(target.is_available().await);
    assert_eq!(target.read_registers(0, 4).await.unwrap(), vec![7, 8, 9, 10]);
    assert_eq!(target.read_registers(2, 2).await.unwrap(), vec![9, 10]);
}

#[tokio::test]
async fn test_staged_test_passes_over_tcp() {
    let server = MockModbusServer::new();
    server.set_holding_registers(0, &(0..10).collect::<Vec<u16>>()).await;
    let addr = Arc::clone(&server).start().await;

    let config = device_at(addr, 10);
    let tester = ContinuousPollingTester::new(quick_polling(), CancellationToken::new());
    let result = tester.run_test(&config, &target(&config)).await;

    assert!(result.success, "{:?}", result.error_message);
    assert!(result.port_available);
    assert!(result.protocol_responds);
    assert!(result.data_parses);
    assert_eq!(result.readings_collected, 3);
    assert_eq!(result.polling_state, PollingState::Passed);
    assert_eq!(tester.state("network_test"), PollingState::Passed);
}

#[tokio::test]
async fn test_unmapped_registers_fail_protocol_stage() {
    let server = MockModbusServer::new();
    server.set_holding_registers(0, &[1, 2]).await;
    let addr = Arc::clone(&server).start().await;

    let config = device_at(addr, 10);
    let tester = ContinuousPollingTester::new(quick_polling(), CancellationToken::new());
    let result = tester.run_test(&config, &target(&config)).await;

    assert!(!result.success);
    assert!(result.port_available);
    assert!(!result.protocol_responds);
    assert!(result
        .error_message
        .unwrap()
        .starts_with("Modbus communication failed"));
}

#[tokio::test]
async fn test_unreachable_host_fails_first_stage() {
    let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let config = device_at(addr, 10);
    let probe: Arc<dyn NetworkProbe> = Arc::new(FixedProbe(false));
    let target = TcpTarget::from_config("network_gone", &config, probe, Duration::from_millis(200)).unwrap();

    let tester = ContinuousPollingTester::new(quick_polling(), CancellationToken::new());
    let result = tester.run_test(&config, &target).await;
    assert!(!result.port_available);
    assert_eq!(
        result.error_message.as_deref(),
        Some("Port not available: 127.0.0.1:1")
    );
}
