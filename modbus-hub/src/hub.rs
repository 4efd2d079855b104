use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info};

use crate::client::ClientHub;
use crate::codec::Word;
use crate::config::{ConnectionKind, HubConfig};
use crate::error::{HubError, Result};
use crate::registers::{Address, Quantity, UnitId};
use crate::server::ServerHub;

/// Kind of a generic hub call, with its count or payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallType {
    Coil(Quantity),
    Discrete(Quantity),
    Holding(Quantity),
    Input(Quantity),
    WriteCoil(bool),
    WriteCoils(Vec<bool>),
    WriteRegister(Word),
    WriteRegisters(Vec<Word>),
}

/// One request against a hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub unit: UnitId,
    pub address: Address,
    pub call: CallType,
}

impl Transaction {
    pub fn new(unit: UnitId, address: Address, call: CallType) -> Self {
        Self { unit, address, call }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallResponse {
    Bits(Vec<bool>),
    Registers(Vec<Word>),
    Written,
}

impl CallResponse {
    pub fn bits(&self) -> Option<&[bool]> {
        match self {
            CallResponse::Bits(bits) => Some(bits),
            _ => None,
        }
    }

    pub fn registers(&self) -> Option<&[Word]> {
        match self {
            CallResponse::Registers(registers) => Some(registers),
            _ => None,
        }
    }
}

/// A configured endpoint: a client link or a virtual slave.
#[derive(Debug)]
pub enum ModbusHub {
    Client(ClientHub),
    Server(ServerHub),
}

macro_rules! delegate {
    ($self:ident, $method:ident($($arg:expr),*)) => {
        match $self {
            ModbusHub::Client(hub) => hub.$method($($arg),*).await,
            ModbusHub::Server(hub) => hub.$method($($arg),*),
        }
    };
}

impl ModbusHub {
    pub fn new(config: HubConfig) -> Self {
        match config.kind {
            ConnectionKind::TcpServer(_) => ModbusHub::Server(ServerHub::new(config)),
            ConnectionKind::Serial(_)
            | ConnectionKind::Tcp(_)
            | ConnectionKind::Udp(_)
            | ConnectionKind::RtuOverTcp(_) => ModbusHub::Client(ClientHub::new(config)),
        }
    }

    pub fn name(&self) -> &str {
        self.config().name.as_str()
    }

    pub fn config(&self) -> &HubConfig {
        match self {
            ModbusHub::Client(hub) => hub.config(),
            ModbusHub::Server(hub) => hub.config(),
        }
    }

    pub fn as_server(&self) -> Option<&ServerHub> {
        match self {
            ModbusHub::Server(hub) => Some(hub),
            ModbusHub::Client(_) => None,
        }
    }

    pub fn as_client(&self) -> Option<&ClientHub> {
        match self {
            ModbusHub::Client(hub) => Some(hub),
            ModbusHub::Server(_) => None,
        }
    }

    /// Connect a client hub. Server hubs only validate here, they listen on
    /// [`ServerHub::start`].
    pub async fn setup(&self) -> Result<()> {
        match self {
            ModbusHub::Client(hub) => hub.setup().await,
            ModbusHub::Server(hub) => hub.config().validate(),
        }
    }

    pub async fn close(&self) {
        match self {
            ModbusHub::Client(hub) => hub.close().await,
            ModbusHub::Server(hub) => hub.close().await,
        }
    }

    pub async fn read_coils(
        &self,
        unit: UnitId,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<bool>> {
        delegate!(self, read_coils(unit, addr, cnt))
    }

    pub async fn read_discrete_inputs(
        &self,
        unit: UnitId,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<bool>> {
        delegate!(self, read_discrete_inputs(unit, addr, cnt))
    }

    pub async fn read_input_registers(
        &self,
        unit: UnitId,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>> {
        delegate!(self, read_input_registers(unit, addr, cnt))
    }

    pub async fn read_holding_registers(
        &self,
        unit: UnitId,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>> {
        delegate!(self, read_holding_registers(unit, addr, cnt))
    }

    pub async fn write_coil(&self, unit: UnitId, addr: Address, value: bool) -> Result<()> {
        delegate!(self, write_coil(unit, addr, value))
    }

    pub async fn write_coils(&self, unit: UnitId, addr: Address, values: &[bool]) -> Result<()> {
        delegate!(self, write_coils(unit, addr, values))
    }

    pub async fn write_register(&self, unit: UnitId, addr: Address, value: Word) -> Result<()> {
        delegate!(self, write_register(unit, addr, value))
    }

    pub async fn write_registers(
        &self,
        unit: UnitId,
        addr: Address,
        values: &[Word],
    ) -> Result<()> {
        delegate!(self, write_registers(unit, addr, values))
    }

    /// Dispatch `transaction` to the matching read or write.
    pub async fn call(&self, transaction: Transaction) -> Result<CallResponse> {
        let Transaction { unit, address, call } = transaction;
        let response = match call {
            CallType::Coil(cnt) => CallResponse::Bits(self.read_coils(unit, address, cnt).await?),
            CallType::Discrete(cnt) => {
                CallResponse::Bits(self.read_discrete_inputs(unit, address, cnt).await?)
            }
            CallType::Holding(cnt) => {
                CallResponse::Registers(self.read_holding_registers(unit, address, cnt).await?)
            }
            CallType::Input(cnt) => {
                CallResponse::Registers(self.read_input_registers(unit, address, cnt).await?)
            }
            CallType::WriteCoil(value) => {
                self.write_coil(unit, address, value).await?;
                CallResponse::Written
            }
            CallType::WriteCoils(values) => {
                self.write_coils(unit, address, &values).await?;
                CallResponse::Written
            }
            CallType::WriteRegister(value) => {
                self.write_register(unit, address, value).await?;
                CallResponse::Written
            }
            CallType::WriteRegisters(values) => {
                self.write_registers(unit, address, &values).await?;
                CallResponse::Written
            }
        };
        Ok(response)
    }
}

/// Hubs by name, owned by whoever sets the integration up.
#[derive(Debug, Default)]
pub struct HubRegistry {
    hubs: HashMap<String, Arc<ModbusHub>>,
}

impl HubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and set up a hub per config.
    ///
    /// A client that fails to connect is kept so its reads report it as not
    /// connected; invalid or duplicate configs abort.
    pub async fn setup(configs: Vec<HubConfig>) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            config.validate()?;
            let hub = registry.insert(ModbusHub::new(config))?;
            if let Err(err) = hub.setup().await {
                if matches!(err, HubError::Config(_)) {
                    return Err(err);
                }
                error!(hub = %hub.name(), %err, "hub setup failed");
            }
        }
        info!(hubs = registry.len(), "modbus hubs ready");
        Ok(registry)
    }

    pub fn insert(&mut self, hub: ModbusHub) -> Result<Arc<ModbusHub>> {
        let name = hub.name().to_owned();
        if self.hubs.contains_key(&name) {
            return Err(HubError::config(format!("duplicate hub name {name}")));
        }
        let hub = Arc::new(hub);
        self.hubs.insert(name, Arc::clone(&hub));
        Ok(hub)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModbusHub>> {
        self.hubs.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.hubs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.hubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.is_empty()
    }

    /// Start every virtual slave, once all entities are registered.
    pub async fn start_servers(&self) -> Result<()> {
        for server in self.hubs.values().filter_map(|hub| hub.as_server()) {
            server.start().await?;
        }
        Ok(())
    }

    pub async fn close_all(&self) {
        for hub in self.hubs.values() {
            hub.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn client_hub() -> ModbusHub {
        let (mock, _recorder) = MockTransport::new();
        ModbusHub::Client(ClientHub::with_transport(
            HubConfig::tcp("plc", "127.0.0.1", 502),
            Box::new(mock),
        ))
    }

    #[test]
    fn factory_picks_hub_by_kind() {
        assert!(ModbusHub::new(HubConfig::tcp_server("slave", "0.0.0.0", 502))
            .as_server()
            .is_some());
        let hub = ModbusHub::new(HubConfig::tcp("plc", "10.0.0.2", 502));
        assert!(hub.as_client().is_some());
        assert_eq!(hub.name(), "plc");
    }

    #[tokio::test]
    async fn call_dispatches_by_type() {
        let hub = client_hub();
        let response = hub
            .call(Transaction::new(1, 40, CallType::Holding(2)))
            .await
            .unwrap();
        assert_eq!(response.registers(), Some(&[40, 41][..]));
        assert_eq!(response.bits(), None);

        let response = hub.call(Transaction::new(1, 0, CallType::Discrete(2))).await.unwrap();
        assert_eq!(response, CallResponse::Bits(vec![false, false]));

        let response = hub
            .call(Transaction::new(1, 0, CallType::WriteRegisters(vec![1, 2])))
            .await
            .unwrap();
        assert_eq!(response, CallResponse::Written);
    }

    #[tokio::test]
    async fn server_reads_report_not_connected_through_hub() {
        let hub = ModbusHub::new(HubConfig::tcp_server("slave", "127.0.0.1", 0));
        hub.setup().await.unwrap();
        let err = hub.call(Transaction::new(1, 0, CallType::Coil(1))).await.unwrap_err();
        assert!(err.is_not_connected());
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = HubRegistry::new();
        registry.insert(client_hub()).unwrap();
        assert!(matches!(registry.insert(client_hub()), Err(HubError::Config(_))));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["plc"]);
        assert!(registry.get("plc").is_some());
        assert!(registry.get("other").is_none());
    }

    #[tokio::test]
    async fn registry_keeps_unreachable_clients() {
        let configs = vec![
            HubConfig::tcp("dead", "127.0.0.1", 1).with_timeout(1),
            HubConfig::tcp_server("slave", "127.0.0.1", 0),
        ];
        let registry = HubRegistry::setup(configs).await.unwrap();
        assert_eq!(registry.len(), 2);

        let dead = registry.get("dead").unwrap();
        assert!(dead.read_coils(1, 0, 1).await.unwrap_err().is_not_connected());

        registry.start_servers().await.unwrap();
        let slave = registry.get("slave").unwrap();
        assert!(slave.as_server().unwrap().is_serving());

        registry.close_all().await;
        assert!(!slave.as_server().unwrap().is_serving());
    }
}
