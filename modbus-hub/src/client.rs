use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::codec::Word;
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::registers::{Address, Quantity, UnitId};
use crate::transport::{self, Transport};

#[derive(Debug, Default)]
struct Link {
    transport: Option<Box<dyn Transport>>,
    ready_at: Option<Instant>,
}

impl Link {
    fn ready(&mut self, hub: &str) -> Result<&mut Box<dyn Transport>> {
        if self.ready_at.is_some_and(|ready_at| Instant::now() < ready_at) {
            debug!(hub, "startup delay not elapsed");
            return Err(HubError::not_connected(hub));
        }
        self.transport.as_mut().ok_or_else(|| HubError::not_connected(hub))
    }
}

/// Unit 0 is never sent explicitly, some devices reject it.
fn unit_arg(unit: UnitId) -> Option<UnitId> {
    (unit != 0).then_some(unit)
}

/// Run one transport call under the link lock, bounded by the hub timeout and
/// followed by the configured message wait.
macro_rules! transact {
    ($hub:ident, $method:ident, $unit:expr, $addr:expr, $arg:expr) => {{
        let mut link = $hub.link.lock().await;
        let transport = link.ready(&$hub.config.name)?;
        debug!(
            hub = %$hub.config.name,
            unit = $unit,
            address = $addr,
            op = stringify!($method),
            "transaction"
        );
        let timeout = $hub.config.timeout();
        let call = transport.$method(unit_arg($unit), $addr, $arg);
        let result = match time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(HubError::Timeout {
                hub: $hub.config.name.clone(),
                timeout,
            }),
        };
        let wait = $hub.config.message_wait();
        if !wait.is_zero() {
            time::sleep(wait).await;
        }
        result
    }};
}

/// Hub talking to one physical or network endpoint, one transaction at a time.
#[derive(Debug)]
pub struct ClientHub {
    config: HubConfig,
    link: Mutex<Link>,
}

impl ClientHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            link: Mutex::new(Link::default()),
        }
    }

    /// Hub over an already open transport; the startup delay starts now.
    pub fn with_transport(config: HubConfig, transport: Box<dyn Transport>) -> Self {
        let ready_at = Instant::now() + config.delay();
        Self {
            config,
            link: Mutex::new(Link {
                transport: Some(transport),
                ready_at: Some(ready_at),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.transport.is_some()
    }

    /// Open the link. Transactions fail with `NotConnected` until `delay` has passed.
    pub async fn setup(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        if link.transport.is_some() {
            return Ok(());
        }
        let timeout = self.config.timeout();
        let transport = match time::timeout(timeout, transport::connect(&self.config)).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(err)) => {
                error!(
                    hub = %self.config.name,
                    endpoint = %self.config.endpoint(),
                    %err,
                    "connect failed"
                );
                return Err(err);
            }
            Err(_) => {
                error!(
                    hub = %self.config.name,
                    endpoint = %self.config.endpoint(),
                    "connect timed out"
                );
                return Err(HubError::Timeout {
                    hub: self.config.name.clone(),
                    timeout,
                });
            }
        };
        link.transport = Some(transport);
        link.ready_at = Some(Instant::now() + self.config.delay());
        if self.config.delay > 0 {
            info!(
                hub = %self.config.name,
                delay = self.config.delay,
                "waiting before first transaction"
            );
        }
        Ok(())
    }

    /// Release the transport. Calling it again is a no-op.
    pub async fn close(&self) {
        let mut link = self.link.lock().await;
        if let Some(mut transport) = link.transport.take() {
            if let Err(err) = transport.disconnect().await {
                warn!(hub = %self.config.name, %err, "error while closing link");
            }
            info!(hub = %self.config.name, "modbus link closed");
        }
        link.ready_at = None;
    }

    pub async fn read_coils(
        &self,
        unit: UnitId,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<bool>> {
        transact!(self, read_coils, unit, addr, cnt)
    }

    pub async fn read_discrete_inputs(
        &self,
        unit: UnitId,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<bool>> {
        transact!(self, read_discrete_inputs, unit, addr, cnt)
    }

    pub async fn read_input_registers(
        &self,
        unit: UnitId,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>> {
        transact!(self, read_input_registers, unit, addr, cnt)
    }

    pub async fn read_holding_registers(
        &self,
        unit: UnitId,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>> {
        transact!(self, read_holding_registers, unit, addr, cnt)
    }

    pub async fn write_coil(&self, unit: UnitId, addr: Address, value: bool) -> Result<()> {
        transact!(self, write_single_coil, unit, addr, value)
    }

    pub async fn write_coils(&self, unit: UnitId, addr: Address, values: &[bool]) -> Result<()> {
        transact!(self, write_multiple_coils, unit, addr, values)
    }

    pub async fn write_register(&self, unit: UnitId, addr: Address, value: Word) -> Result<()> {
        transact!(self, write_single_register, unit, addr, value)
    }

    pub async fn write_registers(
        &self,
        unit: UnitId,
        addr: Address,
        values: &[Word],
    ) -> Result<()> {
        transact!(self, write_multiple_registers, unit, addr, values)
    }
}
