//! Physical links to Modbus devices.
//!
//! Every link speaks the same PDU-level [`Transport`] interface, whatever the
//! framing underneath. A transport is not safe for concurrent use; the owning
//! hub serialises access to it.
use std::fmt::Debug;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_modbus::client::{rtu, tcp, Client, Context, Reader, Writer};
use tokio_modbus::slave::{Slave, SlaveContext};
use tracing::info;

use crate::codec::Word;
use crate::config::{ConnectionKind, HubConfig, NetParams, Parity, SerialMethod, SerialParams};
use crate::error::{HubError, Result};
use crate::registers::{Address, Quantity, UnitId};

mod udp;

pub use udp::UdpTransport;

/// Unit addressed by serial links when the caller does not name one.
pub const DEFAULT_SERIAL_UNIT: UnitId = 1;

#[async_trait]
/// PDU operations of a Modbus master. `unit == None` leaves the link's default unit in place.
pub trait Transport: Send + Debug {
    async fn read_coils(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<bool>>;

    async fn read_discrete_inputs(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<bool>>;

    async fn read_input_registers(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>>;

    async fn read_holding_registers(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>>;

    async fn write_single_coil(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        value: bool,
    ) -> Result<()>;

    async fn write_multiple_coils(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        values: &[bool],
    ) -> Result<()>;

    async fn write_single_register(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        value: Word,
    ) -> Result<()>;

    async fn write_multiple_registers(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        values: &[Word],
    ) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;
}

/// [`Transport`] over a tokio-modbus client context (TCP, RTU on serial or TCP).
#[derive(Debug)]
pub struct ContextTransport {
    ctx: Context,
    default_slave: Slave,
}

impl ContextTransport {
    pub fn new(ctx: Context, default_slave: Slave) -> Self {
        Self { ctx, default_slave }
    }

    fn select(&mut self, unit: Option<UnitId>) {
        let slave = unit.map(Slave).unwrap_or(self.default_slave);
        self.ctx.set_slave(slave);
    }
}

#[async_trait]
impl Transport for ContextTransport {
    async fn read_coils(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<bool>> {
        self.select(unit);
        Ok(self.ctx.read_coils(addr, cnt).await??)
    }

    async fn read_discrete_inputs(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<bool>> {
        self.select(unit);
        Ok(self.ctx.read_discrete_inputs(addr, cnt).await??)
    }

    async fn read_input_registers(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>> {
        self.select(unit);
        Ok(self.ctx.read_input_registers(addr, cnt).await??)
    }

    async fn read_holding_registers(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>> {
        self.select(unit);
        Ok(self.ctx.read_holding_registers(addr, cnt).await??)
    }

    async fn write_single_coil(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        value: bool,
    ) -> Result<()> {
        self.select(unit);
        Ok(self.ctx.write_single_coil(addr, value).await??)
    }

    async fn write_multiple_coils(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        values: &[bool],
    ) -> Result<()> {
        self.select(unit);
        Ok(self.ctx.write_multiple_coils(addr, values).await??)
    }

    async fn write_single_register(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        value: Word,
    ) -> Result<()> {
        self.select(unit);
        Ok(self.ctx.write_single_register(addr, value).await??)
    }

    async fn write_multiple_registers(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        values: &[Word],
    ) -> Result<()> {
        self.select(unit);
        Ok(self.ctx.write_multiple_registers(addr, values).await??)
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(self.ctx.disconnect().await?)
    }
}

pub(crate) async fn resolve(net: &NetParams) -> Result<SocketAddr> {
    tokio::net::lookup_host((net.host.as_str(), net.port))
        .await?
        .next()
        .ok_or_else(|| HubError::config(format!("cannot resolve {}:{}", net.host, net.port)))
}

fn data_bits(bytesize: u8) -> tokio_serial::DataBits {
    match bytesize {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

fn parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::None => tokio_serial::Parity::None,
    }
}

fn stop_bits(stopbits: u8) -> tokio_serial::StopBits {
    match stopbits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}

fn open_serial(serial: &SerialParams, config: &HubConfig) -> Result<tokio_serial::SerialStream> {
    if serial.method == SerialMethod::Ascii {
        return Err(HubError::config(format!(
            "{}: ASCII framing is not supported",
            config.name
        )));
    }
    let builder = tokio_serial::new(&serial.port, serial.baudrate)
        .data_bits(data_bits(serial.bytesize))
        .parity(parity(serial.parity))
        .stop_bits(stop_bits(serial.stopbits))
        .timeout(config.timeout());

    tokio_serial::SerialStream::open(&builder).map_err(|e| HubError::Io(e.into()))
}

/// Open the link described by `config`, choosing the framing from its connection kind.
pub async fn connect(config: &HubConfig) -> Result<Box<dyn Transport>> {
    config.validate()?;
    let transport: Box<dyn Transport> = match &config.kind {
        ConnectionKind::Serial(serial) => {
            let port = open_serial(serial, config)?;
            let ctx = rtu::attach_slave(port, Slave(DEFAULT_SERIAL_UNIT));
            Box::new(ContextTransport::new(ctx, Slave(DEFAULT_SERIAL_UNIT)))
        }
        ConnectionKind::Tcp(net) => {
            let ctx = tcp::connect_slave(resolve(net).await?, Slave::tcp_device()).await?;
            Box::new(ContextTransport::new(ctx, Slave::tcp_device()))
        }
        ConnectionKind::RtuOverTcp(net) => {
            let stream = TcpStream::connect(resolve(net).await?).await?;
            let ctx = rtu::attach_slave(stream, Slave(DEFAULT_SERIAL_UNIT));
            Box::new(ContextTransport::new(ctx, Slave(DEFAULT_SERIAL_UNIT)))
        }
        ConnectionKind::Udp(net) => Box::new(UdpTransport::connect(resolve(net).await?).await?),
        ConnectionKind::TcpServer(_) => {
            return Err(HubError::config(format!(
                "{}: tcp-server is not a client link",
                config.name
            )))
        }
    };
    info!(hub = %config.name, endpoint = %config.endpoint(), "modbus link open");

    Ok(transport)
}
