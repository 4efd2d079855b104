use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    task::{Context, Poll},
};

use futures::future;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_modbus::server::tcp::Server;
use tokio_modbus::prelude::{ExceptionCode, Request, Response, SlaveRequest};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, error, info, warn};

use crate::codec::{DataType, StateValue, Word};
use crate::config::{ConnectionKind, HubConfig};
use crate::error::{HubError, Result};
use crate::registers::{build_server_blocks, Address, AddressSpace, Quantity, RegisterEntry, UnitId};
use crate::transport;

const MAX_READ_REGISTERS: Quantity = 125;
const MAX_READ_BITS: Quantity = 2000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_words(space: &AddressSpace, unit: UnitId, addr: Address, cnt: Quantity) -> Vec<Word> {
    space
        .get(&unit)
        .map(|registers| registers.read(addr, cnt))
        .unwrap_or_else(|| vec![0; cnt.into()])
}

fn read_bits(space: &AddressSpace, unit: UnitId, addr: Address, cnt: Quantity) -> Vec<bool> {
    read_words(space, unit, addr, cnt).into_iter().map(|word| word != 0).collect()
}

fn check_range(
    addr: Address,
    cnt: Quantity,
    max: Quantity,
) -> std::result::Result<(), ExceptionCode> {
    if cnt == 0 || cnt > max {
        return Err(ExceptionCode::IllegalDataValue);
    }
    if u32::from(addr) + u32::from(cnt) > 0x1_0000 {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(())
}

/// Answer one request from a master against the serving address space.
fn respond(
    space: &mut AddressSpace,
    unit: UnitId,
    request: Request<'_>,
) -> std::result::Result<Response, ExceptionCode> {
    match request {
        Request::ReadCoils(addr, cnt) => {
            check_range(addr, cnt, MAX_READ_BITS)?;
            Ok(Response::ReadCoils(read_bits(space, unit, addr, cnt)))
        }
        Request::ReadDiscreteInputs(addr, cnt) => {
            check_range(addr, cnt, MAX_READ_BITS)?;
            Ok(Response::ReadDiscreteInputs(read_bits(space, unit, addr, cnt)))
        }
        Request::ReadInputRegisters(addr, cnt) => {
            check_range(addr, cnt, MAX_READ_REGISTERS)?;
            Ok(Response::ReadInputRegisters(read_words(space, unit, addr, cnt)))
        }
        Request::ReadHoldingRegisters(addr, cnt) => {
            check_range(addr, cnt, MAX_READ_REGISTERS)?;
            Ok(Response::ReadHoldingRegisters(read_words(space, unit, addr, cnt)))
        }
        Request::WriteSingleCoil(addr, value) => {
            space.entry(unit).or_default().write_bits(addr, &[value]);
            Ok(Response::WriteSingleCoil(addr, value))
        }
        Request::WriteMultipleCoils(addr, values) => {
            space.entry(unit).or_default().write_bits(addr, &values);
            Ok(Response::WriteMultipleCoils(addr, values.len() as Quantity))
        }
        Request::WriteSingleRegister(addr, value) => {
            space.entry(unit).or_default().write(addr, &[value]);
            Ok(Response::WriteSingleRegister(addr, value))
        }
        Request::WriteMultipleRegisters(addr, values) => {
            space.entry(unit).or_default().write(addr, &values);
            Ok(Response::WriteMultipleRegisters(addr, values.len() as Quantity))
        }
        Request::MaskWriteRegister(addr, and_mask, or_mask) => {
            let registers = space.entry(unit).or_default();
            let current = registers.get(addr).unwrap_or_default();
            registers.write(addr, &[(current & and_mask) | (or_mask & !and_mask)]);
            Ok(Response::MaskWriteRegister(addr, and_mask, or_mask))
        }
        _ => Err(ExceptionCode::IllegalFunction),
    }
}

#[derive(Debug, Default)]
struct Shared {
    block: Mutex<Option<AddressSpace>>,
    clients: AtomicUsize,
}

impl Shared {
    fn block(&self) -> MutexGuard<'_, Option<AddressSpace>> {
        lock(&self.block)
    }
}

/// Service handed to one connected master. Counts as an attached client
/// until dropped.
struct SlaveService {
    hub: String,
    peer: SocketAddr,
    shared: Arc<Shared>,
}

impl SlaveService {
    fn attach(hub: &str, peer: SocketAddr, shared: Arc<Shared>) -> Self {
        let clients = shared.clients.fetch_add(1, Ordering::SeqCst) + 1;
        info!(hub, %peer, clients, "master connected");
        Self {
            hub: hub.to_owned(),
            peer,
            shared,
        }
    }
}

impl Drop for SlaveService {
    fn drop(&mut self) {
        let clients = self.shared.clients.fetch_sub(1, Ordering::SeqCst) - 1;
        info!(hub = %self.hub, peer = %self.peer, clients, "master disconnected");
    }
}

impl tokio_modbus::server::Service for SlaveService {
    type Request = SlaveRequest<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<std::result::Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let SlaveRequest { slave, request } = req;
        debug!(hub = %self.hub, unit = slave, ?request, "request");
        let mut block = self.shared.block();
        let result = match block.as_mut() {
            Some(space) => respond(space, slave, request),
            None => Err(ExceptionCode::ServerDeviceFailure),
        };
        if let Err(code) = &result {
            warn!(hub = %self.hub, peer = %self.peer, unit = slave, ?code, "exception response");
        }
        future::ready(result)
    }
}

/// Connection stream that reads as end-of-file once the hub shuts down, so
/// the connection task ends and the socket is released.
struct ClosableStream<S> {
    inner: S,
    shutdown: CancellationToken,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<S> ClosableStream<S> {
    fn new(inner: S, shutdown: CancellationToken) -> Self {
        let closed = Box::pin(shutdown.clone().cancelled_owned());
        Self {
            inner,
            shutdown,
            closed,
        }
    }

    fn poll_closed(&mut self, cx: &mut Context<'_>) -> bool {
        self.shutdown.is_cancelled() || self.closed.as_mut().poll(cx).is_ready()
    }
}

impl<S: fmt::Debug> fmt::Debug for ClosableStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosableStream")
            .field("inner", &self.inner)
            .field("closed", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ClosableStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ClosableStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

async fn run_tcp_server(
    hub: String,
    listener: TcpListener,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    let server = Server::new(listener);
    let on_connected = |stream: TcpStream, socket_addr: SocketAddr| {
        let service = SlaveService::attach(&hub, socket_addr, Arc::clone(&shared));
        let stream = ClosableStream::new(stream, shutdown.clone());
        async move { Ok::<_, io::Error>(Some((service, stream))) }
    };
    let on_process_error = {
        let hub = hub.clone();
        move |err: io::Error| warn!(hub = %hub, %err, "connection error")
    };

    tokio::select! {
        result = server.serve(&on_connected, on_process_error) => match result {
            Ok(_) => info!(hub = %hub, "listener stopped"),
            Err(err) => error!(hub = %hub, %err, "listener failed"),
        },
        _ = shutdown.cancelled() => debug!(hub = %hub, "listener shut down"),
    }
}

#[derive(Debug)]
struct Listener {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    Serving(Listener),
    Closed,
}

/// Virtual slave answering Modbus TCP masters from registered entity states.
///
/// Entities are registered first; [`ServerHub::start`] then folds them into the
/// serving address space once. Later registrations are only served after
/// [`ServerHub::rebuild`].
#[derive(Debug)]
pub struct ServerHub {
    config: HubConfig,
    entries: Mutex<Vec<RegisterEntry>>,
    shared: Arc<Shared>,
    state: tokio::sync::Mutex<State>,
}

impl ServerHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(Vec::new()),
            shared: Arc::new(Shared::default()),
            state: tokio::sync::Mutex::new(State::Idle),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Record the register contribution of one entity. Without `data_type` the
    /// state is a boolean, optionally packed into `bit_mask`.
    ///
    /// Registering the same entity at the same place again replaces its entry.
    #[allow(clippy::too_many_arguments)]
    pub fn register_entity(
        &self,
        name: &str,
        unit: UnitId,
        register: Address,
        last_state: &StateValue,
        data_type: Option<DataType>,
        data_count: Option<Quantity>,
        bit_mask: Option<u64>,
    ) -> Result<()> {
        let entry = match data_type {
            None => RegisterEntry::boolean(name, unit, register, last_state, bit_mask),
            Some(data_type) => {
                let count = match data_count {
                    Some(count) => count,
                    None if data_type.is_numeric() => 1,
                    None => {
                        return Err(HubError::config(format!(
                            "{name}: a string entity needs a register count"
                        )))
                    }
                };
                RegisterEntry::new(name, unit, register, last_state, data_type, count)?
            }
        };
        debug!(
            hub = %self.config.name,
            entity = name,
            unit,
            address = register,
            words = entry.registers.len(),
            "entity registered"
        );

        let mut entries = lock(&self.entries);
        match entries
            .iter_mut()
            .find(|e| e.name == entry.name && e.unit == entry.unit && e.address == entry.address)
        {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        Ok(())
    }

    pub fn entries(&self) -> Vec<RegisterEntry> {
        lock(&self.entries).clone()
    }

    /// Build the address space and start listening. Returns the bound address;
    /// calling it again while serving is a no-op.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut state = self.state.lock().await;
        match &*state {
            State::Serving(listener) => return Ok(listener.local_addr),
            State::Closed => return Err(HubError::not_connected(&self.config.name)),
            State::Idle => {}
        }
        let ConnectionKind::TcpServer(net) = &self.config.kind else {
            return Err(HubError::config(format!("{}: not a tcp-server hub", self.config.name)));
        };

        let listener = TcpListener::bind(transport::resolve(net).await?).await?;
        let local_addr = listener.local_addr()?;
        let space = build_server_blocks(&self.entries());
        let units = space.len();
        *self.shared.block() = Some(space);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_tcp_server(
            self.config.name.clone(),
            listener,
            Arc::clone(&self.shared),
            shutdown.clone(),
        ));
        info!(hub = %self.config.name, %local_addr, units, "virtual slave listening");

        *state = State::Serving(Listener {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// Replace the serving address space with one built from the entries
    /// registered now. Values written by masters are lost.
    pub fn rebuild(&self) -> Result<()> {
        let space = build_server_blocks(&self.entries());
        let mut block = self.shared.block();
        if block.is_none() {
            return Err(HubError::not_connected(&self.config.name));
        }
        *block = Some(space);
        info!(hub = %self.config.name, "address space rebuilt");
        Ok(())
    }

    pub fn is_serving(&self) -> bool {
        self.shared.block().is_some()
    }

    /// Number of masters currently attached.
    pub fn connected_clients(&self) -> usize {
        self.shared.clients.load(Ordering::SeqCst)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock().await {
            State::Serving(listener) => Some(listener.local_addr),
            _ => None,
        }
    }

    /// Stop listening and drop every master connection. Calling it again is a no-op.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let State::Serving(listener) = std::mem::replace(&mut *state, State::Closed) {
            listener.shutdown.cancel();
            if let Err(err) = listener.task.await {
                warn!(hub = %self.config.name, %err, "listener task failed");
            }
            *self.shared.block() = None;
            info!(hub = %self.config.name, "virtual slave closed");
        }
    }

    fn with_block<T>(&self, op: impl FnOnce(&mut AddressSpace) -> T) -> Result<T> {
        let mut block = self.shared.block();
        let Some(space) = block.as_mut() else {
            debug!(hub = %self.config.name, "address space not built");
            return Err(HubError::not_connected(&self.config.name));
        };
        if self.connected_clients() == 0 {
            debug!(hub = %self.config.name, "no master connected");
            return Err(HubError::not_connected(&self.config.name));
        }
        Ok(op(space))
    }

    pub fn read_coils(&self, unit: UnitId, addr: Address, cnt: Quantity) -> Result<Vec<bool>> {
        self.with_block(|space| read_bits(space, unit, addr, cnt))
    }

    pub fn read_discrete_inputs(
        &self,
        unit: UnitId,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<bool>> {
        self.with_block(|space| read_bits(space, unit, addr, cnt))
    }

    pub fn read_input_registers(
        &self,
        unit: UnitId,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>> {
        self.with_block(|space| read_words(space, unit, addr, cnt))
    }

    pub fn read_holding_registers(
        &self,
        unit: UnitId,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>> {
        self.with_block(|space| read_words(space, unit, addr, cnt))
    }

    pub fn write_coil(&self, unit: UnitId, addr: Address, value: bool) -> Result<()> {
        self.with_block(|space| space.entry(unit).or_default().write_bits(addr, &[value]))
    }

    pub fn write_coils(&self, unit: UnitId, addr: Address, values: &[bool]) -> Result<()> {
        self.with_block(|space| space.entry(unit).or_default().write_bits(addr, values))
    }

    pub fn write_register(&self, unit: UnitId, addr: Address, value: Word) -> Result<()> {
        self.with_block(|space| space.entry(unit).or_default().write(addr, &[value]))
    }

    pub fn write_registers(&self, unit: UnitId, addr: Address, values: &[Word]) -> Result<()> {
        self.with_block(|space| space.entry(unit).or_default().write(addr, values))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_modbus::client::{tcp, Reader, Writer};
    use tokio_modbus::slave::Slave;

    use super::*;
    use crate::registers::Registers;

    fn hub() -> ServerHub {
        ServerHub::new(HubConfig::tcp_server("slave", "127.0.0.1", 0))
    }

    async fn wait_for_clients(hub: &ServerHub, expected: usize) {
        for _ in 0..200 {
            if hub.connected_clients() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {expected} clients, got {}", hub.connected_clients());
    }

    fn space() -> AddressSpace {
        let mut space = AddressSpace::new();
        space.insert(1, Registers::from_iter([(10, 1), (11, 0), (20, 0x0102)]));
        space
    }

    #[test]
    fn respond_reads_shared_block() {
        let mut space = space();
        assert_eq!(
            respond(&mut space, 1, Request::ReadHoldingRegisters(19, 3)).unwrap(),
            Response::ReadHoldingRegisters(vec![0, 0x0102, 0])
        );
        assert_eq!(
            respond(&mut space, 1, Request::ReadCoils(10, 2)).unwrap(),
            Response::ReadCoils(vec![true, false])
        );
        assert_eq!(
            respond(&mut space, 7, Request::ReadInputRegisters(10, 2)).unwrap(),
            Response::ReadInputRegisters(vec![0, 0])
        );
    }

    #[test]
    fn respond_writes_through() {
        let mut space = space();
        respond(&mut space, 1, Request::WriteMultipleRegisters(30, vec![5, 6].into())).unwrap();
        respond(&mut space, 2, Request::WriteSingleCoil(0, true)).unwrap();
        respond(&mut space, 1, Request::MaskWriteRegister(20, 0x00F2, 0x0025)).unwrap();
        assert_eq!(space[&1].read(30, 2), vec![5, 6]);
        assert_eq!(space[&2].get(0), Some(1));
        // (0x0102 & 0x00F2) | (0x0025 & !0x00F2)
        assert_eq!(space[&1].get(20), Some(0x0007));
    }

    #[test]
    fn respond_rejects_bad_requests() {
        let mut space = space();
        assert_eq!(
            respond(&mut space, 1, Request::ReadHoldingRegisters(0, 0)),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            respond(&mut space, 1, Request::ReadHoldingRegisters(0xFFFF, 2)),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            respond(&mut space, 1, Request::ReportServerId),
            Err(ExceptionCode::IllegalFunction)
        );
    }

    #[test]
    fn register_entity_replaces_same_place() {
        let hub = hub();
        hub.register_entity("pump", 1, 10, &true.into(), None, None, None).unwrap();
        hub.register_entity("pump", 1, 10, &false.into(), None, None, None).unwrap();
        let flow = StateValue::UInt(7);
        hub.register_entity("flow", 1, 20, &flow, Some(DataType::UInt), Some(2), None)
            .unwrap();
        let entries = hub.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].registers, vec![0]);
        assert_eq!(entries[1].registers, vec![0, 7]);
    }

    #[test]
    fn string_entity_needs_count() {
        let err = hub()
            .register_entity("label", 1, 0, &"abc".into(), Some(DataType::String), None, None)
            .unwrap_err();
        assert!(matches!(err, HubError::Config(_)));
    }

    #[test]
    fn not_connected_before_start() {
        let hub = hub();
        assert!(!hub.is_serving());
        assert!(hub.read_holding_registers(1, 0, 1).unwrap_err().is_not_connected());
        assert!(hub.write_coil(1, 0, true).unwrap_err().is_not_connected());
        assert!(hub.rebuild().unwrap_err().is_not_connected());
    }

    #[tokio::test]
    async fn closable_stream_reads_eof_after_shutdown() {
        use tokio::io::AsyncReadExt;

        let mock = tokio_test::io::Builder::new().read(b"abc").build();
        let shutdown = CancellationToken::new();
        let mut stream = ClosableStream::new(mock, shutdown.clone());
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        shutdown.cancel();
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn not_connected_without_master() {
        let hub = hub();
        hub.start().await.unwrap();
        assert!(hub.is_serving());
        assert!(hub.read_coils(1, 0, 1).unwrap_err().is_not_connected());
        hub.close().await;
    }

    #[test_log::test(tokio::test)]
    async fn start_is_idempotent() {
        let hub = hub();
        let first = hub.start().await.unwrap();
        let second = hub.start().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(hub.local_addr().await, Some(first));
        hub.close().await;
        hub.close().await;
        assert!(!hub.is_serving());
        assert_eq!(hub.local_addr().await, None);
        assert!(hub.start().await.unwrap_err().is_not_connected());
    }

    #[test_log::test(tokio::test)]
    async fn master_sees_registered_values() {
        let hub = hub();
        hub.register_entity("pump", 1, 10, &true.into(), None, None, Some(1)).unwrap();
        let addr = hub.start().await.unwrap();

        let mut ctx = tcp::connect_slave(addr, Slave(1)).await.unwrap();
        wait_for_clients(&hub, 1).await;

        assert_eq!(ctx.read_holding_registers(10, 1).await.unwrap().unwrap(), vec![1]);
        ctx.write_single_register(11, 42).await.unwrap().unwrap();
        assert_eq!(hub.read_holding_registers(1, 10, 2).unwrap(), vec![1, 42]);

        hub.write_coil(1, 12, true).unwrap();
        assert_eq!(ctx.read_coils(10, 3).await.unwrap().unwrap(), vec![true, true, true]);

        hub.close().await;
    }

    #[test_log::test(tokio::test)]
    async fn registrations_after_start_need_rebuild() {
        let hub = hub();
        let addr = hub.start().await.unwrap();
        let mut ctx = tcp::connect_slave(addr, Slave(1)).await.unwrap();
        wait_for_clients(&hub, 1).await;

        hub.register_entity("late", 1, 5, &StateValue::Int(-2), Some(DataType::Int), Some(1), None)
            .unwrap();
        assert_eq!(hub.read_holding_registers(1, 5, 1).unwrap(), vec![0]);
        hub.rebuild().unwrap();
        assert_eq!(ctx.read_holding_registers(5, 1).await.unwrap().unwrap(), vec![0xFFFE]);

        hub.close().await;
    }

    #[test_log::test(tokio::test)]
    async fn close_drops_masters() {
        let hub = hub();
        let addr = hub.start().await.unwrap();
        let mut ctx = tcp::connect_slave(addr, Slave(1)).await.unwrap();
        wait_for_clients(&hub, 1).await;

        hub.close().await;
        wait_for_clients(&hub, 0).await;
        assert!(ctx.read_holding_registers(0, 1).await.is_err());
    }
}
