//! Modbus TCP framing (MBAP header) carried in UDP datagrams.
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio_modbus::ExceptionCode;
use tracing::debug;

use super::Transport;
use crate::codec::Word;
use crate::error::{HubError, Result};
use crate::registers::{Address, Quantity, UnitId};

const MBAP_HEADER_LEN: usize = 7;
const MAX_ADU_LEN: usize = 260;
/// Unit id used on Modbus TCP when the request does not name one.
const TCP_DEVICE_UNIT: UnitId = 0xFF;

const READ_COILS: u8 = 0x01;
const READ_DISCRETE_INPUTS: u8 = 0x02;
const READ_HOLDING_REGISTERS: u8 = 0x03;
const READ_INPUT_REGISTERS: u8 = 0x04;
const WRITE_SINGLE_COIL: u8 = 0x05;
const WRITE_SINGLE_REGISTER: u8 = 0x06;
const WRITE_MULTIPLE_COILS: u8 = 0x0F;
const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

const MAX_READ_BITS: usize = 2000;
const MAX_READ_REGISTERS: usize = 125;
const MAX_WRITE_COILS: usize = 1968;
const MAX_WRITE_REGISTERS: usize = 123;

#[derive(Debug)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    transaction_id: u16,
}

impl UdpTransport {
    pub async fn connect(peer: SocketAddr) -> Result<Self> {
        let local = if peer.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        Ok(Self {
            socket: Some(socket),
            transaction_id: 0,
        })
    }

    fn wrap(&mut self, unit: UnitId, pdu: &[u8]) -> Bytes {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
        frame.put_u16(self.transaction_id);
        frame.put_u16(0);
        frame.put_u16((pdu.len() + 1) as u16);
        frame.put_u8(unit);
        frame.put_slice(pdu);
        frame.freeze()
    }

    /// Send one request PDU and wait for the matching response PDU.
    /// Datagrams of other transactions are discarded.
    async fn transact(&mut self, unit: Option<UnitId>, pdu: &[u8]) -> Result<Bytes> {
        let unit = unit.unwrap_or(TCP_DEVICE_UNIT);
        let frame = self.wrap(unit, pdu);
        let transaction_id = self.transaction_id;
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| HubError::Io(std::io::ErrorKind::NotConnected.into()))?;
        socket.send(&frame).await?;

        let mut buf = [0u8; MAX_ADU_LEN];
        loop {
            let len = socket.recv(&mut buf).await?;
            match unwrap_frame(&buf[..len], transaction_id, unit)? {
                Some(response) => return check_response(pdu[0], response),
                None => debug!(transaction_id, "discarding stale datagram"),
            }
        }
    }
}

fn unwrap_frame(frame: &[u8], transaction_id: u16, unit: UnitId) -> Result<Option<Bytes>> {
    if frame.len() < MBAP_HEADER_LEN + 1 {
        return Err(HubError::Protocol(format!("frame of {} bytes is too short", frame.len())));
    }
    let mut header = &frame[..MBAP_HEADER_LEN];
    let received_id = header.get_u16();
    let protocol_id = header.get_u16();
    let length = usize::from(header.get_u16());
    let received_unit = header.get_u8();

    if received_id != transaction_id {
        return Ok(None);
    }
    if protocol_id != 0 {
        return Err(HubError::Protocol(format!("invalid protocol id {protocol_id}")));
    }
    if received_unit != unit {
        return Err(HubError::Protocol(format!(
            "response from unit {received_unit}, expected {unit}"
        )));
    }
    if length < 2 || frame.len() < MBAP_HEADER_LEN - 1 + length {
        return Err(HubError::Protocol(format!("declared length {length} does not match frame")));
    }

    Ok(Some(Bytes::copy_from_slice(&frame[MBAP_HEADER_LEN..MBAP_HEADER_LEN - 1 + length])))
}

fn check_response(function: u8, mut response: Bytes) -> Result<Bytes> {
    if !response.has_remaining() {
        return Err(HubError::Protocol("empty response".to_owned()));
    }
    let code = response.get_u8();
    if code == function | 0x80 {
        let exception = response.first().copied().unwrap_or_default();
        return Err(HubError::Exception(exception_code(exception)));
    }
    if code != function {
        return Err(HubError::Protocol(format!(
            "function {code:#04x} in response to {function:#04x}"
        )));
    }
    Ok(response)
}

fn exception_code(code: u8) -> ExceptionCode {
    match code {
        0x01 => ExceptionCode::IllegalFunction,
        0x02 => ExceptionCode::IllegalDataAddress,
        0x03 => ExceptionCode::IllegalDataValue,
        0x04 => ExceptionCode::ServerDeviceFailure,
        0x05 => ExceptionCode::Acknowledge,
        0x06 => ExceptionCode::ServerDeviceBusy,
        0x08 => ExceptionCode::MemoryParityError,
        0x0A => ExceptionCode::GatewayPathUnavailable,
        0x0B => ExceptionCode::GatewayTargetDevice,
        other => ExceptionCode::Custom(other),
    }
}

/// Function code followed by two big-endian fields, the shape of most requests.
fn request_pdu(function: u8, addr: Address, cnt: u16) -> BytesMut {
    let mut pdu = BytesMut::with_capacity(5);
    pdu.put_u8(function);
    pdu.put_u16(addr);
    pdu.put_u16(cnt);
    pdu
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |byte, (i, &bit)| byte | (u8::from(bit) << i))
        })
        .collect()
}

/// Request quantity of `len` items, at most `max` per request.
fn quantity(len: usize, max: usize) -> Result<Quantity> {
    if len == 0 || len > max {
        return Err(HubError::config(format!("quantity {len} not in 1..={max}")));
    }
    Ok(len as Quantity)
}

fn byte_count(payload: &mut Bytes) -> Result<usize> {
    if !payload.has_remaining() {
        return Err(HubError::Protocol("response without byte count".to_owned()));
    }
    Ok(usize::from(payload.get_u8()))
}

fn unpack_bits(mut payload: Bytes, cnt: Quantity) -> Result<Vec<bool>> {
    let byte_cnt = byte_count(&mut payload)?;
    let cnt = usize::from(cnt);
    if payload.len() < byte_cnt || byte_cnt * 8 < cnt {
        return Err(HubError::Protocol(format!("{byte_cnt} bytes cannot hold {cnt} bits")));
    }
    Ok((0..cnt).map(|i| payload[i / 8] & (1 << (i % 8)) != 0).collect())
}

fn unpack_words(mut payload: Bytes, cnt: Quantity) -> Result<Vec<Word>> {
    let byte_cnt = byte_count(&mut payload)?;
    if payload.len() < byte_cnt || byte_cnt != 2 * usize::from(cnt) {
        return Err(HubError::Protocol(format!("{byte_cnt} bytes cannot hold {cnt} registers")));
    }
    Ok((0..cnt).map(|_| payload.get_u16()).collect())
}

#[async_trait]
impl Transport for UdpTransport {
    async fn read_coils(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<bool>> {
        quantity(cnt.into(), MAX_READ_BITS)?;
        let response = self.transact(unit, &request_pdu(READ_COILS, addr, cnt)).await?;
        unpack_bits(response, cnt)
    }

    async fn read_discrete_inputs(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<bool>> {
        quantity(cnt.into(), MAX_READ_BITS)?;
        let pdu = request_pdu(READ_DISCRETE_INPUTS, addr, cnt);
        let response = self.transact(unit, &pdu).await?;
        unpack_bits(response, cnt)
    }

    async fn read_input_registers(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>> {
        quantity(cnt.into(), MAX_READ_REGISTERS)?;
        let pdu = request_pdu(READ_INPUT_REGISTERS, addr, cnt);
        let response = self.transact(unit, &pdu).await?;
        unpack_words(response, cnt)
    }

    async fn read_holding_registers(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>> {
        quantity(cnt.into(), MAX_READ_REGISTERS)?;
        let pdu = request_pdu(READ_HOLDING_REGISTERS, addr, cnt);
        let response = self.transact(unit, &pdu).await?;
        unpack_words(response, cnt)
    }

    async fn write_single_coil(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        value: bool,
    ) -> Result<()> {
        let value = if value { 0xFF00 } else { 0x0000 };
        let pdu = request_pdu(WRITE_SINGLE_COIL, addr, value);
        self.transact(unit, &pdu).await.map(|_| ())
    }

    async fn write_multiple_coils(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        values: &[bool],
    ) -> Result<()> {
        let cnt = quantity(values.len(), MAX_WRITE_COILS)?;
        let packed = pack_bits(values);
        let mut pdu = request_pdu(WRITE_MULTIPLE_COILS, addr, cnt);
        // At most 246 bytes for 1968 coils.
        pdu.put_u8(packed.len() as u8);
        pdu.put_slice(&packed);
        self.transact(unit, &pdu).await.map(|_| ())
    }

    async fn write_single_register(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        value: Word,
    ) -> Result<()> {
        let pdu = request_pdu(WRITE_SINGLE_REGISTER, addr, value);
        self.transact(unit, &pdu).await.map(|_| ())
    }

    async fn write_multiple_registers(
        &mut self,
        unit: Option<UnitId>,
        addr: Address,
        values: &[Word],
    ) -> Result<()> {
        let cnt = quantity(values.len(), MAX_WRITE_REGISTERS)?;
        let mut pdu = request_pdu(WRITE_MULTIPLE_REGISTERS, addr, cnt);
        pdu.put_u8((2 * cnt) as u8);
        for value in values {
            pdu.put_u16(*value);
        }
        self.transact(unit, &pdu).await.map(|_| ())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.socket.take();
        Ok(())
    }
}
