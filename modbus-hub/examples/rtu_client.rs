/// RTU Modbus client
use std::time::Duration;

use modbus_hub::codec::{decode_registers, DataType, Swap};
use modbus_hub::config::{ConnectionKind, HubConfig, Parity, SerialMethod, SerialParams};
use modbus_hub::{logging, ModbusHub};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init()?;

    let serial = SerialParams {
        port: "/tmp/ttys002".to_owned(),
        baudrate: 9600,
        bytesize: 8,
        method: SerialMethod::Rtu,
        parity: Parity::None,
        stopbits: 1,
    };
    let hub = ModbusHub::new(HubConfig::new("meter", ConnectionKind::Serial(serial)).with_delay(1));
    hub.setup().await?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    loop {
        let words = hub.read_input_registers(1, 0, 2).await?;
        let voltage = decode_registers(&words, DataType::Int, Swap::Word)?;
        println!("voltage {voltage:?}");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
