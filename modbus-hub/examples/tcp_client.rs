/// TCP Modbus client reading the virtual slave demo
use std::time::Duration;

use modbus_hub::codec::{decode_registers, DataType, Swap};
use modbus_hub::config::HubConfig;
use modbus_hub::{logging, CallType, ModbusHub, Transaction};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init()?;

    let hub = ModbusHub::new(HubConfig::tcp("battery", "127.0.0.1", 5020).with_timeout(2));
    hub.setup().await?;

    loop {
        let words = hub.read_holding_registers(1, 0, 4).await?;
        let power = decode_registers(&words[0..2], DataType::Float, Swap::None)?;
        let energy = decode_registers(&words[2..4], DataType::UInt, Swap::None)?;
        let words = hub.read_holding_registers(1, 10, 4).await?;
        let model = decode_registers(&words, DataType::String, Swap::None)?;
        let flags = hub.call(Transaction::new(1, 20, CallType::Holding(1))).await?;
        println!(
            "{model:?}: power {power:?} W, energy {energy:?} Wh, flags {:?}",
            flags.registers()
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
