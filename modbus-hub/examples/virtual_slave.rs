/// Battery exposed as a Modbus TCP virtual slave
use std::time::Duration;

use modbus_hub::codec::{DataType, StateValue};
use modbus_hub::config::HubConfig;
use modbus_hub::{logging, HubRegistry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init()?;

    let config = HubConfig::tcp_server("battery", "127.0.0.1", 5020);
    let registry = HubRegistry::setup(vec![config]).await?;
    let Some(hub) = registry.get("battery") else {
        return Err("battery hub missing".into());
    };
    let Some(battery) = hub.as_server() else {
        return Err("battery hub is not a server".into());
    };

    let mut power = 1500.0;
    let float = Some(DataType::Float);
    let uint = Some(DataType::UInt);
    battery.register_entity("power", 1, 0, &StateValue::Float(power), float, Some(2), None)?;
    battery.register_entity("state_of_energy", 1, 2, &4200u64.into(), uint, Some(2), None)?;
    let string = Some(DataType::String);
    battery.register_entity("model", 1, 10, &"BAT-7".into(), string, Some(4), None)?;
    battery.register_entity("charging", 1, 20, &true.into(), None, None, Some(0b01))?;
    battery.register_entity("fault", 1, 20, &false.into(), None, None, Some(0b10))?;
    registry.start_servers().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                power += 10.0;
                let state = StateValue::Float(power);
                battery.register_entity("power", 1, 0, &state, float, Some(2), None)?;
                battery.rebuild()?;
            }
        }
    }

    registry.close_all().await;
    Ok(())
}
