use cncbridge::{
    init_logging, list_ports, open_controller, ClientHandle, Command, ConnectionParams, Controller,
    ControllerRegistry, ControllerServices, ControllerType, WorkflowState,
};
use std::sync::Arc;
use std::time::Duration;

const USAGE: &str = "Usage:
  cncbridge list-ports
  cncbridge stream <port> <file> [grbl|tinyg2]

Streams a G-code file to the controller on <port>, printing the device
conversation until the job completes. Firmware defaults to grbl.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("list-ports") => cmd_list_ports(),
        Some("stream") if args.len() >= 3 => {
            let firmware = match args.get(3).map(String::as_str) {
                None | Some("grbl") => ControllerType::Grbl,
                Some("tinyg2") => ControllerType::TinyG2,
                Some(other) => anyhow::bail!("unknown firmware '{}'\n{}", other, USAGE),
            };
            cmd_stream(&args[1], &args[2], firmware).await
        }
        _ => {
            eprintln!("{}", USAGE);
            Ok(())
        }
    }
}

fn cmd_list_ports() -> anyhow::Result<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No CNC serial ports found.");
        return Ok(());
    }
    for port in ports {
        println!("{}\t{}", port.port_name, port.description);
    }
    Ok(())
}

async fn cmd_stream(port: &str, path: &str, firmware: ControllerType) -> anyhow::Result<()> {
    let gcode = tokio::fs::read_to_string(path).await?;
    let name = path.to_string();

    let registry = Arc::new(ControllerRegistry::new());
    let controller = open_controller(
        firmware,
        ConnectionParams::new(port, 115200),
        registry.clone(),
        ControllerServices::local(),
    )
    .await?;

    let (client, mut events) = ClientHandle::new();
    let client_id = client.id();
    controller.add_connection(client);

    // Print the device conversation as it happens
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("[{}] {:?}", event.wire_name(), event);
        }
    });

    // Wait for initialisation before starting the job
    while !controller.is_ready() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    controller
        .command(Some(client_id), Command::Load { name, gcode })
        .await?;
    controller.command(Some(client_id), Command::Start).await?;

    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let status = controller.sender_status();
        if controller.workflow_state() == WorkflowState::Idle && status.received == status.total {
            println!("done: {}/{} lines acknowledged", status.received, status.total);
            break;
        }
    }

    controller.close().await;
    printer.abort();
    Ok(())
}
