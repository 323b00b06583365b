//! End-to-end TinyG2 controller tests over a scripted serial link.

use cncbridge_communication::firmware::{Command, Controller, ControllerServices};
use cncbridge_communication::{
    Communicator, ConnectionParams, ControllerRegistry, TinyG2Config, TinyG2Controller,
};
use cncbridge_core::{Result, WorkflowState};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

struct ScriptedLink {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
    connected: bool,
}

impl ScriptedLink {
    fn new() -> (Self, Arc<Mutex<Vec<Vec<u8>>>>, Arc<Mutex<VecDeque<Vec<u8>>>>) {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let replies = Arc::new(Mutex::new(VecDeque::new()));
        (
            Self {
                writes: writes.clone(),
                replies: replies.clone(),
                connected: true,
            },
            writes,
            replies,
        )
    }
}

impl Communicator for ScriptedLink {
    fn connect(&mut self, _params: &ConnectionParams) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.writes.lock().push(data.to_vec());
        Ok(data.len())
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        Ok(self.replies.lock().pop_front().unwrap_or_default())
    }
}

fn written(writes: &Arc<Mutex<Vec<Vec<u8>>>>) -> String {
    let writes = writes.lock();
    writes
        .iter()
        .map(|w| String::from_utf8_lossy(w).to_string())
        .collect::<Vec<_>>()
        .join("")
}

fn reply(replies: &Arc<Mutex<VecDeque<Vec<u8>>>>, data: &str) {
    replies.lock().push_back(data.as_bytes().to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_init_script_then_job_round_trip() {
    let (link, writes, replies) = ScriptedLink::new();
    let registry = Arc::new(ControllerRegistry::new());
    let controller = TinyG2Controller::open_with_link(
        Box::new(link),
        "/dev/ttyACM0",
        TinyG2Config::default(),
        registry.clone(),
        ControllerServices::local(),
    )
    .unwrap();

    // The init script paces itself out, then the controller is ready
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(controller.is_ready());
    let output = written(&writes);
    assert!(output.starts_with("{\"js\":1}\n"));
    assert!(output.contains("{\"sr\":null}\n"));

    controller
        .command(
            None,
            Command::Load {
                name: "job.nc".to_string(),
                gcode: "G0 X1\nG0 X2\n".to_string(),
            },
        )
        .await
        .unwrap();
    controller.command(None, Command::Start).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(written(&writes).contains("N1 G0 X1\n"));

    // Receipt marks the acknowledgement; the queue report releases N2
    reply(&replies, "{\"r\":{\"n\":1},\"f\":[1,0,6]}\n");
    reply(&replies, "{\"qr\":28,\"qi\":1,\"qo\":1}\n");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(written(&writes).contains("N2 G0 X2\n"));
    assert_eq!(controller.sender_status().received, 1);

    reply(&replies, "{\"r\":{\"n\":2},\"f\":[1,0,6]}\n");
    reply(&replies, "{\"qr\":28,\"qi\":1,\"qo\":1}\n");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = controller.sender_status();
    assert_eq!(status.received, 2);
    assert_eq!(controller.workflow_state(), WorkflowState::Idle);

    controller.close().await;
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_issues_cleanup_sequence() {
    let (link, writes, _replies) = ScriptedLink::new();
    let registry = Arc::new(ControllerRegistry::new());
    let controller = TinyG2Controller::open_with_link(
        Box::new(link),
        "/dev/ttyACM0",
        TinyG2Config::default(),
        registry.clone(),
        ControllerServices::local(),
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;

    controller
        .command(
            None,
            Command::Load {
                name: "job.nc".to_string(),
                gcode: "G0 X1\nG0 X2\n".to_string(),
            },
        )
        .await
        .unwrap();
    controller.command(None, Command::Start).await.unwrap();
    controller.command(None, Command::Stop).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(controller.workflow_state(), WorkflowState::Idle);
    assert!(written(&writes).contains("!%\n"));

    // The cleanup writes land after their settle delay
    tokio::time::sleep(Duration::from_millis(300)).await;
    let output = written(&writes);
    assert!(output.contains("{clear:null}\n"));
    assert!(output.ends_with("{\"qr\":\"\"}\n"));

    controller.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_line_numbers_reset_per_run() {
    let (link, writes, replies) = ScriptedLink::new();
    let registry = Arc::new(ControllerRegistry::new());
    let controller = TinyG2Controller::open_with_link(
        Box::new(link),
        "/dev/ttyACM0",
        TinyG2Config::default(),
        registry.clone(),
        ControllerServices::local(),
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;

    controller
        .command(
            None,
            Command::Load {
                name: "job.nc".to_string(),
                gcode: "G0 X1\n".to_string(),
            },
        )
        .await
        .unwrap();
    controller.command(None, Command::Start).await.unwrap();
    reply(&replies, "{\"r\":{\"n\":1},\"f\":[1,0,6]}\n");
    reply(&replies, "{\"qr\":28,\"qi\":1,\"qo\":1}\n");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.workflow_state(), WorkflowState::Idle);

    // A second start renumbers from N1
    controller.command(None, Command::Start).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let output = written(&writes);
    assert_eq!(output.matches("N1 G0 X1\n").count(), 2);
    assert!(!output.contains("N2"));

    controller.close().await;
}
