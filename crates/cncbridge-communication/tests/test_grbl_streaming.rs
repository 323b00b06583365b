//! End-to-end GRBL controller tests over a scripted serial link.

use cncbridge_communication::firmware::{Command, Controller, ControllerServices};
use cncbridge_communication::{
    ClientHandle, Communicator, ConnectionParams, ControllerRegistry, GrblConfig, GrblController,
};
use cncbridge_core::{ClientEvent, Result, WorkflowState};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

// Scripted link: captures writes, replays queued device output
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

fn open_controller(
    registry: &Arc<ControllerRegistry>,
) -> (
    Arc<GrblController>,
    Arc<Mutex<Vec<Vec<u8>>>>,
    Arc<Mutex<VecDeque<Vec<u8>>>>,
) {
    let (link, writes, replies) = ScriptedLink::new();
    let controller = GrblController::open_with_link(
        Box::new(link),
        "/dev/ttyUSB0",
        GrblConfig::default(),
        registry.clone(),
        ControllerServices::local(),
    )
    .unwrap();
    (controller, writes, replies)
}

#[tokio::test(start_paused = true)]
async fn test_job_runs_to_completion() {
    let registry = Arc::new(ControllerRegistry::new());
    let (controller, writes, replies) = open_controller(&registry);

    reply(&replies, "Grbl 1.1f ['$' for help]\n");
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(controller.is_ready());

    controller
        .command(
            None,
            Command::Load {
                name: "square.nc".to_string(),
                gcode: "G1 X10\nG1 Y20\nG1 Z5\n".to_string(),
            },
        )
        .await
        .unwrap();
    controller.command(None, Command::Start).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(controller.workflow_state(), WorkflowState::Running);
    let output = written(&writes);
    assert!(output.contains("G1 X10\nG1 Y20\nG1 Z5\n"));

    reply(&replies, "ok\nok\nok\n");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = controller.sender_status();
    assert_eq!(status.received, 3);
    assert_eq!(status.total, 3);
    assert_eq!(controller.workflow_state(), WorkflowState::Idle);

    controller.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_emission_until_resume() {
    let registry = Arc::new(ControllerRegistry::new());
    let (controller, writes, replies) = open_controller(&registry);
    tokio::time::sleep(Duration::from_millis(700)).await;

    // A window smaller than the job so lines remain queued
    let gcode = (0..30)
        .map(|i| format!("G1 X{}.000 Y{}.000", i, i))
        .collect::<Vec<_>>()
        .join("\n");
    controller
        .command(
            None,
            Command::Load {
                name: "long.nc".to_string(),
                gcode,
            },
        )
        .await
        .unwrap();
    controller.command(None, Command::Start).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    controller.command(None, Command::Pause).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(controller.workflow_state(), WorkflowState::Paused);

    // Acknowledge a line while paused: the window must not refill
    let sent_at_pause = controller.sender_status().sent;
    reply(&replies, "ok\n");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.sender_status().sent, sent_at_pause);

    controller.command(None, Command::Resume).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(controller.workflow_state(), WorkflowState::Running);
    assert!(written(&writes).contains('~'));

    controller.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_two_clients_both_receive_alarm() {
    let registry = Arc::new(ControllerRegistry::new());
    let (controller, _writes, replies) = open_controller(&registry);

    let (client_a, mut rx_a) = ClientHandle::new();
    let (client_b, mut rx_b) = ClientHandle::new();
    controller.add_connection(client_a);
    controller.add_connection(client_b);
    tokio::time::sleep(Duration::from_millis(700)).await;

    reply(&replies, "ALARM:1\n");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let saw_alarm = |rx: &mut tokio::sync::mpsc::UnboundedReceiver<ClientEvent>| {
        let mut found = false;
        while let Ok(event) = rx.try_recv() {
            if let ClientEvent::SerialRead { data } = event {
                if data == "ALARM:1" {
                    found = true;
                }
            }
        }
        found
    };
    assert!(saw_alarm(&mut rx_a));
    assert!(saw_alarm(&mut rx_b));

    controller.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_gcode_command_feeds_one_at_a_time() {
    let registry = Arc::new(ControllerRegistry::new());
    let (controller, writes, replies) = open_controller(&registry);
    tokio::time::sleep(Duration::from_millis(700)).await;

    controller
        .command(
            None,
            Command::Gcode {
                line: "G0 X1".to_string(),
            },
        )
        .await
        .unwrap();
    controller
        .command(
            None,
            Command::Gcode {
                line: "G0 X2".to_string(),
            },
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let output = written(&writes);
    assert!(output.contains("G0 X1\n"));
    assert!(!output.contains("G0 X2\n"));

    reply(&replies, "ok\n");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(written(&writes).contains("G0 X2\n"));

    controller.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_tears_down() {
    struct FailingLink {
        polls: usize,
    }

    impl Communicator for FailingLink {
        fn connect(&mut self, _params: &ConnectionParams) -> Result<()> {
            Ok(())
        }
        fn disconnect(&mut self) -> Result<()> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn send(&mut self, data: &[u8]) -> Result<usize> {
            Ok(data.len())
        }
        fn receive(&mut self) -> Result<Vec<u8>> {
            self.polls += 1;
            if self.polls > 3 {
                Err(cncbridge_core::ConnectionError::ConnectionLost {
                    reason: "device unplugged".to_string(),
                }
                .into())
            } else {
                Ok(vec![])
            }
        }
    }

    let registry = Arc::new(ControllerRegistry::new());
    let controller = GrblController::open_with_link(
        Box::new(FailingLink { polls: 0 }),
        "/dev/ttyUSB0",
        GrblConfig::default(),
        registry.clone(),
        ControllerServices::local(),
    )
    .unwrap();

    let (client, mut rx) = ClientHandle::new();
    controller.add_connection(client);

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!controller.is_open());
    assert!(registry.get("/dev/ttyUSB0").is_none());

    let mut saw_error = false;
    let mut saw_close = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            ClientEvent::SerialError { .. } => saw_error = true,
            ClientEvent::SerialClose { .. } => saw_close = true,
            _ => {}
        }
    }
    assert!(saw_error);
    assert!(saw_close);
}

#[tokio::test(start_paused = true)]
async fn test_reopening_port_supersedes() {
    let registry = Arc::new(ControllerRegistry::new());
    let (first, _w1, _r1) = open_controller(&registry);
    let (second, _w2, _r2) = open_controller(&registry);

    // The registry now resolves to the new controller
    let resolved = registry.get("/dev/ttyUSB0").unwrap();
    assert!(Arc::ptr_eq(
        &resolved,
        &(second.clone() as Arc<dyn Controller>)
    ));

    first.close().await;
    second.close().await;
}
