//! TinyG2 Controller Implementation
//!
//! Drives TinyG2/g2core devices: the numbered send-response job stream,
//! planner-queue gating, the interactive feeder on the JSON channel, and
//! the fan-out of device responses to subscribed clients.
//!
//! All protocol state lives in [`TinyG2Session`] and is mutated only
//! from the controller's event-loop task; the public
//! [`TinyG2Controller`] handle exchanges messages with that task.

use super::command_creator::CommandCreator;
use super::constants;
use super::response_parser::{StatusFields, TinyG2Response, TinyG2ResponseParser};
use crate::communication::{Communicator, ConnectionParams, SerialCommunicator};
use crate::connection::{ClientHandle, ClientId, Connections};
use crate::feeder::{FeedItem, Feeder};
use crate::firmware::{
    Command, Controller, ControllerMsg, ControllerServices, SharedSnapshot,
};
use crate::registry::ControllerRegistry;
use crate::sender::LineSender;
use async_trait::async_trait;
use cncbridge_core::{
    ClientEvent, CommandError, ControllerType, Error, FeederStatus, MachineStateSnapshot, Result,
    SenderStatus, TinyG2MachineState, WorkflowState,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Tunables for the TinyG2 controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TinyG2Config {
    /// Planner slots that must be free before the stream may advance
    pub planner_low_water_mark: u32,
    /// Query timer tick in milliseconds
    pub query_interval_ms: u64,
    /// Delay before the post-stop cleanup writes, milliseconds
    pub stop_cleanup_delay_ms: u64,
}

impl Default for TinyG2Config {
    fn default() -> Self {
        Self {
            planner_low_water_mark: constants::PLANNER_LOW_WATER_MARK,
            query_interval_ms: constants::QUERY_INTERVAL_MS,
            stop_cleanup_delay_ms: constants::STOP_CLEANUP_DELAY_MS,
        }
    }
}

/// How the current job line interacts with the planner queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SenderMode {
    /// Single planner entry; advance on ack + queue report
    #[default]
    Run,
    /// No planner motion; a queue report is solicited explicitly
    NoQr,
    /// Arc: generates multiple entries, advance only once the planner
    /// has committed them
    Wait,
}

/// Whether a queue report has arrived since the last advance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum QrState {
    #[default]
    Unknown,
    Ok,
}

/// Planner availability as of the last queue report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum PlannerQueueStatus {
    #[default]
    Ready,
    Blocked,
}

/// Whether the outstanding line has been acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum BufferState {
    #[default]
    Idle,
    Ack,
}

/// Actions scheduled for a later loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deferred {
    /// Write one step of the init script
    InitStep(usize),
    /// Declare initialisation finished
    MarkReady,
    /// Post-stop cleanup: clear the alarm and solicit a queue report
    StopCleanup,
}

/// Classify how a job line interacts with the planner queue
///
/// Works on whole G-code words so parameter values never false-match
/// (`G1 X94.5` is Run, not a dwell). Precedence when several classes
/// match: NoQr over Wait over Run; an arc carrying axis words is Wait.
fn classify_line(line: &str) -> SenderMode {
    let mut has_offset = false;
    let mut has_no_motion_code = false;

    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if !c.is_ascii_alphabetic() {
            continue;
        }
        let letter = c.to_ascii_uppercase();
        let mut number = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_digit() || next == '.' || next == '-' || next == '+' {
                number.push(next);
                chars.next();
            } else {
                break;
            }
        }
        match letter {
            'I' | 'J' | 'K' => has_offset = true,
            'G' => {
                if let Ok(value) = number.parse::<f64>() {
                    if matches!(value.trunc() as i64, 4 | 5 | 6 | 9) {
                        has_no_motion_code = true;
                    }
                }
            }
            // Axis words (X/Y/Z) and everything else stream as Run
            _ => {}
        }
    }

    if has_no_motion_code {
        SenderMode::NoQr
    } else if has_offset {
        SenderMode::Wait
    } else {
        SenderMode::Run
    }
}

/// Protocol state machine for one TinyG2 device
pub(crate) struct TinyG2Session {
    port: String,
    link: Box<dyn Communicator>,
    parser: TinyG2ResponseParser,
    feeder: Feeder,
    sender: LineSender,
    connections: Connections,
    services: ControllerServices,
    config: TinyG2Config,
    command_creator: CommandCreator,

    workflow: WorkflowState,
    machine: TinyG2MachineState,
    published_machine: TinyG2MachineState,
    ready: bool,

    sender_mode: SenderMode,
    qr_state: QrState,
    planner_queue_status: PlannerQueueStatus,
    buffer_state: BufferState,

    last_query: Option<Instant>,
    deferred: Vec<(Instant, Deferred)>,
}

impl TinyG2Session {
    pub(crate) fn new(
        port: String,
        link: Box<dyn Communicator>,
        config: TinyG2Config,
        services: ControllerServices,
    ) -> Self {
        Self {
            port,
            link,
            parser: TinyG2ResponseParser::new(),
            feeder: Feeder::new(),
            sender: LineSender::new(),
            connections: Connections::new(),
            services,
            config,
            command_creator: CommandCreator::new(),
            workflow: WorkflowState::Idle,
            machine: TinyG2MachineState::default(),
            published_machine: TinyG2MachineState::default(),
            ready: false,
            sender_mode: SenderMode::Run,
            qr_state: QrState::Unknown,
            planner_queue_status: PlannerQueueStatus::Ready,
            buffer_state: BufferState::Idle,
            last_query: None,
            deferred: Vec::new(),
        }
    }

    /// Kick off the initialisation script
    pub(crate) fn start(&mut self, now: Instant) {
        self.broadcast(ClientEvent::SerialOpen {
            port: self.port.clone(),
        });
        self.schedule(now, Deferred::InitStep(0));
    }

    fn schedule(&mut self, at: Instant, action: Deferred) {
        self.deferred.push((at, action));
    }

    fn run_due(&mut self, now: Instant) {
        let mut due = Vec::new();
        self.deferred.retain(|(at, action)| {
            if *at <= now {
                due.push(*action);
                false
            } else {
                true
            }
        });
        for action in due {
            match action {
                Deferred::InitStep(index) => {
                    let step = constants::INIT_SCRIPT[index];
                    self.writeln(step.cmd);
                    let settle = Duration::from_millis(step.pause_after_ms);
                    if index + 1 < constants::INIT_SCRIPT.len() {
                        self.schedule(now + settle, Deferred::InitStep(index + 1));
                    } else {
                        self.schedule(now + settle, Deferred::MarkReady);
                    }
                }
                Deferred::MarkReady => {
                    tracing::info!("{}: initialisation complete", self.port);
                    self.ready = true;
                }
                Deferred::StopCleanup => {
                    self.writeln(constants::CLEAR_ALARM);
                    self.writeln(constants::QUEUE_REPORT_REQUEST);
                }
            }
        }
    }

    pub(crate) fn receive(&mut self) -> Result<Vec<u8>> {
        self.link.receive()
    }

    fn broadcast(&self, event: ClientEvent) {
        self.connections.broadcast(event);
    }

    fn broadcast_read(&self, data: impl Into<String>) {
        self.broadcast(ClientEvent::SerialRead { data: data.into() });
    }

    /// Every TinyG2 write is newline-terminated; the device accepts the
    /// realtime characters mid-stream with a newline.
    fn writeln(&mut self, data: &str) {
        if !self.link.is_connected() {
            tracing::warn!("{}: write of {:?} while port closed, dropped", self.port, data);
            return;
        }
        if let Err(e) = self.link.send_command(data) {
            tracing::error!("{}: write failed: {}", self.port, e);
        }
    }

    /// Emit the next job line, classify it, and solicit a queue report
    /// when the line generates no planner motion
    fn emit_next(&mut self) {
        let Some(line) = self.sender.next() else {
            return;
        };
        let mode = classify_line(&line);
        self.sender_mode = mode;
        let framed = self.command_creator.create_gcode_command(&line);
        tracing::debug!("{}: > {}", self.port, framed);
        self.writeln(&framed);
        if mode == SenderMode::NoQr {
            self.writeln(constants::QUEUE_REPORT_POLL);
        }
    }

    /// Acknowledge the in-flight feeder line and dispatch the next one
    fn advance_feeder(&mut self) {
        while let Some(item) = self.feeder.next() {
            let line = item.line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if let Some(client) = item.client {
                self.connections.set_last_sent(client, &line);
            }
            // JSON config commands pass through untouched; G-code is
            // wrapped for the JSON channel.
            let framed = if line.starts_with('{') {
                line.clone()
            } else {
                self.command_creator.wrap_gcode(&line)
            };
            self.writeln(&framed);
            self.broadcast(ClientEvent::SerialWrite {
                data: format!("{}\n", framed),
            });
            break;
        }
    }

    /// Decode one device line and react to it
    pub(crate) fn on_serial_line(&mut self, line: &str) {
        let Some(response) = self.parser.parse(line) else {
            return;
        };
        tracing::trace!("{}: < {}", self.port, line);

        match response {
            TinyG2Response::Receipt { status, body, .. } => self.on_receipt(status, &body),
            TinyG2Response::StatusReport(fields) => self.on_status_report(&fields),
            TinyG2Response::QueueReport { qr, qi, qo } => self.on_queue_report(qr, qi, qo),
            TinyG2Response::FirmwareBuild { version } => {
                tracing::info!("{}: firmware build {}", self.port, version);
                self.broadcast_read(line);
            }
            TinyG2Response::HardwarePlatform { .. } | TinyG2Response::Message => {
                self.broadcast_read(line)
            }
        }
    }

    /// Command receipt: the acknowledgement half of the send-response
    /// protocol, gated by the planner state
    fn on_receipt(&mut self, status: u8, body: &serde_json::Value) {
        // A receipt can carry an embedded status report or queue report
        // (responses to `{"sr":null}` / `{"qr":null}` polls).
        if let Some(sr) = body.get("sr") {
            self.on_status_report(&StatusFields::from_value(sr));
        }
        if let Some(qr) = body.get("qr").and_then(serde_json::Value::as_u64) {
            let qi = body.get("qi").and_then(serde_json::Value::as_u64).unwrap_or(0);
            let qo = body.get("qo").and_then(serde_json::Value::as_u64).unwrap_or(0);
            self.on_queue_report(qr as u32, qi as u32, qo as u32);
            return;
        }

        if status != 0 && self.workflow != WorkflowState::Idle {
            let errored = self
                .sender
                .line_at(self.sender.received())
                .unwrap_or_default()
                .to_string();
            self.broadcast_read(format!("> {}", errored));
            self.broadcast_read(format!(
                "error={}, line={}",
                status,
                self.sender.received() + 1
            ));
        }

        if self.workflow != WorkflowState::Running {
            self.advance_feeder();
            return;
        }
        if self.sender_mode == SenderMode::Wait {
            // An arc is still being committed; only a queue report may
            // release it.
            return;
        }

        self.buffer_state = BufferState::Ack;
        if self.planner_queue_status == PlannerQueueStatus::Ready && self.qr_state == QrState::Ok {
            self.sender.ack();
            self.emit_next();
            self.qr_state = QrState::Unknown;
        }
    }

    /// Queue report: the planner-side gate of the stream
    fn on_queue_report(&mut self, qr: u32, qi: u32, qo: u32) {
        self.qr_state = QrState::Ok;
        self.planner_queue_status = PlannerQueueStatus::Blocked;

        if self.sender_mode == SenderMode::Wait && (qi == 0 || qo > qi) {
            // The arc has been committed to the planner
            self.sender_mode = SenderMode::Run;
        }

        if qr > self.config.planner_low_water_mark && self.buffer_state == BufferState::Ack {
            if self.workflow == WorkflowState::Running && self.sender_mode == SenderMode::Run {
                self.sender.ack();
                self.emit_next();
            } else {
                self.advance_feeder();
                self.planner_queue_status = PlannerQueueStatus::Ready;
            }
        }
    }

    /// Status report: machine state plus a fallback advance for firmware
    /// builds that elide the receipt message
    fn on_status_report(&mut self, fields: &StatusFields) {
        if let Some(stat) = fields.stat {
            self.machine.machine_state = TinyG2MachineState::stat_name(stat).to_string();
        }
        if fields.line.is_some() {
            self.machine.line = fields.line;
        }
        if let Some(x) = fields.posx {
            self.machine.work_pos.x = x;
        }
        if let Some(y) = fields.posy {
            self.machine.work_pos.y = y;
        }
        if let Some(z) = fields.posz {
            self.machine.work_pos.z = z;
        }
        if fields.vel.is_some() {
            self.machine.velocity = fields.vel;
        }
        if fields.feed.is_some() {
            self.machine.feed_rate = fields.feed;
        }

        if self.workflow == WorkflowState::Running
            && self.sender_mode != SenderMode::Wait
            && self.planner_queue_status == PlannerQueueStatus::Ready
            && self.qr_state == QrState::Ok
            && self.sender.received() < self.sender.sent()
        {
            if let Some(line) = fields.line {
                if line <= self.command_creator.line_number() {
                    self.buffer_state = BufferState::Ack;
                    self.sender.ack();
                    self.emit_next();
                    self.qr_state = QrState::Unknown;
                }
            }
        }
    }

    /// Dispatch a client command
    pub(crate) async fn handle_command(
        &mut self,
        client: Option<ClientId>,
        command: Command,
        now: Instant,
    ) -> Result<()> {
        tracing::debug!("{}: command {}", self.port, command.name());
        match command {
            Command::Load { name, gcode } => {
                self.sender.load(&name, &gcode)?;
                self.workflow = WorkflowState::Idle;
                tracing::info!("{}: loaded '{}' ({} lines)", self.port, name, self.sender.total());
                Ok(())
            }
            Command::LoadMacro { id } => {
                let m = self
                    .services
                    .macros
                    .get(&id)
                    .ok_or(CommandError::UnknownMacro { id })?;
                Box::pin(self.handle_command(
                    client,
                    Command::Load {
                        name: m.name,
                        gcode: m.content,
                    },
                    now,
                ))
                .await
            }
            Command::LoadFile { path } => {
                let gcode = self.services.files.read_to_string(&path).await?;
                Box::pin(self.handle_command(client, Command::Load { name: path, gcode }, now))
                    .await
            }
            Command::Unload => {
                self.workflow = WorkflowState::Idle;
                self.sender.unload();
                Ok(())
            }
            Command::Start => {
                self.feeder.clear();
                self.command_creator.reset_line_number();
                self.workflow = WorkflowState::Running;
                self.sender.rewind();
                self.sender_mode = SenderMode::Run;
                self.qr_state = QrState::Unknown;
                self.planner_queue_status = PlannerQueueStatus::Ready;
                self.buffer_state = BufferState::Idle;
                self.emit_next();
                Ok(())
            }
            Command::Stop => {
                self.workflow = WorkflowState::Idle;
                self.sender.rewind();
                self.writeln(constants::FEED_HOLD_QUEUE_FLUSH);
                self.schedule(
                    now + Duration::from_millis(self.config.stop_cleanup_delay_ms),
                    Deferred::StopCleanup,
                );
                Ok(())
            }
            Command::Pause => {
                if self.workflow == WorkflowState::Running {
                    self.workflow = WorkflowState::Paused;
                }
                self.writeln(constants::FEED_HOLD);
                self.writeln(constants::QUEUE_REPORT_REQUEST);
                Ok(())
            }
            Command::Resume => {
                self.writeln(constants::CYCLE_START);
                self.writeln(constants::QUEUE_REPORT_REQUEST);
                if self.workflow == WorkflowState::Paused {
                    self.workflow = WorkflowState::Running;
                    self.emit_next();
                } else {
                    self.advance_feeder();
                }
                Ok(())
            }
            Command::QueueFlush => {
                self.writeln(constants::FEED_HOLD_QUEUE_FLUSH);
                self.writeln(constants::QUEUE_REPORT_REQUEST);
                Ok(())
            }
            Command::KillJob => {
                self.writeln(constants::KILL_JOB);
                Ok(())
            }
            Command::Reset => {
                if self.workflow != WorkflowState::Idle {
                    self.workflow = WorkflowState::Idle;
                    self.sender.rewind();
                }
                self.writeln(constants::SOFT_RESET);
                Ok(())
            }
            Command::Unlock => {
                self.writeln(constants::CLEAR_ALARM);
                Ok(())
            }
            Command::Homing => {
                self.writeln(constants::HOME_ALL);
                Ok(())
            }
            Command::Gcode { line } => {
                self.feeder.feed(FeedItem { client, line });
                if !self.feeder.is_pending() {
                    self.advance_feeder();
                }
                Ok(())
            }
            Command::Check => Err(CommandError::Unsupported {
                firmware: ControllerType::TinyG2.to_string(),
                command: command.name().to_string(),
            }
            .into()),
        }
    }

    /// Direct write on behalf of a client
    pub(crate) fn handle_write(&mut self, client: Option<ClientId>, data: &str) {
        if let Some(client) = client {
            self.connections.set_last_sent(client, data);
        }
        let line = data.trim_end_matches('\n');
        self.writeln(line);
        self.broadcast(ClientEvent::SerialWrite {
            data: format!("{}\n", line),
        });
    }

    /// One iteration of the timers
    pub(crate) fn tick(&mut self, now: Instant) {
        self.run_due(now);

        if self.workflow == WorkflowState::Running && self.sender.is_done() {
            tracing::info!("{}: job complete", self.port);
            self.workflow = WorkflowState::Idle;
        }

        if !self.ready || !self.link.is_connected() {
            return;
        }

        let due = self
            .last_query
            .map_or(true, |t| now.duration_since(t).as_millis() as u64 >= self.config.query_interval_ms);
        if !due {
            return;
        }
        self.last_query = Some(now);

        if self.feeder.peek() {
            self.broadcast(ClientEvent::FeederStatus(self.feeder.status()));
        }
        if self.sender.peek() {
            self.broadcast(ClientEvent::SenderStatus(self.sender.status()));
        }
        if self.machine != self.published_machine && !self.machine.is_empty() {
            self.published_machine = self.machine.clone();
            self.broadcast(ClientEvent::MachineState {
                firmware: ControllerType::TinyG2,
                state: MachineStateSnapshot::TinyG2(self.machine.clone()),
            });
        }
    }

    pub(crate) fn add_connection(&mut self, handle: ClientHandle) {
        let id = handle.id();
        self.connections.add(handle);
        self.connections.send_to(
            id,
            ClientEvent::SerialOpen {
                port: self.port.clone(),
            },
        );
        if !self.machine.is_empty() {
            self.connections.send_to(
                id,
                ClientEvent::MachineState {
                    firmware: ControllerType::TinyG2,
                    state: MachineStateSnapshot::TinyG2(self.machine.clone()),
                },
            );
            self.connections
                .send_to(id, ClientEvent::SenderStatus(self.sender.status()));
        }
    }

    pub(crate) fn remove_connection(&mut self, id: ClientId) {
        self.connections.remove(id);
    }

    pub(crate) fn on_transport_error(&mut self, error: &Error) {
        tracing::error!("{}: transport error: {}", self.port, error);
        self.broadcast(ClientEvent::SerialError {
            message: error.to_string(),
        });
        self.shutdown();
    }

    pub(crate) fn shutdown(&mut self) {
        self.broadcast(ClientEvent::SerialClose {
            port: self.port.clone(),
        });
        if let Err(e) = self.link.disconnect() {
            tracing::warn!("{}: error closing port: {}", self.port, e);
        }
    }

    pub(crate) fn snapshot(&self) -> SharedSnapshot {
        SharedSnapshot {
            workflow: self.workflow,
            ready: self.ready,
            firmware: ControllerType::TinyG2,
            feeder: self.feeder.status(),
            sender: self.sender.status(),
        }
    }
}

/// Event loop for one TinyG2 controller
async fn run_loop(
    mut session: TinyG2Session,
    mut msg_rx: mpsc::UnboundedReceiver<ControllerMsg>,
    shared: Arc<RwLock<SharedSnapshot>>,
    closed: Arc<AtomicBool>,
    registry: Arc<ControllerRegistry>,
    me: Weak<TinyG2Controller>,
    port: String,
) {
    let unregister = |registry: &ControllerRegistry| {
        if let Some(me) = me.upgrade() {
            registry.unregister_instance(&port, &(me as Arc<dyn Controller>));
        }
    };
    let loop_delay = Duration::from_millis(10);
    let mut read_buffer = String::new();
    session.start(Instant::now());

    'outer: loop {
        // Command phase
        while let Ok(msg) = msg_rx.try_recv() {
            match msg {
                ControllerMsg::Command {
                    client,
                    command,
                    reply,
                } => {
                    let name = command.name();
                    let result = session.handle_command(client, command, Instant::now()).await;
                    if let Err(e) = &result {
                        tracing::error!("{}: command {} failed: {}", port, name, e);
                    }
                    let _ = reply.send(result);
                }
                ControllerMsg::Write {
                    client,
                    data,
                    reply,
                } => {
                    session.handle_write(client, &data);
                    let _ = reply.send(Ok(()));
                }
                ControllerMsg::AddConnection(handle) => session.add_connection(handle),
                ControllerMsg::RemoveConnection(id) => session.remove_connection(id),
                ControllerMsg::Close { reply } => {
                    session.shutdown();
                    unregister(&registry);
                    closed.store(true, Ordering::SeqCst);
                    let _ = reply.send(());
                    break 'outer;
                }
            }
        }

        // Read phase
        match session.receive() {
            Ok(data) if !data.is_empty() => {
                read_buffer.push_str(&String::from_utf8_lossy(&data));
                while let Some(pos) = read_buffer.find('\n') {
                    let line = read_buffer[..pos].trim().to_string();
                    read_buffer.drain(..=pos);
                    if !line.is_empty() {
                        session.on_serial_line(&line);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                session.on_transport_error(&e);
                unregister(&registry);
                closed.store(true, Ordering::SeqCst);
                break 'outer;
            }
        }

        // Timer phase
        session.tick(Instant::now());
        *shared.write() = session.snapshot();

        tokio::time::sleep(loop_delay).await;
    }

    *shared.write() = session.snapshot();
    tracing::info!("{}: controller loop stopped", port);
}

/// TinyG2 controller handle
///
/// Created by [`TinyG2Controller::open`]; every method exchanges
/// messages with the controller's event-loop task.
pub struct TinyG2Controller {
    port: String,
    msg_tx: mpsc::UnboundedSender<ControllerMsg>,
    shared: Arc<RwLock<SharedSnapshot>>,
    closed: Arc<AtomicBool>,
    close_requested: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TinyG2Controller {
    /// Open a serial port and register the controller
    pub fn open(
        params: ConnectionParams,
        config: TinyG2Config,
        registry: Arc<ControllerRegistry>,
        services: ControllerServices,
    ) -> Result<Arc<Self>> {
        let mut link = SerialCommunicator::new();
        link.connect(&params)?;
        Self::open_with_link(Box::new(link), &params.port, config, registry, services)
    }

    /// Register a controller over an already-connected link
    pub fn open_with_link(
        link: Box<dyn Communicator>,
        port: &str,
        config: TinyG2Config,
        registry: Arc<ControllerRegistry>,
        services: ControllerServices,
    ) -> Result<Arc<Self>> {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(RwLock::new(SharedSnapshot {
            firmware: ControllerType::TinyG2,
            ..Default::default()
        }));
        let closed = Arc::new(AtomicBool::new(false));

        let controller = Arc::new(Self {
            port: port.to_string(),
            msg_tx,
            shared: shared.clone(),
            closed: closed.clone(),
            close_requested: AtomicBool::new(false),
            task: Mutex::new(None),
        });

        registry.register(port, controller.clone());

        let session = TinyG2Session::new(port.to_string(), link, config, services);
        let task = tokio::spawn(run_loop(
            session,
            msg_rx,
            shared,
            closed,
            registry.clone(),
            Arc::downgrade(&controller),
            port.to_string(),
        ));
        *controller.task.lock() = Some(task);

        tracing::info!("{}: TinyG2 controller opened", port);
        Ok(controller)
    }
}

#[async_trait]
impl Controller for TinyG2Controller {
    fn controller_type(&self) -> ControllerType {
        ControllerType::TinyG2
    }

    fn port(&self) -> &str {
        &self.port
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn is_ready(&self) -> bool {
        self.shared.read().ready
    }

    fn workflow_state(&self) -> WorkflowState {
        self.shared.read().workflow
    }

    fn sender_status(&self) -> SenderStatus {
        self.shared.read().sender.clone()
    }

    fn feeder_status(&self) -> FeederStatus {
        self.shared.read().feeder
    }

    fn add_connection(&self, client: ClientHandle) {
        let _ = self.msg_tx.send(ControllerMsg::AddConnection(client));
    }

    fn remove_connection(&self, id: ClientId) {
        let _ = self.msg_tx.send(ControllerMsg::RemoveConnection(id));
    }

    async fn command(&self, client: Option<ClientId>, command: Command) -> Result<()> {
        if !self.is_open() {
            return Err(CommandError::ControllerClosed.into());
        }
        let (reply, rx) = oneshot::channel();
        self.msg_tx
            .send(ControllerMsg::Command {
                client,
                command,
                reply,
            })
            .map_err(|_| Error::from(CommandError::ControllerClosed))?;
        rx.await.map_err(|_| CommandError::ControllerClosed)?
    }

    async fn write(&self, client: Option<ClientId>, data: String) -> Result<()> {
        if !self.is_open() {
            return Err(CommandError::ControllerClosed.into());
        }
        let (reply, rx) = oneshot::channel();
        self.msg_tx
            .send(ControllerMsg::Write {
                client,
                data,
                reply,
            })
            .map_err(|_| Error::from(CommandError::ControllerClosed))?;
        rx.await.map_err(|_| CommandError::ControllerClosed)?
    }

    async fn close(&self) {
        if self.close_requested.swap(true, Ordering::SeqCst) {
            tracing::warn!("{}: close on an already-closed controller", self.port);
            return;
        }
        let (reply, rx) = oneshot::channel();
        if self.msg_tx.send(ControllerMsg::Close { reply }).is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await.map_err(|e| {
                tracing::warn!("{}: loop task join failed: {}", self.port, e);
            });
        }
        tracing::info!("{}: controller closed", self.port);
    }
}
