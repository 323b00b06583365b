//! GRBL Controller Implementation
//!
//! Drives GRBL and Smoothieware devices over one serial link: the
//! character-counting job stream, the interactive feeder, the periodic
//! status/parser-state query timer, and the fan-out of device responses
//! to subscribed clients.
//!
//! All protocol state lives in [`GrblSession`] and is mutated only from
//! the controller's event-loop task; the public [`GrblController`]
//! handle exchanges messages with that task.

use super::constants;
use super::response_parser::{GrblResponse, GrblResponseParser, StatusReport};
use crate::communication::{Communicator, ConnectionParams, SerialCommunicator};
use crate::connection::{ClientHandle, ClientId, Connections};
use crate::feeder::{FeedItem, Feeder};
use crate::firmware::{
    Command, Controller, ControllerMsg, ControllerServices, SharedSnapshot,
};
use crate::registry::ControllerRegistry;
use crate::sender::CharCountSender;
use async_trait::async_trait;
use cncbridge_core::{
    ClientEvent, CommandError, ControllerType, Error, FeederStatus, GrblMachineState,
    MachineStateSnapshot, Result, SenderStatus, WorkflowState,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Tunables for the GRBL controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrblConfig {
    /// Streaming window for character counting, strictly less than the
    /// device receive buffer
    pub rx_buffer_size: usize,
    /// Query timer tick in milliseconds
    pub query_interval_ms: u64,
    /// Minimum interval between `$G` polls in milliseconds
    pub parser_state_interval_ms: u64,
    /// Settle time after open before the version probe, milliseconds
    pub startup_delay_ms: u64,
    /// Delay between hold and soft reset in the stop sequence, milliseconds
    pub stop_reset_delay_ms: u64,
}

impl Default for GrblConfig {
    fn default() -> Self {
        Self {
            rx_buffer_size: constants::STREAMING_BUFFER_SIZE,
            query_interval_ms: constants::QUERY_INTERVAL_MS,
            parser_state_interval_ms: constants::PARSER_STATE_INTERVAL_MS,
            startup_delay_ms: constants::STARTUP_DELAY_MS,
            stop_reset_delay_ms: constants::STOP_RESET_DELAY_MS,
        }
    }
}

/// Actions scheduled for a later loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deferred {
    /// Write the `version` probe that fingerprints Smoothieware
    VersionProbe,
    /// Declare initialisation finished
    MarkReady,
    /// Soft reset, second half of the stop sequence
    SoftReset,
}

/// Protocol state machine for one GRBL/Smoothieware device
pub(crate) struct GrblSession {
    port: String,
    link: Box<dyn Communicator>,
    parser: GrblResponseParser,
    feeder: Feeder,
    sender: CharCountSender,
    connections: Connections,
    services: ControllerServices,
    config: GrblConfig,

    workflow: WorkflowState,
    firmware: ControllerType,
    machine: GrblMachineState,
    published_machine: GrblMachineState,
    ready: bool,

    status_in_flight: bool,
    parserstate_in_flight: bool,
    parserstate_awaiting_ok: bool,
    last_parserstate_query: Option<Instant>,
    last_query: Option<Instant>,

    deferred: Vec<(Instant, Deferred)>,
}

impl GrblSession {
    pub(crate) fn new(
        port: String,
        link: Box<dyn Communicator>,
        config: GrblConfig,
        services: ControllerServices,
    ) -> Self {
        Self {
            port,
            link,
            parser: GrblResponseParser::new(),
            feeder: Feeder::new(),
            sender: CharCountSender::new(config.rx_buffer_size),
            connections: Connections::new(),
            services,
            config,
            workflow: WorkflowState::Idle,
            firmware: ControllerType::Grbl,
            machine: GrblMachineState::default(),
            published_machine: GrblMachineState::default(),
            ready: false,
            status_in_flight: false,
            parserstate_in_flight: false,
            parserstate_awaiting_ok: false,
            last_parserstate_query: None,
            last_query: None,
            deferred: Vec::new(),
        }
    }

    /// Kick off initialisation: settle, probe for Smoothieware, go ready
    pub(crate) fn start(&mut self, now: Instant) {
        self.broadcast(ClientEvent::SerialOpen {
            port: self.port.clone(),
        });
        self.schedule(
            now + Duration::from_millis(self.config.startup_delay_ms),
            Deferred::VersionProbe,
        );
        self.schedule(
            now + Duration::from_millis(
                self.config.startup_delay_ms + constants::VERSION_PROBE_SETTLE_MS,
            ),
            Deferred::MarkReady,
        );
    }

    fn schedule(&mut self, at: Instant, action: Deferred) {
        self.deferred.push((at, action));
    }

    /// Run every deferred action that has come due
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
                Deferred::VersionProbe => self.writeln("version"),
                Deferred::MarkReady => self.ready = true,
                Deferred::SoftReset => self.write_realtime(constants::SOFT_RESET),
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

    fn writeln(&mut self, data: &str) {
        if !self.link.is_connected() {
            tracing::warn!("{}: write of {:?} while port closed, dropped", self.port, data);
            return;
        }
        if let Err(e) = self.link.send_command(data) {
            tracing::error!("{}: write failed: {}", self.port, e);
        }
    }

    fn write_realtime(&mut self, byte: u8) {
        if !self.link.is_connected() {
            tracing::warn!(
                "{}: realtime write 0x{:02X} while port closed, dropped",
                self.port,
                byte
            );
            return;
        }
        if let Err(e) = self.link.send(&[byte]) {
            tracing::error!("{}: realtime write failed: {}", self.port, e);
        }
    }

    /// Emit every job line that fits the streaming window
    fn flush_sender(&mut self) {
        for line in self.sender.next() {
            tracing::debug!("{}: > {}", self.port, line);
            if let Err(e) = self.link.send_command(&line) {
                tracing::error!("{}: job write failed: {}", self.port, e);
            }
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
            if constants::is_realtime_command(&line) {
                self.write_realtime(line.as_bytes()[0]);
                self.broadcast(ClientEvent::SerialWrite { data: line });
            } else {
                self.writeln(&line);
                self.broadcast(ClientEvent::SerialWrite {
                    data: format!("{}\n", line),
                });
            }
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
            GrblResponse::Ok => self.on_ok(),
            GrblResponse::Error { message, .. } => self.on_error(&message, line),
            GrblResponse::Status(report) => self.on_status(report, line),
            GrblResponse::ParserState { modal } => self.on_parser_state(&modal, line),
            GrblResponse::Startup { version } => {
                tracing::info!("{}: startup banner: {}", self.port, version);
                self.firmware = ControllerType::Grbl;
                self.status_in_flight = false;
                self.parserstate_in_flight = false;
                self.parserstate_awaiting_ok = false;
                self.broadcast_read(line);
            }
            GrblResponse::SmoothieVersion => {
                tracing::info!("{}: Smoothieware fingerprint detected", self.port);
                self.firmware = ControllerType::Smoothie;
                self.broadcast_read(line);
            }
            GrblResponse::Alarm { .. }
            | GrblResponse::Parameters
            | GrblResponse::Feedback
            | GrblResponse::Setting { .. }
            | GrblResponse::Message => self.broadcast_read(line),
        }
    }

    fn on_ok(&mut self) {
        // The ok that terminates a `$G` report belongs to the query, not
        // to a queued line.
        if self.parserstate_awaiting_ok {
            self.parserstate_awaiting_ok = false;
            self.connections.clear_matching("$G");
            return;
        }
        if self.workflow == WorkflowState::Running {
            self.sender.ack();
            self.flush_sender();
            return;
        }
        self.broadcast_read("ok");
        self.advance_feeder();
    }

    fn on_error(&mut self, message: &str, raw: &str) {
        if self.workflow == WorkflowState::Running {
            let errored = self
                .sender
                .line_at(self.sender.received())
                .unwrap_or_default()
                .to_string();
            self.broadcast_read(format!("> {}", errored));
            self.broadcast_read(format!(
                "error={}, line={}",
                message,
                self.sender.received() + 1
            ));
            // The erroring line still occupies an acknowledgement slot
            self.sender.ack();
            self.flush_sender();
            return;
        }
        self.broadcast_read(raw);
        self.advance_feeder();
    }

    fn on_status(&mut self, report: StatusReport, raw: &str) {
        self.status_in_flight = false;

        self.machine.active_state = report.state;
        if let Some(pos) = report.machine_pos {
            self.machine.machine_pos = pos;
        }
        if let Some(pos) = report.work_pos {
            self.machine.work_pos = pos;
        }
        if report.work_coord_offset.is_some() {
            self.machine.work_coord_offset = report.work_coord_offset;
        }
        if report.feed_rate.is_some() {
            self.machine.feed_rate = report.feed_rate;
        }
        if report.spindle_speed.is_some() {
            self.machine.spindle_speed = report.spindle_speed;
        }
        if report.buffer.is_some() {
            self.machine.buffer = report.buffer;
        }

        // Status reports answer either the query timer or a client's own
        // `?`; they are routed, never broadcast.
        self.connections.route_matching(
            "?",
            ClientEvent::SerialRead {
                data: raw.to_string(),
            },
            true,
        );
    }

    fn on_parser_state(&mut self, modal: &str, raw: &str) {
        self.parserstate_in_flight = false;
        self.parserstate_awaiting_ok = true;
        self.machine.parser_state = Some(modal.to_string());

        // The correlation is kept until the trailing ok arrives.
        self.connections.route_matching(
            "$G",
            ClientEvent::SerialRead {
                data: raw.to_string(),
            },
            false,
        );
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
                self.workflow = WorkflowState::Running;
                self.sender.rewind();
                self.flush_sender();
                Ok(())
            }
            Command::Stop => {
                self.workflow = WorkflowState::Idle;
                self.sender.rewind();
                let active = self.machine.active_state.as_str();
                if self.firmware == ControllerType::Grbl && active == "Run" {
                    self.write_realtime(constants::FEED_HOLD);
                    self.schedule(
                        now + Duration::from_millis(self.config.stop_reset_delay_ms),
                        Deferred::SoftReset,
                    );
                } else if self.firmware == ControllerType::Smoothie && active == "Hold" {
                    self.write_realtime(constants::CYCLE_START);
                    self.schedule(
                        now + Duration::from_millis(self.config.stop_reset_delay_ms),
                        Deferred::SoftReset,
                    );
                } else {
                    self.write_realtime(constants::SOFT_RESET);
                }
                Ok(())
            }
            Command::Pause => {
                if self.workflow == WorkflowState::Running {
                    self.workflow = WorkflowState::Paused;
                }
                self.write_realtime(constants::FEED_HOLD);
                Ok(())
            }
            Command::Resume => {
                self.write_realtime(constants::CYCLE_START);
                if self.workflow == WorkflowState::Paused {
                    self.workflow = WorkflowState::Running;
                    self.flush_sender();
                }
                Ok(())
            }
            Command::Reset => {
                if self.workflow != WorkflowState::Idle {
                    self.workflow = WorkflowState::Idle;
                    self.sender.rewind();
                }
                self.write_realtime(constants::SOFT_RESET);
                Ok(())
            }
            Command::Unlock => {
                self.writeln("$X");
                Ok(())
            }
            Command::Homing => {
                self.writeln("$H");
                Ok(())
            }
            Command::Check => {
                self.writeln("$C");
                Ok(())
            }
            Command::Gcode { line } => {
                self.feeder.feed(FeedItem { client, line });
                if !self.feeder.is_pending() {
                    self.advance_feeder();
                }
                Ok(())
            }
            Command::QueueFlush | Command::KillJob => Err(CommandError::Unsupported {
                firmware: self.firmware.to_string(),
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
        if constants::is_realtime_command(data.trim_end_matches('\n')) {
            self.write_realtime(data.trim_end_matches('\n').as_bytes()[0]);
            self.broadcast(ClientEvent::SerialWrite {
                data: data.to_string(),
            });
            return;
        }
        let line = data.trim_end_matches('\n');
        self.writeln(line);
        self.broadcast(ClientEvent::SerialWrite {
            data: format!("{}\n", line),
        });
    }

    /// One iteration of the timers: deferred actions, the query cycle,
    /// status publication, and job-completion detection
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

        // One `?` in flight at a time
        if !self.status_in_flight {
            self.status_in_flight = true;
            self.write_realtime(constants::STATUS_QUERY);
        }

        // `$G` polls are additionally throttled and must not overlap the
        // report/ok pair of the previous poll
        if !self.parserstate_in_flight && !self.parserstate_awaiting_ok {
            let throttled = self.last_parserstate_query.map_or(false, |t| {
                (now.duration_since(t).as_millis() as u64) < self.config.parser_state_interval_ms
            });
            if !throttled {
                self.parserstate_in_flight = true;
                self.last_parserstate_query = Some(now);
                self.writeln("$G");
            }
        }

        if self.feeder.peek() {
            self.broadcast(ClientEvent::FeederStatus(self.feeder.status()));
        }
        if self.sender.peek() {
            self.broadcast(ClientEvent::SenderStatus(self.sender.status()));
        }
        if self.machine != self.published_machine && !self.machine.is_empty() {
            self.published_machine = self.machine.clone();
            self.broadcast(ClientEvent::MachineState {
                firmware: self.firmware,
                state: MachineStateSnapshot::Grbl(self.machine.clone()),
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
                    firmware: self.firmware,
                    state: MachineStateSnapshot::Grbl(self.machine.clone()),
                },
            );
            self.connections
                .send_to(id, ClientEvent::SenderStatus(self.sender.status()));
        }
    }

    pub(crate) fn remove_connection(&mut self, id: ClientId) {
        self.connections.remove(id);
    }

    /// Transport failure: tell the clients, then drop the link
    pub(crate) fn on_transport_error(&mut self, error: &Error) {
        tracing::error!("{}: transport error: {}", self.port, error);
        self.broadcast(ClientEvent::SerialError {
            message: error.to_string(),
        });
        self.shutdown();
    }

    /// Tear down: announce the close and drop the link
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
            firmware: self.firmware,
            feeder: self.feeder.status(),
            sender: self.sender.status(),
        }
    }
}

/// Event loop for one GRBL controller
async fn run_loop(
    mut session: GrblSession,
    mut msg_rx: mpsc::UnboundedReceiver<ControllerMsg>,
    shared: Arc<RwLock<SharedSnapshot>>,
    closed: Arc<AtomicBool>,
    registry: Arc<ControllerRegistry>,
    me: Weak<GrblController>,
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

/// GRBL controller handle
///
/// Created by [`GrblController::open`]; every method exchanges messages
/// with the controller's event-loop task.
pub struct GrblController {
    port: String,
    msg_tx: mpsc::UnboundedSender<ControllerMsg>,
    shared: Arc<RwLock<SharedSnapshot>>,
    closed: Arc<AtomicBool>,
    close_requested: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GrblController {
    /// Open a serial port and register the controller
    pub fn open(
        params: ConnectionParams,
        config: GrblConfig,
        registry: Arc<ControllerRegistry>,
        services: ControllerServices,
    ) -> Result<Arc<Self>> {
        let mut link = SerialCommunicator::new();
        link.connect(&params)?;
        Self::open_with_link(Box::new(link), &params.port, config, registry, services)
    }

    /// Register a controller over an already-connected link
    ///
    /// This is the seam tests (and alternative transports) use.
    pub fn open_with_link(
        link: Box<dyn Communicator>,
        port: &str,
        config: GrblConfig,
        registry: Arc<ControllerRegistry>,
        services: ControllerServices,
    ) -> Result<Arc<Self>> {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(RwLock::new(SharedSnapshot::default()));
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

        let session = GrblSession::new(port.to_string(), link, config, services);
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

        tracing::info!("{}: GRBL controller opened", port);
        Ok(controller)
    }
}

#[async_trait]
impl Controller for GrblController {
    fn controller_type(&self) -> ControllerType {
        self.shared.read().firmware
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

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::collections::VecDeque;

    /// Scripted link capturing writes and replaying queued device output
    struct MockLink {
        writes: Arc<PlMutex<Vec<Vec<u8>>>>,
        replies: Arc<PlMutex<VecDeque<Vec<u8>>>>,
        connected: bool,
    }

    impl MockLink {
        fn new() -> (Self, Arc<PlMutex<Vec<Vec<u8>>>>, Arc<PlMutex<VecDeque<Vec<u8>>>>) {
            let writes = Arc::new(PlMutex::new(Vec::new()));
            let replies = Arc::new(PlMutex::new(VecDeque::new()));
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

    impl Communicator for MockLink {
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

    fn written(writes: &Arc<PlMutex<Vec<Vec<u8>>>>) -> String {
        let writes = writes.lock();
        writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).to_string())
            .collect::<Vec<_>>()
            .join("")
    }

    fn session_with_mock() -> (GrblSession, Arc<PlMutex<Vec<Vec<u8>>>>) {
        let (link, writes, _replies) = MockLink::new();
        let session = GrblSession::new(
            "/dev/ttyUSB0".to_string(),
            Box::new(link),
            GrblConfig::default(),
            ControllerServices::local(),
        );
        (session, writes)
    }

    async fn load_and_start(session: &mut GrblSession, gcode: &str) {
        session
            .handle_command(
                None,
                Command::Load {
                    name: "job".to_string(),
                    gcode: gcode.to_string(),
                },
                Instant::now(),
            )
            .await
            .unwrap();
        session
            .handle_command(None, Command::Start, Instant::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_streams_whole_window() {
        let (mut session, writes) = session_with_mock();
        load_and_start(&mut session, "G1 X10\nG1 Y20\nG1 Z5\n").await;

        assert_eq!(written(&writes), "G1 X10\nG1 Y20\nG1 Z5\n");
        assert_eq!(session.sender.bytes_in_flight(), 23);
        assert_eq!(session.workflow, WorkflowState::Running);

        session.on_serial_line("ok");
        session.on_serial_line("ok");
        session.on_serial_line("ok");
        assert_eq!(session.sender.received(), 3);
        assert_eq!(session.sender.bytes_in_flight(), 0);

        session.tick(Instant::now());
        assert_eq!(session.workflow, WorkflowState::Idle);
    }

    #[tokio::test]
    async fn test_window_refills_on_ack() {
        let (link, writes, _replies) = MockLink::new();
        let config = GrblConfig {
            rx_buffer_size: 10,
            ..Default::default()
        };
        let mut session = GrblSession::new(
            "/dev/ttyUSB0".to_string(),
            Box::new(link),
            config,
            ControllerServices::local(),
        );
        load_and_start(&mut session, "123456789\nG0 X0\n").await;

        // First line fills the window exactly; the second must wait.
        assert_eq!(written(&writes), "123456789\n");

        session.on_serial_line("ok");
        assert_eq!(written(&writes), "123456789\nG0 X0\n");
    }

    #[tokio::test]
    async fn test_error_while_running_continues_job() {
        let (mut session, _writes) = session_with_mock();
        let (client, mut rx) = ClientHandle::new();
        session.add_connection(client);
        load_and_start(&mut session, "G1 X10\nG1 Y20\n").await;

        // Drain the connection events so far
        while rx.try_recv().is_ok() {}

        session.on_serial_line("error:20");

        let mut reads = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ClientEvent::SerialRead { data } = event {
                reads.push(data);
            }
        }
        assert_eq!(reads[0], "> G1 X10");
        assert!(reads[1].starts_with("error=Unsupported or invalid g-code"));
        assert!(reads[1].ends_with("line=1"));

        // The erroring line consumed its slot; the job advanced
        assert_eq!(session.sender.received(), 1);
    }

    #[tokio::test]
    async fn test_ok_outside_job_drives_feeder() {
        let (mut session, writes) = session_with_mock();
        session
            .handle_command(
                None,
                Command::Gcode {
                    line: "G0 X1".to_string(),
                },
                Instant::now(),
            )
            .await
            .unwrap();
        session
            .handle_command(
                None,
                Command::Gcode {
                    line: "G0 X2".to_string(),
                },
                Instant::now(),
            )
            .await
            .unwrap();

        // Only the first line goes out until its ok arrives
        assert_eq!(written(&writes), "G0 X1\n");
        session.on_serial_line("ok");
        assert_eq!(written(&writes), "G0 X1\nG0 X2\n");
    }

    #[tokio::test]
    async fn test_stop_while_run_holds_then_resets() {
        let (mut session, writes) = session_with_mock();
        load_and_start(&mut session, "G1 X10\n").await;
        session.on_serial_line("<Run|MPos:0.000,0.000,0.000>");

        let start = Instant::now();
        session
            .handle_command(None, Command::Stop, start)
            .await
            .unwrap();
        assert_eq!(session.workflow, WorkflowState::Idle);
        assert_eq!(session.sender.sent(), 0);
        assert!(written(&writes).ends_with("!"));

        // Soft reset fires 50 ms later
        session.tick(start + Duration::from_millis(60));
        assert!(written(&writes).ends_with("\u{18}"));
    }

    #[tokio::test]
    async fn test_stop_while_idle_resets_immediately() {
        let (mut session, writes) = session_with_mock();
        session.on_serial_line("<Idle|MPos:0.000,0.000,0.000>");
        session
            .handle_command(None, Command::Stop, Instant::now())
            .await
            .unwrap();
        assert!(written(&writes).ends_with("\u{18}"));
    }

    #[tokio::test]
    async fn test_pause_resume_round_trip() {
        let (mut session, writes) = session_with_mock();
        load_and_start(&mut session, "G1 X10\nG1 Y20\nG1 Z5\n").await;
        session
            .handle_command(None, Command::Pause, Instant::now())
            .await
            .unwrap();
        assert_eq!(session.workflow, WorkflowState::Paused);
        assert!(written(&writes).ends_with("!"));

        let sent_before = session.sender.sent();
        session
            .handle_command(None, Command::Resume, Instant::now())
            .await
            .unwrap();
        assert_eq!(session.workflow, WorkflowState::Running);
        // No duplicate emission: the window was already full
        assert_eq!(session.sender.sent(), sent_before);
        assert!(written(&writes).ends_with("~"));
    }

    #[tokio::test]
    async fn test_query_timer_status_gating() {
        let (mut session, writes) = session_with_mock();
        session.ready = true;

        let t0 = Instant::now();
        session.tick(t0);
        assert!(written(&writes).contains('?'));
        let count = writes.lock().len();

        // No second ? until the first status arrives
        session.tick(t0 + Duration::from_millis(300));
        let only_gs: usize = writes.lock().len() - count;
        assert_eq!(only_gs, 0);

        session.on_serial_line("<Idle|MPos:0.000,0.000,0.000>");
        session.tick(t0 + Duration::from_millis(600));
        assert!(written(&writes).matches('?').count() >= 2);
    }

    #[tokio::test]
    async fn test_parser_state_query_routing() {
        let (mut session, _writes) = session_with_mock();
        let (client_a, mut rx_a) = ClientHandle::new();
        let (client_b, mut rx_b) = ClientHandle::new();
        let id_a = client_a.id();
        session.add_connection(client_a);
        session.add_connection(client_b);
        while rx_a.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}

        // Client A asks for the parser state
        session.handle_write(Some(id_a), "$G\n");
        while rx_a.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}

        session.on_serial_line("[GC:G0 G54 G17 G21 G90 G94 M5 M9 T0 F0 S0]");

        // Only A receives the report
        assert!(matches!(
            rx_a.try_recv(),
            Ok(ClientEvent::SerialRead { .. })
        ));
        assert!(rx_b.try_recv().is_err());

        // The trailing ok is consumed, not broadcast
        session.on_serial_line("ok");
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_smoothie_fingerprint_switches_firmware() {
        let (mut session, _writes) = session_with_mock();
        assert_eq!(session.firmware, ControllerType::Grbl);

        session.on_serial_line("Build version: edge-94de12c, Build date: Jan 1 2020");
        assert_eq!(session.firmware, ControllerType::Smoothie);

        // A GRBL banner takes it back
        session.on_serial_line("Grbl 1.1f ['$' for help]");
        assert_eq!(session.firmware, ControllerType::Grbl);
    }

    #[tokio::test]
    async fn test_alarm_broadcast_to_all_clients() {
        let (mut session, _writes) = session_with_mock();
        let (client_a, mut rx_a) = ClientHandle::new();
        let (client_b, mut rx_b) = ClientHandle::new();
        session.add_connection(client_a);
        session.add_connection(client_b);
        while rx_a.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}

        session.on_serial_line("ALARM:1");

        assert!(matches!(
            rx_a.try_recv(),
            Ok(ClientEvent::SerialRead { data }) if data == "ALARM:1"
        ));
        assert!(matches!(
            rx_b.try_recv(),
            Ok(ClientEvent::SerialRead { data }) if data == "ALARM:1"
        ));
    }

    #[tokio::test]
    async fn test_load_empty_program_fails() {
        let (mut session, _writes) = session_with_mock();
        let result = session
            .handle_command(
                None,
                Command::Load {
                    name: "empty".to_string(),
                    gcode: "".to_string(),
                },
                Instant::now(),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(session.sender.total(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_commands_rejected() {
        let (mut session, _writes) = session_with_mock();
        let result = session
            .handle_command(None, Command::QueueFlush, Instant::now())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_initialisation_probe() {
        let (link, writes, _replies) = MockLink::new();
        let registry = Arc::new(ControllerRegistry::new());
        let controller = GrblController::open_with_link(
            Box::new(link),
            "/dev/ttyUSB0",
            GrblConfig::default(),
            registry.clone(),
            ControllerServices::local(),
        )
        .unwrap();

        assert!(registry.get("/dev/ttyUSB0").is_some());
        assert!(!controller.is_ready());

        // The version probe goes out after the settle delay, then the
        // controller declares itself ready.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(written(&writes).contains("version\n"));
        assert!(controller.is_ready());

        controller.close().await;
        assert!(!controller.is_open());
        assert!(registry.get("/dev/ttyUSB0").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let (link, _writes, _replies) = MockLink::new();
        let registry = Arc::new(ControllerRegistry::new());
        let controller = GrblController::open_with_link(
            Box::new(link),
            "/dev/ttyUSB0",
            GrblConfig::default(),
            registry.clone(),
            ControllerServices::local(),
        )
        .unwrap();

        controller.close().await;
        controller.close().await;
        assert!(!controller.is_open());

        let result = controller.command(None, Command::Start).await;
        assert!(result.is_err());
    }
}
