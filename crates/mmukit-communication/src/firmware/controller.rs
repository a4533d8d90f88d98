//! Device controller
//!
//! Provides the connection lifecycle, the background reader, the watchdog,
//! and the synchronous command/response correlation for the filament
//! changer.
//!
//! Three background threads share one serial link: the reader (continuous
//! receive loop), the watchdog (liveness timer fed only by state
//! broadcasts), and, while disconnected, the connector (retry loop). All
//! are cooperatively stoppable through one shared stop flag and are joined
//! in a fixed order (connector, watchdog, reader) before the link handle
//! is released, so no task ever touches a dead handle.

use crate::communication::{ConnectionParams, LinkOpener, LinkReader, SerialLinkOpener};
use crate::firmware::commands;
use crate::firmware::config_sync::{ConfigSync, SyncStage};
use crate::firmware::response_parser::{
    self, ActionRequest, ConfigCategory, DeviceResponse,
};
use crate::firmware::status_parser::StateReport;
use crate::firmware::telemetry::ToolChangeStats;
use mmukit_core::{DeviceListener, DeviceState, FirmwareInfo, NoOpListener};
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Timing configuration of the controller
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ControllerConfig {
    /// Serial connection parameters
    pub connection: ConnectionParams,
    /// Timeout for ordinary commands
    pub command_timeout: Duration,
    /// Timeout for tool change commands
    pub tool_change_timeout: Duration,
    /// Watchdog window while no command is in flight
    pub watchdog_timeout: Duration,
    /// Backoff between connector retry attempts
    pub retry_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionParams::default(),
            command_timeout: Duration::from_secs(25),
            tool_change_timeout: Duration::from_secs(90),
            watchdog_timeout: Duration::from_secs(60),
            retry_interval: Duration::from_secs(3),
        }
    }
}

/// Manual-reset event: `set` wakes all waiters and stays set until `clear`.
struct Signal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn set(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.cond.notify_all();
    }

    fn clear(&self) {
        *self.flag.lock() = false;
    }

    /// Wait until set or until `timeout` elapses; returns the flag state.
    fn wait(&self, timeout: Duration) -> bool {
        let mut flag = self.flag.lock();
        if !*flag {
            self.cond.wait_for(&mut flag, timeout);
        }
        *flag
    }
}

/// The one in-flight request (commands are strictly serialized).
#[derive(Default)]
struct PendingCommand {
    /// Leading token of the command, used for terminator matching
    sent_token: Option<String>,
    /// Response lines received before the terminator
    fragments: Vec<String>,
    /// Set when a terminator (or error, or shutdown) resolved the command
    done: bool,
    /// The resolved payload; `None` on error
    result: Option<String>,
}

impl PendingCommand {
    fn resolve_failed(&mut self) {
        self.sent_token = None;
        self.result = None;
        self.done = true;
    }
}

struct Inner {
    config: ControllerConfig,
    opener: Box<dyn LinkOpener>,
    listener: Box<dyn DeviceListener>,

    state: RwLock<DeviceState>,
    pending: Mutex<PendingCommand>,
    sync: Mutex<ConfigSync>,
    stats: Mutex<ToolChangeStats>,
    json_category: Mutex<Option<ConfigCategory>>,

    writer: Mutex<Option<Box<dyn crate::communication::LinkWriter>>>,

    /// Serializes link setup against teardown
    lifecycle: Mutex<()>,

    stop: AtomicBool,
    closing: AtomicBool,
    connected: AtomicBool,
    busy: AtomicBool,
    error: AtomicBool,
    processing: AtomicBool,
    reconnecting: AtomicBool,
    wait_requested: AtomicBool,
    abort_requested: AtomicBool,

    /// Raised when a command has been resolved
    response_signal: Signal,
    /// Raised on every state broadcast; the watchdog's only food
    broadcast_signal: Signal,
    /// Watchdog window currently in effect
    watchdog_window: Mutex<Duration>,

    reader_task: Mutex<Option<JoinHandle<()>>>,
    watchdog_task: Mutex<Option<JoinHandle<()>>>,
    connector_task: Mutex<Option<JoinHandle<()>>>,
}

/// Synchronous driver for an MMU filament changer
///
/// All public operations are callable from any thread. `send_and_wait` is
/// the only blocking operation and is always timeout bounded. Background
/// failures never propagate as panics or errors across this boundary; they
/// are logged, reported through the listener, and handled by automatic
/// reconnection.
pub struct MmuController {
    inner: Arc<Inner>,
}

impl MmuController {
    /// Create a controller for a real serial port with no listener.
    pub fn new(config: ControllerConfig) -> Self {
        Self::with_parts(config, Box::new(SerialLinkOpener), Box::new(NoOpListener))
    }

    /// Create a controller with an explicit link opener and listener.
    pub fn with_parts(
        config: ControllerConfig,
        opener: Box<dyn LinkOpener>,
        listener: Box<dyn DeviceListener>,
    ) -> Self {
        let watchdog_timeout = config.watchdog_timeout;
        Self {
            inner: Arc::new(Inner {
                config,
                opener,
                listener,
                state: RwLock::new(DeviceState::default()),
                pending: Mutex::new(PendingCommand::default()),
                sync: Mutex::new(ConfigSync::new()),
                stats: Mutex::new(ToolChangeStats::new()),
                json_category: Mutex::new(None),
                writer: Mutex::new(None),
                lifecycle: Mutex::new(()),
                stop: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                busy: AtomicBool::new(false),
                error: AtomicBool::new(false),
                processing: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                wait_requested: AtomicBool::new(false),
                abort_requested: AtomicBool::new(false),
                response_signal: Signal::new(),
                broadcast_signal: Signal::new(),
                watchdog_window: Mutex::new(watchdog_timeout),
                reader_task: Mutex::new(None),
                watchdog_task: Mutex::new(None),
                connector_task: Mutex::new(None),
            }),
        }
    }

    /// Open the link and start the background tasks.
    ///
    /// Returns `false` when the port cannot be opened; the failure is also
    /// reported through the listener. Connecting while already connected
    /// is a no-op returning `true`.
    pub fn connect(&self) -> bool {
        self.inner.closing.store(false, Ordering::Relaxed);
        connect_link(&self.inner)
    }

    /// Stop the background tasks, join them, and release the link.
    ///
    /// Idempotent: closing an already closed controller only logs.
    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::Relaxed);
        if teardown_link(&self.inner, true) {
            tracing::info!("Disconnected from device");
        }
    }

    /// Close and reattempt the connection.
    ///
    /// A no-op while the connector retry loop is already running. When the
    /// direct attempt fails, the connector is started and keeps retrying
    /// in the background until it succeeds or the controller is closed.
    pub fn reconnect(&self) {
        reconnect_link(&self.inner);
    }

    /// True while the link is open.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }

    /// True while the device signals it is busy.
    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Relaxed)
    }

    /// True while a `send_and_wait` call is in flight.
    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Relaxed)
    }

    /// True when the device asked the host to wait.
    pub fn is_wait_requested(&self) -> bool {
        self.inner.wait_requested.load(Ordering::Relaxed)
    }

    /// True when the device aborted the current operation.
    pub fn is_abort_requested(&self) -> bool {
        self.inner.abort_requested.load(Ordering::Relaxed)
    }

    /// Fire-and-forget send. Returns the success of the write itself, not
    /// of the command's execution.
    pub fn send(&self, data: &str) -> bool {
        send_line(&self.inner, data)
    }

    /// Send a command and block until its terminator arrives, the device
    /// reports an error, or the class timeout elapses.
    ///
    /// Tool change commands (`T...`) use the tool change timeout,
    /// everything else the short command timeout. Busy notices extend the
    /// wait instead of failing it. Returns the first response line before
    /// the terminator, or `None` on error or timeout.
    pub fn send_and_wait(&self, data: &str) -> Option<String> {
        send_and_wait(&self.inner, data)
    }

    /// A copy of the current device state snapshot.
    pub fn state(&self) -> DeviceState {
        self.inner.state.read().clone()
    }

    /// The raw firmware identity banner, once received.
    pub fn firmware_info(&self) -> Option<String> {
        let state = self.inner.state.read();
        if state.firmware.is_known() {
            Some(state.firmware.raw.clone())
        } else {
            None
        }
    }

    /// Stage of the post-connect configuration sync.
    pub fn sync_stage(&self) -> SyncStage {
        self.inner.sync.lock().stage()
    }

    /// Begin timing a tool change and count it.
    pub fn start_tool_change_timer(&self) {
        self.inner.stats.lock().start_timer();
    }

    /// Finish timing the current tool change, returning its duration.
    pub fn stop_tool_change_timer(&self) -> Duration {
        self.inner.stats.lock().stop_timer()
    }

    /// Number of tool changes since the last telemetry reset.
    pub fn tool_change_count(&self) -> u32 {
        self.inner.stats.lock().count()
    }

    /// Average tool change duration.
    pub fn average_tool_change(&self) -> Duration {
        self.inner.stats.lock().average()
    }

    /// Zero the tool change telemetry.
    pub fn reset_telemetry(&self) {
        self.inner.stats.lock().reset();
    }

    /// Select a tool.
    pub fn select_tool(&self, tool: i32) -> Option<String> {
        self.send_and_wait(&commands::select_tool(tool))
    }

    /// Cut the filament.
    pub fn cut_filament(&self) -> Option<String> {
        self.send_and_wait(commands::CUT)
    }

    /// Wipe the nozzle.
    pub fn wipe_nozzle(&self) -> Option<String> {
        self.send_and_wait(commands::WIPE)
    }

    /// Open the lid servo.
    pub fn open_lid(&self) -> Option<String> {
        self.send_and_wait(commands::LID_OPEN)
    }

    /// Close the lid servo.
    pub fn close_lid(&self) -> Option<String> {
        self.send_and_wait(commands::LID_CLOSE)
    }

    /// Position a servo; the angle must be between 0 and 180 degrees.
    pub fn set_servo(&self, servo: u8, angle: u8) -> Option<String> {
        if angle > 180 {
            self.inner
                .listener
                .on_message("Servo position must be between 0 and 180.");
            return None;
        }
        self.send_and_wait(&commands::set_servo(servo, angle))
    }

    /// Load filament on the active tool.
    pub fn load_filament(&self) -> Option<String> {
        self.send_and_wait(commands::LOAD_FILAMENT)
    }

    /// Unload filament from the active tool.
    pub fn unload_filament(&self) -> Option<String> {
        self.send_and_wait(commands::UNLOAD_FILAMENT)
    }

    /// Home the selector (and revolver, if configured).
    pub fn home(&self) -> Option<String> {
        self.send_and_wait(commands::HOME)
    }

    /// Turn the stepper motors off.
    pub fn motors_off(&self) -> Option<String> {
        self.send_and_wait(commands::MOTORS_OFF)
    }

    /// Reset the feeder-jammed flag.
    pub fn clear_jam(&self) -> Option<String> {
        self.send_and_wait(commands::CLEAR_JAM)
    }

    /// Turn the housing fan on or off.
    pub fn set_fan(&self, on: bool) -> Option<String> {
        self.send_and_wait(if on { commands::FAN_ON } else { commands::FAN_OFF })
    }

    /// Set a named configuration parameter on the device.
    pub fn set_parameter(&self, name: &str, value: &str) -> Option<String> {
        self.send_and_wait(&commands::set_parameter(name, value))
    }

    /// Reset the device. The response is suppressed from correlation, so
    /// this is fire-and-forget.
    pub fn reset_device(&self) -> bool {
        self.send(commands::RESET)
    }

    /// Render a human readable status block.
    pub fn status_summary(&self) -> String {
        let connected = self.is_connected();
        let mut out = String::new();
        let _ = writeln!(out, "Device Status:");
        let _ = writeln!(out, "Connected:\t{}", yes_no(connected));
        let _ = writeln!(out, "Port:\t\t{}", self.inner.config.connection.port);
        if !connected {
            return out;
        }

        let state = self.state();
        let stats = self.inner.stats.lock();
        let _ = writeln!(out, "------------------------");
        let _ = writeln!(out, "Device name:\t{}", state.device_name);
        let _ = writeln!(out, "Tool count:\t{}", state.tool_count);
        let _ = writeln!(out, "------------------------");
        let active = if state.has_tool() {
            format!("T{}", state.current_tool)
        } else {
            "None".to_string()
        };
        let _ = writeln!(out, "Active tool:\t{}", active);
        let _ = writeln!(out, "Selector:\t{}", triggered(state.selector));
        let _ = writeln!(out, "Feeder:\t\t{}", triggered(state.feeder));
        let _ = writeln!(out, "Feeder 2:\t{}", triggered(state.feeder2));
        let _ = writeln!(
            out,
            "Lid:\t\t{}",
            if state.lid_closed { "CLOSED" } else { "OPENED" }
        );
        if let Some(relay) = state.relay {
            let _ = writeln!(out, "Relay state:\t{}", relay);
        }
        let _ = writeln!(
            out,
            "SD-Card:\t{}",
            if state.sd_removed { "REMOVED" } else { "INSERTED" }
        );
        let _ = writeln!(out, "Idle:\t\t{}", yes_no(state.idle));
        let _ = writeln!(out, "Config changed:\t{}", yes_no(state.config_changed));
        let _ = writeln!(
            out,
            "Feeder loaded:\t{}",
            state.load_state.describe(state.has_splitter)
        );
        let _ = writeln!(out, "Feeder jammed:\t{}", yes_no(state.jammed));
        let _ = writeln!(out, "------------------------");
        let fw = &state.firmware;
        let unknown = || "UNKNOWN".to_string();
        let _ = writeln!(out, "FW-Version:\t{}", fw.version.clone().unwrap_or_else(unknown));
        let _ = writeln!(out, "FW-Board:\t{}", fw.board.clone().unwrap_or_else(unknown));
        let _ = writeln!(out, "FW-Mode:\t{}", fw.mode.clone().unwrap_or_else(unknown));
        let _ = writeln!(
            out,
            "FW-Options:\t{}",
            fw.options
                .clone()
                .map(|o| o.replace('|', ", "))
                .unwrap_or_else(unknown)
        );
        let _ = writeln!(out, "------------------------");
        let _ = writeln!(out, "Tool changes:\t{}", stats.count());
        let _ = writeln!(
            out,
            "Average duration:\t{:.1} s",
            stats.average().as_secs_f64()
        );
        out
    }
}

impl Drop for MmuController {
    fn drop(&mut self) {
        self.close();
    }
}

fn yes_no(v: bool) -> &'static str {
    if v {
        "YES"
    } else {
        "NO"
    }
}

fn triggered(v: bool) -> &'static str {
    if v {
        "TRIGGERED"
    } else {
        "NOT TRIGGERED"
    }
}

/// Open the link, start reader and watchdog, arm the configuration sync,
/// and request periodic state broadcasts.
fn connect_link(inner: &Arc<Inner>) -> bool {
    let _guard = inner.lifecycle.lock();

    if inner.closing.load(Ordering::Relaxed) {
        return false;
    }
    if inner.connected.load(Ordering::Relaxed) {
        tracing::info!("Already connected");
        return true;
    }

    let (reader, writer) = match inner.opener.open(&inner.config.connection) {
        Ok(halves) => halves,
        Err(e) => {
            let msg = format!(
                "Can't open serial port '{}': {}",
                inner.config.connection.port, e
            );
            tracing::error!("{}", msg);
            inner.listener.on_message(&msg);
            return false;
        }
    };

    *inner.state.write() = DeviceState::default();
    *inner.pending.lock() = PendingCommand::default();
    *inner.json_category.lock() = None;
    inner.busy.store(false, Ordering::Relaxed);
    inner.error.store(false, Ordering::Relaxed);
    inner.processing.store(false, Ordering::Relaxed);
    inner.stop.store(false, Ordering::Relaxed);
    inner.response_signal.clear();
    inner.broadcast_signal.clear();
    *inner.watchdog_window.lock() = inner.config.watchdog_timeout;
    *inner.writer.lock() = Some(writer);

    let reader_inner = Arc::clone(inner);
    let reader_task = std::thread::Builder::new()
        .name("mmu-reader".to_string())
        .spawn(move || reader_loop(reader_inner, reader));
    let reader_task = match reader_task {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!("Unable to start serial reader thread: {}", e);
            *inner.writer.lock() = None;
            return false;
        }
    };
    *inner.reader_task.lock() = Some(reader_task);

    let watchdog_inner = Arc::clone(inner);
    let watchdog_task = std::thread::Builder::new()
        .name("mmu-watchdog".to_string())
        .spawn(move || watchdog_loop(watchdog_inner));
    match watchdog_task {
        Ok(handle) => *inner.watchdog_task.lock() = Some(handle),
        Err(e) => {
            // without a watchdog the link would never recover; give up
            tracing::error!("Unable to start serial watchdog thread: {}", e);
            inner.stop.store(true, Ordering::Relaxed);
            *inner.writer.lock() = None;
            if let Some(handle) = inner.reader_task.lock().take() {
                let _ = handle.join();
            }
            return false;
        }
    }

    inner.connected.store(true, Ordering::Relaxed);
    inner.sync.lock().arm();
    send_line(inner, &commands::periodic_states(true));
    tracing::info!(
        "Connected to device on '{}'",
        inner.config.connection.port
    );
    true
}

/// Stop and join the background tasks, then release the link.
///
/// Returns `false` when there was nothing to tear down.
fn teardown_link(inner: &Arc<Inner>, join_connector: bool) -> bool {
    {
        let _guard = inner.lifecycle.lock();
        if !inner.connected.load(Ordering::Relaxed)
            && inner.reader_task.lock().is_none()
            && inner.connector_task.lock().is_none()
        {
            tracing::info!("Link wasn't open, nothing to do here");
            return false;
        }
        inner.stop.store(true, Ordering::Relaxed);
        // release any blocked caller rather than leaving it hung
        inner.pending.lock().resolve_failed();
        inner.response_signal.set();
        inner.broadcast_signal.set();
    }

    if join_connector {
        if let Some(handle) = inner.connector_task.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Serial connector thread panicked");
            }
        }
    }
    if let Some(handle) = inner.watchdog_task.lock().take() {
        if handle.join().is_err() {
            tracing::error!("Serial watchdog thread panicked");
        }
    }
    if let Some(handle) = inner.reader_task.lock().take() {
        if handle.join().is_err() {
            tracing::error!("Serial reader thread panicked");
        }
    }

    let _guard = inner.lifecycle.lock();
    *inner.writer.lock() = None;
    inner.sync.lock().cancel();
    inner.connected.store(false, Ordering::Relaxed);
    true
}

/// Close the current link and try to get a new one.
fn reconnect_link(inner: &Arc<Inner>) {
    if inner.closing.load(Ordering::Relaxed) {
        return;
    }
    if let Some(handle) = &*inner.connector_task.lock() {
        if !handle.is_finished() {
            tracing::info!("Connector already running, aborting reconnect request");
            return;
        }
    }
    if inner.reconnecting.swap(true, Ordering::Relaxed) {
        return;
    }

    teardown_link(inner, false);
    tracing::info!("Attempting a reconnect...");
    if !connect_link(inner) {
        tracing::info!("Still not connected, starting connector");
        start_connector(inner);
    }
    inner.reconnecting.store(false, Ordering::Relaxed);
}

/// Start the connector retry loop.
fn start_connector(inner: &Arc<Inner>) {
    let connector_inner = Arc::clone(inner);
    let handle = std::thread::Builder::new()
        .name("mmu-connector".to_string())
        .spawn(move || connector_loop(connector_inner));
    match handle {
        Ok(handle) => *inner.connector_task.lock() = Some(handle),
        Err(e) => tracing::error!("Unable to start serial connector thread: {}", e),
    }
}

/// Connector retry loop: attempt a connect, back off, repeat.
fn connector_loop(inner: Arc<Inner>) {
    tracing::info!("Entering serial connector thread");

    'retry: loop {
        // stop-aware backoff so close() never waits a full interval
        let mut slept = Duration::ZERO;
        while slept < inner.config.retry_interval {
            if inner.closing.load(Ordering::Relaxed) {
                break 'retry;
            }
            std::thread::sleep(Duration::from_millis(100));
            slept += Duration::from_millis(100);
        }
        if inner.closing.load(Ordering::Relaxed) || connect_link(&inner) {
            break;
        }
        tracing::info!("Serial connector looping...");
    }

    tracing::info!("Shutting down serial connector");
}

/// Watchdog: wait for the broadcast signal; on silence beyond the active
/// window, trigger a reconnect and exit. A fresh watchdog starts with the
/// next successful connect.
fn watchdog_loop(inner: Arc<Inner>) {
    tracing::info!("Entering serial watchdog thread");

    loop {
        if inner.stop.load(Ordering::Relaxed) {
            break;
        }
        inner.broadcast_signal.clear();
        let window = *inner.watchdog_window.lock();
        let alive = inner.broadcast_signal.wait(window);
        if inner.stop.load(Ordering::Relaxed) {
            break;
        }
        if !alive {
            tracing::warn!(
                "Watchdog timed out, no sign of life within {:?}",
                window
            );
            let reconnect_inner = Arc::clone(&inner);
            let spawned = std::thread::Builder::new()
                .name("mmu-reconnect".to_string())
                .spawn(move || reconnect_link(&reconnect_inner));
            if let Err(e) = spawned {
                tracing::error!("Unable to start reconnect thread: {}", e);
            }
            break;
        }
    }

    tracing::info!("Shutting down serial watchdog");
}

/// Reader: poll the link for lines and dispatch each one.
fn reader_loop(inner: Arc<Inner>, mut reader: Box<dyn LinkReader>) {
    tracing::info!("Entering serial reader thread");

    while !inner.stop.load(Ordering::Relaxed) {
        match reader.read_line() {
            Ok(Some(line)) => dispatch_line(&inner, &line),
            Ok(None) => {}
            Err(e) => {
                if inner.stop.load(Ordering::Relaxed) {
                    break;
                }
                tracing::error!("Serial reader failed: {}", e);
                // release any waiter; the watchdog will notice the
                // silence and reconnect
                inner.pending.lock().resolve_failed();
                inner.response_signal.set();
                break;
            }
        }
    }

    tracing::info!("Shutting down serial reader");
    inner.listener.on_status_changed(false);
}

/// Route one classified frame.
fn dispatch_line(inner: &Arc<Inner>, line: &str) {
    let Some(frame) = response_parser::parse(line) else {
        return;
    };

    match frame {
        DeviceResponse::Start => {
            tracing::info!("\"start\" banner received, device has reset");
            // a mid-command reboot resolves the command as failed
            inner.pending.lock().resolve_failed();
            inner.response_signal.set();
            send_line(inner, &commands::periodic_states(true));
        }
        DeviceResponse::PeriodicStateAck => {
            tracing::debug!("Periodic state broadcasts are on");
            let mut sync = inner.sync.lock();
            // never restart a finished sync from a stray acknowledgement
            if sync.stage() == SyncStage::Idle {
                sync.arm();
            }
        }
        DeviceResponse::Debug(text) => {
            tracing::debug!("Device debug: [{}]", text);
        }
        DeviceResponse::StateBroadcast(payload) => {
            let report = StateReport::parse(&payload);
            {
                let mut state = inner.state.write();
                report.apply(&mut state);
            }
            inner.listener.on_status_changed(true);
            inner.broadcast_signal.set();
            drive_sync(inner);
        }
        DeviceResponse::Busy => {
            tracing::debug!("Device sent a busy response");
            inner.listener.on_message("Device is busy");
            inner.busy.store(true, Ordering::Relaxed);
        }
        DeviceResponse::Error {
            message,
            unknown_command,
        } => {
            let text = format!("Device reported an error: [{}]", message);
            tracing::info!("{}", text);
            inner.listener.on_message(&text);
            if unknown_command {
                // the device received garbage; flush both directions
                if let Some(writer) = inner.writer.lock().as_mut() {
                    if let Err(e) = writer.clear() {
                        tracing::warn!("Buffer flush failed: {}", e);
                    }
                }
            }
            inner.error.store(true, Ordering::Relaxed);
            let mut pending = inner.pending.lock();
            if pending.sent_token.is_some() {
                pending.sent_token = None;
                pending.done = true;
            }
        }
        DeviceResponse::Action(action) => handle_action(inner, action),
        DeviceResponse::JsonCategory(category) => {
            *inner.json_category.lock() = Some(category);
        }
        DeviceResponse::JsonBody(payload) => {
            if let Some(category) = inner.json_category.lock().take() {
                let mut state = inner.state.write();
                inner.sync.lock().on_category(&category, &payload, &mut state);
            } else {
                tracing::debug!("JSON payload without a category marker, ignored");
            }
        }
        DeviceResponse::FirmwareBanner(banner) => {
            let fields = response_parser::parse_firmware_banner(&banner);
            {
                let mut state = inner.state.write();
                state.firmware = FirmwareInfo {
                    raw: banner.clone(),
                    name: fields.name,
                    version: fields.version,
                    board: fields.board,
                    mode: fields.mode,
                    options: fields.options,
                };
            }
            inner
                .listener
                .on_message(&format!("Firmware info:\n{}", banner));
            inner.pending.lock().sent_token = None;
            inner.sync.lock().on_firmware_banner();
        }
        DeviceResponse::Ok => resolve_pending(inner),
        DeviceResponse::Fragment(text) => {
            tracing::debug!("Response received: [{}]", text);
            inner.pending.lock().fragments.push(text);
        }
    }
}

/// A terminator arrived: resolve the in-flight command.
fn resolve_pending(inner: &Arc<Inner>) {
    {
        let mut pending = inner.pending.lock();
        if inner.error.load(Ordering::Relaxed) {
            pending.result = None;
        } else {
            let first = pending.fragments.first().cloned().unwrap_or_default();
            if first == commands::RESET {
                pending.result = None;
            } else {
                if let Some(token) = &pending.sent_token {
                    if *token == first {
                        tracing::debug!("Response matches command '{}'", token);
                    }
                }
                // only the first line is the payload; the firmware emits
                // one meaningful line before "ok"
                for extra in pending.fragments.iter().skip(1) {
                    tracing::debug!("Extra response line: [{}]", extra);
                }
                pending.result = Some(first);
            }
        }
        pending.sent_token = None;
        pending.fragments.clear();
        pending.done = true;
    }
    inner.response_signal.set();
}

/// Handle a device-initiated action request.
fn handle_action(inner: &Arc<Inner>, action: ActionRequest) {
    match action {
        ActionRequest::ToolChange(tool) => {
            inner.state.write().pending_tool = tool;
            let msg = format!("Device requests a change to tool T{}", tool);
            tracing::info!("{}", msg);
            inner.listener.on_message(&msg);
        }
        ActionRequest::Wait => {
            tracing::info!("Device asked us to wait");
            inner.wait_requested.store(true, Ordering::Relaxed);
        }
        ActionRequest::Continue => {
            tracing::info!("Device cleared, continuing");
            inner.wait_requested.store(false, Ordering::Relaxed);
            inner.abort_requested.store(false, Ordering::Relaxed);
        }
        ActionRequest::Abort => {
            tracing::info!("Device is aborting the current operation");
            inner.wait_requested.store(false, Ordering::Relaxed);
            inner.abort_requested.store(true, Ordering::Relaxed);
        }
        ActionRequest::Pong => {
            tracing::info!("PONG received");
        }
        ActionRequest::Unknown(text) => {
            tracing::warn!("Unknown action request: [{}]", text);
        }
    }
}

/// Issue the configuration sync's pending request, unless a host command
/// is in flight.
fn drive_sync(inner: &Arc<Inner>) {
    let request = {
        let sync = inner.sync.lock();
        if sync.is_active() && !inner.processing.load(Ordering::Relaxed) {
            sync.pending_request()
        } else {
            None
        }
    };
    if let Some(request) = request {
        send_line(inner, &request);
    }
}

/// Write one command line. Clears the busy and error flags and records the
/// command's leading token for terminator matching.
fn send_line(inner: &Arc<Inner>, data: &str) -> bool {
    inner.busy.store(false, Ordering::Relaxed);
    inner.error.store(false, Ordering::Relaxed);

    {
        let mut pending = inner.pending.lock();
        let token = data.split_whitespace().next().unwrap_or(data);
        // the reset response is suppressed from correlation
        pending.sent_token = if token == commands::RESET {
            None
        } else {
            Some(token.to_string())
        };
        pending.fragments.clear();
        pending.result = None;
        pending.done = false;
    }

    let mut writer = inner.writer.lock();
    match writer.as_mut() {
        Some(writer) => match writer.write_line(data) {
            Ok(()) => {
                tracing::trace!("Sent: [{}]", data);
                true
            }
            Err(e) => {
                tracing::error!("Unable to send command '{}': {}", data, e);
                false
            }
        },
        None => {
            tracing::error!("Serial port is closed, can't send data");
            false
        }
    }
}

/// The blocking correlator behind [`MmuController::send_and_wait`].
fn send_and_wait(inner: &Arc<Inner>, data: &str) -> Option<String> {
    let tool_change = data.starts_with(commands::TOOL_PREFIX);
    let timeout = if tool_change {
        inner.config.tool_change_timeout
    } else {
        inner.config.command_timeout
    };
    // while a command is in flight the watchdog follows its timeout class
    *inner.watchdog_window.lock() = timeout;

    if !send_line(inner, data) {
        tracing::error!("Failed to send command, aborting send_and_wait");
        *inner.watchdog_window.lock() = inner.config.watchdog_timeout;
        return None;
    }
    inner.processing.store(true, Ordering::Relaxed);

    let result = loop {
        inner.response_signal.clear();
        let resolved = inner.pending.lock().done;
        let signaled = resolved || inner.response_signal.wait(timeout);

        if signaled {
            let (done, response) = {
                let mut pending = inner.pending.lock();
                (pending.done, pending.result.take())
            };
            if !done {
                continue; // spurious wakeup
            }
            if inner.error.load(Ordering::Relaxed) {
                tracing::info!("To [{}] the device reported an error", data);
                break None;
            }
            match response {
                None => break None,
                Some(text) if text.starts_with("echo:") => {
                    // echoed restatement, keep waiting for the real result
                    inner.pending.lock().done = false;
                }
                Some(text) => {
                    tracing::info!("To [{}] the device says [{}]", data, text);
                    break Some(text);
                }
            }
        } else if !inner.busy.load(Ordering::Relaxed) {
            tracing::info!(
                "Timed out waiting {:?} for a response to '{}'",
                timeout,
                data
            );
            break None;
        } else {
            // a fresh busy notice is required to extend the wait again,
            // so a device that goes silent after "busy" still resolves
            // within one more timeout window
            inner.busy.store(false, Ordering::Relaxed);
            tracing::debug!("Device is busy, extending the wait for '{}'", data);
        }
    };

    inner.processing.store(false, Ordering::Relaxed);
    *inner.watchdog_window.lock() = inner.config.watchdog_timeout;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::{LinkWriter, NoOpLink};
    use mmukit_core::Result;

    /// Opener whose links are never connected to anything.
    struct NoOpOpener;

    impl LinkOpener for NoOpOpener {
        fn open(
            &self,
            _params: &ConnectionParams,
        ) -> Result<(Box<dyn LinkReader>, Box<dyn LinkWriter>)> {
            Ok((Box::new(NoOpLink), Box::new(NoOpLink)))
        }
    }

    /// Opener that always fails.
    struct FailingOpener;

    impl LinkOpener for FailingOpener {
        fn open(
            &self,
            _params: &ConnectionParams,
        ) -> Result<(Box<dyn LinkReader>, Box<dyn LinkWriter>)> {
            Err(mmukit_core::ConnectionError::PortNotFound {
                port: "test".to_string(),
            }
            .into())
        }
    }

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            command_timeout: Duration::from_millis(200),
            tool_change_timeout: Duration::from_millis(400),
            watchdog_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[test]
    fn test_connect_failure_returns_false() {
        let controller = MmuController::with_parts(
            test_config(),
            Box::new(FailingOpener),
            Box::new(NoOpListener),
        );
        assert!(!controller.connect());
        assert!(!controller.is_connected());
    }

    #[test]
    fn test_close_is_idempotent() {
        let controller = MmuController::with_parts(
            test_config(),
            Box::new(NoOpOpener),
            Box::new(NoOpListener),
        );
        controller.close();
        controller.close();
        assert!(!controller.is_connected());
    }

    #[test]
    fn test_send_fails_when_closed() {
        let controller = MmuController::with_parts(
            test_config(),
            Box::new(FailingOpener),
            Box::new(NoOpListener),
        );
        assert!(!controller.send("M115"));
        assert_eq!(controller.send_and_wait("M115"), None);
    }

    #[test]
    fn test_signal_set_before_wait() {
        let signal = Signal::new();
        signal.set();
        assert!(signal.wait(Duration::from_millis(1)));
        signal.clear();
        assert!(!signal.wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_status_summary_disconnected() {
        let controller = MmuController::with_parts(
            test_config(),
            Box::new(FailingOpener),
            Box::new(NoOpListener),
        );
        let summary = controller.status_summary();
        assert!(summary.contains("Connected:\tNO"));
        assert!(!summary.contains("Active tool"));
    }

    #[test]
    fn test_telemetry_passthrough() {
        let controller = MmuController::with_parts(
            test_config(),
            Box::new(FailingOpener),
            Box::new(NoOpListener),
        );
        controller.start_tool_change_timer();
        let d = controller.stop_tool_change_timer();
        assert_eq!(controller.tool_change_count(), 1);
        assert!(controller.average_tool_change() <= d + Duration::from_millis(1));
        controller.reset_telemetry();
        assert_eq!(controller.tool_change_count(), 0);
    }
}
