//! Device listener interface
//!
//! Defines the listener trait for driver events

/// Listener trait for driver events
///
/// Implement this trait to receive notifications from the driver. The two
/// callbacks are the only channel from the driver back to the host: a
/// status pulse on every state broadcast (and a final `active = false`
/// when the reader shuts down), and unsolicited device text (errors, busy
/// notices, action requests) that is not part of a command's response.
///
/// Callbacks are invoked from the driver's reader thread and must not
/// block.
pub trait DeviceListener: Send + Sync {
    /// Called when a state broadcast has been applied (`active = true`)
    /// or the reader has shut down (`active = false`)
    fn on_status_changed(&self, _active: bool) {}

    /// Called with device text that is not a command response
    fn on_message(&self, _text: &str) {}
}

/// Listener that ignores all events.
///
/// Useful as a default when the host does not care about callbacks.
#[derive(Debug, Default)]
pub struct NoOpListener;

impl DeviceListener for NoOpListener {}
