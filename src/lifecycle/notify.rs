//! Service-manager lifecycle notifications.

use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::Mutex;

/// Lifecycle milestones reported to the process supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    Ready,
    Reloading,
    Stopping,
}

impl ServiceEvent {
    fn as_sd_notify(&self) -> &'static str {
        match self {
            ServiceEvent::Ready => "READY=1",
            ServiceEvent::Reloading => "RELOADING=1",
            ServiceEvent::Stopping => "STOPPING=1",
        }
    }
}

pub trait ServiceNotifier: Send + Sync {
    fn notify(&self, event: ServiceEvent);
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl ServiceNotifier for NoopNotifier {
    fn notify(&self, _event: ServiceEvent) {}
}

/// Writes sd_notify datagrams to `$NOTIFY_SOCKET`.
#[derive(Debug)]
pub struct SystemdNotifier {
    socket: Option<PathBuf>,
}

impl SystemdNotifier {
    pub fn from_env() -> Self {
        Self::new(std::env::var_os("NOTIFY_SOCKET").map(PathBuf::from))
    }

    pub fn new(socket: Option<PathBuf>) -> Self {
        Self { socket }
    }
}

impl ServiceNotifier for SystemdNotifier {
    fn notify(&self, event: ServiceEvent) {
        let Some(path) = &self.socket else {
            tracing::debug!(event = ?event, "NOTIFY_SOCKET not set, skipping service notification");
            return;
        };
        let sent = UnixDatagram::unbound()
            .and_then(|sock| sock.send_to(event.as_sd_notify().as_bytes(), path));
        if let Err(e) = sent {
            tracing::warn!(socket = %path.display(), error = %e, "Failed to notify service manager");
        }
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<ServiceEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<ServiceEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl ServiceNotifier for RecordingNotifier {
    fn notify(&self, event: ServiceEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_datagram_to_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let server = UnixDatagram::bind(&path).unwrap();

        let notifier = SystemdNotifier::new(Some(path));
        notifier.notify(ServiceEvent::Ready);
        notifier.notify(ServiceEvent::Stopping);

        let mut buf = [0u8; 64];
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1");
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"STOPPING=1");
    }

    #[test]
    fn missing_socket_is_silent() {
        SystemdNotifier::new(None).notify(ServiceEvent::Reloading);
    }
}
