//! Platform notifications for critical fleet alerts.
//!
//! The dispatcher stays policy-free; this module registers its own
//! `fleet_alert` handler and decides what deserves a notification.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use fleet_core::config::NotificationConfig;
use fleet_core::error::FleetResult;
use fleet_socket::{FleetAlert, FrameKind, HandlerId, MessageDispatcher};

use crate::event_bus::{AppEvent, EventBus};
use crate::service::{Service, ServiceState};

/// Shows a notification to the user.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str, sound: bool) -> FleetResult<()>;
}

/// Native desktop notifications through notify-rust.
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopNotifier;

impl Notifier for DesktopNotifier {
    fn notify(&self, title: &str, body: &str, sound: bool) -> FleetResult<()> {
        #[cfg(not(test))]
        {
            use fleet_core::constants::APP_NAME;
            use fleet_core::error::FleetError;

            let mut notification = notify_rust::Notification::new();
            notification.summary(title).body(body).appname(APP_NAME);
            if sound {
                notification.sound_name("default");
            }
            notification
                .show()
                .map_err(|e| FleetError::Notification(e.to_string()))?;
        }

        debug!("notification shown: {title} (sound: {sound})");
        let _ = body;
        Ok(())
    }
}

/// Raises a notification for every critical `fleet_alert`.
pub struct CriticalAlertNotifier {
    notifier: Arc<dyn Notifier>,
    events: EventBus,
    config: NotificationConfig,
    registration: Mutex<Option<(MessageDispatcher, HandlerId)>>,
}

impl CriticalAlertNotifier {
    pub fn new(notifier: Arc<dyn Notifier>, events: EventBus, config: NotificationConfig) -> Self {
        Self {
            notifier,
            events,
            config,
            registration: Mutex::new(None),
        }
    }

    /// Register the alert handler. Replaces a previous registration.
    pub fn attach(&self, dispatcher: &MessageDispatcher) {
        self.detach();

        let notifier = self.notifier.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        let id = dispatcher.on(FrameKind::FleetAlert, move |frame| {
            let Some(alert) = frame.as_fleet_alert() else {
                anyhow::bail!("fleet_alert payload did not decode");
            };
            handle_alert(notifier.as_ref(), &events, &config, alert)
        });

        *self.registration.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((dispatcher.clone(), id));
    }

    pub fn detach(&self) {
        let registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((dispatcher, id)) = registration {
            dispatcher.off(&FrameKind::FleetAlert, id);
        }
    }

    pub fn is_attached(&self) -> bool {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

fn handle_alert(
    notifier: &dyn Notifier,
    events: &EventBus,
    config: &NotificationConfig,
    alert: FleetAlert,
) -> anyhow::Result<()> {
    if !alert.is_critical() {
        return Ok(());
    }

    info!(
        "critical alert{}: {}",
        alert
            .vehicle_id
            .as_deref()
            .map(|v| format!(" for {v}"))
            .unwrap_or_default(),
        alert.title
    );

    if config.critical_alerts {
        let title = if alert.title.is_empty() {
            "Critical fleet alert"
        } else {
            alert.title.as_str()
        };
        notifier.notify(title, &alert.message, config.sound)?;
    }
    events.emit(AppEvent::CriticalAlert { alert });
    Ok(())
}

impl Drop for CriticalAlertNotifier {
    fn drop(&mut self) {
        self.detach();
    }
}

impl Service for CriticalAlertNotifier {
    fn name(&self) -> &'static str {
        "alert_notifier"
    }

    fn state(&self) -> ServiceState {
        if self.is_attached() {
            ServiceState::Running
        } else {
            ServiceState::Stopped
        }
    }

    fn detail(&self) -> String {
        if self.config.critical_alerts {
            "critical alerts on".into()
        } else {
            "critical alerts muted".into()
        }
    }
}
