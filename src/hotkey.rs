//! Push-to-talk via evdev.
//!
//! Watches every keyboard for the configured combos. Holding a combo sends
//! `Pressed`, letting go sends `Released`; the service maps those to
//! start/stop capture.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use evdev::{Device, EventType, InputEventKind, Key};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::HotkeyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyEvent {
    Pressed,
    Released,
}

/// Resolve a key name like "KEY_LEFTMETA" to an evdev key.
fn resolve_key(name: &str) -> Option<Key> {
    let key = match name {
        "KEY_LEFTMETA" => Key::KEY_LEFTMETA,
        "KEY_RIGHTMETA" => Key::KEY_RIGHTMETA,
        "KEY_LEFTALT" => Key::KEY_LEFTALT,
        "KEY_RIGHTALT" => Key::KEY_RIGHTALT,
        "KEY_LEFTCTRL" => Key::KEY_LEFTCTRL,
        "KEY_RIGHTCTRL" => Key::KEY_RIGHTCTRL,
        "KEY_LEFTSHIFT" => Key::KEY_LEFTSHIFT,
        "KEY_RIGHTSHIFT" => Key::KEY_RIGHTSHIFT,
        "KEY_SPACE" => Key::KEY_SPACE,
        "KEY_CAPSLOCK" => Key::KEY_CAPSLOCK,
        "KEY_SCROLLLOCK" => Key::KEY_SCROLLLOCK,
        "KEY_PAUSE" => Key::KEY_PAUSE,
        "KEY_INSERT" => Key::KEY_INSERT,
        "KEY_F1" => Key::KEY_F1,
        "KEY_F2" => Key::KEY_F2,
        "KEY_F3" => Key::KEY_F3,
        "KEY_F4" => Key::KEY_F4,
        "KEY_F5" => Key::KEY_F5,
        "KEY_F6" => Key::KEY_F6,
        "KEY_F7" => Key::KEY_F7,
        "KEY_F8" => Key::KEY_F8,
        "KEY_F9" => Key::KEY_F9,
        "KEY_F10" => Key::KEY_F10,
        "KEY_F11" => Key::KEY_F11,
        "KEY_F12" => Key::KEY_F12,
        "KEY_V" => Key::KEY_V,
        "KEY_T" => Key::KEY_T,
        _ => {
            warn!("Unknown key name: {name}");
            return None;
        }
    };
    Some(key)
}

fn resolve_combo(names: &[String]) -> Option<HashSet<Key>> {
    let combo: HashSet<Key> = names.iter().filter_map(|s| resolve_key(s)).collect();
    (!combo.is_empty()).then_some(combo)
}

/// Pressed keys across all devices and whether a combo is currently held.
#[derive(Default)]
struct ComboTracker {
    combos: Vec<HashSet<Key>>,
    pressed: HashSet<Key>,
    active: bool,
}

impl ComboTracker {
    fn new(combos: Vec<HashSet<Key>>) -> Self {
        Self {
            combos,
            ..Self::default()
        }
    }

    /// Feed one key event (0 = release, 1 = press, 2 = repeat). Returns an
    /// event only on a combo edge.
    fn key(&mut self, key: Key, value: i32) -> Option<HotkeyEvent> {
        match value {
            1 => {
                self.pressed.insert(key);
            }
            0 => {
                self.pressed.remove(&key);
            }
            _ => return None,
        }

        let held = self.combos.iter().any(|combo| combo.is_subset(&self.pressed));
        match (held, self.active) {
            (true, false) => {
                self.active = true;
                Some(HotkeyEvent::Pressed)
            }
            (false, true) => {
                self.active = false;
                Some(HotkeyEvent::Released)
            }
            _ => None,
        }
    }
}

pub struct HotkeyMonitor {
    tracker: Arc<Mutex<ComboTracker>>,
    tx: mpsc::Sender<HotkeyEvent>,
}

impl HotkeyMonitor {
    pub fn new(config: &HotkeyConfig, tx: mpsc::Sender<HotkeyEvent>) -> Self {
        let combos: Vec<HashSet<Key>> = std::iter::once(&config.combo)
            .chain(&config.alt_combos)
            .filter_map(|names| resolve_combo(names))
            .collect();
        info!("Push-to-talk: {} combo(s) configured", combos.len());

        Self {
            tracker: Arc::new(Mutex::new(ComboTracker::new(combos))),
            tx,
        }
    }

    fn find_keyboards() -> Vec<Device> {
        evdev::enumerate()
            .map(|(_path, device)| device)
            .filter(|device| {
                device
                    .supported_keys()
                    .is_some_and(|keys| keys.contains(Key::KEY_A) && keys.contains(Key::KEY_ENTER))
            })
            .inspect(|device| info!("Found keyboard: {}", device.name().unwrap_or("unknown")))
            .collect()
    }

    async fn monitor_device(
        device: Device,
        tracker: Arc<Mutex<ComboTracker>>,
        tx: mpsc::Sender<HotkeyEvent>,
    ) {
        let name = device.name().unwrap_or("unknown").to_string();
        debug!("Monitoring {name}");

        let mut events = match device.into_event_stream() {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot create event stream for {name}: {e}");
                return;
            }
        };

        loop {
            let event = match events.next_event().await {
                Ok(event) => event,
                Err(e) => {
                    warn!("Device {name} disconnected: {e}");
                    break;
                }
            };
            if event.event_type() != EventType::KEY {
                continue;
            }
            let InputEventKind::Key(key) = event.kind() else {
                continue;
            };

            let edge = tracker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .key(key, event.value());
            if let Some(edge) = edge {
                debug!("Push-to-talk {edge:?}");
                let _ = tx.try_send(edge);
            }
        }
    }

    /// Monitor all keyboards until they disconnect. Returns straight away
    /// if there is nothing to watch.
    pub async fn run(self) {
        if self.tracker.lock().unwrap_or_else(PoisonError::into_inner).combos.is_empty() {
            warn!("Push-to-talk disabled: no valid key combo");
            return;
        }

        let keyboards = Self::find_keyboards();
        if keyboards.is_empty() {
            warn!(
                "Push-to-talk disabled: no keyboards found. Make sure you're in the 'input' \
                 group: sudo usermod -aG input $USER"
            );
            return;
        }

        info!("Monitoring {} keyboard(s)", keyboards.len());
        let handles: Vec<_> = keyboards
            .into_iter()
            .map(|device| {
                tokio::spawn(Self::monitor_device(
                    device,
                    Arc::clone(&self.tracker),
                    self.tx.clone(),
                ))
            })
            .collect();

        for handle in handles {
            let _ = handle.await;
        }
    }
}
