//! A minimal typed event bus with the two firing modes the session core
//! relies on: a synchronous fire that completes before the caller's read
//! loop advances, and a parallel fire that never blocks it.

use crate::{player::ConnectedPlayer, protocol::packet::ClientSettings};
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    future::Future,
    sync::{Arc, RwLock},
};

type Subscriber = Box<dyn Fn(&mut dyn Any) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<TypeId, Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for events of type `E`.
    pub fn subscribe<E: Any + Send>(&self, handler: impl Fn(&mut E) + Send + Sync + 'static) {
        self.subscribers
            .write()
            .unwrap()
            .entry(TypeId::of::<E>())
            .or_default()
            .push(Box::new(move |event| {
                if let Some(event) = event.downcast_mut::<E>() {
                    handler(event);
                }
            }));
    }

    /// Fires `event` synchronously, running every subscriber before
    /// returning. Used where the result gates packet handling.
    pub fn fire<E: Any + Send>(&self, event: &mut E) {
        let subscribers = self.subscribers.read().unwrap();
        if let Some(handlers) = subscribers.get(&TypeId::of::<E>()) {
            for handler in handlers {
                handler(event);
            }
        }
    }

    /// Fires `event` on a separate task and invokes `continuation` with the
    /// resolved event. Never blocks the calling read loop.
    pub fn fire_parallel<E, F, Fut>(self: &Arc<Self>, mut event: E, continuation: F)
    where
        E: Any + Send + 'static,
        F: FnOnce(E) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            bus.fire(&mut event);
            continuation(event).await;
        });
    }
}

/// How a player's login ended, reported on [`DisconnectEvent`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoginStatus {
    /// The player was registered and left normally.
    SuccessfulLogin,
    /// The player was registered but was evicted by a second login with the
    /// same profile.
    ConflictingLogin,
    /// The player was never registered and the proxy initiated the close.
    CanceledByProxy,
    /// The player was never registered and the client hung up.
    CanceledByUser,
}

/// Fired when a player issues a chat message starting with `/`.
pub struct CommandExecuteEvent {
    pub player: Arc<ConnectedPlayer>,
    pub commandline: String,
    allowed: bool,
}

impl CommandExecuteEvent {
    pub fn new(player: Arc<ConnectedPlayer>, commandline: String) -> Self {
        Self {
            player,
            commandline,
            allowed: true,
        }
    }

    pub fn allowed(&self) -> bool {
        self.allowed
    }

    pub fn set_allowed(&mut self, allowed: bool) {
        self.allowed = allowed;
    }
}

/// Fired when a player sends a regular chat message.
pub struct PlayerChatEvent {
    pub player: Arc<ConnectedPlayer>,
    pub message: String,
    allowed: bool,
}

impl PlayerChatEvent {
    pub fn new(player: Arc<ConnectedPlayer>, message: String) -> Self {
        Self {
            player,
            message,
            allowed: true,
        }
    }

    pub fn allowed(&self) -> bool {
        self.allowed
    }

    pub fn set_allowed(&mut self, allowed: bool) {
        self.allowed = allowed;
    }
}

/// Fired in parallel when a player's client settings change.
pub struct PlayerSettingsChangedEvent {
    pub player: Arc<ConnectedPlayer>,
    pub settings: ClientSettings,
}

/// Fired in parallel for plugin messages on channels the proxy has
/// registered.
pub struct PluginMessageEvent {
    pub player: Arc<ConnectedPlayer>,
    pub channel: String,
    pub data: Vec<u8>,
    allowed: bool,
}

impl PluginMessageEvent {
    pub fn new(player: Arc<ConnectedPlayer>, channel: String, data: Vec<u8>) -> Self {
        Self {
            player,
            channel,
            data,
            allowed: true,
        }
    }

    pub fn allowed(&self) -> bool {
        self.allowed
    }

    pub fn set_allowed(&mut self, allowed: bool) {
        self.allowed = allowed;
    }
}

/// Fired synchronously when a player's connection is torn down.
pub struct DisconnectEvent {
    pub player: Arc<ConnectedPlayer>,
    pub login_status: LoginStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Probe {
        value: i32,
        allowed: bool,
    }

    #[test]
    fn fire_runs_subscribers_in_order() {
        let bus = EventBus::new();
        bus.subscribe::<Probe>(|e| e.value += 1);
        bus.subscribe::<Probe>(|e| e.value *= 10);
        let mut event = Probe {
            value: 1,
            allowed: true,
        };
        bus.fire(&mut event);
        assert_eq!(event.value, 20);
    }

    #[test]
    fn fire_ignores_unrelated_types() {
        let bus = EventBus::new();
        bus.subscribe::<Probe>(|e| e.allowed = false);
        let mut other = 5u32;
        bus.fire(&mut other);
        assert_eq!(other, 5);
    }

    #[tokio::test]
    async fn fire_parallel_resolves_then_continues() {
        let bus = Arc::new(EventBus::new());
        bus.subscribe::<Probe>(|e| e.allowed = false);
        let hit = Arc::new(AtomicBool::new(false));
        let hit2 = Arc::clone(&hit);
        let (tx, rx) = tokio::sync::oneshot::channel();
        bus.fire_parallel(
            Probe {
                value: 0,
                allowed: true,
            },
            move |event| async move {
                if !event.allowed {
                    hit2.store(true, Ordering::SeqCst);
                }
                tx.send(()).ok();
            },
        );
        rx.await.unwrap();
        assert!(hit.load(Ordering::SeqCst));
    }
}
