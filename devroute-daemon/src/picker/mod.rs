//! Interactive disambiguation between several servers for one bundle id.
//!
//! A pick moves `idle -> open -> {selected | cancelled}`; the resolver adds
//! `timed-out` by dropping the pick when its timer wins. At most one pick is
//! open: opening a new one cancels the previous one. Whichever source
//! completes the open pick first wins; later completions are ignored.

pub mod dialog;
pub mod menu;

use std::io::IsTerminal;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use devroute_protocol::ServerRegistration;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use crate::paths::shorten_home;
use crate::simulators;
use menu::MenuAction;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickRequest {
    pub bundle_id: String,
    /// Candidates in display order.
    pub servers: Vec<ServerRegistration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub server: ServerRegistration,
    /// Persist the choice as a sticky route.
    pub remember: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PickOutcome {
    Selected(Selection),
    Cancelled,
}

#[async_trait]
pub trait ServerPicker: Send + Sync {
    /// Ask which server should handle `request`. Dropping the returned
    /// future abandons the pick.
    async fn pick(&self, request: PickRequest) -> PickOutcome;

    /// Complete the open pick for `bundle_id` with `server_id`, if any.
    fn resolve_pending(&self, bundle_id: &str, server_id: &str) -> bool;

    /// Cancel whatever is open and release the terminal.
    fn shutdown(&self) {}
}

/// Label shown for a candidate: shortened root plus port.
pub fn server_label(server: &ServerRegistration) -> String {
    format!("{} (port {})", shorten_home(&server.root), server.port)
}

struct ActivePick {
    generation: u64,
    bundle_id: String,
    servers: Vec<ServerRegistration>,
    tx: oneshot::Sender<PickOutcome>,
    stop_tx: watch::Sender<bool>,
}

impl ActivePick {
    fn finish(self, outcome: Option<PickOutcome>) -> bool {
        let _ = self.stop_tx.send(true);
        match outcome {
            Some(outcome) => self.tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

#[derive(Default)]
struct PickerSlot {
    active: Mutex<Option<ActivePick>>,
    next_generation: AtomicU64,
}

impl PickerSlot {
    fn open(
        &self,
        request: &PickRequest,
    ) -> (u64, oneshot::Receiver<PickOutcome>, watch::Receiver<bool>) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let previous = self.active.lock().replace(ActivePick {
            generation,
            bundle_id: request.bundle_id.clone(),
            servers: request.servers.clone(),
            tx,
            stop_tx,
        });
        if let Some(previous) = previous {
            tracing::debug!(bundle_id = %previous.bundle_id, "replacing pending picker");
            // Dropping the sender resolves the previous waiter as cancelled.
            previous.finish(None);
        }
        (generation, rx, stop_rx)
    }

    fn take_if(&self, pred: impl FnOnce(&ActivePick) -> bool) -> Option<ActivePick> {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(pred) {
            active.take()
        } else {
            None
        }
    }

    fn complete(&self, generation: u64, outcome: PickOutcome) -> bool {
        match self.take_if(|a| a.generation == generation) {
            Some(active) => active.finish(Some(outcome)),
            None => false,
        }
    }

    fn resolve(&self, bundle_id: &str, server_id: &str) -> bool {
        let mut server = None;
        let active = self.take_if(|a| {
            if a.bundle_id != bundle_id {
                return false;
            }
            server = a.servers.iter().find(|s| s.id == server_id).cloned();
            server.is_some()
        });
        match (active, server) {
            (Some(active), Some(server)) => active.finish(Some(PickOutcome::Selected(Selection {
                server,
                remember: false,
            }))),
            _ => false,
        }
    }

    fn cancel(&self, generation: u64) {
        if let Some(active) = self.take_if(|a| a.generation == generation) {
            active.finish(None);
        }
    }

    fn cancel_all(&self) {
        if let Some(active) = self.active.lock().take() {
            active.finish(None);
        }
    }

    fn is_open(&self) -> bool {
        self.active.lock().is_some()
    }
}

/// Cancels its pick when the waiting future goes away.
struct PendingPick {
    slot: Arc<PickerSlot>,
    generation: u64,
}

impl Drop for PendingPick {
    fn drop(&mut self) {
        self.slot.cancel(self.generation);
    }
}

/// Picker backed by a native dialog (macOS) with a raw-mode terminal menu as
/// fallback.
pub struct InteractivePicker {
    slot: Arc<PickerSlot>,
    native_dialog: bool,
}

impl InteractivePicker {
    pub fn new(native_dialog: bool) -> Self {
        Self {
            slot: Arc::new(PickerSlot::default()),
            native_dialog,
        }
    }

    pub fn is_open(&self) -> bool {
        self.slot.is_open()
    }
}

#[async_trait]
impl ServerPicker for InteractivePicker {
    async fn pick(&self, request: PickRequest) -> PickOutcome {
        let (generation, rx, stop_rx) = self.slot.open(&request);
        let _pending = PendingPick {
            slot: self.slot.clone(),
            generation,
        };

        tokio::spawn(run_sources(
            self.slot.clone(),
            generation,
            request,
            self.native_dialog,
            stop_rx,
        ));

        rx.await.unwrap_or(PickOutcome::Cancelled)
    }

    fn resolve_pending(&self, bundle_id: &str, server_id: &str) -> bool {
        self.slot.resolve(bundle_id, server_id)
    }

    fn shutdown(&self) {
        self.slot.cancel_all();
    }
}

async fn wait_for_stop(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stopped| *stopped).await;
}

async fn run_sources(
    slot: Arc<PickerSlot>,
    generation: u64,
    request: PickRequest,
    native_dialog: bool,
    mut stop_rx: watch::Receiver<bool>,
) {
    let simulators = simulators::booted_simulators().await;

    if native_dialog && cfg!(target_os = "macos") {
        let result = tokio::select! {
            r = dialog::choose(&request, &simulators) => r,
            _ = wait_for_stop(&mut stop_rx) => return,
        };
        match result {
            Ok(outcome) => {
                if !slot.complete(generation, outcome) {
                    tracing::debug!(bundle_id = %request.bundle_id, "ignoring late dialog selection");
                }
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "native dialog unavailable, using terminal menu");
            }
        }
    }

    if *stop_rx.borrow() {
        return;
    }
    if !std::io::stdin().is_terminal() {
        slot.complete(generation, PickOutcome::Cancelled);
        return;
    }

    let menu_request = request.clone();
    let stop = stop_rx.clone();
    let result =
        tokio::task::spawn_blocking(move || menu::run_menu(&menu_request, &simulators, &stop))
            .await;

    let outcome = match result {
        Ok(Ok(Some(MenuAction::Select { index, remember }))) => request
            .servers
            .get(index)
            .cloned()
            .map(|server| PickOutcome::Selected(Selection { server, remember }))
            .unwrap_or(PickOutcome::Cancelled),
        Ok(Ok(Some(_))) => PickOutcome::Cancelled,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "terminal menu failed");
            PickOutcome::Cancelled
        }
        Err(e) => {
            tracing::warn!(error = %e, "terminal menu task failed");
            PickOutcome::Cancelled
        }
    };
    slot.complete(generation, outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn server(id: &str, port: u16) -> ServerRegistration {
        ServerRegistration {
            id: id.to_string(),
            port,
            bundle_id: "app".to_string(),
            root: format!("/p/{id}"),
            registered_at: 1,
            last_active_at: None,
            pid: None,
        }
    }

    fn request() -> PickRequest {
        PickRequest {
            bundle_id: "app".to_string(),
            servers: vec![server("server-1", 3001), server("server-2", 3002)],
        }
    }

    #[test]
    fn first_completion_wins_and_late_ones_are_ignored() {
        let slot = PickerSlot::default();
        let (generation, mut rx, stop_rx) = slot.open(&request());

        assert!(slot.complete(
            generation,
            PickOutcome::Selected(Selection {
                server: server("server-2", 3002),
                remember: true,
            })
        ));
        assert!(!slot.complete(generation, PickOutcome::Cancelled));
        assert!(*stop_rx.borrow());

        match rx.try_recv().unwrap() {
            PickOutcome::Selected(sel) => {
                assert_eq!(sel.server.id, "server-2");
                assert!(sel.remember);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn opening_a_new_pick_cancels_the_previous_one() {
        let slot = PickerSlot::default();
        let (first, mut first_rx, first_stop) = slot.open(&request());
        let (second, _second_rx, _) = slot.open(&request());

        assert_ne!(first, second);
        assert!(first_rx.try_recv().is_err());
        assert!(*first_stop.borrow());
        assert!(!slot.complete(first, PickOutcome::Cancelled));
        assert!(slot.is_open());
    }

    #[test]
    fn resolve_matches_bundle_and_candidate() {
        let slot = PickerSlot::default();
        let (_generation, mut rx, _stop) = slot.open(&request());

        assert!(!slot.resolve("other", "server-1"));
        assert!(!slot.resolve("app", "server-9"));
        assert!(slot.is_open());

        assert!(slot.resolve("app", "server-1"));
        assert!(!slot.is_open());
        match rx.try_recv().unwrap() {
            PickOutcome::Selected(sel) => {
                assert_eq!(sel.server.id, "server-1");
                assert!(!sel.remember);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_a_pick_releases_the_slot() {
        let picker = InteractivePicker::new(false);
        // Without a terminal the menu cancels immediately; with one we time out.
        let res = tokio::time::timeout(Duration::from_millis(50), picker.pick(request())).await;
        if let Ok(outcome) = res {
            assert_eq!(outcome, PickOutcome::Cancelled);
        }
        assert!(!picker.is_open());
    }

    #[tokio::test]
    async fn resolve_pending_completes_an_open_pick() {
        let picker = Arc::new(InteractivePicker::new(false));
        let slot = picker.slot.clone();
        let (generation, rx, _stop) = slot.open(&request());
        assert!(picker.resolve_pending("app", "server-2"));
        assert!(!slot.complete(generation, PickOutcome::Cancelled));
        match rx.await.unwrap() {
            PickOutcome::Selected(sel) => assert_eq!(sel.server.port, 3002),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn label_uses_root_and_port() {
        let s = server("server-1", 3001);
        assert_eq!(server_label(&s), "/p/server-1 (port 3001)");
    }
}
