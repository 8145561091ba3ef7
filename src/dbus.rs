//! System bus surface.
//!
//! One object path exports two interfaces: host system operations and
//! distrobox operations. Every method takes a trailing transaction string
//! and returns the JSON-encoded response envelope; task events go out as a
//! `Notification` signal so a remote client can follow progress by
//! transaction id.

use crate::commands::{AppState, distrobox, image, system};
use crate::dialog::AutoApprove;
use crate::error::ApmError;
use crate::events::{EventSink, Reporter, TaskEvent};
use crate::response::Envelope;
use crate::runner::CancelToken;
use crate::transaction;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, warn};
use zbus::object_server::SignalEmitter;

/// Object path both interfaces live on.
pub const OBJECT_PATH: &str = "/org/altlinux/APM";

/// Well-known bus name and the system interface name.
pub const SERVICE_NAME: &str = "org.altlinux.APM";

/// Interface carrying distrobox methods.
pub const DISTROBOX_INTERFACE: &str = "org.altlinux.APM.distrobox";

/// Method-level authorization hook.
///
/// The default allows everything; a polkit-backed policy slots in here
/// without touching the method bodies.
pub trait AuthPolicy: Send + Sync {
    fn authorize(&self, method: &str) -> bool;
}

/// Policy that permits every caller.
pub struct AllowAll;

impl AuthPolicy for AllowAll {
    fn authorize(&self, _method: &str) -> bool {
        true
    }
}

/// Event sink that broadcasts task events as bus signals.
pub struct BusSink {
    connection: zbus::blocking::Connection,
}

impl BusSink {
    pub fn new(connection: zbus::blocking::Connection) -> Self {
        Self { connection }
    }
}

impl EventSink for BusSink {
    fn emit(&self, event: &TaskEvent) {
        let Ok(body) = serde_json::to_string(event) else {
            return;
        };
        let sent = self.connection.emit_signal(
            None::<&str>,
            OBJECT_PATH,
            SERVICE_NAME,
            "Notification",
            &(body,),
        );
        if let Err(err) = sent {
            warn!(error = %err, "failed to emit notification signal");
        }
    }
}

/// Shared plumbing for both interfaces.
struct ServiceInner {
    state: Arc<AppState>,
    sink: Arc<dyn EventSink>,
    auth: Arc<dyn AuthPolicy>,
}

impl ServiceInner {
    /// Authorize, resolve the transaction, and run the handler.
    fn dispatch(
        &self,
        method: &str,
        transaction: &str,
        handler: impl FnOnce(&AppState, &Reporter, &CancelToken) -> Envelope,
    ) -> String {
        let tx = transaction::resolve(Some(transaction));
        debug!(method, transaction = %tx, "bus call");
        if !self.auth.authorize(method) {
            return Envelope::failure(ApmError::PrivilegeRequired.to_string(), &tx).to_wire();
        }
        let reporter = Reporter::new(self.sink.clone(), tx);
        let cancel = CancelToken::new();
        let envelope = handler(&self.state, &reporter, &cancel);
        envelope.to_wire()
    }
}

/// `org.altlinux.APM`: host system operations.
pub struct SystemService {
    inner: ServiceInner,
}

#[zbus::interface(name = "org.altlinux.APM")]
impl SystemService {
    fn update(&self, transaction: String) -> String {
        self.inner
            .dispatch("Update", &transaction, |state, reporter, cancel| {
                system::update(state, reporter, cancel)
            })
    }

    fn install(&self, packages: Vec<String>, apply: bool, transaction: String) -> String {
        self.inner
            .dispatch("Install", &transaction, |state, reporter, cancel| {
                system::install(state, reporter, cancel, &packages, apply, &AutoApprove)
            })
    }

    fn remove(&self, packages: Vec<String>, apply: bool, transaction: String) -> String {
        self.inner
            .dispatch("Remove", &transaction, |state, reporter, cancel| {
                system::remove(state, reporter, cancel, &packages, apply, &AutoApprove)
            })
    }

    fn check(&self, action: String, packages: Vec<String>, transaction: String) -> String {
        self.inner
            .dispatch("Check", &transaction, |state, reporter, cancel| {
                let action = match action.as_str() {
                    "remove" => crate::apt::CheckAction::Remove,
                    _ => crate::apt::CheckAction::Install,
                };
                system::check(state, reporter, cancel, action, &packages)
            })
    }

    fn info(&self, package: String, transaction: String) -> String {
        self.inner
            .dispatch("Info", &transaction, |state, reporter, _cancel| {
                system::info(state, reporter, &package)
            })
    }

    fn search(&self, query: String, installed: bool, transaction: String) -> String {
        self.inner
            .dispatch("Search", &transaction, |state, reporter, _cancel| {
                system::search(state, reporter, &query, installed)
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn list(
        &self,
        filters: Vec<(String, String)>,
        sort: String,
        descending: bool,
        limit: u32,
        offset: u32,
        transaction: String,
    ) -> String {
        self.inner
            .dispatch("List", &transaction, |state, reporter, _cancel| {
                let sort = if sort.is_empty() { None } else { Some(sort) };
                let limit = if limit == 0 { None } else { Some(limit) };
                system::list(state, reporter, &filters, sort, descending, limit, offset)
            })
    }

    fn image_status(&self, transaction: String) -> String {
        self.inner
            .dispatch("ImageStatus", &transaction, |state, reporter, cancel| {
                image::status(state, reporter, cancel)
            })
    }

    fn image_apply(&self, pull: bool, allow_same: bool, transaction: String) -> String {
        self.inner
            .dispatch("ImageApply", &transaction, |state, reporter, cancel| {
                image::apply(state, reporter, cancel, pull, allow_same)
            })
    }

    fn image_update(&self, transaction: String) -> String {
        self.inner
            .dispatch("ImageUpdate", &transaction, |state, reporter, cancel| {
                image::update(state, reporter, cancel)
            })
    }

    fn image_history(&self, limit: u32, transaction: String) -> String {
        self.inner
            .dispatch("ImageHistory", &transaction, |state, reporter, _cancel| {
                let limit = if limit == 0 { None } else { Some(limit) };
                image::history(state, reporter, limit)
            })
    }

    fn image_get_config(&self, transaction: String) -> String {
        self.inner
            .dispatch("ImageGetConfig", &transaction, |state, reporter, cancel| {
                image::config_get(state, reporter, cancel)
            })
    }

    fn image_save_config(&self, config: String, transaction: String) -> String {
        self.inner
            .dispatch("ImageSaveConfig", &transaction, |state, reporter, _cancel| {
                image::config_save(state, reporter, &config)
            })
    }

    /// Task lifecycle events, JSON-encoded.
    #[zbus(signal)]
    async fn notification(emitter: &SignalEmitter<'_>, event: String) -> zbus::Result<()>;
}

/// `org.altlinux.APM.distrobox`: sandbox container operations.
pub struct DistroboxService {
    inner: ServiceInner,
}

#[zbus::interface(name = "org.altlinux.APM.distrobox")]
impl DistroboxService {
    fn update(&self, container: String, transaction: String) -> String {
        self.inner
            .dispatch("DistroboxUpdate", &transaction, |state, reporter, cancel| {
                distrobox::update(state, reporter, cancel, &container)
            })
    }

    fn info(&self, container: String, package: String, transaction: String) -> String {
        self.inner
            .dispatch("DistroboxInfo", &transaction, |state, reporter, _cancel| {
                distrobox::info(state, reporter, &container, &package)
            })
    }

    fn search(
        &self,
        container: String,
        query: String,
        installed: bool,
        transaction: String,
    ) -> String {
        self.inner
            .dispatch("DistroboxSearch", &transaction, |state, reporter, _cancel| {
                distrobox::search(state, reporter, &container, &query, installed)
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn list(
        &self,
        container: String,
        filters: Vec<(String, String)>,
        sort: String,
        descending: bool,
        limit: u32,
        offset: u32,
        transaction: String,
    ) -> String {
        self.inner
            .dispatch("DistroboxList", &transaction, |state, reporter, _cancel| {
                let sort = if sort.is_empty() { None } else { Some(sort) };
                let limit = if limit == 0 { None } else { Some(limit) };
                distrobox::list(
                    state, reporter, &container, &filters, sort, descending, limit, offset,
                )
            })
    }

    fn install(&self, container: String, packages: Vec<String>, transaction: String) -> String {
        self.inner
            .dispatch("DistroboxInstall", &transaction, |state, reporter, cancel| {
                distrobox::install(state, reporter, cancel, &container, &packages, false)
            })
    }

    fn remove(&self, container: String, packages: Vec<String>, transaction: String) -> String {
        self.inner
            .dispatch("DistroboxRemove", &transaction, |state, reporter, cancel| {
                distrobox::remove(state, reporter, cancel, &container, &packages)
            })
    }

    fn container_list(&self, transaction: String) -> String {
        self.inner
            .dispatch("ContainerList", &transaction, |state, reporter, cancel| {
                distrobox::container_list(state, reporter, cancel)
            })
    }

    fn container_add(&self, name: String, image: String, transaction: String) -> String {
        self.inner
            .dispatch("ContainerAdd", &transaction, |state, reporter, cancel| {
                distrobox::container_add(state, reporter, cancel, &name, &image)
            })
    }

    fn container_remove(&self, name: String, transaction: String) -> String {
        self.inner
            .dispatch("ContainerRemove", &transaction, |state, reporter, cancel| {
                distrobox::container_remove(state, reporter, cancel, &name)
            })
    }

    fn get_filter_fields(&self, transaction: String) -> String {
        self.inner
            .dispatch("GetFilterFields", &transaction, |_state, reporter, _cancel| {
                distrobox::get_filter_fields(reporter)
            })
    }
}

/// Run the bus daemon until the process is terminated.
pub fn serve(state: Arc<AppState>, auth: Arc<dyn AuthPolicy>) -> Result<()> {
    let connection = zbus::blocking::Connection::system()
        .map_err(|_| ApmError::BusNotConnected)
        .context("Failed to connect to the system bus")?;
    let sink: Arc<dyn EventSink> = Arc::new(BusSink::new(connection.clone()));

    connection
        .object_server()
        .at(
            OBJECT_PATH,
            SystemService {
                inner: ServiceInner {
                    state: state.clone(),
                    sink: sink.clone(),
                    auth: auth.clone(),
                },
            },
        )
        .context("Failed to export the system interface")?;
    connection
        .object_server()
        .at(
            OBJECT_PATH,
            DistroboxService {
                inner: ServiceInner { state, sink, auth },
            },
        )
        .context("Failed to export the distrobox interface")?;
    connection
        .request_name(SERVICE_NAME)
        .context("Failed to acquire the bus name")?;

    tracing::info!(name = SERVICE_NAME, path = OBJECT_PATH, "bus daemon ready");
    loop {
        std::thread::park();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{PackageRecord, Scope};
    use crate::config::AppConfig;
    use crate::runner::MockCommandRunner;

    struct DenyAll;

    impl AuthPolicy for DenyAll {
        fn authorize(&self, _method: &str) -> bool {
            false
        }
    }

    fn test_inner(auth: Arc<dyn AuthPolicy>) -> (ServiceInner, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            database_path: dir.path().join("apm.db"),
            image_config_path: dir.path().join("image.yml"),
            containerfile_path: dir.path().join("Containerfile"),
            resources_dir: dir.path().join("resources"),
            home: dir.path().to_path_buf(),
        };
        let state =
            Arc::new(AppState::with_runner(config, Arc::new(MockCommandRunner::new())).unwrap());
        (
            ServiceInner {
                state,
                sink: Arc::new(crate::events::NullSink),
                auth,
            },
            dir,
        )
    }

    #[test]
    fn dispatch_returns_wire_envelopes() {
        let (inner, _dir) = test_inner(Arc::new(AllowAll));
        inner
            .state
            .store
            .save(
                &Scope::Host,
                &[PackageRecord {
                    name: "zip".to_string(),
                    ..Default::default()
                }],
            )
            .unwrap();
        let service = SystemService { inner };
        let wire = service.search("zip".to_string(), false, "tx-1".to_string());
        let envelope: Envelope = serde_json::from_str(&wire).unwrap();
        assert!(!envelope.error);
        assert_eq!(envelope.transaction.as_deref(), Some("tx-1"));
        assert_eq!(envelope.data["totalCount"], 1);
    }

    #[test]
    fn empty_transaction_is_synthesized() {
        let (inner, _dir) = test_inner(Arc::new(AllowAll));
        let service = SystemService { inner };
        let wire = service.info("zip".to_string(), String::new());
        let envelope: Envelope = serde_json::from_str(&wire).unwrap();
        assert!(envelope.error);
        assert!(envelope.transaction.is_some());
    }

    #[test]
    fn denied_policy_short_circuits() {
        let (inner, _dir) = test_inner(Arc::new(DenyAll));
        let service = SystemService { inner };
        let wire = service.update("tx".to_string());
        let envelope: Envelope = serde_json::from_str(&wire).unwrap();
        assert!(envelope.error);
        assert!(
            envelope.data["message"]
                .as_str()
                .unwrap()
                .contains("root privileges")
        );
    }
}
