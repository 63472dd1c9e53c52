use std::{collections::HashMap, fmt::Write as _, sync::Arc};

use log::{info, warn};
use parking_lot::RwLock;
use schema::{
    ApplicationDefinition, ApplicationId, ExtensionDescriptor, Request, validate_application,
};

use crate::{
    application::{ApplicationContext, ApplicationHandler},
    error::DispatchError,
    extension::{ExtensionEvent, ExtensionRegistry},
    statistics::render_metrics,
};

/// Outcome of one application's reaction to an extension change.
pub type RestartOutcome = (String, Result<(), DispatchError>);

#[derive(Default)]
struct RegistryState {
    by_id: HashMap<ApplicationId, Arc<ApplicationHandler>>,
    by_name: HashMap<String, ApplicationId>,
    by_root: HashMap<String, ApplicationId>,
}

impl RegistryState {
    fn remove(&mut self, id: ApplicationId) -> Option<Arc<ApplicationHandler>> {
        let app = self.by_id.remove(&id)?;
        self.by_name.retain(|_, candidate| *candidate != id);
        self.by_root.retain(|_, candidate| *candidate != id);
        Some(app)
    }
}

fn root_key(root: &str) -> String {
    root.trim_matches('/').to_ascii_lowercase()
}

/// Owns every running application of one server instance.
pub struct ServerRegistry {
    state: RwLock<RegistryState>,
    context: ApplicationContext,
}

impl ServerRegistry {
    pub fn new(context: ApplicationContext) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            context,
        }
    }

    pub fn context(&self) -> &ApplicationContext {
        &self.context
    }

    pub fn extensions(&self) -> &Arc<ExtensionRegistry> {
        &self.context.extensions
    }

    /// Registers and, when enabled, initializes the application. A failed
    /// init unregisters it again; other applications are unaffected.
    pub fn start_application(
        &self,
        definition: ApplicationDefinition,
    ) -> Result<Arc<ApplicationHandler>, DispatchError> {
        validate_application(&definition).map_err(|err| {
            DispatchError::InvalidDefinition(format!("application '{}': {err}", definition.name))
        })?;
        let id = definition.id;
        let name = definition.name.clone();
        let enabled = definition.enabled;
        let app = {
            let mut state = self.state.write();
            let name_key = name.to_ascii_lowercase();
            let root = root_key(&definition.request_root);
            if state.by_id.contains_key(&id)
                || state.by_name.contains_key(&name_key)
                || state.by_root.contains_key(&root)
            {
                return Err(DispatchError::ApplicationExists { name });
            }
            let app = Arc::new(ApplicationHandler::new(definition, self.context.clone()));
            state.by_id.insert(id, Arc::clone(&app));
            state.by_name.insert(name_key, id);
            state.by_root.insert(root, id);
            app
        };

        if enabled {
            if let Err(err) = app.init() {
                self.state.write().remove(id);
                return Err(err);
            }
        } else {
            info!("application '{name}' registered but disabled");
        }
        Ok(app)
    }

    /// Returns whether the application drained before its handlers were released.
    pub fn stop_application(&self, name: &str) -> Result<bool, DispatchError> {
        let app = {
            let mut state = self.state.write();
            let id = state
                .by_name
                .get(&name.to_ascii_lowercase())
                .copied()
                .ok_or_else(|| DispatchError::ApplicationNotFound {
                    name: name.to_string(),
                })?;
            state.remove(id)
        };
        Ok(app.map(|app| app.shutdown()).unwrap_or(true))
    }

    pub fn rename_application(&self, name: &str, new_name: &str) -> Result<(), DispatchError> {
        let mut state = self.state.write();
        let old_key = name.to_ascii_lowercase();
        let new_key = new_name.to_ascii_lowercase();
        let id = state
            .by_name
            .get(&old_key)
            .copied()
            .ok_or_else(|| DispatchError::ApplicationNotFound {
                name: name.to_string(),
            })?;
        if let Some(existing) = state.by_name.get(&new_key)
            && *existing != id
        {
            return Err(DispatchError::ApplicationExists {
                name: new_name.to_string(),
            });
        }
        if let Some(app) = state.by_id.get(&id) {
            app.rename(new_name);
        }
        state.by_name.remove(&old_key);
        state.by_name.insert(new_key, id);
        Ok(())
    }

    pub fn application(&self, name: &str) -> Option<Arc<ApplicationHandler>> {
        let state = self.state.read();
        let id = state.by_name.get(&name.to_ascii_lowercase())?;
        state.by_id.get(id).cloned()
    }

    pub fn application_for_root(&self, root: &str) -> Option<Arc<ApplicationHandler>> {
        let state = self.state.read();
        let id = state.by_root.get(&root_key(root))?;
        state.by_id.get(id).cloned()
    }

    /// Ordered by application id.
    pub fn applications(&self) -> Vec<Arc<ApplicationHandler>> {
        let mut apps: Vec<_> = self.state.read().by_id.values().cloned().collect();
        apps.sort_by_key(|app| app.id());
        apps
    }

    pub fn dispatch(&self, request: &mut Request) -> Result<(), DispatchError> {
        match self.application_for_root(request.request_root()) {
            Some(app) => app.process_request(request),
            None => {
                let err = DispatchError::RouteNotFound {
                    application: request.request_root().to_string(),
                    path: format!("/{}/{}", request.request_root(), request.page_path()),
                };
                err.write_response(request.response_mut());
                Err(err)
            }
        }
    }

    pub fn register_extension(&self, descriptor: ExtensionDescriptor) -> u64 {
        self.context.extensions.register(descriptor)
    }

    /// Unknown descriptors are registered without notifying anyone.
    pub fn update_extension(&self, descriptor: ExtensionDescriptor) -> Vec<RestartOutcome> {
        match self.context.extensions.update(descriptor.clone()) {
            Some(event) => self.notify_extension_changed(&event),
            None => {
                self.context.extensions.register(descriptor);
                Vec::new()
            }
        }
    }

    pub fn remove_extension(&self, name: &str) -> Vec<RestartOutcome> {
        self.context
            .extensions
            .remove(name)
            .map(|event| self.notify_extension_changed(&event))
            .unwrap_or_default()
    }

    pub fn disable_extension(&self, name: &str) -> Vec<RestartOutcome> {
        self.context
            .extensions
            .disable(name)
            .map(|event| self.notify_extension_changed(&event))
            .unwrap_or_default()
    }

    /// Runs quiesce-and-restart on the calling thread for every application
    /// referencing the extension, one after another.
    pub fn notify_extension_changed(&self, event: &ExtensionEvent) -> Vec<RestartOutcome> {
        let mut outcomes = Vec::new();
        for app in self.applications() {
            match app.handle_extension_change(event) {
                Ok(false) => {}
                Ok(true) => outcomes.push((app.name(), Ok(()))),
                Err(err) => {
                    warn!(
                        "application '{}' did not pick up extension '{}' change: {err}",
                        app.name(),
                        event.name
                    );
                    outcomes.push((app.name(), Err(err)));
                }
            }
        }
        outcomes
    }

    pub fn shutdown_all(&self) {
        let apps: Vec<_> = {
            let mut state = self.state.write();
            state.by_name.clear();
            state.by_root.clear();
            state.by_id.drain().map(|(_, app)| app).collect()
        };
        for app in apps {
            app.shutdown();
        }
    }

    pub fn metrics_text(&self) -> String {
        let apps = self.applications();
        let names: Vec<String> = apps.iter().map(|app| app.name()).collect();
        let samples: Vec<_> = apps
            .iter()
            .zip(&names)
            .map(|(app, name)| {
                (
                    name.as_str(),
                    app.statistics().samples(app.in_flight(), app.ceiling()),
                )
            })
            .collect();
        let mut out = render_metrics(&samples);

        let cache = self.context.cache.stats();
        for (name, kind, value) in [
            ("dispatch_response_cache_entries", "gauge", cache.entries as u64),
            ("dispatch_response_cache_hit_total", "counter", cache.hit_total),
            ("dispatch_response_cache_miss_total", "counter", cache.miss_total),
            ("dispatch_response_cache_store_total", "counter", cache.store_total),
            (
                "dispatch_response_cache_store_rejected_total",
                "counter",
                cache.store_rejected_total,
            ),
            ("dispatch_response_cache_flush_total", "counter", cache.flush_total),
        ] {
            let _ = writeln!(out, "# TYPE {name} {kind}");
            let _ = writeln!(out, "{name} {value}");
        }
        out
    }

    pub fn statistics_json(&self) -> serde_json::Value {
        let applications: Vec<serde_json::Value> = self
            .applications()
            .iter()
            .map(|app| {
                serde_json::json!({
                    "id": app.id(),
                    "name": app.name(),
                    "request_root": app.request_root(),
                    "lifecycle": app.lifecycle(),
                    "in_flight": app.in_flight(),
                    "ceiling": app.ceiling(),
                    "peak_in_flight": app.peak_in_flight(),
                    "statistics": app.statistics(),
                })
            })
            .collect();
        serde_json::json!({
            "applications": applications,
            "cache": self.context.cache.stats(),
        })
    }
}
