use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, warn};

use super::Plugin;
use crate::error::Error;
use crate::request::{RequestContext, RequestOptions};
use crate::response::HttpResponse;
use crate::util::{read_unpoisoned, redact_uri_for_logs, write_unpoisoned};

struct PluginRecord {
    plugin: Arc<dyn Plugin>,
    name: String,
    priority: i32,
    sequence: u64,
    shut_down: AtomicBool,
}

impl PluginRecord {
    fn shutdown_once(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            debug!(plugin = %self.name, "shutting down plugin");
            self.plugin.shutdown();
        }
    }
}

/// Ordered plugin list owned by one client.
///
/// Hooks run against a snapshot of the list, so registration changes never
/// block in-flight requests and no lock is held while plugin code runs.
#[derive(Default)]
pub struct PluginPipeline {
    records: RwLock<Vec<Arc<PluginRecord>>>,
    next_sequence: AtomicU64,
}

impl PluginPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initializes `plugin` with `config` and inserts it at its priority.
    pub fn register(&self, plugin: Arc<dyn Plugin>, config: &Value) -> crate::Result<()> {
        let name = plugin.name().to_owned();
        if self.contains(&name) {
            return Err(duplicate(&name));
        }

        plugin
            .initialize(config)
            .map_err(|source| Error::PluginRegistration {
                plugin: name.clone(),
                message: source.to_string(),
            })?;

        let record = Arc::new(PluginRecord {
            priority: plugin.priority(),
            plugin,
            name: name.clone(),
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            shut_down: AtomicBool::new(false),
        });

        {
            let mut records = write_unpoisoned(&self.records);
            if !records.iter().any(|existing| existing.name == name) {
                records.push(record);
                records.sort_by_key(|record| (record.priority, record.sequence));
                debug!(plugin = %name, "registered plugin");
                return Ok(());
            }
        }

        // Lost a registration race for the same name.
        record.shutdown_once();
        Err(duplicate(&name))
    }

    /// Removes the plugin and shuts it down. Returns whether it was present.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = {
            let mut records = write_unpoisoned(&self.records);
            records
                .iter()
                .position(|record| record.name == name)
                .map(|index| records.remove(index))
        };
        match removed {
            Some(record) => {
                record.shutdown_once();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        read_unpoisoned(&self.records)
            .iter()
            .find(|record| record.name == name)
            .map(|record| Arc::clone(&record.plugin))
    }

    pub fn contains(&self, name: &str) -> bool {
        read_unpoisoned(&self.records)
            .iter()
            .any(|record| record.name == name)
    }

    /// Plugins in execution order.
    pub fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.snapshot()
            .into_iter()
            .map(|record| Arc::clone(&record.plugin))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .map(|record| record.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        read_unpoisoned(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        read_unpoisoned(&self.records).is_empty()
    }

    /// Metrics reported by every plugin that exposes any, keyed by name.
    pub fn all_metrics(&self) -> BTreeMap<String, Value> {
        self.snapshot()
            .into_iter()
            .filter_map(|record| {
                record
                    .plugin
                    .metrics()
                    .map(|metrics| (record.name.clone(), metrics))
            })
            .collect()
    }

    /// Shuts down and removes every plugin. Safe to call repeatedly.
    pub fn shutdown_all(&self) {
        let drained = std::mem::take(&mut *write_unpoisoned(&self.records));
        for record in drained {
            record.shutdown_once();
        }
    }

    pub(crate) fn run_pre_request(
        &self,
        context: &RequestContext,
        options: &mut RequestOptions,
    ) -> crate::Result<()> {
        for record in self.snapshot() {
            if let Err(source) = record.plugin.pre_request(context, options) {
                warn!(
                    plugin = %record.name,
                    error = %source,
                    "plugin aborted request"
                );
                return Err(Error::PluginAbort {
                    plugin: record.name.clone(),
                    method: context.method().clone(),
                    uri: redact_uri_for_logs(context.url()),
                    source,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn run_post_request(&self, context: &RequestContext, response: &mut HttpResponse) {
        for record in self.snapshot() {
            record.plugin.post_request(context, response);
        }
    }

    pub(crate) fn run_on_error(&self, context: &RequestContext, error: Error) -> Error {
        for record in self.snapshot() {
            if let Some(replacement) = record.plugin.on_error(context, &error) {
                debug!(plugin = %record.name, original = %error, "plugin replaced error");
                return replacement;
            }
        }
        error
    }

    fn snapshot(&self) -> Vec<Arc<PluginRecord>> {
        read_unpoisoned(&self.records).clone()
    }
}

impl std::fmt::Debug for PluginPipeline {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PluginPipeline")
            .field("plugins", &self.names())
            .finish()
    }
}

fn duplicate(name: &str) -> Error {
    Error::PluginRegistration {
        plugin: name.to_owned(),
        message: "a plugin with this name is already registered".to_owned(),
    }
}
