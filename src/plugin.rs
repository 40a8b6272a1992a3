//! Plugin Manager (spec §4.10): a typed registry with dependency ordering, grounded in
//! `backtest_v2::strategy_factory`'s name→factory lookup (`make_strategy`, "unknown name" error
//! listing available options), generalized from one flat match arm to a dependency-ordered
//! registry spanning five plugin kinds.

use crate::clock::Clock;
use crate::config::RuntimeConfig;
use crate::error::{CoreError, CoreResult};
use crate::event_store::{EventStore, TruthState};
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    SensorInput,
    Fusion,
    RenderPolicy,
    RenderBackend,
    SituationalAnalysis,
}

impl PluginKind {
    fn as_str(self) -> &'static str {
        match self {
            PluginKind::SensorInput => "sensor_input",
            PluginKind::Fusion => "fusion",
            PluginKind::RenderPolicy => "render_policy",
            PluginKind::RenderBackend => "render_backend",
            PluginKind::SituationalAnalysis => "situational_analysis",
        }
    }
}

/// Shared context handed to every plugin factory at instantiation (spec §4.10).
pub struct PluginContext {
    pub clock: Arc<dyn Clock>,
    pub event_store: Arc<EventStore>,
    pub config: Arc<RuntimeConfig>,
}

/// Marker trait every registered plugin instance implements. Kept intentionally small: the
/// interesting per-kind behavior lives in the typed components (`FusionEngine`, `RenderPolicy`,
/// ...) a plugin constructs and hands back to the pipeline; the plugin itself is an opaque
/// named, dependency-ordered unit from the registry's point of view.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
}

/// Enum-dispatched built-in plugins (spec §9 re-architecture note: "enum-dispatch for
/// built-ins, boxed dyn for user plugins"). Each variant is a zero-cost marker identifying which
/// of the core's own components backs this plugin slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinPlugin {
    DefaultSensorInput,
    DefaultFusion,
    DefaultRenderPolicy,
    DefaultRenderBackend,
    DefaultSituationalAnalysis,
}

impl Plugin for BuiltinPlugin {
    fn name(&self) -> &str {
        match self {
            BuiltinPlugin::DefaultSensorInput => "builtin.sensor_input",
            BuiltinPlugin::DefaultFusion => "builtin.fusion",
            BuiltinPlugin::DefaultRenderPolicy => "builtin.render_policy",
            BuiltinPlugin::DefaultRenderBackend => "builtin.render_backend",
            BuiltinPlugin::DefaultSituationalAnalysis => "builtin.situational_analysis",
        }
    }
}

fn builtin_for(kind: PluginKind) -> BuiltinPlugin {
    match kind {
        PluginKind::SensorInput => BuiltinPlugin::DefaultSensorInput,
        PluginKind::Fusion => BuiltinPlugin::DefaultFusion,
        PluginKind::RenderPolicy => BuiltinPlugin::DefaultRenderPolicy,
        PluginKind::RenderBackend => BuiltinPlugin::DefaultRenderBackend,
        PluginKind::SituationalAnalysis => BuiltinPlugin::DefaultSituationalAnalysis,
    }
}

pub type PluginFactory =
    Box<dyn Fn(&PluginContext) -> CoreResult<Box<dyn Plugin>> + Send + Sync>;

struct PluginEntry {
    name: String,
    kind: PluginKind,
    provides: Vec<String>,
    requires: Vec<String>,
    factory: PluginFactory,
}

/// Registry of available plugin factories, keyed by name. Holds no instances; `instantiate`
/// builds a fresh, dependency-ordered set for one pipeline.
#[derive(Default)]
pub struct PluginRegistry {
    entries: Vec<PluginEntry>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        kind: PluginKind,
        provides: Vec<String>,
        requires: Vec<String>,
        factory: PluginFactory,
    ) -> CoreResult<()> {
        let name = name.into();
        if self.entries.iter().any(|e| e.name == name) {
            return Err(CoreError::InvalidConfig(format!("duplicate plugin name '{name}'")));
        }
        self.entries.push(PluginEntry { name, kind, provides, requires, factory });
        Ok(())
    }

    fn find(&self, name: &str) -> Option<&PluginEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Kahn's-algorithm topological order over `requires` edges restricted to `selected` names.
    /// A residual non-empty frontier-less set signals a cycle.
    fn topo_order(&self, selected: &[String]) -> CoreResult<Vec<String>> {
        let selected_set: HashSet<&str> = selected.iter().map(|s| s.as_str()).collect();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for name in selected {
            in_degree.entry(name.as_str()).or_insert(0);
        }
        for name in selected {
            if let Some(entry) = self.find(name) {
                for dep in &entry.requires {
                    if selected_set.contains(dep.as_str()) {
                        *in_degree.entry(name.as_str()).or_insert(0) += 1;
                        dependents.entry(dep.as_str()).or_default().push(name.as_str());
                    }
                }
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, °ree)| degree == 0)
            .map(|(&name, _)| name)
            .collect();
        let mut ordered: Vec<String> = Vec::with_capacity(selected.len());

        while let Some(name) = queue.pop_front() {
            ordered.push(name.to_string());
            if let Some(deps) = dependents.get(name) {
                for &dependent in deps {
                    let degree = in_degree.get_mut(dependent).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if ordered.len() != selected.len() {
            let unresolved: Vec<String> = selected
                .iter()
                .filter(|n| !ordered.contains(n))
                .cloned()
                .collect();
            return Err(CoreError::DependencyCycle(unresolved));
        }
        Ok(ordered)
    }

    /// Instantiate one plugin per requested `(kind, name)` pair in dependency order. Unknown
    /// names are fatal in strict mode; otherwise they fall back to the kind's built-in and emit
    /// `PLUGIN_FALLBACK_USED`.
    pub fn instantiate(
        &self,
        requested: &[(PluginKind, String)],
        ctx: &PluginContext,
        strict_mode: bool,
    ) -> CoreResult<HashMap<PluginKind, Box<dyn Plugin>>> {
        let names: Vec<String> = requested.iter().map(|(_, n)| n.clone()).collect();
        let known_names: Vec<String> = names
            .iter()
            .filter(|n| self.find(n).is_some())
            .cloned()
            .collect();
        let order = self.topo_order(&known_names)?;

        let mut built: HashMap<String, ()> = HashMap::new();
        let mut out = HashMap::new();

        for name in &order {
            let entry = self.find(name).expect("topo_order only returns known names");
            let plugin = (entry.factory)(ctx)?;
            built.insert(name.clone(), ());
            out.insert(entry.kind, plugin);
        }

        for (kind, name) in requested {
            if out.contains_key(kind) {
                continue;
            }
            if self.find(name).is_none() {
                if strict_mode {
                    return Err(CoreError::UnknownPlugin(name.clone(), kind.as_str().to_string()));
                }
                let _ = ctx.event_store.append(
                    "PLUGIN",
                    "PLUGIN_FALLBACK_USED",
                    serde_json::json!({"kind": kind.as_str(), "requested": name}),
                    TruthState::Fallback,
                    "UNKNOWN_PLUGIN_NAME",
                    Some(ctx.clock.now()),
                );
                out.insert(*kind, Box::new(builtin_for(*kind)) as Box<dyn Plugin>);
            }
        }

        Ok(out)
    }
}

/// Plugin profile YAML (spec §6): `schema_version:1`, `profiles: {<name>: {<kind>: {name, params?}}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginProfileEntry {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginProfileFile {
    pub schema_version: u32,
    pub profiles: HashMap<String, HashMap<String, PluginProfileEntry>>,
}

impl PluginProfileFile {
    pub fn load(path: &std::path::Path) -> CoreResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::WriterIo(format!("read {path:?}: {e}")))?;
        let file: Self = serde_yaml::from_str(&raw)
            .map_err(|e| CoreError::InvalidConfig(format!("invalid plugin profile YAML: {e}")))?;
        if file.schema_version != 1 {
            return Err(CoreError::InvalidConfig(format!(
                "plugin profile schema_version {} unsupported",
                file.schema_version
            )));
        }
        Ok(file)
    }

    /// Flattens one named profile into `(kind, plugin_name)` pairs for `PluginRegistry::instantiate`.
    pub fn profile_requests(&self, profile_name: &str) -> CoreResult<Vec<(PluginKind, String)>> {
        let profile = self.profiles.get(profile_name).ok_or_else(|| {
            CoreError::InvalidConfig(format!("unknown plugin profile '{profile_name}'"))
        })?;
        let mut out = Vec::new();
        for (kind_str, entry) in profile {
            let kind: PluginKind = serde_yaml::from_str(&format!("\"{kind_str}\""))
                .map_err(|_| CoreError::InvalidConfig(format!("unknown plugin kind '{kind_str}'")))?;
            out.push((kind, entry.name.clone()));
        }
        Ok(out)
    }
}
