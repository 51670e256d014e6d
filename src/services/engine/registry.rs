use crate::core::config::{Config, EngineConfig, FallbackScope};
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::state::CharacterMap;
use crate::services::engine::http::HttpSpeechBackend;
use crate::services::engine::SpeechBackend;
use anyhow::{Context, Result};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct RegisteredEngine {
    backend: Arc<dyn SpeechBackend>,
    fallback: Option<Vec<String>>,
    permits: Arc<Semaphore>,
}

/// Engines available to a run, keyed by id.
pub struct EngineRegistry {
    engines: HashMap<String, RegisteredEngine>,
    default_engine: Option<String>,
    override_engine: Option<String>,
    project_chain: Vec<String>,
    /// Single slot shared by every resource-exclusive engine.
    exclusive_slot: Arc<Semaphore>,
}

/// Held for the duration of one engine call. Dropping it frees the slots.
pub struct EngineSlot {
    _engine: OwnedSemaphorePermit,
    _exclusive: Option<OwnedSemaphorePermit>,
}

impl EngineRegistry {
    pub fn new(
        default_engine: Option<String>,
        override_engine: Option<String>,
        project_chain: Vec<String>,
    ) -> Self {
        Self {
            engines: HashMap::new(),
            default_engine,
            override_engine,
            project_chain,
            exclusive_slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Builds every engine declared in the config.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new(
            config.generation.default_engine.clone(),
            config.generation.engine_override.clone(),
            config.generation.fallback_chain.clone(),
        );
        for engine in &config.engines {
            match engine {
                EngineConfig::Http(cfg) => {
                    let backend = HttpSpeechBackend::new(cfg.clone())
                        .with_context(|| format!("Failed to set up engine '{}'", cfg.id))?;
                    registry.register(Arc::new(backend), cfg.fallback.clone());
                }
            }
        }
        Ok(registry)
    }

    pub fn register(&mut self, backend: Arc<dyn SpeechBackend>, fallback: Option<Vec<String>>) {
        let id = backend.id().to_string();
        let permits = Arc::new(Semaphore::new(backend.capabilities().max_concurrency.max(1)));
        if self.engines.contains_key(&id) {
            warn!("Engine '{}' registered twice, keeping the latest", id);
        }
        self.engines.insert(
            id,
            RegisteredEngine {
                backend,
                fallback,
                permits,
            },
        );
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.engines.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get(&self, id: &str) -> PipelineResult<Arc<dyn SpeechBackend>> {
        self.engines
            .get(id)
            .map(|e| e.backend.clone())
            .ok_or_else(|| PipelineError::UnknownEngine {
                engine: id.to_string(),
            })
    }

    pub fn is_exclusive(&self, id: &str) -> bool {
        self.engines
            .get(id)
            .is_some_and(|e| e.backend.capabilities().resource_exclusive)
    }

    /// Picks the primary engine for a character.
    ///
    /// The run-wide override wins. Otherwise the character's own engine is
    /// used, and characters absent from the table speak with the default
    /// character's engine. The chapter engine and the project default fill
    /// in when neither names one.
    pub fn resolve(
        &self,
        character: &str,
        characters: &CharacterMap,
        default_character: &str,
        chapter_engine: Option<&str>,
    ) -> PipelineResult<String> {
        let from_character = |name: &str| {
            characters
                .characters
                .get(name)
                .and_then(|info| info.engine.as_deref())
        };

        let chosen = self
            .override_engine
            .as_deref()
            .or_else(|| {
                if characters.contains(character) {
                    from_character(character)
                } else {
                    from_character(default_character)
                }
            })
            .or(chapter_engine)
            .or(self.default_engine.as_deref())
            .ok_or_else(|| {
                PipelineError::Config(format!("No engine configured for '{}'", character))
            })?;

        self.get(chosen)?;
        Ok(chosen.to_string())
    }

    /// Primary engine followed by its fallbacks, without duplicates.
    ///
    /// An engine-level fallback list replaces the project chain. A forced
    /// override runs alone.
    pub fn fallback_chain(&self, primary: &str) -> Vec<String> {
        if self.override_engine.as_deref() == Some(primary) {
            return vec![primary.to_string()];
        }

        let backups = self
            .engines
            .get(primary)
            .and_then(|e| e.fallback.as_ref())
            .unwrap_or(&self.project_chain);

        let mut chain = vec![primary.to_string()];
        for id in backups {
            if !chain.contains(id) && self.engines.contains_key(id) {
                chain.push(id.clone());
            }
        }
        chain
    }

    /// Waits for a per-engine concurrency permit and, for resource-exclusive
    /// engines, the shared exclusive slot.
    pub async fn acquire(&self, id: &str) -> PipelineResult<EngineSlot> {
        let engine = self.engines.get(id).ok_or_else(|| PipelineError::UnknownEngine {
            engine: id.to_string(),
        })?;
        let closed = |_| PipelineError::Other(anyhow::anyhow!("engine '{}' slots closed", id));

        let exclusive = if engine.backend.capabilities().resource_exclusive {
            Some(self.exclusive_slot.clone().acquire_owned().await.map_err(closed)?)
        } else {
            None
        };
        let permit = engine.permits.clone().acquire_owned().await.map_err(closed)?;

        Ok(EngineSlot {
            _engine: permit,
            _exclusive: exclusive,
        })
    }

    pub async fn release(&self, id: &str) -> PipelineResult<()> {
        let backend = self.get(id)?;
        info!("Releasing engine '{}'", id);
        backend.release().await?;
        Ok(())
    }
}

/// Tracks engines demoted after a failure.
///
/// Demoted engines move to the end of every chain, so they are still tried
/// when nothing else works. With chapter scope the demotions are forgotten at
/// the start of each chapter.
#[derive(Clone)]
pub struct FallbackPolicy {
    scope: FallbackScope,
    demoted: Arc<Mutex<Vec<String>>>,
}

impl FallbackPolicy {
    pub fn new(scope: FallbackScope) -> Self {
        Self {
            scope,
            demoted: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn scope(&self) -> FallbackScope {
        self.scope
    }

    pub fn begin_chapter(&self) {
        if self.scope == FallbackScope::Chapter {
            self.lock().clear();
        }
    }

    pub fn demote(&self, id: &str) {
        let mut demoted = self.lock();
        if !demoted.iter().any(|d| d == id) {
            info!("Demoting engine '{}' ({:?} scope)", id, self.scope);
            demoted.push(id.to_string());
        }
    }

    pub fn is_demoted(&self, id: &str) -> bool {
        self.lock().iter().any(|d| d == id)
    }

    pub fn apply(&self, chain: Vec<String>) -> Vec<String> {
        let demoted = self.lock();
        let (mut healthy, mut demoted_in_chain): (Vec<String>, Vec<String>) =
            chain.into_iter().partition(|id| !demoted.contains(id));
        demoted_in_chain.sort_by_key(|id| demoted.iter().position(|d| d == id));
        healthy.append(&mut demoted_in_chain);
        healthy
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.demoted.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::CharacterInfo;
    use crate::services::engine::mock::ScriptedBackend;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn registry() -> EngineRegistry {
        let mut registry = EngineRegistry::new(
            Some("cloud_a".to_string()),
            None,
            vec!["cloud_a".to_string(), "cloud_b".to_string()],
        );
        registry.register(Arc::new(ScriptedBackend::new("cloud_a")), None);
        registry.register(Arc::new(ScriptedBackend::new("cloud_b")), None);
        registry.register(
            Arc::new(ScriptedBackend::exclusive("local_x")),
            Some(vec!["cloud_b".to_string()]),
        );
        registry
    }

    fn cast() -> CharacterMap {
        let mut characters = HashMap::new();
        characters.insert(
            "narrator".to_string(),
            CharacterInfo {
                engine: Some("cloud_b".to_string()),
                ..Default::default()
            },
        );
        characters.insert(
            "hero".to_string(),
            CharacterInfo {
                engine: Some("local_x".to_string()),
                ..Default::default()
            },
        );
        characters.insert("crowd".to_string(), CharacterInfo::default());
        CharacterMap { characters }
    }

    #[test]
    fn test_resolve_order() {
        let registry = registry();
        let cast = cast();
        assert_eq!(registry.resolve("hero", &cast, "narrator", None).unwrap(), "local_x");
        // Unknown speakers borrow the default character's engine.
        assert_eq!(registry.resolve("ghost", &cast, "narrator", None).unwrap(), "cloud_b");
        // Known character without an engine falls to the chapter engine.
        assert_eq!(
            registry.resolve("crowd", &cast, "narrator", Some("local_x")).unwrap(),
            "local_x"
        );
        assert_eq!(registry.resolve("crowd", &cast, "narrator", None).unwrap(), "cloud_a");
    }

    #[test]
    fn test_override_forces_single_engine() {
        let mut registry = registry();
        registry.override_engine = Some("cloud_b".to_string());
        assert_eq!(registry.resolve("hero", &cast(), "narrator", None).unwrap(), "cloud_b");
        assert_eq!(registry.fallback_chain("cloud_b"), vec!["cloud_b"]);
    }

    #[test]
    fn test_resolve_unknown_engine() {
        let mut cast = cast();
        cast.characters.get_mut("hero").unwrap().engine = Some("nowhere".to_string());
        let err = registry().resolve("hero", &cast, "narrator", None).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownEngine { engine } if engine == "nowhere"));
    }

    #[test]
    fn test_fallback_chain_dedupes_and_prefers_engine_list() {
        let registry = registry();
        assert_eq!(registry.fallback_chain("cloud_a"), vec!["cloud_a", "cloud_b"]);
        assert_eq!(registry.fallback_chain("cloud_b"), vec!["cloud_b", "cloud_a"]);
        assert_eq!(registry.fallback_chain("local_x"), vec!["local_x", "cloud_b"]);
    }

    #[test]
    fn test_policy_chapter_scope_resets() {
        let policy = FallbackPolicy::new(FallbackScope::Chapter);
        let chain = vec!["cloud_a".to_string(), "cloud_b".to_string()];
        policy.demote("cloud_a");
        assert_eq!(policy.apply(chain.clone()), vec!["cloud_b", "cloud_a"]);
        policy.begin_chapter();
        assert_eq!(policy.apply(chain), vec!["cloud_a", "cloud_b"]);
    }

    #[test]
    fn test_policy_project_scope_persists_for_run() {
        let policy = FallbackPolicy::new(FallbackScope::Project);
        policy.demote("cloud_a");
        policy.begin_chapter();
        assert!(policy.is_demoted("cloud_a"));
        assert_eq!(
            policy.apply(vec!["cloud_a".to_string(), "cloud_b".to_string()]),
            vec!["cloud_b", "cloud_a"]
        );
    }

    #[tokio::test]
    async fn test_exclusive_engines_share_one_slot() {
        let mut registry = EngineRegistry::new(None, None, Vec::new());
        registry.register(Arc::new(ScriptedBackend::exclusive("local_x")), None);
        registry.register(Arc::new(ScriptedBackend::exclusive("local_y")), None);

        let held = registry.acquire("local_x").await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), registry.acquire("local_y")).await;
        assert!(blocked.is_err(), "second exclusive engine must wait");
        drop(held);
        assert!(registry.acquire("local_y").await.is_ok());
    }

    #[tokio::test]
    async fn test_release_calls_backend() {
        let backend = Arc::new(ScriptedBackend::exclusive("local_x"));
        let mut registry = EngineRegistry::new(None, None, Vec::new());
        registry.register(backend.clone(), None);
        registry.release("local_x").await.unwrap();
        assert_eq!(backend.releases.load(Ordering::SeqCst), 1);
    }
}
