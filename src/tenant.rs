//! Tenant Manager (component H): lazily bootstraps one `Orchestrator` per
//! `client_id`, each rooted at its own directory so that distinct tenants
//! never observe each other's antibodies, graph, or ledger. Grounded on
//! `original_source/src/config.py::get_tenant_dir` and
//! `original_source/src/core/system.py`'s tenant lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::Config;
use crate::engine::LlmEngine;
use crate::error::GatewayError;
use crate::hardening::SelfHardeningCore;
use crate::hitl::ReviewQueue;
use crate::intent::IntentTracker;
use crate::ledger::Ledger;
use crate::membrane::Membrane;
use crate::orchestrator::Orchestrator;

pub struct TenantManager {
    cfg: Config,
    engine: Arc<dyn LlmEngine>,
    review_queue: Arc<ReviewQueue>,
    tenants: Mutex<HashMap<String, Arc<Orchestrator>>>,
}

impl TenantManager {
    pub fn new(cfg: Config, engine: Arc<dyn LlmEngine>) -> Self {
        let review_queue = Arc::new(ReviewQueue::new(&cfg.review_queue_path));
        Self {
            cfg,
            engine,
            review_queue,
            tenants: Mutex::new(HashMap::new()),
        }
    }

    fn bootstrap(&self, client_id: &str) -> Result<Orchestrator, GatewayError> {
        let tenant_dir = self.cfg.tenant_dir(client_id);
        std::fs::create_dir_all(&tenant_dir).map_err(|e| {
            GatewayError::TenantInit(client_id.to_string(), crate::error::PersistenceError::Io(e))
        })?;

        let membrane = Arc::new(Membrane::new(&tenant_dir, self.engine.clone()));
        let intent = Arc::new(IntentTracker::new(
            self.engine.clone(),
            self.review_queue.clone(),
            self.cfg.risk_threshold_block,
            self.cfg.risk_threshold_ambiguous,
            self.cfg.hitl_enabled,
        ));
        let hardening = Arc::new(SelfHardeningCore::new(self.engine.clone(), membrane.clone()));
        let genesis_data = serde_json::json!({
            "event": "Genesis",
            "model_fingerprint": self.cfg.model_fingerprint(),
        });
        let ledger = Arc::new(Ledger::with_genesis_data(&tenant_dir, genesis_data));

        Ok(Orchestrator::new(
            self.engine.clone(),
            membrane,
            intent,
            hardening,
            ledger,
            self.cfg.max_history_turns,
            self.cfg.parallel_layers,
            self.cfg.risk_threshold_block,
            self.cfg.safe_anchor_confidence,
        ))
    }

    /// Returns the orchestrator for `client_id`, constructing and caching
    /// it on first access.
    pub async fn orchestrator_for(&self, client_id: &str) -> Result<Arc<Orchestrator>, GatewayError> {
        let mut tenants = self.tenants.lock().await;
        if let Some(existing) = tenants.get(client_id) {
            return Ok(existing.clone());
        }
        let orchestrator = Arc::new(self.bootstrap(client_id)?);
        tenants.insert(client_id.to_string(), orchestrator.clone());
        Ok(orchestrator)
    }

    #[cfg(test)]
    pub async fn tenant_count(&self) -> usize {
        self.tenants.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LocalCpuEngine;
    use tempfile::tempdir;

    fn manager() -> (TenantManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.base_memory_dir = dir.path().to_path_buf();
        cfg.review_queue_path = dir.path().join("review_queue.json");
        let engine: Arc<dyn LlmEngine> = Arc::new(LocalCpuEngine::new());
        (TenantManager::new(cfg, engine), dir)
    }

    #[tokio::test]
    async fn same_client_id_reuses_orchestrator() {
        let (manager, _dir) = manager();
        let a = manager.orchestrator_for("alice").await.unwrap();
        let b = manager.orchestrator_for("alice").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.tenant_count().await, 1);
    }

    #[tokio::test]
    async fn distinct_tenants_get_distinct_state_directories() {
        let (manager, _dir) = manager();
        let alice = manager.orchestrator_for("alice").await.unwrap();
        let bob = manager.orchestrator_for("bob").await.unwrap();

        // A benign ALLOW with L2 risk 0 schedules a whitelist-learn, which
        // writes alice's antibodies.json but must never touch bob's.
        alice.process("hello there").await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let alice_path = manager.cfg.tenant_dir("alice").join("antibodies.json");
        let bob_path = manager.cfg.tenant_dir("bob").join("antibodies.json");
        assert!(alice_path.exists());
        assert!(!bob_path.exists());

        // Touching bob afterwards must not retroactively affect alice.
        bob.process("hello there").await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let alice_contents = std::fs::read_to_string(&alice_path).unwrap();
        assert!(alice_contents.contains("SAFE"));
    }
}
