use chrono::{Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use taskmesh_core::agent::OFFLINE_AFTER_SECS;
use taskmesh_core::{AgentRegistration, AgentStatus, MeshError, MeshResult};
use taskmesh_store::KvStore;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Key prefix for individual registrations.
pub const AGENT_KEY_PREFIX: &str = "agent:";
/// Key holding the list of every registered `appId`.
pub const AGENT_INDEX_KEY: &str = "agents:index";

fn agent_key(app_id: &str) -> String {
    format!("{AGENT_KEY_PREFIX}{app_id}")
}

/// Directory of agent registrations backed by a plain key/value store.
///
/// Each registration lives under `agent:{appId}`; a secondary index key lists
/// all ids. The two writes are not transactional: an index entry missing
/// after a crash is restored by the agent's next register or heartbeat.
pub struct AgentRegistry {
    store: Arc<dyn KvStore>,
    /// Serialises writes to `agent:*` keys so a heartbeat's read-modify-write
    /// cannot overwrite a concurrent re-registration. Taken before `index_lock`.
    record_lock: Mutex<()>,
    /// Serialises read-modify-write cycles on the index key.
    index_lock: Mutex<()>,
}

impl AgentRegistry {
    /// A registry over `store`. Nothing is read until the first call.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            record_lock: Mutex::new(()),
            index_lock: Mutex::new(()),
        }
    }

    /// Upsert a registration. Registering counts as a heartbeat.
    pub async fn register(&self, mut reg: AgentRegistration) -> MeshResult<AgentRegistration> {
        reg.validate()?;
        let _record = self.record_lock.lock().await;
        reg.last_heartbeat = Utc::now();
        reg.status = AgentStatus::Online;

        self.store
            .save(&agent_key(&reg.app_id), &serde_json::to_value(&reg)?)
            .await?;
        self.add_to_index(&reg.app_id).await?;

        info!(
            agent = %reg.app_id,
            capabilities = reg.capabilities.len(),
            "Agent registered"
        );
        Ok(reg)
    }

    /// Refresh an agent's heartbeat. Returns `false` for unknown agents.
    pub async fn heartbeat(&self, app_id: &str) -> MeshResult<bool> {
        let _record = self.record_lock.lock().await;
        let Some(mut reg) = self.load(app_id).await? else {
            debug!(agent = %app_id, "Heartbeat from unknown agent ignored");
            return Ok(false);
        };
        reg.last_heartbeat = Utc::now();
        reg.status = AgentStatus::Online;
        self.store
            .save(&agent_key(app_id), &serde_json::to_value(&reg)?)
            .await?;
        self.add_to_index(app_id).await?;
        Ok(true)
    }

    /// A single registration with recomputed status.
    pub async fn get(&self, app_id: &str) -> MeshResult<Option<AgentRegistration>> {
        let now = Utc::now();
        Ok(self
            .load(app_id)
            .await?
            .map(|reg| reg.with_recomputed_status(now)))
    }

    /// Every registration with recomputed status, ordered by `appId`.
    pub async fn list_all(&self) -> MeshResult<Vec<AgentRegistration>> {
        let now = Utc::now();
        let mut agents = Vec::new();
        for app_id in self.read_index().await? {
            match self.load(&app_id).await {
                Ok(Some(reg)) => agents.push(reg.with_recomputed_status(now)),
                Ok(None) => debug!(agent = %app_id, "Index entry without registration"),
                Err(e) => warn!(agent = %app_id, error = %e, "Skipping unreadable registration"),
            }
        }
        agents.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        Ok(agents)
    }

    /// Registrations declaring `capability` that are not offline.
    pub async fn find_by_capability(&self, capability: &str) -> MeshResult<Vec<AgentRegistration>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|reg| reg.has_capability(capability) && reg.status != AgentStatus::Offline)
            .collect())
    }

    /// Force an agent offline until its next heartbeat.
    ///
    /// Status is derived from heartbeat age on read, so the heartbeat is
    /// back-dated past the offline threshold as well.
    pub async fn mark_offline(&self, app_id: &str) -> MeshResult<bool> {
        let _record = self.record_lock.lock().await;
        let Some(mut reg) = self.load(app_id).await? else {
            return Ok(false);
        };
        reg.status = AgentStatus::Offline;
        reg.last_heartbeat = Utc::now() - Duration::seconds(OFFLINE_AFTER_SECS);
        self.store
            .save(&agent_key(app_id), &serde_json::to_value(&reg)?)
            .await?;
        info!(agent = %app_id, "Agent marked offline");
        Ok(true)
    }

    /// Remove a registration and its index entry. Unknown ids are a no-op.
    pub async fn deregister(&self, app_id: &str) -> MeshResult<bool> {
        let _record = self.record_lock.lock().await;
        let existed = self.load(app_id).await?.is_some();
        self.store.delete(&agent_key(app_id)).await?;

        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;
        let before = index.len();
        index.retain(|id| id != app_id);
        if index.len() != before {
            self.write_index(&index).await?;
        }
        if existed {
            info!(agent = %app_id, "Agent deregistered");
        }
        Ok(existed)
    }

    async fn load(&self, app_id: &str) -> MeshResult<Option<AgentRegistration>> {
        match self.store.get(&agent_key(app_id)).await? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                MeshError::Registry(format!("corrupt registration for '{app_id}': {e}"))
            }),
        }
    }

    async fn add_to_index(&self, app_id: &str) -> MeshResult<()> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;
        if index.iter().any(|id| id == app_id) {
            return Ok(());
        }
        index.push(app_id.to_string());
        self.write_index(&index).await
    }

    async fn read_index(&self) -> MeshResult<Vec<String>> {
        match self.store.get(AGENT_INDEX_KEY).await? {
            None => Ok(Vec::new()),
            Some(value) => serde_json::from_value(value)
                .map_err(|e| MeshError::Registry(format!("corrupt agent index: {e}"))),
        }
    }

    async fn write_index(&self, index: &[String]) -> MeshResult<()> {
        self.store
            .save(AGENT_INDEX_KEY, &Value::from(index.to_vec()))
            .await
    }
}
