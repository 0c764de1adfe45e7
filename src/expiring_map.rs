//! Expiring `tool_call_id -> tool_name` map (C5's follow-up correlation
//! table). Entries live for 6 hours; a background task sweeps every 10
//! minutes, and `get` also treats an expired-but-unswept entry as a miss.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

const ENTRY_TTL: Duration = Duration::from_secs(6 * 60 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub struct ExpiringMap {
    data: Mutex<HashMap<String, (String, Instant)>>,
}

impl ExpiringMap {
    pub fn new() -> Arc<Self> {
        let map = Arc::new(Self {
            data: Mutex::new(HashMap::new()),
        });
        let sweeper = map.clone();
        tokio::spawn(async move { sweeper.sweep_loop().await });
        map
    }

    pub async fn set(&self, key: String, value: String) {
        let expiry = Instant::now() + ENTRY_TTL;
        self.data.lock().await.insert(key, (value, expiry));
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let mut data = self.data.lock().await;
        match data.get(key) {
            Some((value, expiry)) if Instant::now() < *expiry => Some(value.clone()),
            Some(_) => {
                data.remove(key);
                None
            }
            None => None,
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            let now = Instant::now();
            self.data.lock().await.retain(|_, (_, expiry)| *expiry > now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let map = ExpiringMap::new();
        map.set("call-1".into(), "get_weather".into()).await;
        assert_eq!(map.get("call-1").await, Some("get_weather".to_string()));
    }

    #[tokio::test]
    async fn get_is_a_miss_for_unknown_keys() {
        let map = ExpiringMap::new();
        assert_eq!(map.get("missing").await, None);
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss_even_before_the_sweep() {
        let map = ExpiringMap::new();
        {
            let mut data = map.data.lock().await;
            data.insert(
                "stale".into(),
                ("tool".into(), Instant::now() - Duration::from_secs(1)),
            );
        }
        assert_eq!(map.get("stale").await, None);
    }
}
