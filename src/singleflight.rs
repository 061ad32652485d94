use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

/// Keyed await group: concurrent callers for the same key share one
/// execution of the underlying future and all observe its result.
pub struct Group<K, T> {
    inner: Arc<Mutex<HashMap<K, Arc<Call<T>>>>>,
}

impl<K, T> Group<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn do_call<F, Fut>(&self, key: K, f: F) -> T
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let call = {
            let mut map = self.inner.lock().await;
            if let Some(call) = map.get(&key) {
                call.clone()
            } else {
                let call = Arc::new(Call::new());
                map.insert(key.clone(), call.clone());
                tokio::spawn(run_call(self.inner.clone(), key, call.clone(), f));
                call
            }
        };

        call.wait().await
    }
}

impl<K, T> Default for Group<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

struct Call<T> {
    notify: Notify,
    result: Mutex<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> Call<T> {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            result: Mutex::new(None),
        }
    }

    async fn wait(&self) -> T {
        loop {
            if let Some(val) = self.result.lock().await.clone() {
                return val;
            }
            self.notify.notified().await;
        }
    }

    async fn set(&self, val: T) {
        let mut slot = self.result.lock().await;
        *slot = Some(val);
        self.notify.notify_waiters();
    }
}

async fn run_call<K, T, F, Fut>(
    map: Arc<Mutex<HashMap<K, Arc<Call<T>>>>>,
    key: K,
    call: Arc<Call<T>>,
    f: F,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let result = f().await;
    call.set(result).await;
    let mut map = map.lock().await;
    map.remove(&key);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let group = Arc::new(Group::<u32, usize>::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let group = Arc::clone(&group);
            let executions = Arc::clone(&executions);
            handles.push(tokio::spawn(async move {
                group
                    .do_call(7, move || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        executions.fetch_add(1, Ordering::SeqCst)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 0);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let group = Arc::new(Group::<u32, u32>::new());
        let a = group.do_call(1, || async { 10 }).await;
        let b = group.do_call(2, || async { 20 }).await;
        assert_eq!((a, b), (10, 20));
    }
}
