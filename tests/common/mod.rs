use std::sync::Arc;

use afscache::cache::Cache;
use afscache::rpc::{Origin, OriginServer};
use afscache::session::Session;

pub struct Fixture {
    pub cache: Arc<Cache>,
    pub origin: Arc<dyn Origin>,
    _cache_dir: tempfile::TempDir,
    _origin_dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new(capacity: u64) -> Self {
        let cache_dir = tempfile::tempdir().expect("create cache tempdir");
        let origin_dir = tempfile::tempdir().expect("create origin tempdir");
        let cache = Arc::new(Cache::new(cache_dir.path().to_path_buf(), capacity));
        let origin: Arc<dyn Origin> = Arc::new(OriginServer::new(origin_dir.path().to_path_buf()));
        Self { cache, origin, _cache_dir: cache_dir, _origin_dir: origin_dir }
    }

    pub fn session(&self) -> Session {
        Session::new(self.cache.clone(), self.origin.clone())
    }
}
