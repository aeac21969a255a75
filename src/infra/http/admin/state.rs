use std::sync::Arc;

use crate::cache::{CacheAdmin, CacheEngine};

#[derive(Clone)]
pub struct AdminState {
    pub cache: CacheAdmin,
    pub engine: Arc<CacheEngine>,
}

impl AdminState {
    pub fn new(engine: Arc<CacheEngine>) -> Self {
        Self {
            cache: CacheAdmin::new(Arc::clone(&engine)),
            engine,
        }
    }
}
