use std::sync::Arc;

use tracing::error;

use murmur_db::Database;
use murmur_gateway::dispatcher::Dispatcher;

use crate::error::{ApiError, ApiResult};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub jwt_secret: String,
}

impl AppStateInner {
    /// Run a blocking database call off the async runtime.
    pub async fn run_db<F, T>(&self, f: F) -> ApiResult<T>
    where
        F: FnOnce(&Database) -> murmur_db::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                ApiError::Internal(e.to_string())
            })?
            .map_err(ApiError::from)
    }
}
