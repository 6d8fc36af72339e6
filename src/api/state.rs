use std::sync::Arc;

use crate::scheduler::JobService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<JobService>,
}
