use std::sync::Arc;

use crate::application::repository::KeyValueRepository;

#[derive(Clone)]
pub struct ApiState {
    pub repository: Arc<KeyValueRepository>,
}

impl ApiState {
    pub fn new(repository: Arc<KeyValueRepository>) -> Self {
        Self { repository }
    }
}
