use kiln_job_queue::JobQueueClient;

/// Shared application state passed to every route handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub job_queue: JobQueueClient,
    admin_token: Option<String>,
}

impl AppState {
    pub fn new(job_queue: JobQueueClient) -> Self {
        Self {
            job_queue,
            admin_token: None,
        }
    }

    /// Require `Authorization: Bearer <token>` on the job routes.
    #[must_use]
    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }
}
