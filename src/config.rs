use std::env;

/// Browser-like User-Agent sent by the direct fetch tier.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub state_store_url: String,
    pub llm_api_key: Option<String>,
    pub llm_api_base: String,
    pub llm_model: String,
    pub identity_tenant: String,
    pub identity_client_id: String,
    pub identity_client_secret: String,
    pub sharepoint_host: String,
    pub sharepoint_site_path: String,
    /// Global cap on concurrently active worker sub-processes. A value of 0
    /// pauses admission entirely.
    pub max_concurrent_jobs: usize,
    /// Seconds between SIGTERM and SIGKILL when cancelling a worker.
    pub worker_grace_seconds: u64,
    pub user_agent: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidValue("PORT", "must be a valid u16"))?;

        let state_store_url = env::var("STATE_STORE_URL")
            .unwrap_or_else(|_| "sqlite://docharvest.db?mode=rwc".to_string());

        // The classifier degrades to the filename heuristic without a key.
        let llm_api_key = env::var("LLM_API_KEY").ok().filter(|k| !k.is_empty());

        let llm_api_base = env::var("LLM_API_BASE")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        let llm_model = env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let identity_tenant =
            env::var("IDENTITY_TENANT").map_err(|_| ConfigError::Missing("IDENTITY_TENANT"))?;
        let identity_client_id = env::var("IDENTITY_CLIENT_ID")
            .map_err(|_| ConfigError::Missing("IDENTITY_CLIENT_ID"))?;
        let identity_client_secret = env::var("IDENTITY_CLIENT_SECRET")
            .map_err(|_| ConfigError::Missing("IDENTITY_CLIENT_SECRET"))?;
        let sharepoint_host =
            env::var("SHAREPOINT_HOST").map_err(|_| ConfigError::Missing("SHAREPOINT_HOST"))?;
        let sharepoint_site_path = env::var("SHAREPOINT_SITE_PATH")
            .map_err(|_| ConfigError::Missing("SHAREPOINT_SITE_PATH"))?;

        let max_concurrent_jobs = env::var("MAX_CONCURRENT_JOBS")
            .unwrap_or_else(|_| "8".to_string())
            .parse::<usize>()
            .map_err(|_| {
                ConfigError::InvalidValue("MAX_CONCURRENT_JOBS", "must be a valid usize")
            })?;

        let worker_grace_seconds = env::var("WORKER_GRACE_SECONDS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::InvalidValue("WORKER_GRACE_SECONDS", "must be a valid u64")
            })?;

        let user_agent =
            env::var("USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string());

        Ok(Config {
            port,
            state_store_url,
            llm_api_key,
            llm_api_base,
            llm_model,
            identity_tenant,
            identity_client_id,
            identity_client_secret,
            sharepoint_host,
            sharepoint_site_path,
            max_concurrent_jobs,
            worker_grace_seconds,
            user_agent,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, &'static str),
}
