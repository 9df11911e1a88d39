// Settings loaded from the environment, with defaults for the hosted ModelScope endpoint.

use std::env;

lazy_static::lazy_static! {
    pub static ref MODELSCOPE_API_KEY: String = env::var("MODELSCOPE_API_KEY").unwrap_or_default();
    pub static ref MODELSCOPE_BASE_URL: String = env::var("MODELSCOPE_BASE_URL").unwrap_or_else(|_| "https://api-inference.modelscope.cn/v1".to_string());
    pub static ref DIVINA_MODEL: String = env::var("DIVINA_MODEL").unwrap_or_else(|_| "Qwen/Qwen3-235B-A22B-Instruct-2507".to_string());
    pub static ref TEMPLATES_DIR: String = env::var("DIVINA_TEMPLATES_DIR").unwrap_or_else(|_| "templates".to_string());
    pub static ref STATIC_DIR: String = env::var("DIVINA_STATIC_DIR").unwrap_or_else(|_| "static".to_string());
}

/// Key shipped in sample deployments; it is never accepted as a real credential.
pub const PLACEHOLDER_API_KEY: &str = "ms-00000000-0000-0000-0000-000000000000";

pub const TEMPERATURE: f32 = 0.7;
pub const MAX_TOKENS: u32 = 1500;
pub const REQUEST_TIMEOUT_SECS: u64 = 120;

pub const DEFAULT_PORT: u16 = 8501;
