use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::{pipeline::validate_stage_name, types::MergeMethod};

/// Full application configuration, read from the environment with `.env`
/// as a fallback. The bearer token is the only secret and never leaves
/// this struct except through the session.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,
    pub github_token: String,
    pub github_api_url: String,
    pub git_base_url: String,
    pub request_timeout_s: u64,

    // Pipeline
    pub work_dir: String,
    pub keep_workdirs: bool,
    pub pipeline_stages: Vec<String>,
    pub stage_dir: String,
    pub stage_interpreter: String,
    /// Kill a stage and fail the run after this many seconds (0 = no limit).
    pub stage_timeout_s: u64,
    pub pipeline_max_concurrent: usize,
    pub merge_method: MergeMethod,

    // Reconciliation
    pub poll_interval_s: u64,

    // Test pull requests
    pub test_pr_base: String,
    pub test_pr_file: String,

    // Web
    pub web_bind: String,
    pub web_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "data".into(),
            github_token: String::new(),
            github_api_url: "https://api.github.com".into(),
            git_base_url: "https://github.com".into(),
            request_timeout_s: 30,
            work_dir: std::env::temp_dir()
                .join("outline-work")
                .to_string_lossy()
                .into_owned(),
            keep_workdirs: false,
            pipeline_stages: vec!["build".into(), "test".into(), "deploy".into()],
            stage_dir: ".outline".into(),
            stage_interpreter: "bash".into(),
            stage_timeout_s: 1800,
            pipeline_max_concurrent: 2,
            merge_method: MergeMethod::Squash,
            poll_interval_s: 5,
            test_pr_base: "main".into(),
            test_pr_file: "outline-test.txt".into(),
            web_bind: "127.0.0.1".into(),
            web_port: 8080,
        }
    }
}

fn parse_dotenv() -> HashMap<String, String> {
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return HashMap::new();
    };
    parse_dotenv_str(&contents)
}

fn parse_dotenv_str(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim().trim_matches('"');
            map.insert(k.trim().to_string(), v.to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        Some(_) => default,
        None => default,
    }
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn resolve_tilde(path: &str) -> String {
    if path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home, path.strip_prefix("~/").unwrap_or(path));
        }
    }
    path.to_string()
}

/// Split a comma-separated stage list, dropping blanks.
pub fn parse_stage_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();
        let config = Self::from_lookup(&dotenv)?;
        config.validate()?;
        Ok(config)
    }

    fn from_lookup(dotenv: &HashMap<String, String>) -> Result<Self> {
        let d = Config::default();

        let merge_raw = get_str("MERGE_METHOD", dotenv, d.merge_method.as_str());
        let Some(merge_method) = MergeMethod::parse(&merge_raw) else {
            bail!("MERGE_METHOD must be one of squash, merge, rebase (got '{merge_raw}')");
        };

        Ok(Config {
            data_dir: resolve_tilde(&get_str("DATA_DIR", dotenv, &d.data_dir)),
            github_token: get_str("GITHUB_TOKEN", dotenv, "").trim().to_string(),
            github_api_url: get_str("GITHUB_API_URL", dotenv, &d.github_api_url),
            git_base_url: get_str("GIT_BASE_URL", dotenv, &d.git_base_url),
            request_timeout_s: get_u64("REQUEST_TIMEOUT_S", dotenv, d.request_timeout_s),
            work_dir: resolve_tilde(&get_str("WORK_DIR", dotenv, &d.work_dir)),
            keep_workdirs: get_bool("KEEP_WORKDIRS", dotenv, d.keep_workdirs),
            pipeline_stages: match get("PIPELINE_STAGES", dotenv) {
                Some(raw) => parse_stage_list(&raw),
                None => d.pipeline_stages,
            },
            stage_dir: get_str("STAGE_DIR", dotenv, &d.stage_dir),
            stage_interpreter: get_str("STAGE_INTERPRETER", dotenv, &d.stage_interpreter),
            stage_timeout_s: get_u64("STAGE_TIMEOUT_S", dotenv, d.stage_timeout_s),
            pipeline_max_concurrent: get_u64(
                "PIPELINE_MAX_CONCURRENT",
                dotenv,
                d.pipeline_max_concurrent as u64,
            ) as usize,
            merge_method,
            poll_interval_s: get_u64("POLL_INTERVAL_S", dotenv, d.poll_interval_s),
            test_pr_base: get_str("TEST_PR_BASE", dotenv, &d.test_pr_base),
            test_pr_file: get_str("TEST_PR_FILE", dotenv, &d.test_pr_file),
            web_bind: get_str("WEB_BIND", dotenv, &d.web_bind),
            web_port: get_u16("WEB_PORT", dotenv, d.web_port),
        })
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline_stages.is_empty() {
            bail!("PIPELINE_STAGES must name at least one stage");
        }
        for stage in &self.pipeline_stages {
            validate_stage_name(stage)?;
        }
        if self.pipeline_max_concurrent == 0 {
            bail!("PIPELINE_MAX_CONCURRENT must be at least 1");
        }
        if self.poll_interval_s == 0 {
            bail!("POLL_INTERVAL_S must be at least 1");
        }
        if self.stage_interpreter.trim().is_empty() {
            bail!("STAGE_INTERPRETER must not be empty");
        }
        Ok(())
    }

    pub fn token_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("token.txt")
    }
}
