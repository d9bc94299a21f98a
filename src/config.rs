// config.rs - digestconf.txt loading
//
// Same KEY=VALUE format as the other *conf.txt files: one setting per line,
// '#' comments, optional BOM. Every recognised key and its default is listed
// in `DigestConfig::from_map`.

use crate::cluster::ClusterParams;
use crate::error::{DigestError, DigestResult};
use crate::lm::LmSettings;
use crate::prompts::{self, PromptSet};
use crate::retry::RetryPlan;
use log::debug;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const CONFIG_PATHS: [&str; 4] = [
    "digestconf.txt",
    "../digestconf.txt",
    "../../digestconf.txt",
    "src/digestconf.txt",
];

#[derive(Debug, Clone, PartialEq)]
pub struct DigestConfig {
    pub summary: LmSettings,
    /// `None` when VISION_ENABLED=false.
    pub vision: Option<LmSettings>,
    /// `None` when TRANSCRIPTION_ENABLED=false.
    pub transcription: Option<LmSettings>,
    pub embedding: LmSettings,
    pub retry: RetryPlan,
    pub clustering: ClusterParams,
    pub database: PathBuf,
    pub resume_file: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub groups: Vec<String>,
    pub log_model_payloads: bool,
    pub prompts: PromptSet,
}

impl DigestConfig {
    /// Reads `explicit` if given, otherwise the first digestconf.txt found.
    pub fn load(explicit: Option<&Path>) -> DigestResult<Self> {
        let content = match explicit {
            Some(path) => fs::read_to_string(path)
                .map_err(|e| DigestError::Config(format!("cannot read {}: {}", path.display(), e)))?,
            None => CONFIG_PATHS
                .iter()
                .find_map(|path| {
                    let content = fs::read_to_string(path).ok()?;
                    debug!("🔧 Configuration loaded from: {}", path);
                    Some(content)
                })
                .ok_or_else(|| {
                    DigestError::Config(
                        "digestconf.txt file not found in any expected location (., .., ../.., src/)".to_string(),
                    )
                })?,
        };
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> DigestResult<Self> {
        Self::from_map(parse_key_values(content))
    }

    fn from_map(map: HashMap<String, String>) -> DigestResult<Self> {
        let base_url = required(&map, "LM_BASE_URL")?;
        let api_key = optional(&map, "LM_API_KEY");
        let timeout: u64 = parse_or(&map, "LM_TIMEOUT", 120)?;
        let temperature: f32 = parse_or(&map, "TEMPERATURE", 0.3)?;
        let max_tokens: i32 = parse_or(&map, "MAX_TOKENS", 2048)?;

        let settings_for = |base: Option<String>, model: String| LmSettings {
            base_url: base.unwrap_or_else(|| base_url.clone()),
            model,
            api_key: api_key.clone(),
            timeout,
            temperature,
            max_tokens,
        };

        let summary = settings_for(None, required(&map, "SUMMARY_MODEL")?);

        let vision = if parse_or(&map, "VISION_ENABLED", true)? {
            Some(settings_for(
                optional(&map, "VISION_BASE_URL"),
                required(&map, "VISION_MODEL")?,
            ))
        } else {
            None
        };

        let transcription = if parse_or(&map, "TRANSCRIPTION_ENABLED", true)? {
            Some(settings_for(
                optional(&map, "TRANSCRIPTION_BASE_URL"),
                optional(&map, "TRANSCRIPTION_MODEL").unwrap_or_else(|| "whisper-1".to_string()),
            ))
        } else {
            None
        };

        let embedding = settings_for(
            optional(&map, "EMBEDDING_BASE_URL"),
            optional(&map, "EMBEDDING_MODEL").unwrap_or_else(|| "mxbai-embed-large".to_string()),
        );

        let retry = match optional(&map, "RETRY_DELAYS") {
            Some(raw) => RetryPlan::new(parse_delays(&raw)?),
            None => RetryPlan::default(),
        };

        let clustering = ClusterParams {
            eps: parse_or(&map, "CLUSTER_EPS", 0.1)?,
            min_samples: parse_or(&map, "CLUSTER_MIN_SAMPLES", 2)?,
        };
        if !(clustering.eps > 0.0) {
            return Err(DigestError::Config("CLUSTER_EPS must be greater than 0".to_string()));
        }
        if clustering.min_samples == 0 {
            return Err(DigestError::Config("CLUSTER_MIN_SAMPLES must be at least 1".to_string()));
        }

        let prompt_file = |key: &str| optional(&map, key).map(PathBuf::from);
        let prompts = PromptSet {
            attachment: prompts::load_prompt(
                prompt_file("ATTACHMENT_PROMPT_FILE").as_deref(),
                prompts::DEFAULT_ATTACHMENT_PROMPT,
            )?,
            link: prompts::load_prompt(prompt_file("LINK_PROMPT_FILE").as_deref(), prompts::DEFAULT_LINK_PROMPT)?,
            theme: prompts::load_prompt(prompt_file("THEME_PROMPT_FILE").as_deref(), prompts::DEFAULT_THEME_PROMPT)?,
            summary: prompts::load_prompt(
                prompt_file("SUMMARY_PROMPT_FILE").as_deref(),
                prompts::DEFAULT_SUMMARY_PROMPT,
            )?,
        };

        Ok(Self {
            summary,
            vision,
            transcription,
            embedding,
            retry,
            clustering,
            database: optional(&map, "DATABASE").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("messages.db")),
            resume_file: optional(&map, "RESUME_FILE").map(PathBuf::from),
            output_dir: optional(&map, "OUTPUT_DIR").map(PathBuf::from),
            groups: optional(&map, "GROUPS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            log_model_payloads: parse_or(&map, "LOG_MODEL_PAYLOADS", false)?,
            prompts,
        })
    }
}

fn parse_key_values(content: &str) -> HashMap<String, String> {
    // Remove BOM if present
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut config_map = HashMap::new();

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(equals_pos) = line.find('=') {
            let key = line[..equals_pos].trim().to_string();
            let value = line[equals_pos + 1..].trim().to_string();
            config_map.insert(key, value);
        }
    }

    config_map
}

fn optional(map: &HashMap<String, String>, key: &str) -> Option<String> {
    map.get(key).filter(|v| !v.is_empty()).cloned()
}

fn required(map: &HashMap<String, String>, key: &str) -> DigestResult<String> {
    optional(map, key).ok_or_else(|| DigestError::Config(format!("required setting '{}' not found in digestconf.txt", key)))
}

fn parse_or<T: FromStr>(map: &HashMap<String, String>, key: &str, default: T) -> DigestResult<T> {
    match optional(map, key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| DigestError::Config(format!("invalid {} value '{}' in digestconf.txt", key, raw))),
        None => Ok(default),
    }
}

fn parse_delays(raw: &str) -> DigestResult<Vec<Duration>> {
    raw.split(',')
        .map(|part| {
            let part = part.trim();
            part.parse::<f64>()
                .ok()
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .ok_or_else(|| DigestError::Config(format!("invalid RETRY_DELAYS entry '{}'", part)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "\u{feff}# model server\nLM_BASE_URL=http://localhost:1234\nSUMMARY_MODEL=qwen2.5-14b\nVISION_MODEL=llava\n";

    #[test]
    fn test_defaults() {
        let config = DigestConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.summary.base_url, "http://localhost:1234");
        assert_eq!(config.summary.timeout, 120);
        assert_eq!(config.vision.as_ref().unwrap().model, "llava");
        assert_eq!(config.embedding.model, "mxbai-embed-large");
        assert_eq!(config.transcription.as_ref().unwrap().model, "whisper-1");
        assert_eq!(config.embedding.base_url, "http://localhost:1234");
        assert_eq!(config.retry, RetryPlan::from_secs(&[2, 4, 8]));
        assert_eq!(config.clustering, ClusterParams { eps: 0.1, min_samples: 2 });
        assert_eq!(config.database, PathBuf::from("messages.db"));
        assert!(config.resume_file.is_none());
        assert!(config.groups.is_empty());
        assert_eq!(config.prompts, PromptSet::default());
    }

    #[test]
    fn test_overrides() {
        let content = format!(
            "{}VISION_ENABLED=false\nTRANSCRIPTION_BASE_URL=http://whisper:8000\nTRANSCRIPTION_MODEL=medium\nEMBEDDING_BASE_URL=http://embed:11434\nRETRY_DELAYS=1, 0.5\nCLUSTER_EPS=0.2\nCLUSTER_MIN_SAMPLES=3\nGROUPS=a, b,,c\nRESUME_FILE=state/resume.json\nLOG_MODEL_PAYLOADS=true\n",
            MINIMAL
        );
        let config = DigestConfig::parse(&content).unwrap();
        assert!(config.vision.is_none());
        let transcription = config.transcription.as_ref().unwrap();
        assert_eq!(transcription.base_url, "http://whisper:8000");
        assert_eq!(transcription.model, "medium");
        assert_eq!(config.embedding.base_url, "http://embed:11434");
        assert_eq!(
            config.retry.delays(),
            &[Duration::from_secs(1), Duration::from_millis(500)]
        );
        assert_eq!(config.clustering.min_samples, 3);
        assert_eq!(config.groups, vec!["a", "b", "c"]);
        assert_eq!(config.resume_file, Some(PathBuf::from("state/resume.json")));
        assert!(config.log_model_payloads);
    }

    #[test]
    fn test_missing_required_key() {
        let err = DigestConfig::parse("LM_BASE_URL=http://localhost:1234\n").unwrap_err();
        assert!(err.to_string().contains("SUMMARY_MODEL"));
    }

    #[test]
    fn test_transcription_can_be_disabled() {
        let config = DigestConfig::parse(&format!("{}TRANSCRIPTION_ENABLED=false\n", MINIMAL)).unwrap();
        assert!(config.transcription.is_none());
    }

    #[test]
    fn test_vision_model_only_required_when_enabled() {
        let content = "LM_BASE_URL=http://x\nSUMMARY_MODEL=m\n";
        assert!(DigestConfig::parse(content).is_err());
        assert!(DigestConfig::parse(&format!("{}VISION_ENABLED=false\n", content)).is_ok());
    }

    #[test]
    fn test_invalid_values() {
        for bad in [
            "LM_TIMEOUT=soon",
            "RETRY_DELAYS=2,,8",
            "RETRY_DELAYS=-1",
            "RETRY_DELAYS=1e30",
            "RETRY_DELAYS=inf",
            "CLUSTER_EPS=0",
            "CLUSTER_MIN_SAMPLES=0",
        ] {
            let content = format!("{}{}\n", MINIMAL, bad);
            assert!(matches!(DigestConfig::parse(&content), Err(DigestError::Config(_))), "{}", bad);
        }
    }
}
