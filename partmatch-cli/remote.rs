//! Identification by a hosted multimodal model.
//!
//! The query image is sent inline as a base64 data URL to an
//! OpenAI-compatible chat completions endpoint together with a listing of
//! the catalog. The model answers with a JSON array of candidates, which is
//! filtered against the catalog before use.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use partmatch_core::{CatalogItem, MatchPolicy, MatchResult};
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::config::{ConfigError, RemoteConfig};
use crate::engine::{recover, AnalyzeError, Analyzer};

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// One candidate as written by the model
#[derive(Deserialize)]
struct Candidate {
    material_number: String,
    confidence_score: f64,
    #[serde(default)]
    match_reason: String,
}

pub struct RemoteAnalyzer {
    client: reqwest::blocking::Client,
    cfg: RemoteConfig,
    api_key: Option<String>,
    policy: MatchPolicy,
}

impl RemoteAnalyzer {
    /// Create the HTTP client. The API key is read from the configured
    /// environment variable; a missing key makes every query fall back.
    pub fn new(cfg: RemoteConfig, policy: MatchPolicy) -> Result<Self, ConfigError> {
        let api_key = std::env::var(&cfg.api_key_env).ok().filter(|k| !k.trim().is_empty());
        Self::with_api_key(cfg, policy, api_key)
    }

    pub fn with_api_key(cfg: RemoteConfig, policy: MatchPolicy, api_key: Option<String>) -> Result<Self, ConfigError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(cfg.timeout())
            .build()
            .map_err(|e| ConfigError::Invalid(format!("HTTP client: {}", e)))?;
        Ok(Self { client, cfg, api_key, policy })
    }

    /// Like `analyze`, but reports why no ranking was produced
    pub fn try_analyze(&self, image: &[u8], catalog: &[CatalogItem]) -> Result<Vec<MatchResult>, AnalyzeError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| AnalyzeError::Remote(format!("{} is not set", self.cfg.api_key_env)))?;
        let data_url = data_url(image)?;

        let body = json!({
            "model": self.cfg.model,
            "temperature": 0,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": build_prompt(catalog, self.cfg.max_catalog_items, self.policy.max_results) },
                    { "type": "image_url", "image_url": { "url": data_url } }
                ]
            }]
        });

        info!(endpoint = %self.cfg.endpoint, model = %self.cfg.model, "sending query to remote model");
        let response = self
            .client
            .post(&self.cfg.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AnalyzeError::Remote(format!("HTTP {}", status)));
        }

        let completion: ChatCompletion = response.json().map_err(|e| self.request_error(e))?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AnalyzeError::Remote("reply has no content".to_string()))?;
        debug!(reply = %content, "remote model reply");

        let results = parse_reply(&content, catalog, self.policy.max_results)?;
        if results.is_empty() {
            return Err(AnalyzeError::NoConfidentMatch);
        }
        Ok(results)
    }

    fn request_error(&self, err: reqwest::Error) -> AnalyzeError {
        if err.is_timeout() {
            AnalyzeError::Timeout(self.cfg.timeout())
        } else {
            AnalyzeError::Remote(err.to_string())
        }
    }
}

impl Analyzer for RemoteAnalyzer {
    fn analyze(&self, image: &[u8], catalog: &[CatalogItem]) -> Vec<MatchResult> {
        recover(self.try_analyze(image, catalog), catalog, &self.policy)
    }
}

fn data_url(image: &[u8]) -> Result<String, AnalyzeError> {
    let format = image::guess_format(image).map_err(|e| AnalyzeError::Decode(e.to_string()))?;
    Ok(format!("data:{};base64,{}", format.to_mime_type(), STANDARD.encode(image)))
}

/// Instructions plus one line per catalog item
pub fn build_prompt(catalog: &[CatalogItem], max_items: usize, max_results: usize) -> String {
    let mut prompt = format!(
        "Identify the spare part in the photo. Compare it with the catalog below and answer with a JSON array only. \
         Each element must be an object with the keys \"material_number\", \"confidence_score\" (0 to 1) and \
         \"match_reason\". Return at most {} candidates, best first, and leave out items that do not match.\n\nCatalog:\n",
        max_results
    );
    for item in catalog.iter().take(max_items) {
        let category = item.category.as_deref().map(|c| format!(" [{}]", c)).unwrap_or_default();
        let manufacturer = item.manufacturer.as_deref().map(|m| format!(" ({})", m)).unwrap_or_default();
        prompt.push_str(&format!("- {}: {}{}{}\n", item.material_number, item.description, category, manufacturer));
    }
    prompt
}

/// Extract the candidate array from a model reply. Accepts a bare array,
/// a fenced code block or an array embedded in prose. Candidates outside
/// the catalog are dropped, confidences clamped to `[0, 1]` and repeated
/// material numbers collapsed to their highest confidence.
pub fn parse_reply(content: &str, catalog: &[CatalogItem], max_results: usize) -> Result<Vec<MatchResult>, AnalyzeError> {
    let (start, end) = match (content.find('['), content.rfind(']')) {
        (Some(start), Some(end)) if start < end => (start, end),
        _ => return Err(AnalyzeError::Remote("reply contains no JSON array".to_string())),
    };
    let candidates: Vec<Candidate> = serde_json::from_str(&content[start..=end])
        .map_err(|e| AnalyzeError::Remote(format!("unparsable reply: {}", e)))?;

    let known: HashSet<&str> = catalog.iter().map(|c| c.material_number.as_str()).collect();
    let mut results: Vec<MatchResult> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for c in candidates.into_iter().filter(|c| known.contains(c.material_number.as_str())) {
        let result = MatchResult {
            item_id: c.material_number,
            confidence_score: c.confidence_score.clamp(0.0, 1.0),
            explanation: if c.match_reason.is_empty() {
                "Remote model match".to_string()
            } else {
                c.match_reason
            },
        };
        match positions.get(&result.item_id) {
            Some(&i) if results[i].confidence_score >= result.confidence_score => {}
            Some(&i) => results[i] = result,
            None => {
                positions.insert(result.item_id.clone(), results.len());
                results.push(result);
            }
        }
    }

    results.sort_by(|a, b| b.confidence_score.total_cmp(&a.confidence_score));
    results.truncate(max_results);
    Ok(results)
}
