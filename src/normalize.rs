//! Pre-routing path normalization: rewrites the many URL shapes clients send
//! onto the canonical operation paths the router understands.

use std::collections::HashMap;
use std::sync::OnceLock;

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use regex::Regex;
use serde_json::Value;

use crate::http::AppState;

const MAX_PEEK_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Everything a rewrite rule may consult. Pure data: building it has no side
/// effects, and rule evaluation never mutates the request.
#[derive(Clone, Debug)]
pub struct NormalizationInput {
    pub path: String,
    pub method: Method,
    pub query: HashMap<String, String>,
    pub body_model: Option<String>,
}

impl NormalizationInput {
    fn stream_requested(&self) -> bool {
        self.path.to_ascii_lowercase().contains("stream")
            || self.query.get("stream").is_some_and(|value| value == "true")
    }

    /// Model name, in order of preference: request body, query parameter,
    /// `/models/{name}` path segment. `None` aborts the rewrite — the
    /// normalizer never guesses a model.
    fn model(&self) -> Option<String> {
        if let Some(model) = &self.body_model {
            return Some(model.clone());
        }
        if let Some(model) = self.query.get("model").filter(|model| !model.is_empty()) {
            return Some(model.clone());
        }
        path_model_pattern()
            .captures(&self.path)
            .map(|captures| captures[1].to_string())
    }
}

struct RewriteRule {
    name: &'static str,
    applies: fn(&str) -> bool,
    rewrite: fn(&NormalizationInput) -> Option<String>,
}

/// Priority-ordered; first match wins and later rules are not consulted even
/// when the winning rule declines to rewrite.
const RULES: [RewriteRule; 4] = [
    RewriteRule {
        name: "gemini_generate",
        applies: applies_gemini,
        rewrite: rewrite_gemini,
    },
    RewriteRule {
        name: "openai_dialect",
        applies: applies_openai,
        rewrite: rewrite_openai,
    },
    RewriteRule {
        name: "v1_dialect",
        applies: applies_v1,
        rewrite: rewrite_v1,
    },
    RewriteRule {
        name: "chat_completions",
        applies: applies_chat,
        rewrite: rewrite_chat,
    },
];

fn applies_gemini(lower_path: &str) -> bool {
    lower_path.contains("generatecontent") || lower_path.contains("v1beta/models")
}

fn applies_openai(lower_path: &str) -> bool {
    lower_path.contains("/openai/")
}

fn applies_v1(lower_path: &str) -> bool {
    lower_path.contains("/v1/")
}

fn applies_chat(lower_path: &str) -> bool {
    lower_path.contains("/chat/completions")
}

fn rewrite_gemini(input: &NormalizationInput) -> Option<String> {
    if input.method == Method::GET {
        return Some("/v1beta/models".to_string());
    }
    let model = input.model()?;
    let action = if input.stream_requested() {
        "streamGenerateContent"
    } else {
        "generateContent"
    };
    if input.path.to_ascii_lowercase().contains("/vertex-express/") {
        Some(format!("/vertex-express/v1beta/models/{model}:{action}"))
    } else {
        Some(format!("/v1beta/models/{model}:{action}"))
    }
}

fn rewrite_openai(input: &NormalizationInput) -> Option<String> {
    rewrite_operation(input, "/openai/v1")
}

fn rewrite_v1(input: &NormalizationInput) -> Option<String> {
    rewrite_operation(input, "/v1")
}

fn rewrite_chat(_input: &NormalizationInput) -> Option<String> {
    Some("/v1/chat/completions".to_string())
}

fn rewrite_operation(input: &NormalizationInput, prefix: &str) -> Option<String> {
    let lower = input.path.to_ascii_lowercase();
    if input.method == Method::POST {
        if lower.contains("chat") || lower.contains("completion") {
            Some(format!("{prefix}/chat/completions"))
        } else if lower.contains("embedding") {
            Some(format!("{prefix}/embeddings"))
        } else if lower.contains("image") {
            Some(format!("{prefix}/images/generations"))
        } else if lower.contains("audio") {
            Some(format!("{prefix}/audio/speech"))
        } else {
            None
        }
    } else if input.method == Method::GET {
        if lower.contains("model") {
            Some(format!("{prefix}/models"))
        } else {
            None
        }
    } else {
        None
    }
}

fn canonical_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^/(v1beta|gemini/v1beta)/models/[^/:]+:(generateContent|streamGenerateContent|countTokens)$",
            r"^/(v1beta|gemini/v1beta)/models$",
            r"^/(v1|openai/v1|hf/v1)/(chat/completions|models|embeddings|images/generations|audio/speech)$",
            r"^/vertex-express/v1beta/models/[^/:]+:(generateContent|streamGenerateContent)$",
            r"^/vertex-express/v1beta/models$",
            r"^/vertex-express/v1/(chat/completions|models|embeddings|images/generations)$",
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("canonical path pattern is valid"))
        .collect()
    })
}

fn path_model_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)/models/([^/:]+)").expect("model pattern is valid"))
}

pub fn is_canonical(path: &str) -> bool {
    canonical_patterns()
        .iter()
        .any(|pattern| pattern.is_match(path))
}

/// Resolve the canonical path for a request, or `None` to pass it through
/// unchanged (already canonical, no rule applies, or the winning rule could
/// not resolve a model).
pub fn rewrite_for(input: &NormalizationInput) -> Option<(String, &'static str)> {
    if is_canonical(&input.path) {
        return None;
    }
    let lower = input.path.to_ascii_lowercase();
    for rule in &RULES {
        if (rule.applies)(&lower) {
            let rewritten = (rule.rewrite)(input)?;
            if rewritten == input.path {
                return None;
            }
            return Some((rewritten, rule.name));
        }
    }
    None
}

pub fn query_params(uri: &Uri) -> HashMap<String, String> {
    uri.query()
        .map(|query| {
            query
                .split('&')
                .filter_map(|pair| {
                    let (name, value) = pair.split_once('=')?;
                    (!name.is_empty()).then(|| (name.to_string(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn replace_path(uri: &Uri, new_path: &str) -> Option<Uri> {
    let mut parts = uri.clone().into_parts();
    let path_and_query = match uri.query() {
        Some(query) => format!("{new_path}?{query}"),
        None => new_path.to_string(),
    };
    parts.path_and_query = Some(path_and_query.parse().ok()?);
    Uri::from_parts(parts).ok()
}

/// Middleware applied around the whole router so the rewrite happens before
/// route matching. The single side effect is the in-place URI substitution;
/// body bytes are buffered for model extraction and re-attached untouched.
pub async fn normalize_request(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.config().await.url_normalization_enabled {
        return next.run(request).await;
    }

    let (mut parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    if is_canonical(&path) {
        return next.run(Request::from_parts(parts, body)).await;
    }

    let bytes = match to_bytes(body, MAX_PEEK_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, err.to_string()).into_response();
        }
    };
    let body_model = serde_json::from_slice::<Value>(&bytes)
        .ok()
        .and_then(|body| {
            body.get("model")
                .and_then(Value::as_str)
                .map(|model| model.trim().to_string())
        })
        .filter(|model| !model.is_empty());

    let input = NormalizationInput {
        path: path.clone(),
        method: parts.method.clone(),
        query: query_params(&parts.uri),
        body_model,
    };
    if let Some((rewritten, rule)) = rewrite_for(&input) {
        tracing::info!(rule, from = %path, to = %rewritten, "request path normalized");
        match replace_path(&parts.uri, &rewritten) {
            Some(uri) => parts.uri = uri,
            None => tracing::warn!(to = %rewritten, "failed to rebuild normalized uri"),
        }
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}
