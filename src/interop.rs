//! Mechanical JSON shape mapping between the OpenAI dialect and the native
//! generate-content API. Text-level fidelity only; the dispatch engine never
//! looks inside these shapes.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};

const DEFAULT_IMAGE_MODEL: &str = "imagen-3.0-generate-002";
const DEFAULT_TTS_MODEL: &str = "gemini-2.5-flash-preview-tts";
const DEFAULT_TTS_VOICE: &str = "Zephyr";

fn required_model(request: &Value) -> Result<String, String> {
    request
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|model| !model.is_empty())
        .map(|model| model.trim_start_matches("models/").to_string())
        .ok_or_else(|| "missing field `model`".to_string())
}

fn message_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// OpenAI chat completions request → (model, native payload, stream flag).
pub fn openai_chat_to_generate_content(request: &Value) -> Result<(String, Value, bool), String> {
    let model = required_model(request)?;
    let stream = request
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let messages = request
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing field `messages`".to_string())?;

    let mut system_text = String::new();
    let mut contents = Vec::<Value>::new();
    for message in messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("");
        let text = message.get("content").map(message_text).unwrap_or_default();
        if text.trim().is_empty() {
            continue;
        }
        match role {
            "system" | "developer" => system_text.push_str(&text),
            "user" => contents.push(json!({ "role": "user", "parts": [{ "text": text }] })),
            "assistant" => contents.push(json!({ "role": "model", "parts": [{ "text": text }] })),
            _ => {}
        }
    }
    if contents.is_empty() {
        return Err("no convertible messages in `messages`".to_string());
    }

    let mut payload = Map::<String, Value>::new();
    payload.insert("contents".to_string(), Value::Array(contents));
    if !system_text.trim().is_empty() {
        payload.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [{ "text": system_text }] }),
        );
    }

    let mut generation_config = Map::<String, Value>::new();
    if let Some(max_tokens) = request.get("max_tokens").and_then(Value::as_u64) {
        generation_config.insert("maxOutputTokens".to_string(), max_tokens.into());
    }
    if let Some(temperature) = request.get("temperature").and_then(Value::as_f64) {
        if let Some(number) = serde_json::Number::from_f64(temperature) {
            generation_config.insert("temperature".to_string(), Value::Number(number));
        }
    }
    if let Some(top_p) = request.get("top_p").and_then(Value::as_f64) {
        if let Some(number) = serde_json::Number::from_f64(top_p) {
            generation_config.insert("topP".to_string(), Value::Number(number));
        }
    }
    if let Some(stop) = request.get("stop") {
        let stops: Vec<Value> = match stop {
            Value::String(stop) => vec![Value::String(stop.clone())],
            Value::Array(stops) => stops
                .iter()
                .filter_map(Value::as_str)
                .map(|stop| Value::String(stop.to_string()))
                .collect(),
            _ => Vec::new(),
        };
        if !stops.is_empty() {
            generation_config.insert("stopSequences".to_string(), Value::Array(stops));
        }
    }
    if !generation_config.is_empty() {
        payload.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );
    }

    Ok((model, Value::Object(payload), stream))
}

/// Concatenated text of the first candidate's parts, if any.
pub fn candidate_text(response: &Value) -> Option<String> {
    let parts = response
        .get("candidates")?
        .as_array()?
        .first()?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() { None } else { Some(text) }
}

/// First candidate's finish reason, already mapped to the OpenAI name.
pub fn openai_finish_reason(response: &Value) -> Option<&'static str> {
    let reason = response
        .get("candidates")?
        .as_array()?
        .first()?
        .get("finishReason")?
        .as_str()?;
    Some(match reason {
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "PROHIBITED_CONTENT" => "content_filter",
        _ => "stop",
    })
}

fn openai_usage(response: &Value) -> Value {
    let usage = response.get("usageMetadata");
    let count = |field: &str| {
        usage
            .and_then(|usage| usage.get(field))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    json!({
        "prompt_tokens": count("promptTokenCount"),
        "completion_tokens": count("candidatesTokenCount"),
        "total_tokens": count("totalTokenCount"),
    })
}

/// Native generate-content response → OpenAI chat completion.
pub fn generate_content_to_openai_chat(
    model: &str,
    response: &Value,
    id: &str,
    created: u64,
) -> Value {
    json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": candidate_text(response).unwrap_or_default(),
            },
            "finish_reason": openai_finish_reason(response).unwrap_or("stop"),
        }],
        "usage": openai_usage(response),
    })
}

/// One OpenAI streaming chunk; `content` and `finish_reason` are both
/// optional so the same constructor covers delta and terminal chunks.
pub fn openai_chunk(
    id: &str,
    created: u64,
    model: &str,
    content: Option<&str>,
    finish_reason: Option<&'static str>,
) -> Value {
    let delta = match content {
        Some(text) => json!({ "role": "assistant", "content": text }),
        None => json!({}),
    };
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    })
}

/// Minimal native-shaped chunk used when the pacer re-slices upstream text.
pub fn gemini_text_chunk(text: &str) -> Value {
    json!({
        "candidates": [{
            "index": 0,
            "content": { "role": "model", "parts": [{ "text": text }] },
        }],
    })
}

pub fn sse_frame(payload: &Value) -> String {
    format!("data: {payload}\n\n")
}

/// OpenAI embeddings request → (model, native batch-embed payload).
pub fn openai_embeddings_to_batch_embed(request: &Value) -> Result<(String, Value), String> {
    let model = required_model(request)?;
    let inputs: Vec<String> = match request.get("input") {
        Some(Value::String(input)) => vec![input.clone()],
        Some(Value::Array(inputs)) => inputs
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    if inputs.is_empty() {
        return Err("missing field `input`".to_string());
    }
    let requests: Vec<Value> = inputs
        .iter()
        .map(|input| {
            json!({
                "model": format!("models/{model}"),
                "content": { "parts": [{ "text": input }] },
            })
        })
        .collect();
    Ok((model, json!({ "requests": requests })))
}

pub fn batch_embed_to_openai(model: &str, response: &Value) -> Value {
    let data: Vec<Value> = response
        .get("embeddings")
        .and_then(Value::as_array)
        .map(|embeddings| {
            embeddings
                .iter()
                .enumerate()
                .map(|(index, embedding)| {
                    json!({
                        "object": "embedding",
                        "index": index,
                        "embedding": embedding.get("values").cloned().unwrap_or(Value::Array(Vec::new())),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    json!({
        "object": "list",
        "model": model,
        "data": data,
        "usage": { "prompt_tokens": 0, "total_tokens": 0 },
    })
}

/// OpenAI image generation request → (model, native predict payload).
pub fn openai_images_to_predict(request: &Value) -> Result<(String, Value), String> {
    let prompt = request
        .get("prompt")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty())
        .ok_or_else(|| "missing field `prompt`".to_string())?;
    let model = required_model(request).unwrap_or_else(|_| DEFAULT_IMAGE_MODEL.to_string());
    let count = request.get("n").and_then(Value::as_u64).unwrap_or(1).max(1);
    let payload = json!({
        "instances": [{ "prompt": prompt }],
        "parameters": { "sampleCount": count },
    });
    Ok((model, payload))
}

pub fn predict_to_openai_images(response: &Value, created: u64) -> Value {
    let data: Vec<Value> = response
        .get("predictions")
        .and_then(Value::as_array)
        .map(|predictions| {
            predictions
                .iter()
                .filter_map(|prediction| {
                    prediction
                        .get("bytesBase64Encoded")
                        .and_then(Value::as_str)
                        .map(|encoded| json!({ "b64_json": encoded }))
                })
                .collect()
        })
        .unwrap_or_default();
    json!({ "created": created, "data": data })
}

/// OpenAI audio speech request → (model, native TTS generate payload).
pub fn openai_speech_to_generate_content(request: &Value) -> Result<(String, Value), String> {
    let input = request
        .get("input")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|input| !input.is_empty())
        .ok_or_else(|| "missing field `input`".to_string())?;
    let model = required_model(request).unwrap_or_else(|_| DEFAULT_TTS_MODEL.to_string());
    let voice = request
        .get("voice")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|voice| !voice.is_empty())
        .unwrap_or(DEFAULT_TTS_VOICE);
    let payload = json!({
        "contents": [{ "role": "user", "parts": [{ "text": input }] }],
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } },
            },
        },
    });
    Ok((model, payload))
}

/// Decode the TTS response's inline audio: (mime type, bytes).
pub fn speech_response_audio(response: &Value) -> Result<(String, Vec<u8>), String> {
    let inline = response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .and_then(|parts| {
            parts
                .iter()
                .find_map(|part| part.get("inlineData").and_then(Value::as_object))
        })
        .ok_or_else(|| "response carries no inline audio data".to_string())?;
    let mime = inline
        .get("mimeType")
        .and_then(Value::as_str)
        .unwrap_or("application/octet-stream")
        .to_string();
    let encoded = inline
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| "inline audio data is missing".to_string())?;
    let bytes = BASE64
        .decode(encoded)
        .map_err(|err| format!("invalid base64 audio payload: {err}"))?;
    Ok((mime, bytes))
}

/// Native model catalog → OpenAI model list.
pub fn models_to_openai(response: &Value, created: u64) -> Value {
    let data: Vec<Value> = response
        .get("models")
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|model| model.get("name").and_then(Value::as_str))
                .map(|name| {
                    json!({
                        "id": name.trim_start_matches("models/"),
                        "object": "model",
                        "created": created,
                        "owned_by": "google",
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    json!({ "object": "list", "data": data })
}
