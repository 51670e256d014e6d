use crate::core::error::EngineError;
use crate::services::engine::{Capabilities, SpeechBackend, SynthesisRequest};
use crate::utils::audio::{decode_wav, AudioBuffer};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use url::Url;

/// A speech service reached over HTTP.
///
/// `POST {base_url}/synthesize` takes a JSON body and answers with WAV bytes.
/// `GET /health` reports availability and `POST /release` frees the model.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpEngineConfig {
    pub id: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub voice_id: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Merged over `params` once the engine has been degraded.
    #[serde(default)]
    pub degraded_params: BTreeMap<String, String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Engine-level fallback chain, replacing the project chain for this engine.
    pub fallback: Option<Vec<String>>,
}

pub struct HttpSpeechBackend {
    config: HttpEngineConfig,
    base: Url,
    client: Client,
    degraded: AtomicBool,
}

impl HttpSpeechBackend {
    pub fn new(config: HttpEngineConfig) -> Result<Self> {
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base)
            .with_context(|| format!("Invalid base_url for engine '{}'", config.id))?;
        info!("Using HTTP speech engine '{}' at {}", config.id, base);

        Ok(Self {
            config,
            base,
            client: Client::new(),
            degraded: AtomicBool::new(false),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, EngineError> {
        self.base
            .join(path)
            .map_err(|e| EngineError::Fatal(format!("bad endpoint {}: {}", path, e)))
    }

    fn body(&self, request: &SynthesisRequest) -> serde_json::Value {
        let mut params = self.config.params.clone();
        if self.degraded.load(Ordering::SeqCst) {
            params.extend(self.config.degraded_params.clone());
        }
        params.extend(request.params.iter().cloned());

        json!({
            "text": request.text,
            "voice": request.voice.as_ref().or(self.config.voice_id.as_ref()),
            "language": request.language,
            "params": params,
        })
    }
}

/// Maps a non-success HTTP status onto the engine failure taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> EngineError {
    let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
    match status.as_u16() {
        507 => EngineError::ResourceExhausted(message),
        408 | 429 => EngineError::Transient(message),
        400 | 422 => EngineError::InvalidInput(message),
        s if s >= 500 => EngineError::Transient(message),
        _ => EngineError::Fatal(message),
    }
}

#[async_trait]
impl SpeechBackend for HttpSpeechBackend {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn capabilities(&self) -> &Capabilities {
        &self.config.capabilities
    }

    async fn available(&self) -> bool {
        let Ok(url) = self.endpoint("health") else {
            return false;
        };
        match self.client.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Engine '{}' health check failed: {}", self.config.id, e);
                false
            }
        }
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioBuffer, EngineError> {
        let url = self.endpoint("synthesize")?;
        let mut builder = self.client.post(url).json(&self.body(request));
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| EngineError::Transient(format!("request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| EngineError::Transient(format!("failed to read audio: {}", e)))?;
        decode_wav(&bytes).map_err(|e| EngineError::Transient(format!("malformed audio: {:#}", e)))
    }

    async fn release(&self) -> Result<()> {
        let url = self.endpoint("release")?;
        let resp = self
            .client
            .post(url)
            .send()
            .await
            .with_context(|| format!("Failed to release engine '{}'", self.config.id))?;
        if !resp.status().is_success() {
            anyhow::bail!(
                "Engine '{}' release returned HTTP {}",
                self.config.id,
                resp.status().as_u16()
            );
        }
        Ok(())
    }

    fn degrade(&self) -> bool {
        if self.config.degraded_params.is_empty() || self.degraded.swap(true, Ordering::SeqCst) {
            return false;
        }
        warn!("Engine '{}' switched to degraded parameters", self.config.id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::audio::encode_wav;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(base_url: &str) -> HttpEngineConfig {
        HttpEngineConfig {
            id: "cloud_a".to_string(),
            base_url: base_url.to_string(),
            api_key: None,
            voice_id: Some("layla".to_string()),
            params: BTreeMap::from([("quality".to_string(), "high".to_string())]),
            degraded_params: BTreeMap::from([("quality".to_string(), "low".to_string())]),
            capabilities: Capabilities::default(),
            fallback: None,
        }
    }

    /// Serves exactly one request with the given status line and body.
    async fn serve_once(
        status: &'static str,
        body: Vec<u8>,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length {
                        break;
                    }
                }
            }
            let head = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    #[test]
    fn test_classify_status() {
        let cases = [
            (429, "transient"),
            (503, "transient"),
            (408, "transient"),
            (507, "exhausted"),
            (401, "fatal"),
            (404, "fatal"),
            (422, "invalid"),
        ];
        for (code, expected) in cases {
            let err = classify_status(StatusCode::from_u16(code).unwrap(), "x");
            let kind = match err {
                EngineError::Transient(_) => "transient",
                EngineError::ResourceExhausted(_) => "exhausted",
                EngineError::Fatal(_) => "fatal",
                EngineError::InvalidInput(_) => "invalid",
            };
            assert_eq!(kind, expected, "status {}", code);
        }
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let backend = HttpSpeechBackend::new(config("http://localhost:9000/tts")).unwrap();
        assert_eq!(
            backend.endpoint("synthesize").unwrap().as_str(),
            "http://localhost:9000/tts/synthesize"
        );
    }

    #[test]
    fn test_degrade_applies_once() {
        let backend = HttpSpeechBackend::new(config("http://localhost:9000")).unwrap();
        let request = SynthesisRequest {
            text: "hi".to_string(),
            voice: None,
            language: "en".to_string(),
            params: vec![("pace".to_string(), "slow".to_string())],
        };
        assert_eq!(backend.body(&request)["params"]["quality"], "high");
        assert!(backend.degrade());
        assert!(!backend.degrade());
        let body = backend.body(&request);
        assert_eq!(body["params"]["quality"], "low");
        assert_eq!(body["params"]["pace"], "slow");
        assert_eq!(body["voice"], "layla");
    }

    #[tokio::test]
    async fn test_synthesize_decodes_wav() {
        let audio = AudioBuffer::new(8000, 1, vec![0.25; 800]);
        let (base, server) = serve_once("200 OK", encode_wav(&audio).unwrap()).await;
        let backend = HttpSpeechBackend::new(config(&base)).unwrap();

        let request = SynthesisRequest {
            text: "مرحبا".to_string(),
            voice: None,
            language: "ar".to_string(),
            params: Vec::new(),
        };
        let decoded = backend.synthesize(&request).await.unwrap();
        assert_eq!(decoded.sample_rate, 8000);
        assert_eq!(decoded.frames(), 800);

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /synthesize"));
        assert!(raw.contains("\"language\":\"ar\""));
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let (base, _server) = serve_once("429 Too Many Requests", b"slow down".to_vec()).await;
        let backend = HttpSpeechBackend::new(config(&base)).unwrap();
        let request = SynthesisRequest {
            text: "hello".to_string(),
            voice: None,
            language: "en".to_string(),
            params: Vec::new(),
        };
        match backend.synthesize(&request).await {
            Err(EngineError::Transient(msg)) => assert!(msg.contains("slow down")),
            other => panic!("unexpected result: {:?}", other.map(|a| a.frames())),
        }
    }
}
